//! qscaled — the qscale daemon.
//!
//! Assembles the state store, broker provider, right-sizer and controller
//! into one process. The binary in `main.rs` adds the CLI, logging and
//! signal handling on top of [`daemon::assemble`].

pub mod config;
pub mod daemon;

pub use config::DaemonConfig;
pub use daemon::assemble;
