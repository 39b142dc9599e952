//! qscale-rightsize — learns how much CPU and memory each container slot
//! of a workload actually needs.
//!
//! # Algorithm
//!
//! ```text
//! for each container slot:
//!     peak = max(usage[slot]) across live instances      (cpu, memory separately)
//!     if exceeds(mark[slot], peak, threshold): mark[slot] = peak
//!
//! on OOM kill of an instance:
//!     mark[slot].memory += mark[slot].memory * step%    (no threshold)
//! ```
//!
//! Marks only move up. New instances request the learned mark where it is
//! non-zero and the template's own request otherwise.

pub mod sizer;
pub mod source;
pub mod threshold;

pub use sizer::{
    Dimension, RightSizer, RightSizingConfig, WatermarkChange, oom_bump, raise_watermarks,
    reset_watermarks, sized_requests,
};
pub use source::{MetricsError, MetricsSource};
pub use threshold::exceeds;
