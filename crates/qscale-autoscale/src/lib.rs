//! qscale-autoscale — queue-depth-driven replica convergence.
//!
//! # Algorithm
//!
//! For each workload, on every trigger (store change, OOM kill, resync tick):
//!
//! 1. Count live instances (`Pending` or `Running`).
//! 2. Read the queue depth `d` through the workload's broker.
//! 3. `desired = clamp(d * scaling_factor, min_replicas, max_replicas)`.
//! 4. `desired > current`: create the difference, sized from the template
//!    (or from high-water-marks when right-sizing is on).
//! 5. `desired < current`: push one shutdown marker per surplus instance to
//!    the queue's death queue. Instances drain their work and exit on their
//!    own; nothing is deleted.
//! 6. Write status back with the version read in step 1.
//!
//! If the depth cannot be read the previous decision stands (clamped to the
//! current bounds) and no shutdown signal is sent.

pub mod budget;
pub mod controller;
pub mod decision;
pub mod error;
pub mod queue;
pub mod reconciler;
pub mod template;

pub use budget::PassBudget;
pub use controller::{Controller, ControllerConfig, WorkKey};
pub use decision::{ScaleAction, desired_replicas};
pub use error::ReconcileError;
pub use queue::WorkQueue;
pub use reconciler::{PassOutcome, PassReport, ReconcilerConfig, WorkloadReconciler};
pub use template::template_hash;
