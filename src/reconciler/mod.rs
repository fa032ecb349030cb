//! Reconciler Module
//!
//! Decides which lifecycle events a correlation still owes and writes them
//! onto the backend claim.
//!
//! - `decision`: pure projection from observed state to export actions
//! - `writer`: conditional annotation updates
//! - `queue`: per-key deduplicating work queue
//! - `scheduler`: delayed re-enqueue of deferred and failed keys
//! - `controller`: worker pool tying the pieces together

pub mod controller;
pub mod decision;
pub mod queue;
pub mod scheduler;
pub mod writer;

pub use controller::{ExportController, ReconcileOutcome};
pub use decision::{decide, Action, DeferReason, Plan};
pub use queue::WorkQueue;
pub use scheduler::{RetryScheduler, SchedulerLoop};
pub use writer::{AnnotationWriter, PendingWrite, Prepared, WriteOutcome};
