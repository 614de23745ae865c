//! Boardlab Scheduler
//!
//! Master-side services: device assignment, the coordination event loop and
//! worker liveness tracking. Everything durable lives behind the repository
//! ports; this crate only holds the in-flight view.

pub mod master;
pub mod scheduler;
pub mod workers;

#[cfg(test)]
pub(crate) mod testutil;

pub use master::{Master, MasterConfig};
pub use scheduler::{inject_peers, request_cancel, submit_job, Scheduler};
pub use workers::WorkerTracker;
