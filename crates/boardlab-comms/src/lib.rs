//! Boardlab Comms
//!
//! NATS implementations of the coordination channel and log queue ports.

pub mod channel;

pub use channel::{NatsCoordinator, NatsLogQueue, NatsWorkerLink};
