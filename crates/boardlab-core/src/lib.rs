//! Boardlab Core
//!
//! Core domain types, traits, and error handling for Boardlab.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod device;
pub mod error;
pub mod ids;
pub mod job;
pub mod messages;
pub mod ports;
pub mod render;
pub mod results;
pub mod worker;

pub use device::{Device, DeviceConfig, DeviceHealth, DeviceState};
pub use error::{Error, Result};
pub use ids::*;
pub use job::{Job, JobHealth, JobState};
pub use worker::{Worker, WorkerState};
