//! Boardlab pipeline framework.
//!
//! Compiles declarative job definitions into validated, retryable action
//! trees and interprets them against a device configuration.

pub mod action;
pub mod context;
pub mod parser;
pub mod pipeline;
pub mod protocol;
pub mod strategy;

pub use action::{ActionIx, ActionKind, Level, Parameters};
pub use context::{Connection, JobContext};
pub use parser::{JobDefinition, JobParser, ParsedJob};
pub use pipeline::{ActionDescription, Pipeline};
pub use protocol::ProtocolRegistry;
pub use strategy::Registry;
