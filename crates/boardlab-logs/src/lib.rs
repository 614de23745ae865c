//! Boardlab Logs
//!
//! Per-job log storage and the ingestion service that turns the worker log
//! stream into output files and test-case rows.

pub mod files;
pub mod ingest;

pub use files::{FileMap, JobLogFiles, HANDLE_IDLE_TIMEOUT};
pub use ingest::{LogIngestor, FLUSH_INTERVAL};
