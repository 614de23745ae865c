//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external
//! adapters: the datastore and the coordination channel.

use crate::device::Device;
use crate::ids::{Hostname, JobId};
use crate::job::{Job, JobHealth};
use crate::messages::{Envelope, MasterMessage, WorkerMessage};
use crate::results::TestCase;
use crate::worker::Worker;
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of inbound worker messages, as seen by the master.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Envelope>> + Send>>;

/// Stream of master replies, as seen by one worker-side participant.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<MasterMessage>> + Send>>;

/// One raw log line addressed to a job.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub job: JobId,
    pub line: String,
}

/// Stream of inbound log entries, as seen by the ingestion service.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogEntry>> + Send>>;

/// Master side of the coordination channel.
#[async_trait]
pub trait CoordinationBus: Send + Sync {
    /// Send a message to one worker.
    async fn send(&self, worker: &Hostname, message: MasterMessage) -> Result<()>;

    /// Subscribe to all inbound worker messages.
    async fn messages(&self) -> Result<MessageStream>;
}

/// Worker side of the coordination channel (also used by the log daemon
/// for its liveness pings).
#[async_trait]
pub trait WorkerLink: Send + Sync {
    /// Send a message to the master under this participant's hostname.
    async fn send(&self, message: WorkerMessage) -> Result<()>;

    /// Subscribe to replies addressed to this participant.
    async fn replies(&self) -> Result<ReplyStream>;
}

/// Inbound queue of per-job log records.
#[async_trait]
pub trait LogQueue: Send + Sync {
    async fn records(&self) -> Result<LogStream>;
}

/// Repository for jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &Job) -> Result<JobId>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    async fn update(&self, job: &Job) -> Result<()>;

    /// Jobs waiting for a device.
    async fn submitted(&self) -> Result<Vec<Job>>;

    /// Jobs holding a reservation, not yet started.
    async fn scheduled(&self) -> Result<Vec<Job>>;

    /// Jobs with a pending cancellation request.
    async fn canceling(&self) -> Result<Vec<Job>>;

    /// Running (or canceling) jobs owned by the given worker.
    async fn running_on(&self, worker: &Hostname) -> Result<Vec<Job>>;

    /// All sub-jobs of a multi-device group.
    async fn in_target_group(&self, target_group: &str) -> Result<Vec<Job>>;

    /// Atomically finish a job. `health` is the fallback outcome, applied
    /// only when no content-derived health was recorded. Returns `false`
    /// when the job was already finished (the call is then a no-op).
    async fn finish(
        &self,
        id: JobId,
        health: JobHealth,
        failure_comment: Option<&str>,
    ) -> Result<bool>;

    /// Record the content-derived health, if none was recorded yet.
    async fn set_health(&self, id: JobId, health: JobHealth) -> Result<()>;
}

/// Repository for devices.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get(&self, hostname: &Hostname) -> Result<Option<Device>>;

    async fn list(&self) -> Result<Vec<Device>>;

    /// Idle devices of the given type.
    async fn idle_by_type(&self, device_type: &str) -> Result<Vec<Device>>;

    /// Atomically reserve an idle device for a job. Returns `false` when
    /// the device was no longer idle (another job won the race).
    async fn reserve(&self, hostname: &Hostname, job: JobId) -> Result<bool>;

    /// Transition a reserved device to running.
    async fn mark_running(&self, hostname: &Hostname) -> Result<()>;

    /// Return a device to the idle pool, clearing its current job.
    async fn release(&self, hostname: &Hostname) -> Result<()>;

    async fn update(&self, device: &Device) -> Result<()>;
}

/// Repository for workers.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn get(&self, hostname: &Hostname) -> Result<Option<Worker>>;

    async fn list(&self) -> Result<Vec<Worker>>;

    /// Record traffic from a worker: upsert the row, mark it online and
    /// refresh the last-ping timestamp.
    async fn seen(&self, hostname: &Hostname) -> Result<()>;

    async fn mark_offline(&self, hostname: &Hostname) -> Result<()>;
}

/// Repository for test cases.
#[async_trait]
pub trait TestCaseRepository: Send + Sync {
    async fn create(&self, case: &TestCase) -> Result<()>;

    async fn create_bulk(&self, cases: &[TestCase]) -> Result<()>;
}
