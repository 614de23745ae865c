//! NATS adapters for the coordination channel and the log queue.
//!
//! Coordination messages travel over core NATS subjects, one per
//! destination: the master listens on `boardlab.master.>` (the last token is
//! the sending hostname) and each worker on `boardlab.worker.<hostname>`.
//! Log lines are published per job on `boardlab.logs.<job-id>`. Payloads are
//! the protocol frames, JSON-encoded. Nothing here is durable: job state
//! lives in the database and is resynchronized after a restart, so plain
//! pub/sub is enough.

use async_trait::async_trait;
use boardlab_core::messages::{Envelope, MasterMessage, WorkerMessage};
use boardlab_core::ports::{
    CoordinationBus, LogEntry, LogQueue, LogStream, MessageStream, ReplyStream, WorkerLink,
};
use boardlab_core::{Error, Hostname, JobId, Result};
use futures::StreamExt;
use tracing::{debug, info};

const WORKER_SUBJECT_PREFIX: &str = "boardlab.worker.";
const MASTER_SUBJECT_PREFIX: &str = "boardlab.master.";
const LOG_SUBJECT_PREFIX: &str = "boardlab.logs.";

fn worker_subject(hostname: &Hostname) -> String {
    format!("{}{}", WORKER_SUBJECT_PREFIX, hostname)
}

fn master_subject(hostname: &Hostname) -> String {
    format!("{}{}", MASTER_SUBJECT_PREFIX, hostname)
}

fn log_subject(job: JobId) -> String {
    format!("{}{}", LOG_SUBJECT_PREFIX, job)
}

fn hostname_from_subject(subject: &str) -> Result<Hostname> {
    subject
        .strip_prefix(MASTER_SUBJECT_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(Hostname::new)
        .ok_or_else(|| Error::Channel(format!("unexpected coordination subject: {}", subject)))
}

fn job_from_subject(subject: &str) -> Result<JobId> {
    subject
        .strip_prefix(LOG_SUBJECT_PREFIX)
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| Error::Channel(format!("unexpected log subject: {}", subject)))
}

fn encode_frames(frames: &[String]) -> Result<Vec<u8>> {
    serde_json::to_vec(frames).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_frames(payload: &[u8]) -> Result<Vec<String>> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::Protocol(format!("undecodable message payload: {}", e)))
}

async fn connect(url: &str) -> Result<async_nats::Client> {
    info!("connecting to NATS at {}", url);
    async_nats::connect(url)
        .await
        .map_err(|e| Error::Channel(format!("failed to connect to NATS: {}", e)))
}

/// Master side of the coordination channel.
#[derive(Clone)]
pub struct NatsCoordinator {
    client: async_nats::Client,
}

impl NatsCoordinator {
    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self {
            client: connect(url).await?,
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

fn decode_envelope(message: &async_nats::Message) -> Result<Envelope> {
    let worker = hostname_from_subject(message.subject.as_str())?;
    let frames = decode_frames(&message.payload)?;
    Ok(Envelope {
        worker,
        message: WorkerMessage::from_frames(&frames)?,
    })
}

#[async_trait]
impl CoordinationBus for NatsCoordinator {
    async fn send(&self, worker: &Hostname, message: MasterMessage) -> Result<()> {
        let subject = worker_subject(worker);
        debug!(subject = %subject, "sending master message");
        let payload = encode_frames(&message.to_frames())?;
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| Error::Channel(format!("failed to publish to worker: {}", e)))
    }

    async fn messages(&self) -> Result<MessageStream> {
        let subscriber = self
            .client
            .subscribe(format!("{}>", MASTER_SUBJECT_PREFIX))
            .await
            .map_err(|e| Error::Channel(format!("failed to subscribe: {}", e)))?;
        Ok(Box::pin(
            subscriber.map(|message| decode_envelope(&message)),
        ))
    }
}

/// Worker side of the coordination channel. Also used by the log daemon,
/// which participates in the ping protocol under its own hostname.
#[derive(Clone)]
pub struct NatsWorkerLink {
    client: async_nats::Client,
    hostname: Hostname,
}

impl NatsWorkerLink {
    pub async fn connect(url: &str, hostname: Hostname) -> Result<Self> {
        Ok(Self {
            client: connect(url).await?,
            hostname,
        })
    }

    pub fn with_client(client: async_nats::Client, hostname: Hostname) -> Self {
        Self { client, hostname }
    }
}

fn decode_reply(message: &async_nats::Message) -> Result<MasterMessage> {
    let frames = decode_frames(&message.payload)?;
    MasterMessage::from_frames(&frames)
}

#[async_trait]
impl WorkerLink for NatsWorkerLink {
    async fn send(&self, message: WorkerMessage) -> Result<()> {
        let payload = encode_frames(&message.to_frames())?;
        self.client
            .publish(master_subject(&self.hostname), payload.into())
            .await
            .map_err(|e| Error::Channel(format!("failed to publish to master: {}", e)))
    }

    async fn replies(&self) -> Result<ReplyStream> {
        let subscriber = self
            .client
            .subscribe(worker_subject(&self.hostname))
            .await
            .map_err(|e| Error::Channel(format!("failed to subscribe: {}", e)))?;
        Ok(Box::pin(subscriber.map(|message| decode_reply(&message))))
    }
}

/// NATS-backed log queue.
#[derive(Clone)]
pub struct NatsLogQueue {
    client: async_nats::Client,
}

impl NatsLogQueue {
    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self {
            client: connect(url).await?,
        })
    }

    pub fn with_client(client: async_nats::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Publish one log line for a job (worker side).
    pub async fn publish_line(&self, job: JobId, line: &str) -> Result<()> {
        self.client
            .publish(log_subject(job), line.as_bytes().to_vec().into())
            .await
            .map_err(|e| Error::Channel(format!("failed to publish log line: {}", e)))
    }
}

fn decode_log_entry(message: &async_nats::Message) -> Result<LogEntry> {
    let job = job_from_subject(message.subject.as_str())?;
    let line = String::from_utf8(message.payload.to_vec())
        .map_err(|e| Error::Channel(format!("log line is not valid UTF-8: {}", e)))?;
    Ok(LogEntry { job, line })
}

#[async_trait]
impl LogQueue for NatsLogQueue {
    async fn records(&self) -> Result<LogStream> {
        let subscriber = self
            .client
            .subscribe(format!("{}>", LOG_SUBJECT_PREFIX))
            .await
            .map_err(|e| Error::Channel(format!("failed to subscribe: {}", e)))?;
        Ok(Box::pin(
            subscriber.map(|message| decode_log_entry(&message)),
        ))
    }
}
