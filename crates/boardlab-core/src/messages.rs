//! Worker coordination protocol.
//!
//! Every message travels as a small ordered tuple of string frames. The
//! first frame on the wire is always the sending worker's hostname; the
//! frames here start at the message name. `to_frames`/`from_frames` are the
//! wire contract and must round-trip exactly.

use crate::ids::{Hostname, JobId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Coordination protocol version. A HELLO carrying a different version is
/// refused.
pub const PROTOCOL_VERSION: u32 = 3;

/// Interval between worker pings, advertised in PONG.
pub const PING_INTERVAL_SECS: u64 = 20;

/// A worker is considered offline after this long without any message.
pub const WORKER_TIMEOUT_SECS: u64 = 3 * PING_INTERVAL_SECS;

/// Interval between master scheduling passes.
pub const SCHEDULE_INTERVAL_SECS: u64 = 20;

/// Message sent by a worker (or the log daemon) to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMessage {
    Hello { version: u32 },
    HelloRetry { version: u32 },
    Ping,
    StartOk { job: JobId },
    End { job: JobId, exit_code: i32, error: String },
}

/// Message sent by the master to one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterMessage {
    HelloOk,
    Pong { ping_interval: u64 },
    Start {
        job: JobId,
        definition: String,
        device: String,
        /// Environment blob for the worker's job processes; may be empty.
        env: String,
    },
    Cancel { job: JobId },
    Status { job: JobId },
    EndOk { job: JobId },
}

/// A worker message together with the hostname it arrived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub worker: Hostname,
    pub message: WorkerMessage,
}

fn frame_job(frames: &[String], index: usize, name: &str) -> Result<JobId> {
    let frame = frames
        .get(index)
        .ok_or_else(|| Error::Protocol(format!("{} message is missing the job id frame", name)))?;
    frame
        .parse()
        .map_err(|_| Error::Protocol(format!("{} message has an invalid job id: {}", name, frame)))
}

fn frame_u32(frames: &[String], index: usize, name: &str, what: &str) -> Result<u32> {
    let frame = frames
        .get(index)
        .ok_or_else(|| Error::Protocol(format!("{} message is missing the {} frame", name, what)))?;
    frame
        .parse()
        .map_err(|_| Error::Protocol(format!("{} message has an invalid {}: {}", name, what, frame)))
}

impl WorkerMessage {
    pub fn to_frames(&self) -> Vec<String> {
        match self {
            WorkerMessage::Hello { version } => vec!["HELLO".into(), version.to_string()],
            WorkerMessage::HelloRetry { version } => {
                vec!["HELLO_RETRY".into(), version.to_string()]
            }
            WorkerMessage::Ping => vec!["PING".into()],
            WorkerMessage::StartOk { job } => vec!["START_OK".into(), job.to_string()],
            WorkerMessage::End {
                job,
                exit_code,
                error,
            } => vec![
                "END".into(),
                job.to_string(),
                exit_code.to_string(),
                error.clone(),
            ],
        }
    }

    pub fn from_frames(frames: &[String]) -> Result<Self> {
        let name = frames
            .first()
            .ok_or_else(|| Error::Protocol("empty message".into()))?;
        match name.as_str() {
            "HELLO" => Ok(WorkerMessage::Hello {
                version: frame_u32(frames, 1, "HELLO", "version")?,
            }),
            "HELLO_RETRY" => Ok(WorkerMessage::HelloRetry {
                version: frame_u32(frames, 1, "HELLO_RETRY", "version")?,
            }),
            "PING" => Ok(WorkerMessage::Ping),
            "START_OK" => Ok(WorkerMessage::StartOk {
                job: frame_job(frames, 1, "START_OK")?,
            }),
            "END" => {
                let job = frame_job(frames, 1, "END")?;
                let exit_code = frames
                    .get(2)
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| Error::Protocol("END message has an invalid exit code".into()))?;
                let error = frames.get(3).cloned().unwrap_or_default();
                Ok(WorkerMessage::End {
                    job,
                    exit_code,
                    error,
                })
            }
            other => Err(Error::Protocol(format!("unknown worker message: {}", other))),
        }
    }
}

impl MasterMessage {
    pub fn to_frames(&self) -> Vec<String> {
        match self {
            MasterMessage::HelloOk => vec!["HELLO_OK".into()],
            MasterMessage::Pong { ping_interval } => {
                vec!["PONG".into(), ping_interval.to_string()]
            }
            MasterMessage::Start {
                job,
                definition,
                device,
                env,
            } => vec![
                "START".into(),
                job.to_string(),
                definition.clone(),
                device.clone(),
                env.clone(),
            ],
            MasterMessage::Cancel { job } => vec!["CANCEL".into(), job.to_string()],
            MasterMessage::Status { job } => vec!["STATUS".into(), job.to_string()],
            MasterMessage::EndOk { job } => vec!["END_OK".into(), job.to_string()],
        }
    }

    pub fn from_frames(frames: &[String]) -> Result<Self> {
        let name = frames
            .first()
            .ok_or_else(|| Error::Protocol("empty message".into()))?;
        match name.as_str() {
            "HELLO_OK" => Ok(MasterMessage::HelloOk),
            "PONG" => {
                let interval = frames
                    .get(1)
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| Error::Protocol("PONG message has an invalid interval".into()))?;
                Ok(MasterMessage::Pong {
                    ping_interval: interval,
                })
            }
            "START" => Ok(MasterMessage::Start {
                job: frame_job(frames, 1, "START")?,
                definition: frames
                    .get(2)
                    .cloned()
                    .ok_or_else(|| Error::Protocol("START message is missing the definition".into()))?,
                device: frames
                    .get(3)
                    .cloned()
                    .ok_or_else(|| Error::Protocol("START message is missing the device".into()))?,
                env: frames.get(4).cloned().unwrap_or_default(),
            }),
            "CANCEL" => Ok(MasterMessage::Cancel {
                job: frame_job(frames, 1, "CANCEL")?,
            }),
            "STATUS" => Ok(MasterMessage::Status {
                job: frame_job(frames, 1, "STATUS")?,
            }),
            "END_OK" => Ok(MasterMessage::EndOk {
                job: frame_job(frames, 1, "END_OK")?,
            }),
            other => Err(Error::Protocol(format!("unknown master message: {}", other))),
        }
    }
}
