//! Worker records.

use crate::ids::Hostname;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Online,
    Offline,
}

/// A worker process driving one or more devices.
///
/// Workers are known only by hostname; they appear when the first HELLO
/// arrives and are marked offline when pings stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub hostname: Hostname,
    pub state: WorkerState,
    pub last_ping: DateTime<Utc>,
    /// Maximum concurrent jobs, 0 = unlimited.
    pub job_limit: u32,
}

impl Worker {
    pub fn new(hostname: Hostname) -> Self {
        Self {
            hostname,
            state: WorkerState::Online,
            last_ping: Utc::now(),
            job_limit: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == WorkerState::Online
    }
}
