//! Job model and lifecycle.

use crate::error::truncate_comment;
use crate::ids::{Hostname, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduling state of a job.
///
/// `Canceling` is transient: it resolves to `Finished` with health
/// `Canceled` once the owning worker acknowledges the cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Submitted,
    Scheduled,
    Running,
    Canceling,
    Finished,
}

/// Outcome of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobHealth {
    Unknown,
    Complete,
    Incomplete,
    Canceled,
}

/// A submitted test job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Submitted job document, verbatim.
    pub definition: String,
    pub priority: i32,
    pub health_check: bool,
    pub requested_device_type: String,
    /// Pin to one device (health checks do this).
    pub requested_device: Option<Hostname>,
    pub actual_device: Option<Hostname>,
    /// Multi-device group this job belongs to, if any.
    pub target_group: Option<String>,
    pub sub_id: Option<u32>,
    pub state: JobState,
    pub health: JobHealth,
    pub failure_comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(definition: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            definition: definition.into(),
            priority: 50,
            health_check: false,
            requested_device_type: device_type.into(),
            requested_device: None,
            actual_device: None,
            target_group: None,
            sub_id: None,
            state: JobState::Submitted,
            health: JobHealth::Unknown,
            failure_comment: None,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == JobState::Finished
    }

    pub fn go_state_scheduled(&mut self, device: Hostname) {
        if self.state == JobState::Submitted {
            self.state = JobState::Scheduled;
            self.actual_device = Some(device);
        }
    }

    pub fn go_state_running(&mut self) {
        if matches!(self.state, JobState::Scheduled | JobState::Running) {
            self.state = JobState::Running;
            if self.started_at.is_none() {
                self.started_at = Some(Utc::now());
            }
        }
    }

    pub fn go_state_canceling(&mut self) {
        if matches!(
            self.state,
            JobState::Scheduled | JobState::Running | JobState::Canceling
        ) {
            self.state = JobState::Canceling;
        }
    }

    /// Transition to `Finished`. Returns `false` when the job was already
    /// terminal; the call is then a no-op and the first outcome is kept.
    pub fn go_state_finished(&mut self, health: JobHealth) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Finished;
        if self.health == JobHealth::Unknown {
            self.health = health;
        }
        self.ended_at = Some(Utc::now());
        true
    }

    pub fn set_failure_comment(&mut self, comment: &str) {
        self.failure_comment = Some(truncate_comment(comment));
    }
}
