//! Device assignment.
//!
//! The scheduling pass matches submitted jobs to idle devices. Assignment is
//! deterministic (health checks first, then priority, then submission order)
//! and relies on the repository's atomic reserve to stay safe against
//! concurrent passes: losing a reservation race silently requeues the job.

use boardlab_core::ports::{DeviceRepository, JobRepository, WorkerRepository};
use boardlab_core::{Device, DeviceState, Error, Hostname, Job, JobHealth, JobId, JobState, Result};
use boardlab_pipeline::JobDefinition;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub struct Scheduler {
    jobs: Arc<dyn JobRepository>,
    devices: Arc<dyn DeviceRepository>,
    workers: Arc<dyn WorkerRepository>,
}

impl Scheduler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        devices: Arc<dyn DeviceRepository>,
        workers: Arc<dyn WorkerRepository>,
    ) -> Self {
        Self {
            jobs,
            devices,
            workers,
        }
    }

    /// Assign devices to submitted jobs. Only devices whose worker is in
    /// `online` are considered. Returns the jobs scheduled in this pass.
    pub async fn schedule_pass(&self, online: &HashSet<Hostname>) -> Result<Vec<JobId>> {
        let mut submitted = self.jobs.submitted().await?;
        sort_for_assignment(&mut submitted);

        let mut scheduled = Vec::new();
        let mut handled_groups: HashSet<String> = HashSet::new();
        for job in &submitted {
            if let Some(group) = &job.target_group {
                if handled_groups.insert(group.clone()) {
                    scheduled.extend(self.schedule_group(group, online).await?);
                }
                continue;
            }
            if let Some(id) = self.schedule_single(job, online).await? {
                scheduled.push(id);
            }
        }
        Ok(scheduled)
    }

    async fn schedule_single(&self, job: &Job, online: &HashSet<Hostname>) -> Result<Option<JobId>> {
        match self.reserve_for(job, online).await? {
            Some(device) => {
                let mut job = job.clone();
                job.go_state_scheduled(device);
                self.jobs.update(&job).await?;
                Ok(Some(job.id))
            }
            // No device right now: the job stays submitted.
            None => Ok(None),
        }
    }

    /// Reserve one suitable device for a job, racing other passes.
    async fn reserve_for(&self, job: &Job, online: &HashSet<Hostname>) -> Result<Option<Hostname>> {
        let candidates: Vec<Device> = match &job.requested_device {
            Some(hostname) => self.devices.get(hostname).await?.into_iter().collect(),
            None => self.devices.idle_by_type(&job.requested_device_type).await?,
        };
        for device in candidates {
            if !device.is_idle() || !device.accepts(job.health_check) {
                continue;
            }
            if !online.contains(&device.worker) {
                continue;
            }
            if !self.worker_has_capacity(&device.worker).await? {
                debug!(job = %job.id, worker = %device.worker, "worker is at its job limit");
                continue;
            }
            if self.devices.reserve(&device.hostname, job.id).await? {
                debug!(job = %job.id, device = %device.hostname, "device reserved");
                return Ok(Some(device.hostname));
            }
            // Lost the race for this device; try the next candidate.
        }
        Ok(None)
    }

    /// Whether the worker can take one more job. Every assigned job holds a
    /// reserved or running device, so counting those covers reservations
    /// made earlier in the same pass.
    async fn worker_has_capacity(&self, worker: &Hostname) -> Result<bool> {
        let Some(record) = self.workers.get(worker).await? else {
            return Ok(true);
        };
        if record.job_limit == 0 {
            return Ok(true);
        }
        let active = self
            .devices
            .list()
            .await?
            .iter()
            .filter(|d| d.worker == *worker)
            .filter(|d| matches!(d.state, DeviceState::Reserved | DeviceState::Running))
            .count();
        Ok((active as u32) < record.job_limit)
    }

    /// Schedule a multi-device group, all-or-nothing: every sub-job must get
    /// a device in the same pass, otherwise the reservations are handed back
    /// and the whole group waits.
    async fn schedule_group(&self, group: &str, online: &HashSet<Hostname>) -> Result<Vec<JobId>> {
        let members = self.jobs.in_target_group(group).await?;
        if members.iter().any(|j| j.state != JobState::Submitted) {
            // A sub-job was canceled or is already moving; nothing to do.
            return Ok(Vec::new());
        }

        let mut reservations: Vec<(Job, Hostname)> = Vec::new();
        for job in &members {
            match self.reserve_for(job, online).await? {
                Some(device) => reservations.push((job.clone(), device)),
                None => {
                    for (_, device) in &reservations {
                        self.devices.release(device).await?;
                    }
                    debug!(group, "not enough devices for the group, retrying later");
                    return Ok(Vec::new());
                }
            }
        }

        // Every sub-job learns which device plays which role before it starts.
        let mut peers: HashMap<String, Vec<String>> = HashMap::new();
        for (job, device) in &reservations {
            peers
                .entry(definition_role(&job.definition))
                .or_default()
                .push(device.to_string());
        }

        let mut ids = Vec::new();
        for (mut job, device) in reservations {
            job.definition = inject_peers(&job.definition, &peers)?;
            job.go_state_scheduled(device);
            self.jobs.update(&job).await?;
            ids.push(job.id);
        }
        Ok(ids)
    }
}

/// Assignment order: health checks first, then descending priority, then
/// submission time. The target group key keeps sub-jobs of one group
/// adjacent; sub id and job id are the final tie-breaks.
fn sort_for_assignment(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.health_check
            .cmp(&a.health_check)
            .then(b.priority.cmp(&a.priority))
            .then(a.submitted_at.cmp(&b.submitted_at))
            .then(a.target_group.cmp(&b.target_group))
            .then(a.sub_id.cmp(&b.sub_id))
            .then(a.id.to_string().cmp(&b.id.to_string()))
    });
}

fn definition_role(definition: &str) -> String {
    JobDefinition::from_yaml(definition)
        .ok()
        .and_then(|d| {
            d.protocols
                .get("multinode")
                .and_then(|m| m.get("role"))
                .and_then(serde_json::Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| "node".to_string())
}

/// Write the group's role-to-device map into the stored definition, under
/// `protocols.multinode.peers`, so the worker-side protocol can answer
/// `roles` requests.
pub fn inject_peers(definition: &str, peers: &HashMap<String, Vec<String>>) -> Result<String> {
    use serde_yaml::Value;

    let mut doc: Value =
        serde_yaml::from_str(definition).map_err(|e| Error::Validation(e.to_string()))?;
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| Error::Validation("job definition is not a mapping".into()))?;

    let protocols = root
        .entry(Value::from("protocols"))
        .or_insert_with(|| Value::Mapping(Default::default()));
    let protocols = protocols
        .as_mapping_mut()
        .ok_or_else(|| Error::Validation("'protocols' is not a mapping".into()))?;
    let multinode = protocols
        .entry(Value::from("multinode"))
        .or_insert_with(|| Value::Mapping(Default::default()));
    let multinode = multinode
        .as_mapping_mut()
        .ok_or_else(|| Error::Validation("'multinode' is not a mapping".into()))?;

    multinode.insert(
        Value::from("peers"),
        serde_yaml::to_value(peers).map_err(|e| Error::Serialization(e.to_string()))?,
    );
    serde_yaml::to_string(&doc).map_err(|e| Error::Serialization(e.to_string()))
}

/// Validate and store a new job. The full pipeline is only compiled at
/// dispatch time, once a device is known; submission checks the definition
/// shape and the job timeout.
pub async fn submit_job(jobs: &dyn JobRepository, definition: &str) -> Result<JobId> {
    let parsed = JobDefinition::from_yaml(definition)?;
    let device_type = parsed
        .device_type
        .clone()
        .ok_or_else(|| Error::Validation("job definition needs a 'device_type'".into()))?;
    if parsed.timeouts.job.is_zero() {
        return Err(Error::Validation(
            "the job timeout must be set and positive".into(),
        ));
    }
    let mut job = Job::new(definition, device_type);
    if let Some(priority) = parsed.priority {
        job.priority = priority;
    }
    jobs.create(&job).await?;
    Ok(job.id)
}

/// Request cancellation of a job.
///
/// Jobs that never reached a worker finish immediately as `Canceled`; a
/// running job enters the transient `Canceling` state and waits for the
/// worker's END.
pub async fn request_cancel(
    jobs: &dyn JobRepository,
    devices: &dyn DeviceRepository,
    id: JobId,
) -> Result<()> {
    let Some(mut job) = jobs.get(id).await? else {
        return Err(Error::JobNotFound(id.to_string()));
    };
    match job.state {
        JobState::Submitted | JobState::Scheduled => {
            jobs.finish(id, JobHealth::Canceled, None).await?;
            if let Some(device) = &job.actual_device {
                devices.release(device).await?;
            }
        }
        JobState::Running => {
            job.go_state_canceling();
            jobs.update(&job).await?;
        }
        JobState::Canceling | JobState::Finished => {}
    }
    Ok(())
}
