//! In-memory repository and bus fakes shared by the scheduler tests.

use async_trait::async_trait;
use boardlab_core::device::DeviceHealth;
use boardlab_core::messages::{Envelope, MasterMessage};
use boardlab_core::ports::{
    CoordinationBus, DeviceRepository, JobRepository, MessageStream, TestCaseRepository,
    WorkerRepository,
};
use boardlab_core::results::TestCase;
use boardlab_core::{
    Device, DeviceState, Error, Hostname, Job, JobHealth, JobId, JobState, Result, Worker,
};
use std::collections::HashMap;
use std::sync::Mutex;

const DEVICE_TEMPLATE: &str = r#"hostname: ${{ device.hostname }}
device_type: ${{ device.device_type }}
commands:
  connect: telnet localhost 2000
  power_off: pdu off 1
actions:
  deploy:
    methods: [tftp]
  boot:
    methods: [u-boot, minimal]
"#;

pub fn device(hostname: &str, device_type: &str, worker: &str) -> Device {
    Device {
        hostname: Hostname::new(hostname),
        device_type: device_type.to_string(),
        worker: Hostname::new(worker),
        state: DeviceState::Idle,
        health: DeviceHealth::Good,
        current_job: None,
        config_template: DEVICE_TEMPLATE.to_string(),
    }
}

pub fn job_for(device_type: &str) -> Job {
    Job::new("timeouts:\n  job: {minutes: 10}\nactions: []", device_type)
}

#[derive(Default)]
pub struct MockJobRepository {
    jobs: Mutex<HashMap<JobId, Job>>,
    // Device-to-worker ownership, needed to answer `running_on`.
    device_workers: Mutex<HashMap<Hostname, Hostname>>,
}

impl MockJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, id: JobId) -> Job {
        self.jobs.lock().unwrap().get(&id).cloned().unwrap()
    }

    pub fn map_device_worker(&self, device: &Hostname, worker: &Hostname) {
        self.device_workers
            .lock()
            .unwrap()
            .insert(device.clone(), worker.clone());
    }

    fn filter_state(&self, state: JobState) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn create(&self, job: &Job) -> Result<JobId> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn submitted(&self) -> Result<Vec<Job>> {
        Ok(self.filter_state(JobState::Submitted))
    }

    async fn scheduled(&self) -> Result<Vec<Job>> {
        Ok(self.filter_state(JobState::Scheduled))
    }

    async fn canceling(&self) -> Result<Vec<Job>> {
        Ok(self.filter_state(JobState::Canceling))
    }

    async fn running_on(&self, worker: &Hostname) -> Result<Vec<Job>> {
        let device_workers = self.device_workers.lock().unwrap();
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| matches!(j.state, JobState::Running | JobState::Canceling))
            .filter(|j| {
                j.actual_device
                    .as_ref()
                    .and_then(|d| device_workers.get(d))
                    .is_some_and(|w| w == worker)
            })
            .cloned()
            .collect())
    }

    async fn in_target_group(&self, target_group: &str) -> Result<Vec<Job>> {
        let mut members: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.target_group.as_deref() == Some(target_group))
            .cloned()
            .collect();
        members.sort_by_key(|j| j.sub_id);
        Ok(members)
    }

    async fn finish(
        &self,
        id: JobId,
        health: JobHealth,
        failure_comment: Option<&str>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| Error::JobNotFound(id.to_string()))?;
        let finished = job.go_state_finished(health);
        if finished
            && let Some(comment) = failure_comment
            && job.failure_comment.is_none()
        {
            job.set_failure_comment(comment);
        }
        Ok(finished)
    }

    async fn set_health(&self, id: JobId, health: JobHealth) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| Error::JobNotFound(id.to_string()))?;
        if job.health == JobHealth::Unknown {
            job.health = health;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDeviceRepository {
    devices: Mutex<HashMap<Hostname, Device>>,
}

impl MockDeviceRepository {
    pub fn with(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(
                devices
                    .into_iter()
                    .map(|d| (d.hostname.clone(), d))
                    .collect(),
            ),
        }
    }

    pub fn device(&self, hostname: &Hostname) -> Device {
        self.devices.lock().unwrap().get(hostname).cloned().unwrap()
    }
}

#[async_trait]
impl DeviceRepository for MockDeviceRepository {
    async fn get(&self, hostname: &Hostname) -> Result<Option<Device>> {
        Ok(self.devices.lock().unwrap().get(hostname).cloned())
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.devices.lock().unwrap().values().cloned().collect();
        devices.sort_by(|a, b| a.hostname.as_str().cmp(b.hostname.as_str()));
        Ok(devices)
    }

    async fn idle_by_type(&self, device_type: &str) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.device_type == device_type && d.state == DeviceState::Idle)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.hostname.as_str().cmp(b.hostname.as_str()));
        Ok(devices)
    }

    async fn reserve(&self, hostname: &Hostname, job: JobId) -> Result<bool> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(hostname)
            .ok_or_else(|| Error::DeviceNotFound(hostname.to_string()))?;
        if device.state != DeviceState::Idle {
            return Ok(false);
        }
        device.state = DeviceState::Reserved;
        device.current_job = Some(job);
        Ok(true)
    }

    async fn mark_running(&self, hostname: &Hostname) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(hostname)
            .ok_or_else(|| Error::DeviceNotFound(hostname.to_string()))?;
        device.state = DeviceState::Running;
        Ok(())
    }

    async fn release(&self, hostname: &Hostname) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(hostname)
            .ok_or_else(|| Error::DeviceNotFound(hostname.to_string()))?;
        device.state = DeviceState::Idle;
        device.current_job = None;
        Ok(())
    }

    async fn update(&self, device: &Device) -> Result<()> {
        self.devices
            .lock()
            .unwrap()
            .insert(device.hostname.clone(), device.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockWorkerRepository {
    workers: Mutex<HashMap<Hostname, Worker>>,
}

impl MockWorkerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(workers: Vec<Worker>) -> Self {
        Self {
            workers: Mutex::new(
                workers
                    .into_iter()
                    .map(|w| (w.hostname.clone(), w))
                    .collect(),
            ),
        }
    }

    pub fn worker(&self, hostname: &Hostname) -> Worker {
        self.workers.lock().unwrap().get(hostname).cloned().unwrap()
    }
}

#[async_trait]
impl WorkerRepository for MockWorkerRepository {
    async fn get(&self, hostname: &Hostname) -> Result<Option<Worker>> {
        Ok(self.workers.lock().unwrap().get(hostname).cloned())
    }

    async fn list(&self) -> Result<Vec<Worker>> {
        Ok(self.workers.lock().unwrap().values().cloned().collect())
    }

    async fn seen(&self, hostname: &Hostname) -> Result<()> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .entry(hostname.clone())
            .or_insert_with(|| Worker::new(hostname.clone()));
        worker.state = boardlab_core::WorkerState::Online;
        worker.last_ping = chrono::Utc::now();
        Ok(())
    }

    async fn mark_offline(&self, hostname: &Hostname) -> Result<()> {
        if let Some(worker) = self.workers.lock().unwrap().get_mut(hostname) {
            worker.state = boardlab_core::WorkerState::Offline;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockCaseRepository {
    cases: Mutex<Vec<TestCase>>,
}

impl MockCaseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cases(&self) -> Vec<TestCase> {
        self.cases.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestCaseRepository for MockCaseRepository {
    async fn create(&self, case: &TestCase) -> Result<()> {
        self.cases.lock().unwrap().push(case.clone());
        Ok(())
    }

    async fn create_bulk(&self, cases: &[TestCase]) -> Result<()> {
        self.cases.lock().unwrap().extend_from_slice(cases);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockBus {
    sent: Mutex<Vec<(Hostname, MasterMessage)>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Hostname, MasterMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl CoordinationBus for MockBus {
    async fn send(&self, worker: &Hostname, message: MasterMessage) -> Result<()> {
        self.sent.lock().unwrap().push((worker.clone(), message));
        Ok(())
    }

    async fn messages(&self) -> Result<MessageStream> {
        Ok(Box::pin(futures::stream::pending::<Result<Envelope>>()))
    }
}
