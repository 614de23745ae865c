//! Master event loop.
//!
//! Owns the coordination channel: answers worker messages, runs the periodic
//! dispatch pass (assign, start, cancel) and expires silent workers. All
//! state lives in the repositories; the master itself can restart at any
//! time and resynchronize from persisted job state.

use crate::scheduler::Scheduler;
use crate::workers::WorkerTracker;
use boardlab_core::device::DeviceConfig;
use boardlab_core::messages::{
    Envelope, MasterMessage, WorkerMessage, PING_INTERVAL_SECS, PROTOCOL_VERSION,
    SCHEDULE_INTERVAL_SECS, WORKER_TIMEOUT_SECS,
};
use boardlab_core::ports::{
    CoordinationBus, DeviceRepository, JobRepository, TestCaseRepository, WorkerRepository,
};
use boardlab_core::render::RenderContext;
use boardlab_core::results::{TestCase, TestVerdict, FRAMEWORK_SUITE, JOB_CASE};
use boardlab_core::{Device, Error, Hostname, Job, JobHealth, JobId, JobState, Result};
use boardlab_pipeline::{JobDefinition, JobParser, ProtocolRegistry, Registry};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub ping_interval: Duration,
    pub schedule_interval: Duration,
    pub worker_timeout: Duration,
    /// Environment blob shipped with every START; may be empty.
    pub env: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            schedule_interval: Duration::from_secs(SCHEDULE_INTERVAL_SECS),
            worker_timeout: Duration::from_secs(WORKER_TIMEOUT_SECS),
            env: String::new(),
        }
    }
}

pub struct Master {
    jobs: Arc<dyn JobRepository>,
    devices: Arc<dyn DeviceRepository>,
    workers: Arc<dyn WorkerRepository>,
    cases: Arc<dyn TestCaseRepository>,
    bus: Arc<dyn CoordinationBus>,
    scheduler: Scheduler,
    strategies: Registry,
    protocols: ProtocolRegistry,
    tracker: WorkerTracker,
    config: MasterConfig,
}

impl Master {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        devices: Arc<dyn DeviceRepository>,
        workers: Arc<dyn WorkerRepository>,
        cases: Arc<dyn TestCaseRepository>,
        bus: Arc<dyn CoordinationBus>,
    ) -> Self {
        Self::with_config(jobs, devices, workers, cases, bus, MasterConfig::default())
    }

    pub fn with_config(
        jobs: Arc<dyn JobRepository>,
        devices: Arc<dyn DeviceRepository>,
        workers: Arc<dyn WorkerRepository>,
        cases: Arc<dyn TestCaseRepository>,
        bus: Arc<dyn CoordinationBus>,
        config: MasterConfig,
    ) -> Self {
        let scheduler = Scheduler::new(jobs.clone(), devices.clone(), workers.clone());
        let tracker = WorkerTracker::new(config.worker_timeout);
        Self {
            jobs,
            devices,
            workers,
            cases,
            bus,
            scheduler,
            strategies: Registry::builtin(),
            protocols: ProtocolRegistry::builtin(),
            tracker,
            config,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let mut messages = self.bus.messages().await?;
        let mut schedule_tick = tokio::time::interval(self.config.schedule_interval);
        let mut expire_tick = tokio::time::interval(self.config.ping_interval);
        info!("master loop started");

        loop {
            tokio::select! {
                inbound = messages.next() => match inbound {
                    Some(Ok(envelope)) => {
                        if let Err(e) = self.handle(envelope).await {
                            warn!(error = %e, "failed to handle worker message");
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "dropping malformed worker message"),
                    None => {
                        warn!("coordination channel closed");
                        break;
                    }
                },
                _ = schedule_tick.tick() => {
                    if let Err(e) = self.dispatch().await {
                        warn!(error = %e, "dispatch pass failed");
                    }
                }
                _ = expire_tick.tick() => {
                    if let Err(e) = self.expire_workers().await {
                        warn!(error = %e, "worker expiry failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("master loop stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One dispatch pass: assign devices, start scheduled jobs, push
    /// pending cancellations.
    pub async fn dispatch(&self) -> Result<()> {
        let online = self.tracker.online_workers();
        self.scheduler.schedule_pass(&online).await?;
        self.start_scheduled().await?;
        self.cancel_pass().await?;
        Ok(())
    }

    /// Process one inbound worker message.
    pub async fn handle(&mut self, envelope: Envelope) -> Result<()> {
        let worker = envelope.worker.clone();
        let known = self.tracker.seen(&worker);
        self.workers.seen(&worker).await?;

        match envelope.message {
            WorkerMessage::Hello { version } | WorkerMessage::HelloRetry { version } => {
                self.handle_hello(&worker, version).await
            }
            WorkerMessage::Ping => self.handle_ping(&worker, known).await,
            WorkerMessage::StartOk { job } => self.handle_start_ok(job).await,
            WorkerMessage::End {
                job,
                exit_code,
                error,
            } => self.handle_end(&worker, job, exit_code, &error).await,
        }
    }

    async fn handle_hello(&self, worker: &Hostname, version: u32) -> Result<()> {
        if version != PROTOCOL_VERSION {
            // Answering would make the worker believe the handshake worked;
            // silence lets it retry and surface the mismatch in its logs.
            warn!(
                worker = %worker,
                version,
                expected = PROTOCOL_VERSION,
                "ignoring worker with incompatible protocol version"
            );
            return Ok(());
        }
        self.bus.send(worker, MasterMessage::HelloOk).await?;
        info!(worker = %worker, "worker registered");

        // A fresh HELLO means the worker restarted: whatever it was running
        // is gone.
        for job in self.jobs.running_on(worker).await? {
            warn!(job = %job.id, worker = %worker, "canceling job lost in worker restart");
            self.jobs
                .finish(job.id, JobHealth::Canceled, Some("worker restarted"))
                .await?;
            if let Some(device) = &job.actual_device {
                self.devices.release(device).await?;
            }
        }
        Ok(())
    }

    async fn handle_ping(&self, worker: &Hostname, known: bool) -> Result<()> {
        self.bus
            .send(
                worker,
                MasterMessage::Pong {
                    ping_interval: self.config.ping_interval.as_secs(),
                },
            )
            .await?;

        if !known {
            // Master restart: rebuild the worker's view from persisted
            // job state.
            for job in self.jobs.running_on(worker).await? {
                debug!(job = %job.id, worker = %worker, "resyncing job status");
                self.bus
                    .send(worker, MasterMessage::Status { job: job.id })
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_start_ok(&self, id: JobId) -> Result<()> {
        let Some(mut job) = self.jobs.get(id).await? else {
            warn!(job = %id, "START_OK for unknown job");
            return Ok(());
        };
        job.go_state_running();
        self.jobs.update(&job).await?;
        if let Some(device) = &job.actual_device {
            self.devices.mark_running(device).await?;
        }
        info!(job = %id, "job running");
        Ok(())
    }

    async fn handle_end(
        &self,
        worker: &Hostname,
        id: JobId,
        exit_code: i32,
        error: &str,
    ) -> Result<()> {
        // END is acknowledged unconditionally so the worker can drop the
        // job, even when the message is a duplicate.
        if let Some(job) = self.jobs.get(id).await? {
            let fallback = if job.state == JobState::Canceling {
                JobHealth::Canceled
            } else if exit_code == 0 {
                JobHealth::Complete
            } else {
                JobHealth::Incomplete
            };
            let comment = (!error.is_empty()).then(|| boardlab_core::error::truncate_comment(error));
            let finished = self.jobs.finish(id, fallback, comment.as_deref()).await?;
            if finished {
                if let Some(device) = &job.actual_device {
                    self.devices.release(device).await?;
                }
                info!(job = %id, exit_code, "job ended");
            } else {
                debug!(job = %id, "duplicate END acknowledged");
            }
        } else {
            warn!(job = %id, "END for unknown job");
        }
        self.bus.send(worker, MasterMessage::EndOk { job: id }).await
    }

    /// Compile and start every scheduled job. A job that fails to compile is
    /// finished as incomplete without blocking the others.
    async fn start_scheduled(&self) -> Result<()> {
        for job in self.jobs.scheduled().await? {
            if let Err(e) = self.start_job(&job).await {
                warn!(job = %job.id, error = %e, "failed to start job");
                self.fail_before_start(&job, &e).await?;
            }
        }
        Ok(())
    }

    async fn start_job(&self, job: &Job) -> Result<()> {
        let device_host = job
            .actual_device
            .clone()
            .ok_or_else(|| Error::Internal("scheduled job without a device".into()))?;
        let device = self
            .devices
            .get(&device_host)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(device_host.to_string()))?;

        let definition = JobDefinition::from_yaml(&job.definition)?;
        let rendered = render_device_config(&device, &definition);
        let config = DeviceConfig::from_yaml(&rendered)?;

        // Compile the pipeline master-side: jobs that cannot run on this
        // device must fail here, not on the worker.
        let parser = JobParser::new(&self.strategies, &self.protocols);
        let mut parsed = parser.parse_definition(&definition, &config, job.id)?;
        parsed.pipeline.validate(&config);
        let errors = parsed.pipeline.errors();
        if !errors.is_empty() {
            return Err(Error::Validation(errors.join("; ")));
        }

        let mut job = job.clone();
        job.go_state_running();
        self.jobs.update(&job).await?;
        self.devices.mark_running(&device_host).await?;
        self.bus
            .send(
                &device.worker,
                MasterMessage::Start {
                    job: job.id,
                    definition: job.definition.clone(),
                    device: rendered,
                    env: self.config.env.clone(),
                },
            )
            .await?;
        info!(job = %job.id, device = %device_host, worker = %device.worker, "job started");
        Ok(())
    }

    /// A job that failed before reaching its worker still gets a terminal
    /// result record, so the failure is visible in the result stream.
    async fn fail_before_start(&self, job: &Job, error: &Error) -> Result<()> {
        let comment = error.failure_comment();
        let case = TestCase {
            job: job.id,
            suite: FRAMEWORK_SUITE.to_string(),
            name: JOB_CASE.to_string(),
            result: TestVerdict::Fail,
            test_set: None,
            measurement: None,
            units: None,
            start_line: None,
            end_line: None,
            metadata: format!("error: {}\n", comment),
        };
        if let Err(e) = self.cases.create(&case).await {
            warn!(job = %job.id, error = %e, "failed to record the failure case");
        }
        self.jobs
            .finish(job.id, JobHealth::Incomplete, Some(&comment))
            .await?;
        if let Some(device) = &job.actual_device {
            self.devices.release(device).await?;
        }
        Ok(())
    }

    /// Forward pending cancellations to the owning workers. Jobs canceled
    /// before their worker ever saw them finish directly.
    async fn cancel_pass(&self) -> Result<()> {
        for job in self.jobs.canceling().await? {
            match &job.actual_device {
                Some(hostname) => {
                    if let Some(device) = self.devices.get(hostname).await? {
                        self.bus
                            .send(&device.worker, MasterMessage::Cancel { job: job.id })
                            .await?;
                    }
                }
                None => {
                    self.jobs.finish(job.id, JobHealth::Canceled, None).await?;
                }
            }
        }
        Ok(())
    }

    async fn expire_workers(&mut self) -> Result<()> {
        for worker in self.tracker.expire() {
            warn!(worker = %worker, "worker went silent, marking offline");
            self.workers.mark_offline(&worker).await?;
        }
        Ok(())
    }
}

fn render_device_config(device: &Device, definition: &JobDefinition) -> String {
    let mut ctx = RenderContext::new();
    for (key, value) in &definition.context {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ctx.context.insert(key.clone(), rendered);
    }
    ctx.device
        .insert("hostname".into(), device.hostname.to_string());
    ctx.device
        .insert("device_type".into(), device.device_type.clone());
    ctx.render(&device.config_template)
}
