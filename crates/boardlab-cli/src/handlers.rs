//! Command handlers wiring the services together.

use boardlab_comms::{NatsCoordinator, NatsLogQueue, NatsWorkerLink};
use boardlab_core::{Error, Hostname, JobId, Result};
use boardlab_db::{
    Database, PgDeviceRepository, PgJobRepository, PgTestCaseRepository, PgWorkerRepository,
};
use boardlab_logs::LogIngestor;
use boardlab_scheduler::{Master, MasterConfig};
use std::sync::Arc;
use tracing::info;

fn shutdown_signal() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn database(database_url: &str) -> Result<Database> {
    let db = Database::connect(database_url).await?;
    db.migrate().await?;
    Ok(db)
}

pub async fn master(nats_url: &str, database_url: &str, env_file: Option<&str>) -> Result<()> {
    let db = database(database_url).await?;
    let bus = NatsCoordinator::connect(nats_url).await?;

    let mut config = MasterConfig::default();
    if let Some(path) = env_file {
        config.env = std::fs::read_to_string(path)?;
    }
    let mut master = Master::with_config(
        Arc::new(PgJobRepository::new(db.pool().clone())),
        Arc::new(PgDeviceRepository::new(db.pool().clone())),
        Arc::new(PgWorkerRepository::new(db.pool().clone())),
        Arc::new(PgTestCaseRepository::new(db.pool().clone())),
        Arc::new(bus),
        config,
    );
    master.run(shutdown_signal()).await
}

pub async fn logs(
    nats_url: &str,
    database_url: &str,
    output_dir: &str,
    hostname: &str,
) -> Result<()> {
    let db = database(database_url).await?;
    let queue = NatsLogQueue::connect(nats_url).await?;
    let link = NatsWorkerLink::with_client(queue.client().clone(), Hostname::new(hostname));

    let mut ingestor = LogIngestor::new(
        output_dir,
        Arc::new(PgJobRepository::new(db.pool().clone())),
        Arc::new(PgTestCaseRepository::new(db.pool().clone())),
        Arc::new(queue),
        Arc::new(link),
    );
    ingestor.run(shutdown_signal()).await
}

pub async fn submit(path: &str, database_url: &str) -> Result<()> {
    let definition = std::fs::read_to_string(path)?;
    let db = database(database_url).await?;
    let jobs = PgJobRepository::new(db.pool().clone());
    let id = boardlab_scheduler::submit_job(&jobs, &definition).await?;
    println!("{}", id);
    Ok(())
}

fn parse_job_id(job: &str) -> Result<JobId> {
    job.parse()
        .map_err(|_| Error::Validation(format!("invalid job id: {}", job)))
}

pub async fn cancel(job: &str, database_url: &str) -> Result<()> {
    let id = parse_job_id(job)?;
    let db = database(database_url).await?;
    let jobs = PgJobRepository::new(db.pool().clone());
    let devices = PgDeviceRepository::new(db.pool().clone());
    boardlab_scheduler::request_cancel(&jobs, &devices, id).await?;
    println!("cancellation requested for {}", id);
    Ok(())
}

pub async fn show(job: &str, database_url: &str) -> Result<()> {
    use boardlab_core::ports::JobRepository;

    let id = parse_job_id(job)?;
    let db = database(database_url).await?;
    let jobs = PgJobRepository::new(db.pool().clone());
    let Some(job) = jobs.get(id).await? else {
        return Err(Error::JobNotFound(id.to_string()));
    };
    println!("id:        {}", job.id);
    println!("state:     {:?}", job.state);
    println!("health:    {:?}", job.health);
    println!("type:      {}", job.requested_device_type);
    if let Some(device) = &job.actual_device {
        println!("device:    {}", device);
    }
    if let Some(comment) = &job.failure_comment {
        println!("failure:   {}", comment);
    }
    Ok(())
}

pub async fn devices(database_url: &str) -> Result<()> {
    use boardlab_core::ports::DeviceRepository;

    let db = database(database_url).await?;
    let devices = PgDeviceRepository::new(db.pool().clone());
    for device in devices.list().await? {
        let job = device
            .current_job
            .map(|j| j.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<20} {:<12} {:?}/{:?} {}",
            device.hostname, device.device_type, device.worker, device.state, device.health, job
        );
    }
    Ok(())
}
