//! PostgreSQL implementation of JobRepository.

use async_trait::async_trait;
use boardlab_core::ports::JobRepository;
use boardlab_core::{Error, Hostname, Job, JobHealth, JobId, JobState, Result};
use sqlx::{PgPool, Row};

const JOB_COLUMNS: &str = "id, definition, priority, health_check, requested_device_type, \
     requested_device, actual_device, target_group, sub_id, state, health, failure_comment, \
     submitted_at, started_at, ended_at";

pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn state_to_str(state: JobState) -> &'static str {
        match state {
            JobState::Submitted => "submitted",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Canceling => "canceling",
            JobState::Finished => "finished",
        }
    }

    fn str_to_state(s: &str) -> JobState {
        match s {
            "scheduled" => JobState::Scheduled,
            "running" => JobState::Running,
            "canceling" => JobState::Canceling,
            "finished" => JobState::Finished,
            _ => JobState::Submitted,
        }
    }

    fn health_to_str(health: JobHealth) -> &'static str {
        match health {
            JobHealth::Unknown => "unknown",
            JobHealth::Complete => "complete",
            JobHealth::Incomplete => "incomplete",
            JobHealth::Canceled => "canceled",
        }
    }

    fn str_to_health(s: &str) -> JobHealth {
        match s {
            "complete" => JobHealth::Complete,
            "incomplete" => JobHealth::Incomplete,
            "canceled" => JobHealth::Canceled,
            _ => JobHealth::Unknown,
        }
    }

    fn row_to_job(r: &sqlx::postgres::PgRow) -> Job {
        let state: String = r.get("state");
        let health: String = r.get("health");
        Job {
            id: JobId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            definition: r.get("definition"),
            priority: r.get("priority"),
            health_check: r.get("health_check"),
            requested_device_type: r.get("requested_device_type"),
            requested_device: r
                .get::<Option<String>, _>("requested_device")
                .map(Hostname::new),
            actual_device: r
                .get::<Option<String>, _>("actual_device")
                .map(Hostname::new),
            target_group: r.get("target_group"),
            sub_id: r.get::<Option<i32>, _>("sub_id").map(|s| s as u32),
            state: Self::str_to_state(&state),
            health: Self::str_to_health(&health),
            failure_comment: r.get("failure_comment"),
            submitted_at: r.get("submitted_at"),
            started_at: r.get("started_at"),
            ended_at: r.get("ended_at"),
        }
    }

    async fn by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE state = $1 ORDER BY submitted_at",
            JOB_COLUMNS
        ))
        .bind(Self::state_to_str(state))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_job).collect())
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, job: &Job) -> Result<JobId> {
        sqlx::query(
            r#"INSERT INTO jobs (id, definition, priority, health_check, requested_device_type,
                   requested_device, actual_device, target_group, sub_id, state, health,
                   failure_comment, submitted_at, started_at, ended_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.definition)
        .bind(job.priority)
        .bind(job.health_check)
        .bind(&job.requested_device_type)
        .bind(job.requested_device.as_ref().map(Hostname::as_str))
        .bind(job.actual_device.as_ref().map(Hostname::as_str))
        .bind(&job.target_group)
        .bind(job.sub_id.map(|s| s as i32))
        .bind(Self::state_to_str(job.state))
        .bind(Self::health_to_str(job.health))
        .bind(&job.failure_comment)
        .bind(job.submitted_at)
        .bind(job.started_at)
        .bind(job.ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.as_ref().map(Self::row_to_job))
    }

    async fn update(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"UPDATE jobs SET definition = $2, priority = $3, actual_device = $4,
                   state = $5, health = $6, failure_comment = $7, started_at = $8, ended_at = $9
               WHERE id = $1"#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.definition)
        .bind(job.priority)
        .bind(job.actual_device.as_ref().map(Hostname::as_str))
        .bind(Self::state_to_str(job.state))
        .bind(Self::health_to_str(job.health))
        .bind(&job.failure_comment)
        .bind(job.started_at)
        .bind(job.ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn submitted(&self) -> Result<Vec<Job>> {
        self.by_state(JobState::Submitted).await
    }

    async fn scheduled(&self) -> Result<Vec<Job>> {
        self.by_state(JobState::Scheduled).await
    }

    async fn canceling(&self) -> Result<Vec<Job>> {
        self.by_state(JobState::Canceling).await
    }

    async fn running_on(&self, worker: &Hostname) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"SELECT j.id, j.definition, j.priority, j.health_check, j.requested_device_type,
                   j.requested_device, j.actual_device, j.target_group, j.sub_id, j.state,
                   j.health, j.failure_comment, j.submitted_at, j.started_at, j.ended_at
               FROM jobs j
               JOIN devices d ON d.hostname = j.actual_device
               WHERE d.worker = $1 AND j.state IN ('running', 'canceling')"#,
        )
        .bind(worker.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_job).collect())
    }

    async fn in_target_group(&self, target_group: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE target_group = $1 ORDER BY sub_id",
            JOB_COLUMNS
        ))
        .bind(target_group)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_job).collect())
    }

    async fn finish(
        &self,
        id: JobId,
        health: JobHealth,
        failure_comment: Option<&str>,
    ) -> Result<bool> {
        // Single statement so concurrent END handling stays idempotent: the
        // first caller finishes the job, later callers match zero rows. A
        // health recorded from the log stream wins over the fallback.
        let result = sqlx::query(
            r#"UPDATE jobs
               SET state = 'finished',
                   ended_at = NOW(),
                   health = CASE WHEN health = 'unknown' THEN $2 ELSE health END,
                   failure_comment = COALESCE(failure_comment, $3)
               WHERE id = $1 AND state <> 'finished'"#,
        )
        .bind(id.as_uuid())
        .bind(Self::health_to_str(health))
        .bind(failure_comment)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_health(&self, id: JobId, health: JobHealth) -> Result<()> {
        sqlx::query("UPDATE jobs SET health = $2 WHERE id = $1 AND health = 'unknown'")
            .bind(id.as_uuid())
            .bind(Self::health_to_str(health))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
