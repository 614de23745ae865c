//! PostgreSQL implementation of WorkerRepository.

use async_trait::async_trait;
use boardlab_core::ports::WorkerRepository;
use boardlab_core::{Error, Hostname, Result, Worker, WorkerState};
use sqlx::{PgPool, Row};

pub struct PgWorkerRepository {
    pool: PgPool,
}

impl PgWorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn state_to_str(state: WorkerState) -> &'static str {
        match state {
            WorkerState::Online => "online",
            WorkerState::Offline => "offline",
        }
    }

    fn str_to_state(s: &str) -> WorkerState {
        match s {
            "online" => WorkerState::Online,
            _ => WorkerState::Offline,
        }
    }

    fn row_to_worker(r: &sqlx::postgres::PgRow) -> Worker {
        let state: String = r.get("state");
        Worker {
            hostname: Hostname::new(r.get::<String, _>("hostname")),
            state: Self::str_to_state(&state),
            last_ping: r.get("last_ping"),
            job_limit: r.get::<i32, _>("job_limit") as u32,
        }
    }
}

#[async_trait]
impl WorkerRepository for PgWorkerRepository {
    async fn get(&self, hostname: &Hostname) -> Result<Option<Worker>> {
        let row = sqlx::query(
            "SELECT hostname, state, last_ping, job_limit FROM workers WHERE hostname = $1",
        )
        .bind(hostname.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.as_ref().map(Self::row_to_worker))
    }

    async fn list(&self) -> Result<Vec<Worker>> {
        let rows =
            sqlx::query("SELECT hostname, state, last_ping, job_limit FROM workers ORDER BY hostname")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_worker).collect())
    }

    async fn seen(&self, hostname: &Hostname) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO workers (hostname, state, last_ping)
               VALUES ($1, 'online', NOW())
               ON CONFLICT (hostname) DO UPDATE SET state = 'online', last_ping = NOW()"#,
        )
        .bind(hostname.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn mark_offline(&self, hostname: &Hostname) -> Result<()> {
        sqlx::query("UPDATE workers SET state = 'offline' WHERE hostname = $1")
            .bind(hostname.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
