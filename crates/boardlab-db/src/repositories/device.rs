//! PostgreSQL implementation of DeviceRepository.

use async_trait::async_trait;
use boardlab_core::device::DeviceHealth;
use boardlab_core::ports::DeviceRepository;
use boardlab_core::{Device, DeviceState, Error, Hostname, JobId, Result};
use sqlx::{PgPool, Row};

const DEVICE_COLUMNS: &str =
    "hostname, device_type, worker, state, health, current_job, config_template";

pub struct PgDeviceRepository {
    pool: PgPool,
}

impl PgDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn state_to_str(state: DeviceState) -> &'static str {
        match state {
            DeviceState::Idle => "idle",
            DeviceState::Reserved => "reserved",
            DeviceState::Running => "running",
            DeviceState::Offline => "offline",
        }
    }

    fn str_to_state(s: &str) -> DeviceState {
        match s {
            "idle" => DeviceState::Idle,
            "reserved" => DeviceState::Reserved,
            "running" => DeviceState::Running,
            _ => DeviceState::Offline,
        }
    }

    fn health_to_str(health: DeviceHealth) -> &'static str {
        match health {
            DeviceHealth::Good => "good",
            DeviceHealth::Unknown => "unknown",
            DeviceHealth::Bad => "bad",
        }
    }

    fn str_to_health(s: &str) -> DeviceHealth {
        match s {
            "good" => DeviceHealth::Good,
            "bad" => DeviceHealth::Bad,
            _ => DeviceHealth::Unknown,
        }
    }

    fn row_to_device(r: &sqlx::postgres::PgRow) -> Device {
        let state: String = r.get("state");
        let health: String = r.get("health");
        Device {
            hostname: Hostname::new(r.get::<String, _>("hostname")),
            device_type: r.get("device_type"),
            worker: Hostname::new(r.get::<String, _>("worker")),
            state: Self::str_to_state(&state),
            health: Self::str_to_health(&health),
            current_job: r
                .get::<Option<uuid::Uuid>, _>("current_job")
                .map(JobId::from_uuid),
            config_template: r.get("config_template"),
        }
    }
}

#[async_trait]
impl DeviceRepository for PgDeviceRepository {
    async fn get(&self, hostname: &Hostname) -> Result<Option<Device>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM devices WHERE hostname = $1",
            DEVICE_COLUMNS
        ))
        .bind(hostname.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.as_ref().map(Self::row_to_device))
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM devices ORDER BY hostname",
            DEVICE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_device).collect())
    }

    async fn idle_by_type(&self, device_type: &str) -> Result<Vec<Device>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM devices WHERE device_type = $1 AND state = 'idle' ORDER BY hostname",
            DEVICE_COLUMNS
        ))
        .bind(device_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_device).collect())
    }

    async fn reserve(&self, hostname: &Hostname, job: JobId) -> Result<bool> {
        // Compare-and-swap on the state column: of two concurrent passes,
        // exactly one sees the idle row.
        let result = sqlx::query(
            r#"UPDATE devices SET state = 'reserved', current_job = $2
               WHERE hostname = $1 AND state = 'idle'"#,
        )
        .bind(hostname.as_str())
        .bind(job.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_running(&self, hostname: &Hostname) -> Result<()> {
        sqlx::query("UPDATE devices SET state = 'running' WHERE hostname = $1")
            .bind(hostname.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn release(&self, hostname: &Hostname) -> Result<()> {
        sqlx::query(
            r#"UPDATE devices SET state = 'idle', current_job = NULL
               WHERE hostname = $1 AND state <> 'offline'"#,
        )
        .bind(hostname.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn update(&self, device: &Device) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO devices (hostname, device_type, worker, state, health, current_job, config_template)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (hostname) DO UPDATE SET
                   device_type = EXCLUDED.device_type,
                   worker = EXCLUDED.worker,
                   state = EXCLUDED.state,
                   health = EXCLUDED.health,
                   current_job = EXCLUDED.current_job,
                   config_template = EXCLUDED.config_template"#,
        )
        .bind(device.hostname.as_str())
        .bind(&device.device_type)
        .bind(device.worker.as_str())
        .bind(Self::state_to_str(device.state))
        .bind(Self::health_to_str(device.health))
        .bind(device.current_job.map(|j| *j.as_uuid()))
        .bind(&device.config_template)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_roundtrip() {
        for state in [
            DeviceState::Idle,
            DeviceState::Reserved,
            DeviceState::Running,
            DeviceState::Offline,
        ] {
            assert_eq!(
                PgDeviceRepository::str_to_state(PgDeviceRepository::state_to_str(state)),
                state
            );
        }
    }

    #[test]
    fn test_health_strings_roundtrip() {
        for health in [DeviceHealth::Good, DeviceHealth::Unknown, DeviceHealth::Bad] {
            assert_eq!(
                PgDeviceRepository::str_to_health(PgDeviceRepository::health_to_str(health)),
                health
            );
        }
    }
}
