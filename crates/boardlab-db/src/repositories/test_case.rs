//! PostgreSQL implementation of TestCaseRepository.

use async_trait::async_trait;
use boardlab_core::ports::TestCaseRepository;
use boardlab_core::results::{TestCase, TestVerdict};
use boardlab_core::{Error, Result};
use sqlx::PgPool;

pub struct PgTestCaseRepository {
    pool: PgPool,
}

impl PgTestCaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn bind_insert<'q>(
        case: &'q TestCase,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        sqlx::query(
            r#"INSERT INTO test_cases (job, suite, name, result, test_set, measurement, units,
                   start_line, end_line, metadata)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(case.job.as_uuid())
        .bind(&case.suite)
        .bind(&case.name)
        .bind(case.result.as_str())
        .bind(&case.test_set)
        .bind(case.measurement)
        .bind(&case.units)
        .bind(case.start_line.map(|l| l as i64))
        .bind(case.end_line.map(|l| l as i64))
        .bind(&case.metadata)
    }

    #[allow(dead_code)]
    fn str_to_verdict(s: &str) -> TestVerdict {
        match s {
            "pass" => TestVerdict::Pass,
            "fail" => TestVerdict::Fail,
            "skip" => TestVerdict::Skip,
            _ => TestVerdict::Unknown,
        }
    }
}

#[async_trait]
impl TestCaseRepository for PgTestCaseRepository {
    async fn create(&self, case: &TestCase) -> Result<()> {
        Self::bind_insert(case)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Insert a batch atomically. One bad row fails the whole batch; the
    /// ingestion service then retries row by row.
    async fn create_bulk(&self, cases: &[TestCase]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        for case in cases {
            Self::bind_insert(case)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
