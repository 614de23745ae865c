//! Log ingestion service.
//!
//! Consumes the per-job log queue: every line is appended verbatim to the
//! job's output file, `results` records are extracted into test-case rows,
//! and the terminal `boardlab/job` result drives the job's content health.
//! The service also keeps its own liveness ping towards the master, adopting
//! whatever interval the master advertises in its PONG.

use crate::files::{FileMap, HANDLE_IDLE_TIMEOUT};
use boardlab_core::messages::{MasterMessage, WorkerMessage, PING_INTERVAL_SECS};
use boardlab_core::ports::{JobRepository, LogEntry, LogQueue, TestCaseRepository, WorkerLink};
use boardlab_core::results::{
    LogRecord, ResultRecord, TestCase, TestVerdict, METADATA_MAX_BYTES,
};
use boardlab_core::{Error, JobHealth, JobId, Result};
use futures::StreamExt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often buffered test cases are flushed to the repository.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Byte budget for each name component of a metadata side file.
const SIDE_FILE_COMPONENT_MAX: usize = 64;

/// Byte budget for the identifying fields kept in a stripped record.
const STRIPPED_FIELD_MAX: usize = 256;

pub struct LogIngestor {
    files: FileMap,
    jobs: Arc<dyn JobRepository>,
    cases: Arc<dyn TestCaseRepository>,
    queue: Arc<dyn LogQueue>,
    link: Arc<dyn WorkerLink>,
    pending: Vec<TestCase>,
    ping_interval: Duration,
}

impl LogIngestor {
    pub fn new(
        root: impl Into<PathBuf>,
        jobs: Arc<dyn JobRepository>,
        cases: Arc<dyn TestCaseRepository>,
        queue: Arc<dyn LogQueue>,
        link: Arc<dyn WorkerLink>,
    ) -> Self {
        Self {
            files: FileMap::new(root),
            jobs,
            cases,
            queue,
            link,
            pending: Vec::new(),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let mut records = self.queue.records().await?;
        let mut replies = self.link.replies().await?;
        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
        let mut gc_tick = tokio::time::interval(HANDLE_IDLE_TIMEOUT);
        let mut ping_tick = tokio::time::interval(self.ping_interval);
        info!("log ingestion started");

        loop {
            tokio::select! {
                entry = records.next() => match entry {
                    Some(Ok(entry)) => {
                        if let Err(e) = self.handle(&entry).await {
                            warn!(job = %entry.job, error = %e, "dropping log line");
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "dropping malformed log entry"),
                    None => {
                        warn!("log queue closed");
                        break;
                    }
                },
                reply = replies.next() => {
                    if let Some(Ok(MasterMessage::Pong { ping_interval })) = reply {
                        let advertised = Duration::from_secs(ping_interval);
                        if ping_interval > 0 && advertised != self.ping_interval {
                            debug!(seconds = ping_interval, "adopting master ping interval");
                            self.ping_interval = advertised;
                            ping_tick = tokio::time::interval(self.ping_interval);
                        }
                    }
                },
                _ = flush_tick.tick() => self.flush().await,
                _ = gc_tick.tick() => self.files.gc(HANDLE_IDLE_TIMEOUT),
                _ = ping_tick.tick() => {
                    if let Err(e) = self.link.send(WorkerMessage::Ping).await {
                        warn!(error = %e, "ping failed");
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("log ingestion stopping");
                        break;
                    }
                }
            }
        }
        self.flush().await;
        Ok(())
    }

    /// Ingest one log line.
    pub async fn handle(&mut self, entry: &LogEntry) -> Result<()> {
        // Undecodable lines are dropped before touching the output file.
        let record = LogRecord::parse(&entry.line)?;
        let line = self.files.get(entry.job)?.append(&entry.line)?;

        if !record.is_results() {
            return Ok(());
        }
        let result = ResultRecord::from_msg(&record.msg)?;
        let case = self.build_case(entry.job, &result, line)?;

        if result.is_job_result() {
            // Flush buffered cases first so the terminal case lands last.
            self.flush().await;
            self.cases.create(&case).await?;
            let health = if result.result == TestVerdict::Pass {
                JobHealth::Complete
            } else {
                JobHealth::Incomplete
            };
            self.jobs.set_health(entry.job, health).await?;
            info!(job = %entry.job, health = ?health, "terminal job result recorded");
        } else {
            self.pending.push(case);
        }
        Ok(())
    }

    fn build_case(&mut self, job: JobId, result: &ResultRecord, line: u64) -> Result<TestCase> {
        Ok(TestCase {
            job,
            suite: result.definition.clone(),
            name: result.case.clone(),
            result: result.result,
            test_set: result.set.clone(),
            measurement: result.measurement_f64(),
            units: result.units.clone(),
            start_line: Some(line),
            end_line: Some(line),
            metadata: self.case_metadata(job, result)?,
        })
    }

    /// Serialized record metadata, bounded by [`METADATA_MAX_BYTES`].
    ///
    /// Oversized records are spilled to a side file under the job's
    /// `metadata/` directory, keeping a pointer in the row. If the pointer
    /// form is still too large, or the spill itself fails, only the
    /// identifying fields are kept.
    fn case_metadata(&mut self, job: JobId, result: &ResultRecord) -> Result<String> {
        let serialized = to_yaml(result)?;
        if serialized.len() <= METADATA_MAX_BYTES {
            return Ok(serialized);
        }

        // A failed spill must not drop the record.
        match self.spill_metadata(job, result, &serialized) {
            Ok(pointer) if pointer.len() <= METADATA_MAX_BYTES => return Ok(pointer),
            Ok(_) => {}
            Err(e) => {
                warn!(job = %job, case = %result.case, error = %e, "metadata spill failed");
            }
        }

        // Last resort: identifying fields only, truncated so the stripped
        // record cannot itself exceed the ceiling.
        to_yaml(&ResultRecord {
            definition: truncate_utf8(&result.definition, STRIPPED_FIELD_MAX),
            case: truncate_utf8(&result.case, STRIPPED_FIELD_MAX),
            result: result.result,
            measurement: None,
            units: None,
            duration: None,
            level: None,
            set: None,
            extra: None,
        })
    }

    /// Write the full record to a side file and return the pointer form.
    fn spill_metadata(
        &mut self,
        job: JobId,
        result: &ResultRecord,
        serialized: &str,
    ) -> Result<String> {
        let dir = self.files.job_dir(job).join("metadata");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(side_file_name(&result.definition, &result.case));
        std::fs::write(&path, serialized)?;
        debug!(job = %job, case = %result.case, path = %path.display(), "spilled oversized metadata");

        let mut pointer = result.clone();
        pointer.extra = Some(serde_json::Value::String(path.display().to_string()));
        to_yaml(&pointer)
    }

    /// Persist buffered cases, falling back to row-by-row on bulk failure
    /// so one bad row cannot sink the batch.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let cases = std::mem::take(&mut self.pending);
        if let Err(e) = self.cases.create_bulk(&cases).await {
            warn!(error = %e, rows = cases.len(), "bulk insert failed, retrying row by row");
            for case in &cases {
                if let Err(e) = self.cases.create(case).await {
                    warn!(job = %case.job, case = %case.name, error = %e, "dropping test case");
                }
            }
        }
    }
}

fn to_yaml(result: &ResultRecord) -> Result<String> {
    serde_yaml::to_string(result).map_err(|e| Error::Serialization(e.to_string()))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Side files are named after the suite and case, but those names arrive on
/// the log stream and can be arbitrarily long. Each component is truncated
/// to a fixed budget; a hash of the full names keeps truncated pairs apart.
fn side_file_name(definition: &str, case: &str) -> String {
    let mut hasher = DefaultHasher::new();
    definition.hash(&mut hasher);
    case.hash(&mut hasher);
    format!(
        "{}-{}-{:016x}.yaml",
        truncate_utf8(&sanitize(definition), SIDE_FILE_COMPONENT_MAX),
        truncate_utf8(&sanitize(case), SIDE_FILE_COMPONENT_MAX),
        hasher.finish()
    )
}

fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use boardlab_core::ports::{LogStream, ReplyStream};
    use boardlab_core::{Hostname, Job};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubJobs {
        jobs: Mutex<HashMap<JobId, Job>>,
    }

    impl StubJobs {
        fn with(job: Job) -> Self {
            Self {
                jobs: Mutex::new([(job.id, job)].into()),
            }
        }

        fn health(&self, id: JobId) -> JobHealth {
            self.jobs.lock().unwrap()[&id].health
        }
    }

    #[async_trait]
    impl JobRepository for StubJobs {
        async fn create(&self, _job: &Job) -> Result<JobId> {
            unimplemented!()
        }
        async fn get(&self, id: JobId) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }
        async fn update(&self, _job: &Job) -> Result<()> {
            unimplemented!()
        }
        async fn submitted(&self) -> Result<Vec<Job>> {
            unimplemented!()
        }
        async fn scheduled(&self) -> Result<Vec<Job>> {
            unimplemented!()
        }
        async fn canceling(&self) -> Result<Vec<Job>> {
            unimplemented!()
        }
        async fn running_on(&self, _worker: &Hostname) -> Result<Vec<Job>> {
            unimplemented!()
        }
        async fn in_target_group(&self, _target_group: &str) -> Result<Vec<Job>> {
            unimplemented!()
        }
        async fn finish(
            &self,
            _id: JobId,
            _health: JobHealth,
            _failure_comment: Option<&str>,
        ) -> Result<bool> {
            unimplemented!()
        }
        async fn set_health(&self, id: JobId, health: JobHealth) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(&id).unwrap();
            if job.health == JobHealth::Unknown {
                job.health = health;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubCases {
        rows: Mutex<Vec<TestCase>>,
        fail_bulk: bool,
    }

    impl StubCases {
        fn rows(&self) -> Vec<TestCase> {
            self.rows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TestCaseRepository for StubCases {
        async fn create(&self, case: &TestCase) -> Result<()> {
            self.rows.lock().unwrap().push(case.clone());
            Ok(())
        }

        async fn create_bulk(&self, cases: &[TestCase]) -> Result<()> {
            if self.fail_bulk {
                return Err(Error::Database("bulk insert rejected".into()));
            }
            self.rows.lock().unwrap().extend_from_slice(cases);
            Ok(())
        }
    }

    struct StubQueue;

    #[async_trait]
    impl LogQueue for StubQueue {
        async fn records(&self) -> Result<LogStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    struct StubLink;

    #[async_trait]
    impl WorkerLink for StubLink {
        async fn send(&self, _message: WorkerMessage) -> Result<()> {
            Ok(())
        }

        async fn replies(&self) -> Result<ReplyStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("boardlab-ingest-{}", uuid::Uuid::new_v4()))
    }

    fn running_job() -> Job {
        let mut job = Job::new("actions: []", "beaglebone-black");
        job.go_state_scheduled(Hostname::new("bbb-01"));
        job.go_state_running();
        job
    }

    fn ingestor(
        root: &PathBuf,
        jobs: Arc<StubJobs>,
        cases: Arc<StubCases>,
    ) -> LogIngestor {
        LogIngestor::new(root, jobs, cases, Arc::new(StubQueue), Arc::new(StubLink))
    }

    fn entry(job: JobId, line: &str) -> LogEntry {
        LogEntry {
            job,
            line: line.to_string(),
        }
    }

    #[tokio::test]
    async fn test_lines_are_appended_verbatim() {
        let root = temp_root();
        let job = running_job();
        let jobs = Arc::new(StubJobs::with(job.clone()));
        let cases = Arc::new(StubCases::default());
        let mut ingestor = ingestor(&root, jobs, cases.clone());

        ingestor
            .handle(&entry(job.id, "{lvl: info, msg: booting the board}"))
            .await
            .unwrap();
        ingestor
            .handle(&entry(job.id, "{lvl: debug, msg: kernel 6.1}"))
            .await
            .unwrap();

        let output =
            std::fs::read_to_string(ingestor.files.job_dir(job.id).join("output.yaml")).unwrap();
        assert_eq!(
            output,
            "{lvl: info, msg: booting the board}\n{lvl: debug, msg: kernel 6.1}\n"
        );
        // Plain lines produce no test cases.
        assert!(cases.rows().is_empty());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_line_is_rejected() {
        let root = temp_root();
        let job = running_job();
        let jobs = Arc::new(StubJobs::with(job.clone()));
        let mut ingestor = ingestor(&root, jobs, Arc::new(StubCases::default()));

        let err = ingestor
            .handle(&entry(job.id, "{lvl: info, msg: [unbalanced"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        // Nothing was written for this job.
        assert!(!ingestor.files.job_dir(job.id).join("output.yaml").exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_result_records_are_buffered_then_flushed() {
        let root = temp_root();
        let job = running_job();
        let jobs = Arc::new(StubJobs::with(job.clone()));
        let cases = Arc::new(StubCases::default());
        let mut ingestor = ingestor(&root, jobs, cases.clone());

        ingestor
            .handle(&entry(
                job.id,
                "{lvl: results, msg: {definition: smoke-tests, case: uname, result: pass, measurement: 2.5, units: s}}",
            ))
            .await
            .unwrap();
        assert!(cases.rows().is_empty());

        ingestor.flush().await;
        let rows = cases.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].suite, "smoke-tests");
        assert_eq!(rows[0].name, "uname");
        assert_eq!(rows[0].result, TestVerdict::Pass);
        assert_eq!(rows[0].measurement, Some(2.5));
        assert_eq!(rows[0].start_line, Some(1));

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_terminal_result_drives_job_health() {
        let root = temp_root();
        let job = running_job();
        let jobs = Arc::new(StubJobs::with(job.clone()));
        let cases = Arc::new(StubCases::default());
        let mut ingestor = ingestor(&root, jobs.clone(), cases.clone());

        ingestor
            .handle(&entry(
                job.id,
                "{lvl: results, msg: {definition: smoke-tests, case: uname, result: pass}}",
            ))
            .await
            .unwrap();
        ingestor
            .handle(&entry(
                job.id,
                "{lvl: results, msg: {definition: boardlab, case: job, result: fail}}",
            ))
            .await
            .unwrap();

        assert_eq!(jobs.health(job.id), JobHealth::Incomplete);
        // The buffered case was flushed before the terminal case.
        let rows = cases.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "uname");
        assert_eq!(rows[1].suite, "boardlab");
        assert_eq!(rows[1].name, "job");

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_bulk_failure_falls_back_to_row_by_row() {
        let root = temp_root();
        let job = running_job();
        let jobs = Arc::new(StubJobs::with(job.clone()));
        let cases = Arc::new(StubCases {
            rows: Mutex::new(Vec::new()),
            fail_bulk: true,
        });
        let mut ingestor = ingestor(&root, jobs, cases.clone());

        for case in ["uname", "dmesg"] {
            ingestor
                .handle(&entry(
                    job.id,
                    &format!(
                        "{{lvl: results, msg: {{definition: smoke-tests, case: {}, result: pass}}}}",
                        case
                    ),
                ))
                .await
                .unwrap();
        }
        ingestor.flush().await;
        assert_eq!(cases.rows().len(), 2);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_oversized_metadata_is_spilled() {
        let root = temp_root();
        let job = running_job();
        let jobs = Arc::new(StubJobs::with(job.clone()));
        let cases = Arc::new(StubCases::default());
        let mut ingestor = ingestor(&root, jobs, cases.clone());

        let big = "x".repeat(METADATA_MAX_BYTES * 2);
        ingestor
            .handle(&entry(
                job.id,
                &format!(
                    "{{lvl: results, msg: {{definition: smoke-tests, case: big-case, result: pass, extra: {{dump: {}}}}}}}",
                    big
                ),
            ))
            .await
            .unwrap();
        ingestor.flush().await;

        let rows = cases.rows();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].metadata.len() <= METADATA_MAX_BYTES);
        // The full record went to the side file; the row keeps a pointer.
        let side = side_files(&ingestor, job.id);
        assert_eq!(side.len(), 1);
        assert!(side[0].starts_with("smoke-tests-big-case-"));
        assert!(rows[0].metadata.contains(&side[0]));

        std::fs::remove_dir_all(&root).unwrap();
    }

    fn side_files(ingestor: &LogIngestor, job: JobId) -> Vec<String> {
        std::fs::read_dir(ingestor.files.job_dir(job).join("metadata"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_long_suite_names_do_not_drop_the_record() {
        let root = temp_root();
        let job = running_job();
        let jobs = Arc::new(StubJobs::with(job.clone()));
        let cases = Arc::new(StubCases::default());
        let mut ingestor = ingestor(&root, jobs, cases.clone());

        // Suite and case names long enough to push the record over the
        // ceiling on their own.
        let suite = "s".repeat(3000);
        let case = "c".repeat(3000);
        ingestor
            .handle(&entry(
                job.id,
                &format!(
                    "{{lvl: results, msg: {{definition: {}, case: {}, result: pass}}}}",
                    suite, case
                ),
            ))
            .await
            .unwrap();
        ingestor.flush().await;

        let rows = cases.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].suite, suite);
        assert_eq!(rows[0].result, TestVerdict::Pass);
        // The stripped fallback is bounded like every other metadata value.
        assert!(rows[0].metadata.len() <= METADATA_MAX_BYTES);

        // The full record was spilled under a bounded file name.
        let side = side_files(&ingestor, job.id);
        assert_eq!(side.len(), 1);
        assert!(side[0].len() < 200);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
