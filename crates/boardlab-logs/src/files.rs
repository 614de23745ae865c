//! Per-job log files.
//!
//! Each job owns a directory holding `output.yaml` (the raw log stream,
//! append-only) and `output.idx`, a flat index of little-endian u64 byte
//! offsets, one per line, for random access by line number. File handles are
//! kept open between lines and garbage-collected when idle.

use boardlab_core::{JobId, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long an open handle may sit unused before it is closed.
pub const HANDLE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Open handles for one job's log files.
pub struct JobLogFiles {
    output: File,
    index: File,
    bytes_written: u64,
    line_count: u64,
    last_used: Instant,
}

impl JobLogFiles {
    fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("output.yaml"))?;
        let index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("output.idx"))?;
        // Resume where a previous handle (or process) left off.
        let bytes_written = output.metadata()?.len();
        let line_count = index.metadata()?.len() / 8;
        Ok(Self {
            output,
            index,
            bytes_written,
            line_count,
            last_used: Instant::now(),
        })
    }

    /// Append one line verbatim, recording its offset in the index.
    /// Returns the 1-based line number of the appended line.
    pub fn append(&mut self, line: &str) -> Result<u64> {
        self.index.write_all(&self.bytes_written.to_le_bytes())?;
        self.output.write_all(line.as_bytes())?;
        self.bytes_written += line.len() as u64;
        if !line.ends_with('\n') {
            self.output.write_all(b"\n")?;
            self.bytes_written += 1;
        }
        self.line_count += 1;
        self.last_used = Instant::now();
        Ok(self.line_count)
    }

    pub fn line_count(&self) -> u64 {
        self.line_count
    }
}

/// Open log handles for all jobs currently emitting.
pub struct FileMap {
    root: PathBuf,
    open: HashMap<JobId, JobLogFiles>,
}

impl FileMap {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: HashMap::new(),
        }
    }

    pub fn job_dir(&self, job: JobId) -> PathBuf {
        self.root.join(job.to_string())
    }

    /// Handles for one job, opening (and creating the directory) on first
    /// use.
    pub fn get(&mut self, job: JobId) -> Result<&mut JobLogFiles> {
        if !self.open.contains_key(&job) {
            let files = JobLogFiles::open(&self.job_dir(job))?;
            self.open.insert(job, files);
        }
        Ok(self.open.get_mut(&job).unwrap())
    }

    /// Close handles idle for longer than `max_idle`.
    pub fn gc(&mut self, max_idle: Duration) {
        let before = self.open.len();
        let now = Instant::now();
        self.open
            .retain(|_, files| now.duration_since(files.last_used) <= max_idle);
        let closed = before - self.open.len();
        if closed > 0 {
            debug!(closed, open = self.open.len(), "closed idle log handles");
        }
    }
}
