//! Log records and test results.

use crate::ids::JobId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Byte ceiling for serialized test-case metadata.
pub const METADATA_MAX_BYTES: usize = 4096;

/// Reserved suite for framework-emitted results.
pub const FRAMEWORK_SUITE: &str = "boardlab";

/// Case name of the terminal job result within [`FRAMEWORK_SUITE`].
pub const JOB_CASE: &str = "job";

/// One line of the per-job log stream, as emitted by a worker.
///
/// Only `lvl` and `msg` are interpreted here; the raw line is what gets
/// appended to the job output file.
#[derive(Debug, Clone, Deserialize)]
pub struct LogRecord {
    pub lvl: String,
    pub msg: serde_json::Value,
}

impl LogRecord {
    pub fn parse(line: &str) -> Result<Self> {
        serde_yaml::from_str(line)
            .map_err(|e| Error::Serialization(format!("undecodable log record: {}", e)))
    }

    pub fn is_results(&self) -> bool {
        self.lvl == "results"
    }
}

/// Verdict of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestVerdict {
    Pass,
    Fail,
    Skip,
    Unknown,
}

impl TestVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestVerdict::Pass => "pass",
            TestVerdict::Fail => "fail",
            TestVerdict::Skip => "skip",
            TestVerdict::Unknown => "unknown",
        }
    }
}

/// A structured result emitted by a test action or by the framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Test definition (suite) this case belongs to.
    pub definition: String,
    pub case: String,
    pub result: TestVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Dotted level of the emitting action, for framework results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Optional grouping of cases within the suite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl ResultRecord {
    /// Decode from the `msg` payload of a `results` log record.
    pub fn from_msg(msg: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(msg.clone())
            .map_err(|e| Error::Serialization(format!("invalid result record: {}", e)))
    }

    pub fn pass(definition: impl Into<String>, case: impl Into<String>) -> Self {
        Self::with_verdict(definition, case, TestVerdict::Pass)
    }

    pub fn fail(definition: impl Into<String>, case: impl Into<String>) -> Self {
        Self::with_verdict(definition, case, TestVerdict::Fail)
    }

    fn with_verdict(
        definition: impl Into<String>,
        case: impl Into<String>,
        result: TestVerdict,
    ) -> Self {
        Self {
            definition: definition.into(),
            case: case.into(),
            result,
            measurement: None,
            units: None,
            duration: None,
            level: None,
            set: None,
            extra: None,
        }
    }

    /// The single authoritative job-completion signal.
    pub fn is_job_result(&self) -> bool {
        self.definition == FRAMEWORK_SUITE && self.case == JOB_CASE
    }

    pub fn measurement_f64(&self) -> Option<f64> {
        match &self.measurement {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Persisted test-case row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub job: JobId,
    pub suite: String,
    pub name: String,
    pub result: TestVerdict,
    pub test_set: Option<String>,
    pub measurement: Option<f64>,
    pub units: Option<String>,
    /// Log line the case was reported on.
    pub start_line: Option<u64>,
    pub end_line: Option<u64>,
    /// Serialized record metadata, bounded by [`METADATA_MAX_BYTES`].
    pub metadata: String,
}
