//! Per-job execution context.

use crate::protocol::ProtocolHandler;
use boardlab_core::ids::JobId;
use boardlab_core::results::ResultRecord;
use boardlab_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

/// Key/value store scoped by namespace.
///
/// Entries are addressed by (namespace, action, label, key); actions in one
/// namespace cannot observe another namespace's values. The only sanctioned
/// cross-namespace link is the `connection-namespace` parameter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceData {
    data: HashMap<String, HashMap<String, Value>>,
}

impl NamespaceData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, namespace: &str, action: &str, label: &str, key: &str, value: Value) {
        self.data
            .entry(namespace.to_string())
            .or_default()
            .insert(format!("{}.{}.{}", action, label, key), value);
    }

    pub fn get(&self, namespace: &str, action: &str, label: &str, key: &str) -> Option<&Value> {
        self.data
            .get(namespace)?
            .get(&format!("{}.{}.{}", action, label, key))
    }
}

/// A live console connection to a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub namespace: String,
    /// Command used to open the console.
    pub command: String,
}

/// Seam between actions and the host shell.
pub trait CommandRunner: Send {
    /// Run a shell command, returning its stdout.
    fn run(&mut self, command: &str) -> Result<String>;
}

/// Runs commands through `sh -c`, like a worker does.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&mut self, command: &str) -> Result<String> {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| Error::Infrastructure(format!("failed to spawn command: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Infrastructure(format!(
                "command failed with exit code {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}

/// Mutable state threaded through one pipeline run.
pub struct JobContext {
    pub job: JobId,
    pub data: NamespaceData,
    /// Open connections, one per namespace.
    pub connections: HashMap<String, Connection>,
    /// Results emitted while running.
    pub results: Vec<ResultRecord>,
    pub runner: Box<dyn CommandRunner>,
    pub deadline: Option<Instant>,
    /// Budget of the innermost action currently running.
    action_deadline: Option<Instant>,
    pub protocols: Vec<Box<dyn ProtocolHandler>>,
}

impl JobContext {
    pub fn new(job: JobId, runner: Box<dyn CommandRunner>) -> Self {
        Self {
            job,
            data: NamespaceData::new(),
            connections: HashMap::new(),
            results: Vec::new(),
            runner,
            deadline: None,
            action_deadline: None,
            protocols: Vec::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Enter an action's timeout scope, returning the enclosing scope. A
    /// child budget never extends past its parent's.
    pub fn begin_action(&mut self, timeout: std::time::Duration) -> Option<Instant> {
        let mut deadline = Instant::now() + timeout;
        if let Some(outer) = self.action_deadline
            && outer < deadline
        {
            deadline = outer;
        }
        self.action_deadline.replace(deadline)
    }

    pub fn end_action(&mut self, enclosing: Option<Instant>) {
        self.action_deadline = enclosing;
    }

    pub fn check_deadline(&self) -> Result<()> {
        let now = Instant::now();
        if let Some(deadline) = self.deadline
            && now >= deadline
        {
            return Err(Error::Job("job timed out".into()));
        }
        if let Some(deadline) = self.action_deadline
            && now >= deadline
        {
            return Err(Error::Job("action budget exhausted".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespace_isolation() {
        let mut data = NamespaceData::new();
        data.set("dut", "tftp-deploy", "file", "kernel", json!("/tmp/zImage"));
        assert_eq!(
            data.get("dut", "tftp-deploy", "file", "kernel"),
            Some(&json!("/tmp/zImage"))
        );
        // The same coordinates in another namespace see nothing.
        assert_eq!(data.get("probe", "tftp-deploy", "file", "kernel"), None);
        assert_eq!(data.get("common", "tftp-deploy", "file", "kernel"), None);
    }

    #[test]
    fn test_keys_do_not_collide_across_labels() {
        let mut data = NamespaceData::new();
        data.set("common", "overlay", "output", "file", json!("a"));
        data.set("common", "overlay", "input", "file", json!("b"));
        assert_eq!(data.get("common", "overlay", "output", "file"), Some(&json!("a")));
        assert_eq!(data.get("common", "overlay", "input", "file"), Some(&json!("b")));
    }
}
