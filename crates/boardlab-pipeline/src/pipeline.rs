//! The action pipeline: an arena-owned tree executed in strict document
//! order.

use crate::action::{ActionIx, ActionKind, ActionNode, Level, Parameters, DEFAULT_ACTION_TIMEOUT};
use crate::context::{Connection, JobContext};
use crate::protocol::ProtocolRequest;
use boardlab_core::device::DeviceConfig;
use boardlab_core::results::ResultRecord;
use boardlab_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Root of the downloads tree on a worker.
const DOWNLOAD_ROOT: &str = "/var/lib/boardlab/downloads";

/// Root of the overlay build tree on a worker.
const OVERLAY_ROOT: &str = "/var/lib/boardlab/overlays";

/// An ordered tree of actions.
///
/// Nodes live in one arena (`Vec`); parents reference children by index.
/// Levels are assigned at insertion and never change.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    nodes: Vec<ActionNode>,
    roots: Vec<ActionIx>,
}

/// Serializable description of one action, round-trippable without loss of
/// levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescription {
    pub name: String,
    pub level: String,
    pub summary: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<ActionDescription>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(
        &mut self,
        name: impl Into<String>,
        summary: impl Into<String>,
        kind: ActionKind,
        parameters: Parameters,
    ) -> ActionIx {
        let level = Level::root(self.roots.len() as u32 + 1);
        let ix = self.push(name.into(), summary.into(), kind, parameters, level);
        self.roots.push(ix);
        ix
    }

    pub fn add_child(
        &mut self,
        parent: ActionIx,
        name: impl Into<String>,
        summary: impl Into<String>,
        kind: ActionKind,
        parameters: Parameters,
    ) -> ActionIx {
        let level = self.nodes[parent]
            .level
            .child(self.nodes[parent].children.len() as u32 + 1);
        let ix = self.push(name.into(), summary.into(), kind, parameters, level);
        self.nodes[parent].children.push(ix);
        ix
    }

    fn push(
        &mut self,
        name: String,
        summary: String,
        kind: ActionKind,
        parameters: Parameters,
        level: Level,
    ) -> ActionIx {
        self.nodes.push(ActionNode {
            name,
            summary,
            level,
            kind,
            parameters,
            timeout: DEFAULT_ACTION_TIMEOUT,
            errors: Vec::new(),
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn node(&self, ix: ActionIx) -> &ActionNode {
        &self.nodes[ix]
    }

    pub fn node_mut(&mut self, ix: ActionIx) -> &mut ActionNode {
        &mut self.nodes[ix]
    }

    pub fn roots(&self) -> &[ActionIx] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All actions in document order.
    pub fn walk(&self) -> Vec<ActionIx> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for &root in &self.roots {
            self.walk_into(root, &mut out);
        }
        out
    }

    fn walk_into(&self, ix: ActionIx, out: &mut Vec<ActionIx>) {
        out.push(ix);
        for &child in &self.nodes[ix].children {
            self.walk_into(child, out);
        }
    }

    /// Check every action against the device configuration, recording
    /// human-readable errors on the offending nodes.
    pub fn validate(&mut self, device: &DeviceConfig) {
        for ix in 0..self.nodes.len() {
            let errors = Self::check_node(&self.nodes[ix], device);
            self.nodes[ix].errors.extend(errors);
        }
    }

    fn check_node(node: &ActionNode, device: &DeviceConfig) -> Vec<String> {
        let mut errors = Vec::new();
        match &node.kind {
            ActionKind::Deploy(p) => {
                if !device.has_deploy_method(&p.to) {
                    errors.push(format!(
                        "'{}' not in the device configuration deploy methods",
                        p.to
                    ));
                }
            }
            ActionKind::Boot(p) => {
                if !device.has_boot_method(&p.method) {
                    errors.push(format!(
                        "'{}' not in the device configuration boot methods",
                        p.method
                    ));
                }
            }
            ActionKind::Download(p) => {
                if !p.url.contains("://") {
                    errors.push(format!("invalid download url: {}", p.url));
                }
            }
            ActionKind::Test(p) => {
                if p.definitions.is_empty() {
                    errors.push("no test definitions listed".to_string());
                }
            }
            ActionKind::Command(p) => {
                if !device.commands.users.contains_key(&p.name) {
                    errors.push(format!("unknown user command '{}'", p.name));
                }
            }
            ActionKind::Retry(p) => {
                if p.max_retries == 0 {
                    errors.push("retry count must be at least 1".to_string());
                }
            }
            _ => {}
        }
        errors
    }

    /// All validation errors, prefixed with the failing action's level and
    /// name.
    pub fn errors(&self) -> Vec<String> {
        let mut out = Vec::new();
        for &ix in &self.walk() {
            let node = &self.nodes[ix];
            for err in &node.errors {
                out.push(format!("{} {}: {}", node.level, node.name, err));
            }
        }
        out
    }

    /// Serializable description of the whole tree.
    pub fn describe(&self) -> Vec<ActionDescription> {
        self.roots.iter().map(|&ix| self.describe_node(ix)).collect()
    }

    fn describe_node(&self, ix: ActionIx) -> ActionDescription {
        let node = &self.nodes[ix];
        ActionDescription {
            name: node.name.clone(),
            level: node.level.to_string(),
            summary: node.summary.clone(),
            namespace: node.parameters.namespace.clone(),
            pipeline: node
                .children
                .iter()
                .map(|&child| self.describe_node(child))
                .collect(),
        }
    }

    /// Run the pipeline to completion.
    ///
    /// Actions run in strict document order; the first failure aborts the
    /// remaining actions except the finalize action, which always runs.
    /// Returns the connection left open by the last action, if any.
    pub fn run(
        &self,
        ctx: &mut JobContext,
        device: &DeviceConfig,
        mut connection: Option<Connection>,
    ) -> Result<Option<Connection>> {
        let mut failure: Option<Error> = None;

        for &root in &self.roots {
            let is_finalize = matches!(self.nodes[root].kind, ActionKind::Finalize);
            if failure.is_some() && !is_finalize {
                continue;
            }
            match self.run_node(root, ctx, device, connection.take()) {
                Ok(conn) => connection = conn,
                Err(e) => {
                    error!(
                        action = %self.nodes[root].name,
                        level = %self.nodes[root].level,
                        error = %e,
                        "action failed"
                    );
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        let mut record = if failure.is_none() {
            ResultRecord::pass(boardlab_core::results::FRAMEWORK_SUITE, boardlab_core::results::JOB_CASE)
        } else {
            ResultRecord::fail(boardlab_core::results::FRAMEWORK_SUITE, boardlab_core::results::JOB_CASE)
        };
        record.extra = failure.as_ref().map(|e| serde_json::json!({ "error": e.to_string() }));
        ctx.results.push(record);

        match failure {
            Some(e) => Err(e),
            None => Ok(connection),
        }
    }

    fn run_children(
        &self,
        ix: ActionIx,
        ctx: &mut JobContext,
        device: &DeviceConfig,
        mut connection: Option<Connection>,
    ) -> Result<Option<Connection>> {
        for &child in &self.nodes[ix].children {
            connection = self.run_node(child, ctx, device, connection)?;
        }
        Ok(connection)
    }

    fn run_node(
        &self,
        ix: ActionIx,
        ctx: &mut JobContext,
        device: &DeviceConfig,
        connection: Option<Connection>,
    ) -> Result<Option<Connection>> {
        ctx.check_deadline()?;
        let node = &self.nodes[ix];
        debug!(action = %node.name, level = %node.level, "running action");

        self.dispatch_protocol_requests(node, ctx)?;

        let started = Instant::now();
        let enclosing = ctx.begin_action(node.timeout);
        let result = self.exec_node(ix, ctx, device, connection);
        ctx.end_action(enclosing);

        // A single command cannot be interrupted mid-flight; an overrun is
        // surfaced once the action hands control back.
        match result {
            Ok(conn) if started.elapsed() > node.timeout => Err(Error::Job(format!(
                "'{}' did not finish within {:?}",
                node.name, node.timeout
            ))),
            other => other,
        }
    }

    fn exec_node(
        &self,
        ix: ActionIx,
        ctx: &mut JobContext,
        device: &DeviceConfig,
        connection: Option<Connection>,
    ) -> Result<Option<Connection>> {
        let node = &self.nodes[ix];
        match &node.kind {
            ActionKind::Deploy(p) => {
                info!(action = %node.name, to = %p.to, "deploying");
                ctx.data.set(
                    &node.parameters.namespace,
                    &node.name,
                    "deploy",
                    "to",
                    serde_json::json!(p.to),
                );
                self.run_children(ix, ctx, device, connection)
            }
            ActionKind::Download(p) => {
                let filename = p.url.rsplit('/').next().unwrap_or("image");
                let dir = format!("{}/{}/{}", DOWNLOAD_ROOT, ctx.job, p.key);
                let path = format!("{}/{}", dir, filename);
                ctx.runner
                    .run(&format!("mkdir -p {} && curl -sSfL -o {} {}", dir, path, p.url))
                    .map_err(|e| Error::Job(format!("download of '{}' failed: {}", p.key, e)))?;
                ctx.data.set(
                    &node.parameters.namespace,
                    &node.name,
                    "file",
                    &p.key,
                    serde_json::json!(path),
                );
                self.run_children(ix, ctx, device, connection)
            }
            ActionKind::Overlay => {
                let dir = format!("{}/{}", OVERLAY_ROOT, ctx.job);
                let path = format!("{}/overlay.tar.gz", dir);
                ctx.runner.run(&format!(
                    "mkdir -p {} && tar -czf {} --files-from /dev/null",
                    dir, path
                ))?;
                ctx.data.set(
                    &node.parameters.namespace,
                    "overlay",
                    "output",
                    "file",
                    serde_json::json!(path),
                );
                self.run_children(ix, ctx, device, connection)
            }
            ActionKind::ApplyOverlay => {
                let overlay = ctx
                    .data
                    .get(&node.parameters.namespace, "overlay", "output", "file")
                    .and_then(|v| v.as_str().map(String::from));
                let Some(overlay) = overlay else {
                    return Err(Error::Job("no overlay available to apply".into()));
                };
                debug!(overlay = %overlay, "applying overlay");
                ctx.data.set(
                    &node.parameters.namespace,
                    &node.name,
                    "overlay",
                    "applied",
                    serde_json::json!(true),
                );
                self.run_children(ix, ctx, device, connection)
            }
            ActionKind::Boot(p) => {
                let command = match node.parameters.get_str("connection") {
                    Some(name) => device.commands.connections.get(name).cloned(),
                    None => device.commands.connect.clone(),
                };
                let Some(command) = command else {
                    return Err(Error::Configuration(
                        "device has no connect command".into(),
                    ));
                };
                info!(action = %node.name, method = %p.method, "booting device");
                if let Some(commands) = &p.commands {
                    debug!(commands = %commands, "using named boot commands");
                }
                let conn = Connection {
                    namespace: node.parameters.namespace.clone(),
                    command,
                };
                ctx.connections
                    .insert(node.parameters.namespace.clone(), conn.clone());
                self.run_children(ix, ctx, device, Some(conn))
            }
            ActionKind::AutoLogin(p) => {
                let namespace = node.parameters.connection_namespace();
                if connection.is_none() && !ctx.connections.contains_key(namespace) {
                    return Err(Error::Job("no connection available for login".into()));
                }
                debug!(username = ?p.username, "logging in");
                self.run_children(ix, ctx, device, connection)
            }
            ActionKind::Test(p) => {
                let namespace = node.parameters.connection_namespace();
                let conn = connection
                    .clone()
                    .or_else(|| ctx.connections.get(namespace).cloned());
                if conn.is_none() {
                    return Err(Error::Job(format!(
                        "no connection in namespace '{}' for the test action",
                        namespace
                    )));
                }
                for definition in &p.definitions {
                    let outcome = match &definition.path {
                        Some(path) => ctx.runner.run(path),
                        None => Ok(String::new()),
                    };
                    match outcome {
                        Ok(_) => {
                            ctx.results
                                .push(ResultRecord::pass(&definition.name, &definition.name));
                        }
                        Err(e) => {
                            ctx.results
                                .push(ResultRecord::fail(&definition.name, &definition.name));
                            return Err(Error::Job(format!(
                                "test definition '{}' failed: {}",
                                definition.name, e
                            )));
                        }
                    }
                }
                self.run_children(ix, ctx, device, connection)
            }
            ActionKind::Command(p) => {
                let Some(command) = device.commands.users.get(&p.name) else {
                    return Err(Error::Job(format!("unknown user command '{}'", p.name)));
                };
                info!(name = %p.name, "running user command");
                ctx.runner.run(command)?;
                self.run_children(ix, ctx, device, connection)
            }
            ActionKind::Retry(p) => {
                let max = p.max_retries.max(1);
                let mut last_err: Option<Error> = None;
                let mut current = connection;
                for attempt in 1..=max {
                    ctx.check_deadline()?;
                    match self.run_children(ix, ctx, device, current.clone()) {
                        Ok(conn) => {
                            current = conn;
                            last_err = None;
                            if !p.repeat {
                                return Ok(current);
                            }
                        }
                        Err(e) => {
                            warn!(
                                action = %node.name,
                                attempt,
                                max,
                                error = %e,
                                "attempt failed"
                            );
                            last_err = Some(e);
                        }
                    }
                }
                match last_err {
                    Some(e) if !p.repeat => Err(Error::Job(format!(
                        "'{}' failed after {} attempts: {}",
                        node.name, max, e
                    ))),
                    Some(e) => Err(e),
                    None => Ok(current),
                }
            }
            ActionKind::Finalize => {
                info!("finalizing job");
                let result = self.run_children(ix, ctx, device, connection);
                ctx.connections.clear();
                for handler in ctx.protocols.iter_mut() {
                    if let Err(e) = handler.finalize() {
                        warn!(protocol = handler.name(), error = %e, "protocol finalize failed");
                    }
                }
                result.map(|_| None)
            }
            ActionKind::PowerOff => {
                if let Some(cmd) = &device.commands.power_off
                    && let Err(e) = ctx.runner.run(cmd)
                {
                    // Cleanup is best effort.
                    warn!(error = %e, "power off failed");
                }
                Ok(connection)
            }
        }
    }

    fn dispatch_protocol_requests(&self, node: &ActionNode, ctx: &mut JobContext) -> Result<()> {
        let Some(map) = node.parameters.get("protocols").and_then(|v| v.as_object()) else {
            return Ok(());
        };
        let map = map.clone();
        for (protocol_name, requests) in map {
            let requests: Vec<ProtocolRequest> = match serde_json::from_value(requests) {
                Ok(reqs) => reqs,
                Err(e) => {
                    warn!(protocol = %protocol_name, error = %e, "ignoring malformed protocol requests");
                    continue;
                }
            };
            for request in requests {
                if request.action != node.name {
                    continue;
                }
                let JobContext {
                    protocols, data, ..
                } = &mut *ctx;
                let Some(handler) = protocols
                    .iter_mut()
                    .find(|h| h.name() == protocol_name)
                else {
                    return Err(Error::Job(format!(
                        "action '{}' addresses unknown protocol '{}'",
                        node.name, protocol_name
                    )));
                };
                if let Some(reply) = handler.call(&request)? {
                    data.set(
                        &node.parameters.namespace,
                        &node.name,
                        "protocol",
                        &protocol_name,
                        reply,
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{
        BootParams, CommandParams, DeployParams, RetryParams, TestDefinition, TestParams,
    };
    use crate::context::CommandRunner;
    use boardlab_core::ids::JobId;
    use std::collections::HashMap;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Records every command; fails commands containing a marker a set
    /// number of times, or stalls them for a configured duration.
    #[derive(Clone, Default)]
    struct MockRunner {
        log: Arc<Mutex<Vec<String>>>,
        failures: Arc<Mutex<HashMap<String, u32>>>,
        delays: Arc<Mutex<HashMap<String, std::time::Duration>>>,
    }

    impl MockRunner {
        fn fail(&self, marker: &str, times: u32) {
            self.failures.lock().unwrap().insert(marker.into(), times);
        }

        fn delay(&self, marker: &str, duration: std::time::Duration) {
            self.delays.lock().unwrap().insert(marker.into(), duration);
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&mut self, command: &str) -> boardlab_core::Result<String> {
            self.log.lock().unwrap().push(command.to_string());
            for (marker, duration) in self.delays.lock().unwrap().iter() {
                if command.contains(marker.as_str()) {
                    std::thread::sleep(*duration);
                }
            }
            let mut failures = self.failures.lock().unwrap();
            for (marker, left) in failures.iter_mut() {
                if command.contains(marker.as_str()) && *left > 0 {
                    *left -= 1;
                    return Err(Error::Infrastructure("mock command failure".into()));
                }
            }
            Ok(String::new())
        }
    }

    fn device() -> DeviceConfig {
        DeviceConfig::from_yaml(
            r#"
hostname: bbb-01
device_type: beaglebone-black
commands:
  power_off: pduclient --port 3 --command off
  connect: telnet localhost 4001
  users:
    recovery: usbrelay BITFT_1=1
actions:
  deploy:
    methods: [tftp]
  boot:
    methods: [u-boot]
"#,
        )
        .unwrap()
    }

    fn context(runner: MockRunner) -> JobContext {
        JobContext::new(JobId::new(), Box::new(runner))
    }

    fn boot_kind() -> ActionKind {
        ActionKind::Boot(BootParams {
            method: "u-boot".into(),
            commands: None,
            prompts: vec!["login:".into()],
        })
    }

    /// deploy + boot + retry-wrapped test + finalize.
    fn sample_pipeline(max_retries: u32) -> Pipeline {
        let mut p = Pipeline::new();
        let deploy = p.add_root(
            "tftp-deploy",
            "deploy over tftp",
            ActionKind::Deploy(DeployParams { to: "tftp".into() }),
            Parameters::default(),
        );
        p.add_child(
            deploy,
            "download-kernel",
            "download the kernel",
            ActionKind::Download(crate::action::DownloadParams {
                key: "kernel".into(),
                url: "http://images.example.com/zImage".into(),
            }),
            Parameters::default(),
        );
        p.add_root("u-boot-boot", "boot with u-boot", boot_kind(), Parameters::default());
        let retry = p.add_root(
            "test-retry",
            "retry wrapper",
            ActionKind::Retry(RetryParams {
                max_retries,
                repeat: false,
            }),
            Parameters::default(),
        );
        p.add_child(
            retry,
            "test-shell",
            "run test definitions",
            ActionKind::Test(TestParams {
                definitions: vec![TestDefinition {
                    name: "smoke-tests".into(),
                    path: Some("run-smoke-tests".into()),
                    repository: None,
                }],
            }),
            Parameters::default(),
        );
        let finalize = p.add_root(
            "finalize",
            "cleanup",
            ActionKind::Finalize,
            Parameters::default(),
        );
        p.add_child(
            finalize,
            "power-off",
            "power the device off",
            ActionKind::PowerOff,
            Parameters::default(),
        );
        p
    }

    #[test]
    fn test_level_invariants() {
        let p = sample_pipeline(1);
        let walk = p.walk();
        let levels: Vec<&Level> = walk.iter().map(|&ix| &p.node(ix).level).collect();

        // Unique and strictly increasing in document order.
        let unique: HashSet<String> = levels.iter().map(|l| l.to_string()).collect();
        assert_eq!(unique.len(), levels.len());
        for pair in levels.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }

        // Parent level is a prefix of each child's level.
        for &ix in &walk {
            let node = p.node(ix);
            for &child in &node.children {
                assert!(node.level.is_prefix_of(&p.node(child).level));
            }
        }
    }

    #[test]
    fn test_describe_roundtrip() {
        let p = sample_pipeline(3);
        let description = p.describe();
        let yaml = serde_yaml::to_string(&description).unwrap();
        let restored: Vec<ActionDescription> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored, description);
        assert_eq!(restored[0].pipeline[0].level, "1.1");
        assert_eq!(restored.len(), 4);
    }

    #[test]
    fn test_validation_catches_unknown_methods() {
        let mut p = Pipeline::new();
        p.add_root(
            "flasher-deploy",
            "deploy with the flasher",
            ActionKind::Deploy(DeployParams { to: "flasher".into() }),
            Parameters::default(),
        );
        p.add_root(
            "user-command",
            "run an operator command",
            ActionKind::Command(CommandParams { name: "jtag".into() }),
            Parameters::default(),
        );
        p.validate(&device());
        let errors = p.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("'flasher' not in the device configuration deploy methods"));
        assert!(errors[0].starts_with("1 flasher-deploy:"));
        assert!(errors[1].contains("unknown user command 'jtag'"));
    }

    #[test]
    fn test_successful_run_emits_job_pass() {
        let runner = MockRunner::default();
        let p = sample_pipeline(1);
        let mut ctx = context(runner.clone());
        let result = p.run(&mut ctx, &device(), None);
        assert!(result.is_ok());

        let last = ctx.results.last().unwrap();
        assert!(last.is_job_result());
        assert_eq!(last.result, boardlab_core::results::TestVerdict::Pass);

        // Download recorded its artifact in the namespace data.
        assert!(ctx
            .data
            .get("common", "download-kernel", "file", "kernel")
            .is_some());
        // Power off ran during finalize.
        assert!(runner
            .commands()
            .iter()
            .any(|c| c.contains("pduclient")));
    }

    #[test]
    fn test_failure_retry_recovers() {
        let runner = MockRunner::default();
        runner.fail("run-smoke-tests", 2);
        let p = sample_pipeline(3);
        let mut ctx = context(runner.clone());
        assert!(p.run(&mut ctx, &device(), None).is_ok());

        let attempts = runner
            .commands()
            .iter()
            .filter(|c| c.contains("run-smoke-tests"))
            .count();
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_retry_exhaustion_surfaces_failure() {
        let runner = MockRunner::default();
        runner.fail("run-smoke-tests", 10);
        let p = sample_pipeline(3);
        let mut ctx = context(runner.clone());
        let err = p.run(&mut ctx, &device(), None).unwrap_err();
        assert!(matches!(err, Error::Job(_)));
        assert!(err.to_string().contains("after 3 attempts"));

        let attempts = runner
            .commands()
            .iter()
            .filter(|c| c.contains("run-smoke-tests"))
            .count();
        assert_eq!(attempts, 3);
        let last = ctx.results.last().unwrap();
        assert!(last.is_job_result());
        assert_eq!(last.result, boardlab_core::results::TestVerdict::Fail);
    }

    #[test]
    fn test_repeat_runs_every_iteration() {
        let runner = MockRunner::default();
        let mut p = Pipeline::new();
        p.add_root("u-boot-boot", "boot", boot_kind(), Parameters::default());
        let retry = p.add_root(
            "test-retry",
            "repeat wrapper",
            ActionKind::Retry(RetryParams {
                max_retries: 3,
                repeat: true,
            }),
            Parameters::default(),
        );
        p.add_child(
            retry,
            "test-shell",
            "run tests",
            ActionKind::Test(TestParams {
                definitions: vec![TestDefinition {
                    name: "smoke-tests".into(),
                    path: Some("run-smoke-tests".into()),
                    repository: None,
                }],
            }),
            Parameters::default(),
        );

        let mut ctx = context(runner.clone());
        assert!(p.run(&mut ctx, &device(), None).is_ok());
        let attempts = runner
            .commands()
            .iter()
            .filter(|c| c.contains("run-smoke-tests"))
            .count();
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_finalize_runs_after_failure() {
        let runner = MockRunner::default();
        runner.fail("curl", 10);
        let p = sample_pipeline(1);
        let mut ctx = context(runner.clone());
        let err = p.run(&mut ctx, &device(), None).unwrap_err();
        assert!(matches!(err, Error::Job(_)));

        // Boot and test were skipped, but power off still happened.
        let commands = runner.commands();
        assert!(!commands.iter().any(|c| c.contains("run-smoke-tests")));
        assert!(commands.iter().any(|c| c.contains("pduclient")));
    }

    #[test]
    fn test_action_timeout_is_enforced() {
        let runner = MockRunner::default();
        runner.delay("usbrelay", std::time::Duration::from_millis(50));
        let mut p = Pipeline::new();
        let ix = p.add_root(
            "user-command",
            "run the recovery command",
            ActionKind::Command(CommandParams { name: "recovery".into() }),
            Parameters::default(),
        );
        p.node_mut(ix).timeout = std::time::Duration::from_millis(10);

        let mut ctx = context(runner);
        let err = p.run(&mut ctx, &device(), None).unwrap_err();
        assert!(matches!(err, Error::Job(_)));
        assert!(err.to_string().contains("did not finish"));
    }

    #[test]
    fn test_action_budget_stops_further_retry_attempts() {
        let runner = MockRunner::default();
        runner.fail("run-smoke-tests", 10);
        runner.delay("run-smoke-tests", std::time::Duration::from_millis(30));
        let p = {
            let mut p = sample_pipeline(5);
            // Tight budget on the retry wrapper: the first attempt eats it.
            let retry = p.roots()[2];
            p.node_mut(retry).timeout = std::time::Duration::from_millis(10);
            p
        };

        let mut ctx = context(runner.clone());
        assert!(p.run(&mut ctx, &device(), None).is_err());
        let attempts = runner
            .commands()
            .iter()
            .filter(|c| c.contains("run-smoke-tests"))
            .count();
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_test_requires_connection() {
        let runner = MockRunner::default();
        let mut p = Pipeline::new();
        p.add_root(
            "test-shell",
            "run tests",
            ActionKind::Test(TestParams {
                definitions: vec![TestDefinition {
                    name: "smoke-tests".into(),
                    path: None,
                    repository: None,
                }],
            }),
            Parameters::default(),
        );
        let mut ctx = context(runner);
        let err = p.run(&mut ctx, &device(), None).unwrap_err();
        assert!(err.to_string().contains("no connection"));
    }
}
