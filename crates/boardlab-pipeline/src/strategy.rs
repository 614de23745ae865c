//! Strategy selection.
//!
//! Each deploy/boot/test block in a definition is matched against the
//! registered strategies for its family. Strategies carry a
//! reason-returning `accepts` predicate and a `build` function that
//! populates the pipeline subtree. The registry is an explicit value; two
//! registries with the same registrations behave identically.

use crate::action::{
    ActionIx, ActionKind, AutoLoginParams, BootParams, CommandParams, DeployParams,
    DownloadParams, Parameters, RetryParams, TestDefinition, TestParams,
};
use crate::pipeline::Pipeline;
use boardlab_core::device::DeviceConfig;
use boardlab_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Action family a strategy belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionFamily {
    Deploy,
    Boot,
    Test,
}

impl fmt::Display for ActionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionFamily::Deploy => write!(f, "deploy"),
            ActionFamily::Boot => write!(f, "boot"),
            ActionFamily::Test => write!(f, "test"),
        }
    }
}

/// Result of an `accepts` check: `Err` carries the user-actionable reason.
pub type AcceptOutcome = std::result::Result<(), String>;

type AcceptFn = fn(&DeviceConfig, &Parameters) -> AcceptOutcome;
type BuildFn = fn(&mut Pipeline, &Parameters, &TestInfo) -> ActionIx;

/// One registered strategy.
#[derive(Debug)]
pub struct Strategy {
    pub name: &'static str,
    /// Higher wins among accepting strategies; ties go to registration
    /// order.
    pub priority: u32,
    /// Compatibility this strategy requires from the runtime.
    pub compatibility: u32,
    accepts: AcceptFn,
    build: BuildFn,
}

impl Strategy {
    pub fn accepts(&self, device: &DeviceConfig, params: &Parameters) -> AcceptOutcome {
        (self.accepts)(device, params)
    }

    pub fn build(
        &self,
        pipeline: &mut Pipeline,
        params: &Parameters,
        tests: &TestInfo,
    ) -> ActionIx {
        (self.build)(pipeline, params, tests)
    }
}

/// Test blocks seen during the pre-scan, per namespace. Deploy strategies
/// consult this to decide whether an overlay is needed.
#[derive(Debug, Clone, Default)]
pub struct TestInfo {
    counts: HashMap<String, usize>,
}

impl TestInfo {
    pub fn record(&mut self, namespace: &str) {
        *self.counts.entry(namespace.to_string()).or_default() += 1;
    }

    pub fn needs_overlay(&self, namespace: &str) -> bool {
        self.counts.contains_key(namespace)
    }
}

/// Explicit registry of strategies, grouped by family.
#[derive(Default)]
pub struct Registry {
    deploy: Vec<Strategy>,
    boot: Vec<Strategy>,
    test: Vec<Strategy>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategies.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            ActionFamily::Deploy,
            Strategy {
                name: "tftp",
                priority: 5,
                compatibility: 1,
                accepts: accepts_tftp,
                build: build_tftp,
            },
        );
        registry.register(
            ActionFamily::Deploy,
            Strategy {
                name: "flasher",
                priority: 10,
                compatibility: 4,
                accepts: accepts_flasher,
                build: build_flasher,
            },
        );
        registry.register(
            ActionFamily::Boot,
            Strategy {
                name: "u-boot",
                priority: 5,
                compatibility: 2,
                accepts: accepts_uboot,
                build: build_uboot,
            },
        );
        registry.register(
            ActionFamily::Boot,
            Strategy {
                name: "minimal",
                priority: 1,
                compatibility: 1,
                accepts: accepts_minimal,
                build: build_minimal,
            },
        );
        registry.register(
            ActionFamily::Test,
            Strategy {
                name: "shell",
                priority: 1,
                compatibility: 1,
                accepts: accepts_shell,
                build: build_shell,
            },
        );
        registry
    }

    pub fn register(&mut self, family: ActionFamily, strategy: Strategy) {
        self.family_mut(family).push(strategy);
    }

    fn family(&self, family: ActionFamily) -> &[Strategy] {
        match family {
            ActionFamily::Deploy => &self.deploy,
            ActionFamily::Boot => &self.boot,
            ActionFamily::Test => &self.test,
        }
    }

    fn family_mut(&mut self, family: ActionFamily) -> &mut Vec<Strategy> {
        match family {
            ActionFamily::Deploy => &mut self.deploy,
            ActionFamily::Boot => &mut self.boot,
            ActionFamily::Test => &mut self.test,
        }
    }

    /// Pick the strategy for one action block. Deterministic: highest
    /// priority among accepting strategies, registration order breaking
    /// ties. Fails with the last rejection reason when nothing accepts.
    pub fn select(
        &self,
        family: ActionFamily,
        device: &DeviceConfig,
        params: &Parameters,
    ) -> Result<&Strategy> {
        let mut best: Option<&Strategy> = None;
        let mut last_reason = format!("no {} strategies registered", family);
        for strategy in self.family(family) {
            match strategy.accepts(device, params) {
                Ok(()) => {
                    if best.is_none_or(|b| strategy.priority > b.priority) {
                        best = Some(strategy);
                    }
                }
                Err(reason) => last_reason = reason,
            }
        }
        best.ok_or(Error::Job(last_reason))
    }
}

fn accepts_tftp(device: &DeviceConfig, params: &Parameters) -> AcceptOutcome {
    if params.get_str("to") != Some("tftp") {
        return Err("'to' parameter is not 'tftp'".to_string());
    }
    if !device.has_deploy_method("tftp") {
        return Err("'tftp' not in the device configuration deploy methods".to_string());
    }
    Ok(())
}

fn accepts_flasher(device: &DeviceConfig, params: &Parameters) -> AcceptOutcome {
    if params.get_str("to") != Some("flasher") {
        return Err("'to' parameter is not 'flasher'".to_string());
    }
    if !device.has_deploy_method("flasher") {
        return Err("'flasher' not in the device configuration deploy methods".to_string());
    }
    Ok(())
}

fn accepts_uboot(device: &DeviceConfig, params: &Parameters) -> AcceptOutcome {
    if params.get_str("method") != Some("u-boot") {
        return Err("'method' parameter is not 'u-boot'".to_string());
    }
    if !device.has_boot_method("u-boot") {
        return Err("'u-boot' not in the device configuration boot methods".to_string());
    }
    Ok(())
}

fn accepts_minimal(device: &DeviceConfig, params: &Parameters) -> AcceptOutcome {
    if params.get_str("method") != Some("minimal") {
        return Err("'method' parameter is not 'minimal'".to_string());
    }
    if !device.has_boot_method("minimal") {
        return Err("'minimal' not in the device configuration boot methods".to_string());
    }
    Ok(())
}

fn accepts_shell(_device: &DeviceConfig, params: &Parameters) -> AcceptOutcome {
    match params.get("definitions").and_then(Value::as_array) {
        Some(defs) if !defs.is_empty() => Ok(()),
        _ => Err("no test definitions listed".to_string()),
    }
}

/// Add one download child per image entry carrying a `url`.
fn add_downloads(pipeline: &mut Pipeline, root: ActionIx, params: &Parameters) {
    let entries: Vec<(String, String)> = params
        .values
        .iter()
        .filter_map(|(key, value)| {
            let url = value.get("url").and_then(Value::as_str)?;
            Some((key.clone(), url.to_string()))
        })
        .collect();
    for (key, url) in entries {
        pipeline.add_child(
            root,
            format!("download-{}", key),
            format!("download the {} image", key),
            ActionKind::Download(DownloadParams {
                key: key.clone(),
                url,
            }),
            params.clone(),
        );
    }
}

fn add_overlay(pipeline: &mut Pipeline, root: ActionIx, params: &Parameters, tests: &TestInfo) {
    if !tests.needs_overlay(&params.namespace) {
        return;
    }
    pipeline.add_child(
        root,
        "test-overlay",
        "build the test overlay",
        ActionKind::Overlay,
        params.clone(),
    );
    pipeline.add_child(
        root,
        "apply-overlay",
        "apply the test overlay to the deployed files",
        ActionKind::ApplyOverlay,
        params.clone(),
    );
}

fn build_tftp(pipeline: &mut Pipeline, params: &Parameters, tests: &TestInfo) -> ActionIx {
    let root = pipeline.add_root(
        "tftp-deploy",
        "download files and serve them over tftp",
        ActionKind::Deploy(DeployParams { to: "tftp".into() }),
        params.clone(),
    );
    add_downloads(pipeline, root, params);
    add_overlay(pipeline, root, params, tests);
    root
}

fn build_flasher(pipeline: &mut Pipeline, params: &Parameters, tests: &TestInfo) -> ActionIx {
    let root = pipeline.add_root(
        "flasher-deploy",
        "write images with the board flasher",
        ActionKind::Deploy(DeployParams {
            to: "flasher".into(),
        }),
        params.clone(),
    );
    add_downloads(pipeline, root, params);
    add_overlay(pipeline, root, params, tests);
    root
}

fn boot_prompts(params: &Parameters) -> Vec<String> {
    params
        .get("prompts")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

fn build_uboot(pipeline: &mut Pipeline, params: &Parameters, _tests: &TestInfo) -> ActionIx {
    let root = pipeline.add_root(
        "u-boot-boot",
        "boot the device with u-boot",
        ActionKind::Boot(BootParams {
            method: "u-boot".into(),
            commands: params.get_str("commands").map(String::from),
            prompts: boot_prompts(params),
        }),
        params.clone(),
    );
    if let Some(login) = params.get("auto_login") {
        pipeline.add_child(
            root,
            "auto-login",
            "log in once the device has booted",
            ActionKind::AutoLogin(AutoLoginParams {
                username: login
                    .get("username")
                    .and_then(Value::as_str)
                    .map(String::from),
                password: login
                    .get("password")
                    .and_then(Value::as_str)
                    .map(String::from),
            }),
            params.clone(),
        );
    }
    root
}

fn build_minimal(pipeline: &mut Pipeline, params: &Parameters, _tests: &TestInfo) -> ActionIx {
    pipeline.add_root(
        "minimal-boot",
        "connect to an already-running device",
        ActionKind::Boot(BootParams {
            method: "minimal".into(),
            commands: None,
            prompts: boot_prompts(params),
        }),
        params.clone(),
    )
}

fn build_shell(pipeline: &mut Pipeline, params: &Parameters, _tests: &TestInfo) -> ActionIx {
    let definitions: Vec<TestDefinition> = params
        .get("definitions")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let max_retries = params
        .get("failure_retry")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;
    let root = pipeline.add_root(
        "test-retry",
        "retry wrapper for the test action",
        ActionKind::Retry(RetryParams {
            max_retries,
            repeat: false,
        }),
        params.clone(),
    );
    pipeline.add_child(
        root,
        "test-shell",
        "run the test definitions over the connection",
        ActionKind::Test(TestParams { definitions }),
        params.clone(),
    );
    root
}

/// Build a plain command action (no strategy selection involved).
pub fn build_command(pipeline: &mut Pipeline, params: &Parameters) -> Result<ActionIx> {
    let name = params
        .get_str("name")
        .ok_or_else(|| Error::Validation("command action requires a 'name'".into()))?
        .to_string();
    Ok(pipeline.add_root(
        "user-command",
        format!("run the '{}' device command", name),
        ActionKind::Command(CommandParams { name }),
        params.clone(),
    ))
}
