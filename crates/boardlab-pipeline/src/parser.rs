//! Job definition parsing.
//!
//! Turns a submitted YAML document into a validated pipeline, in a fixed
//! order: resolve the job timeout, start protocols by level, pre-scan test
//! blocks per namespace, walk the action list through strategy selection
//! (expanding repeat blocks), append the finalize action, then enforce the
//! declared compatibility floor.

use crate::action::{ActionKind, Parameters, TimeoutSpec, DEFAULT_ACTION_TIMEOUT};
use crate::pipeline::Pipeline;
use crate::protocol::{ProtocolHandler, ProtocolRegistry};
use crate::strategy::{self, ActionFamily, Registry, TestInfo};
use boardlab_core::ids::JobId;
use boardlab_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Timeout block of a definition. `job` is mandatory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutsBlock {
    #[serde(default)]
    pub job: TimeoutSpec,
    /// Default for every action.
    #[serde(default)]
    pub action: Option<TimeoutSpec>,
    /// Per-action-name overrides.
    #[serde(default)]
    pub actions: HashMap<String, TimeoutSpec>,
}

/// One entry of the `actions:` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionEntry {
    Deploy(Parameters),
    Boot(Parameters),
    Test(Parameters),
    Command(Parameters),
    Repeat(RepeatBlock),
}

/// A repeat block: its inner actions are expanded `count` times, with the
/// block's remaining keys merged into each occurrence as defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RepeatBlock {
    pub count: u32,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
    #[serde(flatten)]
    pub defaults: Map<String, Value>,
}

/// A decoded job definition document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub timeouts: TimeoutsBlock,
    /// Minimum runtime compatibility this job insists on.
    #[serde(default)]
    pub compatibility: Option<u32>,
    #[serde(default)]
    pub protocols: HashMap<String, Value>,
    /// Variables for device template rendering.
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
}

impl JobDefinition {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::Validation(e.to_string()))
    }
}

/// Everything the worker needs to run one job.
pub struct ParsedJob {
    pub job: JobId,
    pub job_name: Option<String>,
    pub pipeline: Pipeline,
    pub job_timeout: Duration,
    /// Compatibility provided by the selected strategies.
    pub compatibility: u32,
    pub context: HashMap<String, Value>,
    pub protocols: Vec<Box<dyn ProtocolHandler>>,
}

impl std::fmt::Debug for ParsedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedJob")
            .field("job", &self.job)
            .field("job_name", &self.job_name)
            .field("pipeline", &self.pipeline)
            .field("job_timeout", &self.job_timeout)
            .field("compatibility", &self.compatibility)
            .field("context", &self.context)
            .field(
                "protocols",
                &self.protocols.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Compiles definitions against a strategy and protocol registry.
pub struct JobParser<'r> {
    strategies: &'r Registry,
    protocols: &'r ProtocolRegistry,
}

impl<'r> JobParser<'r> {
    pub fn new(strategies: &'r Registry, protocols: &'r ProtocolRegistry) -> Self {
        Self {
            strategies,
            protocols,
        }
    }

    pub fn parse(
        &self,
        content: &str,
        device: &boardlab_core::device::DeviceConfig,
        job: JobId,
    ) -> Result<ParsedJob> {
        let definition = JobDefinition::from_yaml(content)?;
        self.parse_definition(&definition, device, job)
    }

    pub fn parse_definition(
        &self,
        definition: &JobDefinition,
        device: &boardlab_core::device::DeviceConfig,
        job: JobId,
    ) -> Result<ParsedJob> {
        if definition.timeouts.job.is_zero() {
            return Err(Error::Validation(
                "the job timeout must be set and positive".into(),
            ));
        }
        let job_timeout = definition.timeouts.job.duration();

        let protocols = self.protocols.select_all(definition, job)?;

        let mut tests = TestInfo::default();
        Self::scan_tests(&definition.actions, &mut tests);

        let mut pipeline = Pipeline::new();
        let mut compatibility = 0u32;
        for entry in &definition.actions {
            self.add_entry(
                &mut pipeline,
                entry,
                device,
                &definition.timeouts,
                &tests,
                &mut compatibility,
            )?;
        }

        // The finalize action terminates every pipeline, requested or not.
        let finalize = pipeline.add_root(
            "finalize",
            "clean up after the job",
            ActionKind::Finalize,
            Parameters::default(),
        );
        pipeline.add_child(
            finalize,
            "power-off",
            "power the device off",
            ActionKind::PowerOff,
            Parameters::default(),
        );

        if let Some(floor) = definition.compatibility
            && floor > compatibility
        {
            return Err(Error::Job(format!(
                "the job requires compatibility {}, the runtime provides {}",
                floor, compatibility
            )));
        }

        Ok(ParsedJob {
            job,
            job_name: definition.job_name.clone(),
            pipeline,
            job_timeout,
            compatibility,
            context: definition.context.clone(),
            protocols,
        })
    }

    fn scan_tests(entries: &[ActionEntry], info: &mut TestInfo) {
        for entry in entries {
            match entry {
                ActionEntry::Test(params) => info.record(&params.namespace),
                ActionEntry::Repeat(block) => Self::scan_tests(&block.actions, info),
                _ => {}
            }
        }
    }

    fn add_entry(
        &self,
        pipeline: &mut Pipeline,
        entry: &ActionEntry,
        device: &boardlab_core::device::DeviceConfig,
        timeouts: &TimeoutsBlock,
        tests: &TestInfo,
        compatibility: &mut u32,
    ) -> Result<()> {
        match entry {
            ActionEntry::Deploy(params) => self.add_strategy(
                pipeline,
                ActionFamily::Deploy,
                params,
                device,
                timeouts,
                tests,
                compatibility,
            ),
            ActionEntry::Boot(params) => self.add_strategy(
                pipeline,
                ActionFamily::Boot,
                params,
                device,
                timeouts,
                tests,
                compatibility,
            ),
            ActionEntry::Test(params) => self.add_strategy(
                pipeline,
                ActionFamily::Test,
                params,
                device,
                timeouts,
                tests,
                compatibility,
            ),
            ActionEntry::Command(params) => {
                let ix = strategy::build_command(pipeline, params)?;
                let name = pipeline.node(ix).name.clone();
                pipeline.node_mut(ix).timeout = Self::action_timeout(timeouts, &name);
                Ok(())
            }
            ActionEntry::Repeat(block) => {
                if block.count == 0 {
                    return Err(Error::Validation("repeat count must be at least 1".into()));
                }
                for iteration in 0..block.count {
                    for inner in &block.actions {
                        let merged = Self::merge_repeat(inner, &block.defaults, iteration)?;
                        self.add_entry(pipeline, &merged, device, timeouts, tests, compatibility)?;
                    }
                }
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_strategy(
        &self,
        pipeline: &mut Pipeline,
        family: ActionFamily,
        params: &Parameters,
        device: &boardlab_core::device::DeviceConfig,
        timeouts: &TimeoutsBlock,
        tests: &TestInfo,
        compatibility: &mut u32,
    ) -> Result<()> {
        let chosen = self.strategies.select(family, device, params)?;
        *compatibility = (*compatibility).max(chosen.compatibility);
        let ix = chosen.build(pipeline, params, tests);
        let name = pipeline.node(ix).name.clone();
        pipeline.node_mut(ix).timeout = Self::action_timeout(timeouts, &name);
        Ok(())
    }

    fn merge_repeat(
        inner: &ActionEntry,
        defaults: &Map<String, Value>,
        iteration: u32,
    ) -> Result<ActionEntry> {
        let merge = |params: &Parameters| {
            let mut merged = params.clone();
            for (key, value) in defaults {
                merged
                    .values
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            merged.values.insert("repeat-count".into(), iteration.into());
            merged
        };
        Ok(match inner {
            ActionEntry::Deploy(p) => ActionEntry::Deploy(merge(p)),
            ActionEntry::Boot(p) => ActionEntry::Boot(merge(p)),
            ActionEntry::Test(p) => ActionEntry::Test(merge(p)),
            ActionEntry::Command(p) => ActionEntry::Command(merge(p)),
            ActionEntry::Repeat(_) => {
                return Err(Error::Validation(
                    "nested repeat blocks are not supported".into(),
                ));
            }
        })
    }

    fn action_timeout(timeouts: &TimeoutsBlock, name: &str) -> Duration {
        if let Some(spec) = timeouts.actions.get(name) {
            return spec.duration();
        }
        if let Some(spec) = &timeouts.action {
            return spec.duration();
        }
        DEFAULT_ACTION_TIMEOUT
    }
}
