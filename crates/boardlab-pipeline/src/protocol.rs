//! Job-level protocols.
//!
//! Protocols live outside the action tree and answer explicit requests
//! issued by actions while they run. They are instantiated by the parser in
//! ascending level order, so a protocol that provides an environment (e.g.
//! a container) is ready before one that issues commands through it.

use crate::parser::JobDefinition;
use boardlab_core::ids::JobId;
use boardlab_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::debug;

/// An explicit request from an action to a protocol.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProtocolRequest {
    /// Name of the action issuing the request.
    pub action: String,
    pub request: String,
    #[serde(default)]
    pub message: Option<Value>,
}

/// A live protocol instance attached to one job.
pub trait ProtocolHandler: Send {
    fn name(&self) -> &'static str;

    /// Answer one request. The reply, if any, is recorded in the job's
    /// namespace data under this protocol's name.
    fn call(&mut self, request: &ProtocolRequest) -> Result<Option<Value>>;

    /// Cleanup when the job finishes, successful or not.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

type AcceptFn = fn(&JobDefinition) -> bool;
type CreateFn = fn(&JobDefinition, JobId) -> Result<Box<dyn ProtocolHandler>>;

/// One registered protocol.
pub struct ProtocolEntry {
    pub name: &'static str,
    /// Initialization order: lower levels start first.
    pub level: u32,
    accepts: AcceptFn,
    create: CreateFn,
}

/// Explicit registry of available protocols.
#[derive(Default)]
pub struct ProtocolRegistry {
    entries: Vec<ProtocolEntry>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in protocols.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ProtocolEntry {
            name: "container",
            level: 0,
            accepts: |def| def.protocols.contains_key("container"),
            create: ContainerProtocol::create,
        });
        registry.register(ProtocolEntry {
            name: "multinode",
            level: 1,
            accepts: |def| def.protocols.contains_key("multinode"),
            create: MultinodeProtocol::create,
        });
        registry
    }

    pub fn register(&mut self, entry: ProtocolEntry) {
        self.entries.push(entry);
    }

    /// Instantiate every accepted protocol, sorted by ascending level.
    pub fn select_all(
        &self,
        definition: &JobDefinition,
        job: JobId,
    ) -> Result<Vec<Box<dyn ProtocolHandler>>> {
        let mut accepted: Vec<&ProtocolEntry> = self
            .entries
            .iter()
            .filter(|e| (e.accepts)(definition))
            .collect();
        accepted.sort_by_key(|e| e.level);

        let mut handlers = Vec::with_capacity(accepted.len());
        for entry in accepted {
            debug!(protocol = entry.name, level = entry.level, "starting protocol");
            handlers.push((entry.create)(definition, job)?);
        }
        Ok(handlers)
    }
}

/// Container isolation for actions that run host-side commands.
pub struct ContainerProtocol {
    image: String,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerSettings {
    #[serde(default)]
    image: Option<String>,
}

impl ContainerProtocol {
    fn create(definition: &JobDefinition, _job: JobId) -> Result<Box<dyn ProtocolHandler>> {
        let settings: ContainerSettings = definition
            .protocols
            .get("container")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Validation(format!("invalid container protocol block: {}", e)))?
            .unwrap_or_default();
        Ok(Box::new(Self {
            image: settings.image.unwrap_or_else(|| "debian:stable".to_string()),
        }))
    }
}

impl ProtocolHandler for ContainerProtocol {
    fn name(&self) -> &'static str {
        "container"
    }

    fn call(&mut self, request: &ProtocolRequest) -> Result<Option<Value>> {
        match request.request.as_str() {
            "run" => {
                let cmd = request
                    .message
                    .as_ref()
                    .and_then(|m| m.get("cmd"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::Job("container 'run' request needs a 'cmd' message".into())
                    })?;
                Ok(Some(json!({
                    "cmd": format!("docker run --rm {} sh -c '{}'", self.image, cmd),
                })))
            }
            other => Err(Error::Job(format!("unknown container request '{}'", other))),
        }
    }
}

/// Role coordination for multi-device jobs.
pub struct MultinodeProtocol {
    role: Option<String>,
    peers: HashMap<String, Vec<String>>,
    sub_id: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct MultinodeSettings {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    peers: HashMap<String, Vec<String>>,
    #[serde(default)]
    sub_id: Option<u32>,
}

impl MultinodeProtocol {
    fn create(definition: &JobDefinition, _job: JobId) -> Result<Box<dyn ProtocolHandler>> {
        let settings: MultinodeSettings = definition
            .protocols
            .get("multinode")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Validation(format!("invalid multinode protocol block: {}", e)))?
            .unwrap_or_default();
        Ok(Box::new(Self {
            role: settings.role,
            peers: settings.peers,
            sub_id: settings.sub_id,
        }))
    }
}

impl ProtocolHandler for MultinodeProtocol {
    fn name(&self) -> &'static str {
        "multinode"
    }

    fn call(&mut self, request: &ProtocolRequest) -> Result<Option<Value>> {
        match request.request.as_str() {
            "roles" => Ok(Some(json!({
                "role": self.role,
                "peers": self.peers,
                "sub_id": self.sub_id,
            }))),
            "send" => Ok(Some(json!({
                "response": "ack",
                "message": request.message,
            }))),
            "wait" | "sync" => Ok(Some(json!({ "response": "ack" }))),
            other => Err(Error::Job(format!("unknown multinode request '{}'", other))),
        }
    }
}
