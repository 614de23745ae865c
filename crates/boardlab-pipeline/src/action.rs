//! Action tree building blocks.

use boardlab_core::{Error, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Index of an action within its pipeline's arena.
pub type ActionIx = usize;

/// Default timeout for a single action.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Dotted hierarchical position of an action, e.g. `1.3.2`.
///
/// Levels are unique within a pipeline, strictly increasing in document
/// order, and a parent's level is a prefix of each child's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Level(Vec<u32>);

impl Level {
    pub fn root(index: u32) -> Self {
        Self(vec![index])
    }

    pub fn child(&self, index: u32) -> Self {
        let mut parts = self.0.clone();
        parts.push(index);
        Self(parts)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_prefix_of(&self, other: &Level) -> bool {
        other.0.len() > self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts = s
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::Validation(format!("invalid action level: {}", s)))?;
        if parts.is_empty() {
            return Err(Error::Validation("empty action level".into()));
        }
        Ok(Self(parts))
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", part)?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for Level {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Level::parse(&s).map_err(de::Error::custom)
    }
}

/// Parameters of one action: a namespace plus the raw key/value map from
/// the definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Sanctioned cross-namespace link for connection lookup.
    #[serde(
        default,
        rename = "connection-namespace",
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_namespace: Option<String>,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

fn default_namespace() -> String {
    "common".to_string()
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            connection_namespace: None,
            values: Map::new(),
        }
    }
}

impl Parameters {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Namespace used for connection lookups.
    pub fn connection_namespace(&self) -> &str {
        self.connection_namespace
            .as_deref()
            .unwrap_or(&self.namespace)
    }
}

/// A timeout block from a job definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSpec {
    #[serde(default)]
    pub days: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub seconds: u64,
}

impl TimeoutSpec {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(
            self.days * 86400 + self.hours * 3600 + self.minutes * 60 + self.seconds,
        )
    }

    pub fn is_zero(&self) -> bool {
        self.duration() == Duration::ZERO
    }
}

/// What an action does, with its typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    Deploy(DeployParams),
    Download(DownloadParams),
    Overlay,
    ApplyOverlay,
    Boot(BootParams),
    AutoLogin(AutoLoginParams),
    Test(TestParams),
    Command(CommandParams),
    Retry(RetryParams),
    Finalize,
    PowerOff,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployParams {
    pub to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadParams {
    /// Image key within the deploy block (kernel, ramdisk, dtb, ...).
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootParams {
    pub method: String,
    /// Named boot command set from the device configuration.
    pub commands: Option<String>,
    pub prompts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoLoginParams {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestParams {
    pub definitions: Vec<TestDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandParams {
    /// Key into the device's user commands.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryParams {
    pub max_retries: u32,
    /// `true` runs every iteration; `false` stops at the first success.
    pub repeat: bool,
}

/// One node of the action tree.
#[derive(Debug, Clone)]
pub struct ActionNode {
    pub name: String,
    pub summary: String,
    pub level: Level,
    pub kind: ActionKind,
    pub parameters: Parameters,
    pub timeout: Duration,
    /// Validation errors; any entry makes the job unrunnable.
    pub errors: Vec<String>,
    pub children: Vec<ActionIx>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_display_and_parse() {
        let level = Level::root(1).child(3).child(2);
        assert_eq!(level.to_string(), "1.3.2");
        assert_eq!(Level::parse("1.3.2").unwrap(), level);
        assert!(Level::parse("1..2").is_err());
        assert!(Level::parse("a.b").is_err());
    }

    #[test]
    fn test_level_ordering_matches_document_order() {
        let one = Level::root(1);
        let one_one = one.child(1);
        let one_two = one.child(2);
        let two = Level::root(2);
        assert!(one < one_one);
        assert!(one_one < one_two);
        assert!(one_two < two);
    }

    #[test]
    fn test_level_prefix() {
        let parent = Level::root(2);
        let child = parent.child(1);
        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
        assert!(!parent.is_prefix_of(&parent.clone()));
        assert!(!Level::root(1).is_prefix_of(&Level::root(2).child(1)));
    }

    #[test]
    fn test_parameters_default_namespace() {
        let params: Parameters = serde_yaml::from_str("to: tftp").unwrap();
        assert_eq!(params.namespace, "common");
        assert_eq!(params.get_str("to"), Some("tftp"));
    }

    #[test]
    fn test_connection_namespace_override() {
        let params: Parameters =
            serde_yaml::from_str("namespace: probe\nconnection-namespace: dut").unwrap();
        assert_eq!(params.namespace, "probe");
        assert_eq!(params.connection_namespace(), "dut");
    }

    #[test]
    fn test_timeout_spec() {
        let spec: TimeoutSpec = serde_yaml::from_str("minutes: 5\nseconds: 30").unwrap();
        assert_eq!(spec.duration(), Duration::from_secs(330));
        assert!(TimeoutSpec::default().is_zero());
    }
}
