//! Validated task model.
//!
//! A `Task` is produced only by the validator and is immutable afterwards;
//! the engine shares it behind an `Arc`. Raw, possibly malformed input lives
//! in [`crate::core::declaration`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Named values flowing in and out of tasks.
pub type Values = BTreeMap<String, serde_json::Value>;

/// Identifier of a task, unique within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The four kinds of executor a task can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Non-deterministic reasoning backend.
    Agent,
    /// Deterministic registered function.
    Worker,
    /// Manual, blocking decision.
    Human,
    /// Agent constrained by a named methodology.
    Clone,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 4] = [
        ExecutorKind::Agent,
        ExecutorKind::Worker,
        ExecutorKind::Human,
        ExecutorKind::Clone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Agent => "agent",
            ExecutorKind::Worker => "worker",
            ExecutorKind::Human => "human",
            ExecutorKind::Clone => "clone",
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "agent" => Ok(ExecutorKind::Agent),
            "worker" => Ok(ExecutorKind::Worker),
            "human" => Ok(ExecutorKind::Human),
            "clone" => Ok(ExecutorKind::Clone),
            other => Err(format!("unknown executor kind '{}'", other)),
        }
    }
}

/// Declared type of an input or output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Object => "object",
            ValueType::Array => "array",
            ValueType::Any => "any",
        }
    }

    /// Check whether `value` has this type.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            ValueType::String => matches!(value, Value::String(_)),
            ValueType::Number => matches!(value, Value::Number(_)),
            ValueType::Boolean => matches!(value, Value::Bool(_)),
            ValueType::Object => matches!(value, Value::Object(_)),
            ValueType::Array => matches!(value, Value::Array(_)),
            ValueType::Any => true,
        }
    }
}

impl std::str::FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "text" => Ok(ValueType::String),
            "number" | "integer" | "float" => Ok(ValueType::Number),
            "boolean" | "bool" => Ok(ValueType::Boolean),
            "object" | "map" => Ok(ValueType::Object),
            "array" | "list" => Ok(ValueType::Array),
            "any" => Ok(ValueType::Any),
            other => Err(format!("unknown value type '{}'", other)),
        }
    }
}

/// Where an input value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum InputSource {
    /// Output of another task in the same workflow.
    Task { task: TaskId, output: String },
    /// Value from the loaded configuration.
    Config { key: String },
    /// Value supplied by the caller (`--input K=V`).
    User { key: String },
}

impl InputSource {
    /// Parse `task:<id>.<output>`, `config:<key>`, `user:<key>` or `user`.
    pub fn parse(raw: &str, input_name: &str) -> std::result::Result<Self, String> {
        let raw = raw.trim();
        if raw == "user" {
            return Ok(InputSource::User {
                key: input_name.to_string(),
            });
        }
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| format!("source '{}' has no scheme (task:, config:, user:)", raw))?;
        if rest.is_empty() {
            return Err(format!("source '{}' has an empty reference", raw));
        }
        match scheme {
            "task" => {
                let (task, output) = rest
                    .rsplit_once('.')
                    .filter(|(t, o)| !t.is_empty() && !o.is_empty())
                    .ok_or_else(|| format!("task source '{}' must be task:<id>.<output>", raw))?;
                Ok(InputSource::Task {
                    task: TaskId::from(task),
                    output: output.to_string(),
                })
            }
            "config" => Ok(InputSource::Config {
                key: rest.to_string(),
            }),
            "user" => Ok(InputSource::User {
                key: rest.to_string(),
            }),
            other => Err(format!("unknown source scheme '{}'", other)),
        }
    }
}

impl std::fmt::Display for InputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputSource::Task { task, output } => write!(f, "task:{}.{}", task, output),
            InputSource::Config { key } => write!(f, "config:{}", key),
            InputSource::User { key } => write!(f, "user:{}", key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub value_type: ValueType,
    pub source: InputSource,
    pub required: bool,
    pub default: Option<serde_json::Value>,
}

/// Where an output value is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Destination {
    /// Returned to the caller and to dependent tasks.
    Return,
    /// Exported into the workflow context under a key.
    Context { key: String },
    /// Written to a file after the task succeeds.
    File { path: PathBuf },
}

impl Destination {
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let raw = raw.trim();
        if raw == "return" {
            return Ok(Destination::Return);
        }
        match raw.split_once(':') {
            Some(("context", key)) if !key.is_empty() => Ok(Destination::Context {
                key: key.to_string(),
            }),
            Some(("file", path)) if !path.is_empty() => Ok(Destination::File {
                path: PathBuf::from(path),
            }),
            _ => Err(format!(
                "destination '{}' must be return, context:<key> or file:<path>",
                raw
            )),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Return => write!(f, "return"),
            Destination::Context { key } => write!(f, "context:{}", key),
            Destination::File { path } => write!(f, "file:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub value_type: ValueType,
    pub destination: Destination,
    pub persisted: bool,
}

/// A deterministic check a checklist item can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCheck {
    Present,
    NonEmpty,
    Type,
    Matches,
    MaxLength,
}

impl RuleCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCheck::Present => "present",
            RuleCheck::NonEmpty => "nonEmpty",
            RuleCheck::Type => "type",
            RuleCheck::Matches => "matches",
            RuleCheck::MaxLength => "maxLength",
        }
    }
}

impl std::str::FromStr for RuleCheck {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "present" => Ok(RuleCheck::Present),
            "nonEmpty" | "non_empty" => Ok(RuleCheck::NonEmpty),
            "type" => Ok(RuleCheck::Type),
            "matches" => Ok(RuleCheck::Matches),
            "maxLength" | "max_length" => Ok(RuleCheck::MaxLength),
            other => Err(format!("unknown rule check '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRule {
    /// Input name for preconditions, output name otherwise.
    pub target: String,
    pub check: RuleCheck,
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckItem {
    pub description: String,
    pub blocking: bool,
    pub rule: Option<CheckRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checklist {
    pub preconditions: Vec<CheckItem>,
    pub postconditions: Vec<CheckItem>,
    pub acceptance: Vec<CheckItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    /// Soft budget used for scheduling.
    pub expected_duration_ms: u64,
    pub estimated_cost: f64,
    pub cacheable: bool,
    pub cache_key: Option<String>,
    pub parallelizable: bool,
    /// Hard timeout; the configured global timeout applies when unset.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Linear,
    Exponential,
}

impl Backoff {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backoff::Linear => "linear",
            Backoff::Exponential => "exponential",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1) as u64;
        let ms = match self.backoff {
            Backoff::Linear => self.base_delay_ms.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl((attempt - 1) as u32).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum ErrorPolicy {
    Retry(RetryPolicy),
    Fallback { value: Values },
    Abort,
}

impl ErrorPolicy {
    pub fn strategy(&self) -> &'static str {
        match self {
            ErrorPolicy::Retry(_) => "retry",
            ErrorPolicy::Fallback { .. } => "fallback",
            ErrorPolicy::Abort => "abort",
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            ErrorPolicy::Retry(retry) => retry.max_attempts,
            _ => 1,
        }
    }
}

/// Static metadata the router reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHints {
    /// Same input always yields the same output.
    pub deterministic: bool,
    /// Catalog capability implementing the task.
    pub capability: Option<String>,
    /// Legal, financial or irreversible impact.
    pub critical_decision: bool,
    /// Named methodology the executor must follow.
    pub methodology: Option<String>,
    /// Skill tag required from organizer workers.
    pub skill: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPolicy {
    /// Layer 2 findings block progression.
    pub blocking: bool,
    /// Layer 3 human review is required.
    pub human_review: bool,
}

/// A validated task declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub responsible: String,
    pub executor_override: Option<ExecutorKind>,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub checklist: Checklist,
    pub performance: Performance,
    pub error_policy: ErrorPolicy,
    pub routing: RoutingHints,
    pub quality: QualityPolicy,
    pub version: String,
    pub dependencies: Vec<String>,
}

impl Task {
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Tasks whose outputs this task consumes.
    pub fn upstream_tasks(&self) -> Vec<&TaskId> {
        let mut ids: Vec<&TaskId> = self
            .inputs
            .iter()
            .filter_map(|i| match &i.source {
                InputSource::Task { task, .. } => Some(task),
                _ => None,
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Hard timeout, falling back to `global`.
    pub fn hard_timeout(&self, global: Duration) -> Duration {
        self.performance
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(global)
    }

    pub fn expected_duration(&self) -> Duration {
        Duration::from_millis(self.performance.expected_duration_ms)
    }
}
