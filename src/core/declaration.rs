//! Task declaration document format.
//!
//! Every field is optional at this level so that the validator can report
//! all missing or malformed entries in a single pass. TOML and JSON are
//! accepted, chosen by file extension.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::task::{ErrorPolicy, Task};
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDeclaration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responsible: Option<String>,
    /// `agent`, `worker`, `human`, `clone`, or `inferred`/absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<InputDeclaration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputDeclaration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checklist: Option<ChecklistDeclaration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceDeclaration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicyDeclaration>,
    #[serde(default)]
    pub routing: RoutingDeclaration,
    #[serde(default)]
    pub quality: QualityDeclaration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataDeclaration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDeclaration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDeclaration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistDeclaration {
    #[serde(default)]
    pub preconditions: Vec<CheckItemDeclaration>,
    #[serde(default)]
    pub postconditions: Vec<CheckItemDeclaration>,
    #[serde(default)]
    pub acceptance: Vec<CheckItemDeclaration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckItemDeclaration {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub blocking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<RuleDeclaration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDeclaration {
    /// Input (preconditions) or output (post/acceptance) the rule inspects.
    #[serde(alias = "output", alias = "input")]
    pub target: String,
    pub check: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceDeclaration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cacheable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelizable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPolicyDeclaration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryDeclaration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDeclaration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDeclaration {
    #[serde(default)]
    pub deterministic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default)]
    pub critical_decision: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methodology: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityDeclaration {
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub human_review: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDeclaration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Document formats accepted for declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// Pick the format from a path's extension; TOML unless `.json`.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Toml,
        }
    }
}

/// Parse a document of type `T` in the given format.
pub fn parse_document<T: serde::de::DeserializeOwned>(text: &str, format: Format) -> Result<T> {
    Ok(match format {
        Format::Toml => toml::from_str(text)?,
        Format::Json => serde_json::from_str(text)?,
    })
}

/// Serialize a document of type `T` in the given format.
pub fn render_document<T: Serialize>(doc: &T, format: Format) -> Result<String> {
    Ok(match format {
        Format::Toml => toml::to_string_pretty(doc)?,
        Format::Json => serde_json::to_string_pretty(doc)?,
    })
}

impl TaskDeclaration {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        parse_document(&text, Format::from_path(path))
    }
}

impl Task {
    /// Rebuild the declaration this task was validated from.
    pub fn to_declaration(&self) -> TaskDeclaration {
        let item = |i: &crate::core::task::CheckItem| CheckItemDeclaration {
            description: i.description.clone(),
            blocking: i.blocking,
            rule: i.rule.as_ref().map(|r| RuleDeclaration {
                target: r.target.clone(),
                check: r.check.as_str().to_string(),
                value: r.value.clone(),
            }),
        };

        let error_policy = match &self.error_policy {
            ErrorPolicy::Retry(retry) => ErrorPolicyDeclaration {
                strategy: Some("retry".into()),
                retry: Some(RetryDeclaration {
                    max_attempts: Some(retry.max_attempts),
                    backoff: Some(retry.backoff.as_str().into()),
                    base_delay_ms: Some(retry.base_delay_ms),
                    max_delay_ms: Some(retry.max_delay_ms),
                }),
                fallback: None,
            },
            ErrorPolicy::Fallback { value } => ErrorPolicyDeclaration {
                strategy: Some("fallback".into()),
                retry: None,
                fallback: Some(serde_json::Value::Object(
                    value.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )),
            },
            ErrorPolicy::Abort => ErrorPolicyDeclaration {
                strategy: Some("abort".into()),
                retry: None,
                fallback: None,
            },
        };

        TaskDeclaration {
            task: Some(self.id.0.clone()),
            description: Some(self.description.clone()),
            responsible: Some(self.responsible.clone()),
            executor_kind: Some(
                self.executor_override
                    .map(|k| k.as_str().to_string())
                    .unwrap_or_else(|| "inferred".to_string()),
            ),
            inputs: Some(
                self.inputs
                    .iter()
                    .map(|i| InputDeclaration {
                        name: Some(i.name.clone()),
                        value_type: Some(i.value_type.as_str().into()),
                        source: Some(i.source.to_string()),
                        required: Some(i.required),
                        default: i.default.clone(),
                    })
                    .collect(),
            ),
            outputs: Some(
                self.outputs
                    .iter()
                    .map(|o| OutputDeclaration {
                        name: Some(o.name.clone()),
                        value_type: Some(o.value_type.as_str().into()),
                        destination: Some(o.destination.to_string()),
                        persisted: Some(o.persisted),
                    })
                    .collect(),
            ),
            checklist: Some(ChecklistDeclaration {
                preconditions: self.checklist.preconditions.iter().map(item).collect(),
                postconditions: self.checklist.postconditions.iter().map(item).collect(),
                acceptance: self.checklist.acceptance.iter().map(item).collect(),
            }),
            performance: Some(PerformanceDeclaration {
                expected_duration_ms: Some(self.performance.expected_duration_ms),
                cost: Some(self.performance.estimated_cost),
                cacheable: Some(self.performance.cacheable),
                cache_key: self.performance.cache_key.clone(),
                parallelizable: Some(self.performance.parallelizable),
                timeout_ms: self.performance.timeout_ms,
            }),
            error_policy: Some(error_policy),
            routing: RoutingDeclaration {
                deterministic: self.routing.deterministic,
                capability: self.routing.capability.clone(),
                critical_decision: self.routing.critical_decision,
                methodology: self.routing.methodology.clone(),
                skill: self.routing.skill.clone(),
            },
            quality: QualityDeclaration {
                blocking: self.quality.blocking,
                human_review: self.quality.human_review,
            },
            metadata: Some(MetadataDeclaration {
                version: Some(self.version.clone()),
                dependencies: self.dependencies.clone(),
            }),
        }
    }
}
