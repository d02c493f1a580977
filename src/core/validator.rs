//! Task declaration validation.
//!
//! `validate` is pure: it never touches the filesystem or configuration and
//! returns every violated rule, not just the first one.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::declaration::{CheckItemDeclaration, TaskDeclaration};
use crate::core::task::{
    Backoff, CheckItem, CheckRule, Checklist, Destination, ErrorPolicy, ExecutorKind, InputSource,
    InputSpec, OutputSpec, Performance, QualityPolicy, RetryPolicy, RoutingHints, RuleCheck, Task,
    TaskId, ValueType, Values,
};
use crate::util::placeholders;

pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// A single violated rule, addressed by a dotted path into the declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// All violations found in one declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation::new(path, message));
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn extend(&mut self, other: ValidationReport) {
        self.violations.extend(other.violations);
    }

    /// Prefix every path, used when a task is nested inside a workflow.
    pub fn scoped(mut self, prefix: &str) -> Self {
        for v in &mut self.violations {
            v.path = format!("{}.{}", prefix, v.path);
        }
        self
    }

    pub fn mentions(&self, path: &str) -> bool {
        self.violations.iter().any(|v| v.path == path)
    }
}

impl From<Vec<Violation>> for ValidationReport {
    fn from(violations: Vec<Violation>) -> Self {
        Self { violations }
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lines: Vec<String> = self.violations.iter().map(|v| v.to_string()).collect();
        write!(f, "{} violation(s): {}", lines.len(), lines.join("; "))
    }
}

/// Validate a raw declaration into a `Task`.
pub fn validate(decl: &TaskDeclaration) -> std::result::Result<Task, ValidationReport> {
    let mut report = ValidationReport::default();

    // (1) required top-level fields
    let id = required_str(&mut report, "task", decl.task.as_deref());
    let responsible = required_str(&mut report, "responsible", decl.responsible.as_deref());
    for (path, present) in [
        ("inputs", decl.inputs.is_some()),
        ("outputs", decl.outputs.is_some()),
        ("checklist", decl.checklist.is_some()),
        ("performance", decl.performance.is_some()),
        ("errorPolicy", decl.error_policy.is_some()),
        ("metadata", decl.metadata.is_some()),
    ] {
        if !present {
            report.push(path, "required field is missing");
        }
    }
    let version = decl.metadata.as_ref().and_then(|m| {
        let v = m.version.as_deref().map(str::trim).filter(|v| !v.is_empty());
        if v.is_none() {
            report.push("metadata.version", "required field is missing");
        }
        v.map(str::to_string)
    });

    let executor_override = match decl.executor_kind.as_deref().map(str::trim) {
        None | Some("") | Some("inferred") => None,
        Some(raw) => match raw.parse::<ExecutorKind>() {
            Ok(kind) => Some(kind),
            Err(e) => {
                report.push("executorKind", e);
                None
            }
        },
    };

    // Cross-references use declared names so one bad entry does not cascade.
    let input_names = declared_names(decl.inputs.iter().flatten().map(|i| i.name.as_deref()));
    let output_names = declared_names(decl.outputs.iter().flatten().map(|o| o.name.as_deref()));

    // (2) inputs and outputs
    let inputs = validate_inputs(&mut report, decl);
    let outputs = validate_outputs(&mut report, decl);

    // (3) error policy
    let error_policy = validate_error_policy(&mut report, decl, &output_names);

    // (4) performance and cache key
    let performance = validate_performance(&mut report, decl, &input_names);

    let checklist = validate_checklist(&mut report, decl, &input_names, &output_names);

    let routing = RoutingHints {
        deterministic: decl.routing.deterministic,
        capability: non_empty(decl.routing.capability.as_deref()),
        critical_decision: decl.routing.critical_decision,
        methodology: non_empty(decl.routing.methodology.as_deref()),
        skill: non_empty(decl.routing.skill.as_deref()),
    };
    if executor_override == Some(ExecutorKind::Worker) && routing.capability.is_none() {
        report.push(
            "routing.capability",
            "worker executor requires a catalog capability",
        );
    }
    if executor_override == Some(ExecutorKind::Clone) && routing.methodology.is_none() {
        report.push("routing.methodology", "clone executor requires a methodology");
    }

    if !report.is_empty() {
        return Err(report);
    }

    match (id, responsible, version, performance, error_policy) {
        (Some(id), Some(responsible), Some(version), Some(performance), Some(error_policy)) => {
            Ok(Task {
                id: TaskId::from(id),
                description: decl.description.clone().unwrap_or_default(),
                responsible,
                executor_override,
                inputs,
                outputs,
                checklist,
                performance,
                error_policy,
                routing,
                quality: QualityPolicy {
                    blocking: decl.quality.blocking,
                    human_review: decl.quality.human_review,
                },
                version,
                dependencies: decl
                    .metadata
                    .as_ref()
                    .map(|m| m.dependencies.clone())
                    .unwrap_or_default(),
            })
        }
        _ => {
            // every None above has pushed a violation
            report.push("task", "declaration is incomplete");
            Err(report)
        }
    }
}

fn declared_names<'a>(names: impl Iterator<Item = Option<&'a str>>) -> Vec<String> {
    names.flatten().map(|n| n.trim().to_string()).collect()
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn required_str(report: &mut ValidationReport, path: &str, value: Option<&str>) -> Option<String> {
    let value = non_empty(value);
    if value.is_none() {
        report.push(path, "required field is missing");
    }
    value
}

fn parse_type(report: &mut ValidationReport, path: String, raw: Option<&str>) -> Option<ValueType> {
    match raw {
        None => {
            report.push(path, "required field is missing");
            None
        }
        Some(raw) => match raw.parse::<ValueType>() {
            Ok(t) => Some(t),
            Err(e) => {
                report.push(path, e);
                None
            }
        },
    }
}

fn validate_inputs(report: &mut ValidationReport, decl: &TaskDeclaration) -> Vec<InputSpec> {
    let mut specs = Vec::new();
    let mut seen = HashSet::new();
    for (i, input) in decl.inputs.iter().flatten().enumerate() {
        let base = format!("inputs[{}]", i);
        let name = required_str(report, &format!("{}.name", base), input.name.as_deref());
        if let Some(name) = &name {
            if !seen.insert(name.clone()) {
                report.push(format!("{}.name", base), format!("duplicate input '{}'", name));
            }
        }
        let value_type = parse_type(report, format!("{}.type", base), input.value_type.as_deref());
        let source = match (&name, input.source.as_deref()) {
            (_, None) => {
                report.push(format!("{}.source", base), "required field is missing");
                None
            }
            (Some(name), Some(raw)) => match InputSource::parse(raw, name) {
                Ok(source) => Some(source),
                Err(e) => {
                    report.push(format!("{}.source", base), e);
                    None
                }
            },
            (None, Some(_)) => None,
        };
        if input.required.is_none() {
            report.push(format!("{}.required", base), "required field is missing");
        }
        if let (Some(t), Some(default)) = (value_type, &input.default) {
            if !t.accepts(default) {
                report.push(
                    format!("{}.default", base),
                    format!("default is not of type {}", t.as_str()),
                );
            }
        }
        if let (Some(name), Some(value_type), Some(source), Some(required)) =
            (name, value_type, source, input.required)
        {
            specs.push(InputSpec {
                name,
                value_type,
                source,
                required,
                default: input.default.clone(),
            });
        }
    }
    specs
}

fn validate_outputs(report: &mut ValidationReport, decl: &TaskDeclaration) -> Vec<OutputSpec> {
    let mut specs = Vec::new();
    let mut seen = HashSet::new();
    for (i, output) in decl.outputs.iter().flatten().enumerate() {
        let base = format!("outputs[{}]", i);
        let name = required_str(report, &format!("{}.name", base), output.name.as_deref());
        if let Some(name) = &name {
            if !seen.insert(name.clone()) {
                report.push(format!("{}.name", base), format!("duplicate output '{}'", name));
            }
        }
        let value_type = parse_type(report, format!("{}.type", base), output.value_type.as_deref());
        let destination = match output.destination.as_deref() {
            None => {
                report.push(format!("{}.destination", base), "required field is missing");
                None
            }
            Some(raw) => match Destination::parse(raw) {
                Ok(d) => Some(d),
                Err(e) => {
                    report.push(format!("{}.destination", base), e);
                    None
                }
            },
        };
        if output.persisted.is_none() {
            report.push(format!("{}.persisted", base), "required field is missing");
        }
        if let (Some(name), Some(value_type), Some(destination), Some(persisted)) =
            (name, value_type, destination, output.persisted)
        {
            specs.push(OutputSpec {
                name,
                value_type,
                destination,
                persisted,
            });
        }
    }
    specs
}

fn validate_error_policy(
    report: &mut ValidationReport,
    decl: &TaskDeclaration,
    outputs: &[String],
) -> Option<ErrorPolicy> {
    let policy = decl.error_policy.as_ref()?;
    match policy.strategy.as_deref() {
        None => {
            report.push("errorPolicy.strategy", "required field is missing");
            None
        }
        Some("retry") => {
            let retry = policy.retry.clone().unwrap_or_default();
            let max_attempts = retry.max_attempts.unwrap_or(0);
            if max_attempts < 1 {
                report.push("errorPolicy.retry.maxAttempts", "retry requires maxAttempts >= 1");
            }
            let backoff = match retry.backoff.as_deref() {
                None | Some("linear") => Some(Backoff::Linear),
                Some("exponential") => Some(Backoff::Exponential),
                Some(other) => {
                    report.push(
                        "errorPolicy.retry.backoff",
                        format!("unknown backoff '{}' (linear, exponential)", other),
                    );
                    None
                }
            };
            let base_delay_ms = retry.base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS);
            let max_delay_ms = retry
                .max_delay_ms
                .unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS)
                .max(base_delay_ms);
            backoff.map(|backoff| {
                ErrorPolicy::Retry(RetryPolicy {
                    max_attempts,
                    backoff,
                    base_delay_ms,
                    max_delay_ms,
                })
            })
        }
        Some("fallback") => match &policy.fallback {
            None => {
                report.push("errorPolicy.fallback", "fallback strategy requires a fallback value");
                None
            }
            Some(serde_json::Value::Object(map)) => {
                let mut ok = true;
                for key in map.keys() {
                    if !outputs.contains(key) {
                        report.push(
                            "errorPolicy.fallback",
                            format!("fallback names undeclared output '{}'", key),
                        );
                        ok = false;
                    }
                }
                ok.then(|| ErrorPolicy::Fallback {
                    value: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                })
            }
            Some(scalar) if outputs.len() == 1 => {
                let mut value = Values::new();
                value.insert(outputs[0].clone(), scalar.clone());
                Some(ErrorPolicy::Fallback { value })
            }
            Some(_) => {
                report.push(
                    "errorPolicy.fallback",
                    "a scalar fallback needs exactly one declared output; use a table",
                );
                None
            }
        },
        Some("abort") => Some(ErrorPolicy::Abort),
        Some(other) => {
            report.push(
                "errorPolicy.strategy",
                format!("unknown strategy '{}' (retry, fallback, abort)", other),
            );
            None
        }
    }
}

fn validate_performance(
    report: &mut ValidationReport,
    decl: &TaskDeclaration,
    inputs: &[String],
) -> Option<Performance> {
    let perf = decl.performance.as_ref()?;
    if perf.expected_duration_ms.is_none() {
        report.push("performance.expectedDurationMs", "required field is missing");
    }
    if perf.cost.is_none() {
        report.push("performance.cost", "required field is missing");
    }
    if let Some(cost) = perf.cost {
        if cost < 0.0 || !cost.is_finite() {
            report.push("performance.cost", "cost must be a non-negative number");
        }
    }
    if perf.cacheable.is_none() {
        report.push("performance.cacheable", "required field is missing");
    }
    if perf.timeout_ms == Some(0) {
        report.push("performance.timeoutMs", "timeout must be greater than zero");
    }
    let cache_key = non_empty(perf.cache_key.as_deref());
    if perf.cacheable == Some(true) {
        match &cache_key {
            None => report.push(
                "performance.cacheKey",
                "cacheable tasks require a non-empty cacheKey template",
            ),
            Some(template) => {
                for name in placeholders(template) {
                    if name != "task" && !inputs.contains(&name) {
                        report.push(
                            "performance.cacheKey",
                            format!("placeholder '{{{{{}}}}}' names no declared input", name),
                        );
                    }
                }
            }
        }
    }
    Some(Performance {
        expected_duration_ms: perf.expected_duration_ms?,
        estimated_cost: perf.cost?,
        cacheable: perf.cacheable?,
        cache_key,
        parallelizable: perf.parallelizable.unwrap_or(true),
        timeout_ms: perf.timeout_ms,
    })
}

fn validate_checklist(
    report: &mut ValidationReport,
    decl: &TaskDeclaration,
    inputs: &[String],
    outputs: &[String],
) -> Checklist {
    let Some(checklist) = decl.checklist.as_ref() else {
        return Checklist::default();
    };
    let input_names: Vec<&str> = inputs.iter().map(String::as_str).collect();
    let output_names: Vec<&str> = outputs.iter().map(String::as_str).collect();
    Checklist {
        preconditions: check_items(report, "checklist.preconditions", &checklist.preconditions, &input_names),
        postconditions: check_items(report, "checklist.postconditions", &checklist.postconditions, &output_names),
        acceptance: check_items(report, "checklist.acceptance", &checklist.acceptance, &output_names),
    }
}

fn check_items(
    report: &mut ValidationReport,
    base: &str,
    items: &[CheckItemDeclaration],
    targets: &[&str],
) -> Vec<CheckItem> {
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let path = format!("{}[{}]", base, i);
        if item.description.trim().is_empty() {
            report.push(format!("{}.description", path), "required field is missing");
        }
        let rule = match &item.rule {
            None => None,
            Some(rule) => {
                if !targets.contains(&rule.target.as_str()) {
                    report.push(
                        format!("{}.rule", path),
                        format!("rule targets undeclared name '{}'", rule.target),
                    );
                }
                match rule.check.parse::<RuleCheck>() {
                    Ok(check) => {
                        validate_rule_value(report, &path, check, rule.value.as_ref());
                        Some(CheckRule {
                            target: rule.target.clone(),
                            check,
                            value: rule.value.clone(),
                        })
                    }
                    Err(e) => {
                        report.push(format!("{}.rule.check", path), e);
                        None
                    }
                }
            }
        };
        out.push(CheckItem {
            description: item.description.clone(),
            blocking: item.blocking,
            rule,
        });
    }
    out
}

fn validate_rule_value(
    report: &mut ValidationReport,
    path: &str,
    check: RuleCheck,
    value: Option<&serde_json::Value>,
) {
    let problem = match (check, value) {
        (RuleCheck::Type, Some(serde_json::Value::String(t))) => {
            t.parse::<ValueType>().err()
        }
        (RuleCheck::Matches, Some(serde_json::Value::String(p))) => {
            regex::Regex::new(p).err().map(|e| format!("invalid pattern: {}", e))
        }
        (RuleCheck::MaxLength, Some(v)) if v.as_u64().is_some() => None,
        (RuleCheck::Present | RuleCheck::NonEmpty, _) => None,
        (check, _) => Some(format!("rule '{}' needs a valid value", check.as_str())),
    };
    if let Some(problem) = problem {
        report.push(format!("{}.rule.value", path), problem);
    }
}
