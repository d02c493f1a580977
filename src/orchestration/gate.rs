//! Quality gate manager.
//!
//! Three layers run in sequence over an [`Artifact`]:
//!
//! 1. local checks on declared outputs and checklist rules
//! 2. automated reviewers, run concurrently (pattern and completeness
//!    heuristics, optionally the reasoning backend)
//! 3. human review through the [`ReviewQueue`], the only layer that may stay
//!    pending
//!
//! A layer runs only if the previous one passed or was advisory. Layer 2
//! issues are deduplicated per run: a finding already seen for the same
//! task increments an occurrence counter instead of counting again.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::core::task::{CheckItem, CheckRule, RuleCheck, TaskId, ValueType, Values};
use crate::error::Error;
use crate::orchestration::backend::{ReasoningBackend, ReasoningRequest};
use crate::orchestration::events::{EngineEvent, EventSink};
use crate::orchestration::human::ReviewQueue;
use crate::state::store::{Artifact, ArtifactId, ReviewKind, ReviewRequest, Verdict};
use crate::util::value_text;
use crate::workflow::types::WorkflowRunId;
use crate::{alog, alog_debug, alog_warn};

pub const LAYER_LOCAL: u8 = 1;
pub const LAYER_AUTOMATED: u8 = 2;
pub const LAYER_HUMAN: u8 = 3;

/// Id of the Layer 3 review of `artifact`.
pub fn gate_review_id(artifact: &ArtifactId) -> String {
    format!("gate:{}", artifact)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateIssue {
    pub check: String,
    pub message: String,
    pub blocking: bool,
    /// Times this issue has been reported for the task in this run.
    pub occurrences: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateResult {
    pub layer: u8,
    pub passed: bool,
    pub issues_found: usize,
    /// A failure of this layer stops progression.
    pub blocking: bool,
    /// Layer 3 only: no verdict yet.
    #[serde(default)]
    pub pending: bool,
    pub issues: Vec<GateIssue>,
}

impl QualityGateResult {
    fn from_issues(layer: u8, issues: Vec<GateIssue>) -> Self {
        Self {
            layer,
            passed: issues.is_empty(),
            issues_found: issues.len(),
            blocking: issues.iter().any(|i| i.blocking),
            pending: false,
            issues,
        }
    }

    /// Layer 3 result for a delivered verdict.
    pub fn from_verdict(verdict: &Verdict) -> Self {
        if verdict.approved {
            return Self::from_issues(LAYER_HUMAN, Vec::new());
        }
        let message = verdict.comment.clone().unwrap_or_else(|| "rejected".to_string());
        Self::from_issues(LAYER_HUMAN, vec![issue("human_review", message, true)])
    }

    /// Stops the run: failed, and not advisory.
    pub fn blocks(&self) -> bool {
        !self.passed && !self.pending && self.blocking
    }

    /// Passed, or failed with advisory issues only.
    pub fn acceptable(&self) -> bool {
        self.passed || (!self.pending && !self.blocking)
    }
}

/// All layers evaluated for one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub artifact_id: String,
    pub layers: Vec<QualityGateResult>,
    pub passed: bool,
    pub pending: bool,
}

impl GateReport {
    fn aggregate(artifact_id: String, layers: Vec<QualityGateResult>, human_required: bool) -> Self {
        let layer = |n: u8| layers.iter().find(|l| l.layer == n);
        let local = layer(LAYER_LOCAL).is_some_and(QualityGateResult::acceptable);
        let automated = layer(LAYER_AUTOMATED).map_or(true, QualityGateResult::acceptable);
        let human = layer(LAYER_HUMAN);
        let pending = human.is_some_and(|l| l.pending);
        let human_ok = !human_required || human.is_some_and(|l| l.passed);
        Self {
            artifact_id,
            passed: local && automated && human_ok,
            pending,
            layers,
        }
    }

    /// Replace a pending Layer 3 result with the verdict's.
    pub fn with_human(mut self, result: QualityGateResult) -> Self {
        self.layers.retain(|l| l.layer != LAYER_HUMAN);
        self.layers.push(result);
        Self::aggregate(self.artifact_id, self.layers, true)
    }

    pub fn issues_found(&self) -> usize {
        self.layers.iter().map(|l| l.issues_found).sum()
    }

    /// The error for the first layer that blocked, if any.
    pub fn blocking_failure(&self) -> Option<Error> {
        let layer = self.layers.iter().find(|l| l.blocks())?;
        let check = layer
            .issues
            .iter()
            .find(|i| i.blocking)
            .or_else(|| layer.issues.first())
            .map(|i| format!("{}: {}", i.check, i.message))
            .unwrap_or_else(|| "failed".to_string());
        Some(Error::GateBlockingFailure {
            artifact_id: self.artifact_id.clone(),
            layer: layer.layer,
            check,
        })
    }
}

/// A Layer 2 finding before deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub check: String,
    pub message: String,
}

impl Finding {
    pub fn new(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            message: message.into(),
        }
    }
}

/// An automated Layer 2 check.
#[async_trait]
pub trait Reviewer: Send + Sync {
    fn name(&self) -> &str;

    async fn review(&self, artifact: &Artifact) -> Vec<Finding>;
}

/// Flags declared outputs that came back empty.
pub struct CompletenessReviewer;

#[async_trait]
impl Reviewer for CompletenessReviewer {
    fn name(&self) -> &str {
        "completeness"
    }

    async fn review(&self, artifact: &Artifact) -> Vec<Finding> {
        artifact
            .task
            .outputs
            .iter()
            .filter(|o| artifact.outputs.get(&o.name).map_or(true, is_empty))
            .map(|o| Finding::new(self.name(), format!("output '{}' is empty", o.name)))
            .collect()
    }
}

static PLACEHOLDER_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(TODO|FIXME|TBD|XXX)\b|lorem ipsum|\{\{[^}]*\}\}").unwrap()
});

/// Flags leftover placeholder text in string outputs.
pub struct PatternReviewer;

#[async_trait]
impl Reviewer for PatternReviewer {
    fn name(&self) -> &str {
        "pattern"
    }

    async fn review(&self, artifact: &Artifact) -> Vec<Finding> {
        let mut findings = Vec::new();
        for (name, value) in &artifact.outputs {
            let mut texts = Vec::new();
            collect_strings(value, &mut texts);
            for text in texts {
                if let Some(m) = PLACEHOLDER_TEXT.find(text) {
                    findings.push(Finding::new(
                        self.name(),
                        format!("output '{}' contains placeholder '{}'", name, m.as_str()),
                    ));
                }
            }
        }
        findings
    }
}

fn collect_strings<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(s) => out.push(s),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Asks the reasoning backend to critique the outputs.
///
/// The backend must answer with `{"issues": ["..."]}`; anything else is
/// treated as no findings.
pub struct AgentReviewer {
    backend: Arc<dyn ReasoningBackend>,
    timeout: std::time::Duration,
}

impl AgentReviewer {
    pub fn new(backend: Arc<dyn ReasoningBackend>, config: &Config) -> Self {
        Self {
            backend,
            timeout: config.global_timeout(),
        }
    }
}

#[async_trait]
impl Reviewer for AgentReviewer {
    fn name(&self) -> &str {
        "agent"
    }

    async fn review(&self, artifact: &Artifact) -> Vec<Finding> {
        let outputs = serde_json::to_string_pretty(&artifact.outputs).unwrap_or_default();
        let request = ReasoningRequest {
            task_id: artifact.task.id.clone(),
            prompt: format!(
                "Review the output of task \"{}\" ({}).\n\nOutput:\n{}\n\n\
                 Reply with JSON {{\"issues\": [\"...\"]}}, empty when acceptable.",
                artifact.task.id, artifact.task.description, outputs
            ),
            methodology: None,
            timeout: self.timeout,
        };
        let response = match self.backend.complete(&request).await {
            Ok(r) => r,
            Err(e) => {
                alog_warn!("agent review of {} failed: {}", artifact.id, e);
                return Vec::new();
            }
        };
        crate::orchestration::adapters::extract_json(&response.text)
            .and_then(|v| v.get("issues").and_then(|i| i.as_array()).cloned())
            .unwrap_or_default()
            .iter()
            .map(|issue| Finding::new(self.name(), value_text(issue)))
            .collect()
    }
}

fn is_empty(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Evaluate a checklist rule against `values`.
pub fn check_rule(rule: &CheckRule, values: &Values) -> std::result::Result<(), String> {
    let value = values.get(&rule.target);
    match rule.check {
        RuleCheck::Present => match value {
            Some(v) if !v.is_null() => Ok(()),
            _ => Err(format!("'{}' is missing", rule.target)),
        },
        RuleCheck::NonEmpty => match value {
            Some(v) if !is_empty(v) => Ok(()),
            _ => Err(format!("'{}' is empty", rule.target)),
        },
        RuleCheck::Type => {
            let expected: ValueType = rule
                .value
                .as_ref()
                .map(value_text)
                .unwrap_or_default()
                .parse()?;
            match value {
                Some(v) if expected.accepts(v) => Ok(()),
                _ => Err(format!("'{}' is not of type {}", rule.target, expected.as_str())),
            }
        }
        RuleCheck::Matches => {
            let pattern = rule.value.as_ref().map(value_text).unwrap_or_default();
            let re = Regex::new(&pattern).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
            match value {
                Some(v) if re.is_match(&value_text(v)) => Ok(()),
                _ => Err(format!("'{}' does not match /{}/", rule.target, pattern)),
            }
        }
        RuleCheck::MaxLength => {
            let max = rule.value.as_ref().and_then(|v| v.as_u64()).unwrap_or(u64::MAX) as usize;
            let len = match value {
                Some(serde_json::Value::String(s)) => s.chars().count(),
                Some(serde_json::Value::Array(a)) => a.len(),
                Some(other) => value_text(other).chars().count(),
                None => 0,
            };
            if len <= max {
                Ok(())
            } else {
                Err(format!("'{}' has length {} > {}", rule.target, len, max))
            }
        }
    }
}

/// Failing checklist items among `items`, as (item, reason).
pub fn failed_items<'a>(items: &'a [CheckItem], values: &Values) -> Vec<(&'a CheckItem, String)> {
    items
        .iter()
        .filter_map(|item| {
            let rule = item.rule.as_ref()?;
            check_rule(rule, values).err().map(|reason| (item, reason))
        })
        .collect()
}

type Fingerprint = (WorkflowRunId, TaskId, String, String);

pub struct QualityGateManager {
    config: Arc<Config>,
    reviewers: Vec<Arc<dyn Reviewer>>,
    reviews: ReviewQueue,
    ledger: Mutex<HashMap<Fingerprint, u32>>,
    events: EventSink,
}

impl QualityGateManager {
    /// Manager with the built-in pattern and completeness reviewers.
    pub fn new(config: Arc<Config>, reviews: ReviewQueue, events: EventSink) -> Self {
        Self {
            config,
            reviewers: vec![Arc::new(CompletenessReviewer), Arc::new(PatternReviewer)],
            reviews,
            ledger: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewers.push(reviewer);
        self
    }

    pub fn reviews(&self) -> &ReviewQueue {
        &self.reviews
    }

    /// Run the layers in order, stopping at the first one that blocks.
    pub async fn evaluate(&self, artifact: &Artifact) -> GateReport {
        let human_required = artifact.task.quality.human_review;
        let mut layers = Vec::new();
        for layer in [LAYER_LOCAL, LAYER_AUTOMATED, LAYER_HUMAN] {
            if layer == LAYER_HUMAN && !human_required {
                break;
            }
            let result = self.run_layer(artifact, layer).await;
            let stop = result.blocks();
            layers.push(result);
            if stop {
                break;
            }
        }
        let report = GateReport::aggregate(artifact.id.to_string(), layers, human_required);
        alog!(
            "gates for {}: passed={} pending={} issues={}",
            report.artifact_id,
            report.passed,
            report.pending,
            report.issues_found()
        );
        report
    }

    /// Run a single layer, as `gate run <artifactId> --layer N` does.
    pub async fn run_layer(&self, artifact: &Artifact, layer: u8) -> QualityGateResult {
        let result = match layer {
            LAYER_LOCAL => self.local(artifact),
            LAYER_AUTOMATED => self.automated(artifact).await,
            _ => self.human(artifact).await,
        };
        self.events.emit(EngineEvent::GateEvaluated {
            run_id: artifact.id.run_id,
            artifact_id: artifact.id.to_string(),
            layer: result.layer,
            passed: result.passed,
            pending: result.pending,
            issues_found: result.issues_found,
        });
        result
    }

    fn local(&self, artifact: &Artifact) -> QualityGateResult {
        let task = &artifact.task;
        let mut issues = Vec::new();
        for output in &task.outputs {
            match artifact.outputs.get(&output.name) {
                None => issues.push(issue("present", format!("output '{}' missing", output.name), true)),
                Some(v) if !output.value_type.accepts(v) => issues.push(issue(
                    "type",
                    format!("output '{}' is not {}", output.name, output.value_type.as_str()),
                    true,
                )),
                Some(_) => {}
            }
        }
        let checklist = task.checklist.postconditions.iter().chain(&task.checklist.acceptance);
        let items: Vec<CheckItem> = checklist.cloned().collect();
        for (item, reason) in failed_items(&items, &artifact.outputs) {
            let check = item.rule.as_ref().map_or("rule", |r| r.check.as_str());
            issues.push(issue(check, format!("{}: {}", item.description, reason), item.blocking));
        }
        if !issues.is_empty() {
            alog_warn!("layer 1 on {}: {} issue(s)", artifact.id, issues.len());
        }
        QualityGateResult::from_issues(LAYER_LOCAL, issues)
    }

    async fn automated(&self, artifact: &Artifact) -> QualityGateResult {
        let blocking = artifact.task.quality.blocking || self.config.quality_gate_strict_mode;
        let reviews = join_all(self.reviewers.iter().map(|r| r.review(artifact))).await;
        let mut findings: BTreeMap<(String, String), ()> = BTreeMap::new();
        for finding in reviews.into_iter().flatten() {
            findings.insert((finding.check, finding.message), ());
        }

        let mut ledger = self.ledger.lock().await;
        let issues = findings
            .into_keys()
            .map(|(check, message)| {
                let key = (
                    artifact.id.run_id,
                    artifact.task.id.clone(),
                    check.clone(),
                    message.clone(),
                );
                let seen = ledger.entry(key).or_insert(0);
                *seen += 1;
                GateIssue {
                    check,
                    message,
                    blocking,
                    occurrences: *seen,
                }
            })
            .collect::<Vec<_>>();
        alog_debug!(
            "layer 2 on {}: {} issue(s), blocking={}",
            artifact.id,
            issues.len(),
            blocking
        );
        QualityGateResult::from_issues(LAYER_AUTOMATED, issues)
    }

    async fn human(&self, artifact: &Artifact) -> QualityGateResult {
        let request = ReviewRequest {
            id: gate_review_id(&artifact.id),
            kind: ReviewKind::Gate,
            run_id: Some(artifact.id.run_id),
            task_id: artifact.task.id.clone(),
            artifact_id: Some(artifact.id.to_string()),
            summary: format!("review output of '{}'", artifact.task.description),
            payload: artifact.outputs.clone(),
            created_at: Utc::now(),
        };
        let pending = QualityGateResult {
            layer: LAYER_HUMAN,
            passed: false,
            issues_found: 0,
            blocking: true,
            pending: true,
            issues: Vec::new(),
        };
        let rx = match self.reviews.submit(request).await {
            Ok(rx) => rx,
            Err(e) => {
                alog_warn!("layer 3 on {}: could not enqueue review: {}", artifact.id, e);
                return pending;
            }
        };
        match tokio::time::timeout(self.config.human_review_wait(), rx).await {
            Ok(Ok(verdict)) => QualityGateResult::from_verdict(&verdict),
            _ => {
                alog!("layer 3 on {} pending", artifact.id);
                pending
            }
        }
    }
}

fn issue(check: &str, message: String, blocking: bool) -> GateIssue {
    GateIssue {
        check: check.to_string(),
        message,
        blocking,
        occurrences: 1,
    }
}

impl std::fmt::Debug for QualityGateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityGateManager")
            .field("reviewers", &self.reviewers.iter().map(|r| r.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}
