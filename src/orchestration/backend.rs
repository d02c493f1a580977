//! Reasoning backends behind the Agent and Clone executors.
//!
//! `CommandBackend` runs an external agent CLI in headless mode (`-p`
//! flag) with JSON output and parses its response.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::config::Config;
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::util::with_timeout;
use crate::{alog_debug, alog_warn};

/// One prompt sent to a reasoning backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningRequest {
    pub task_id: TaskId,
    pub prompt: String,
    /// Rule-set a Clone executor must follow.
    pub methodology: Option<String>,
    pub timeout: Duration,
}

impl ReasoningRequest {
    /// Prompt with the methodology, when present, stated first.
    pub fn full_prompt(&self) -> String {
        match &self.methodology {
            Some(m) => format!(
                "Follow the methodology \"{}\" strictly. Do not deviate from its rules.\n\n{}",
                m, self.prompt
            ),
            None => self.prompt.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningResponse {
    pub text: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

/// An opaque, possibly slow and non-deterministic text backend.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn complete(&self, request: &ReasoningRequest) -> Result<ReasoningResponse>;
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs the configured agent command once per request.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    /// `command` is split on whitespace into a program and leading args.
    pub fn new(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "claude".to_string());
        Self {
            program,
            args: parts.collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.effective_agent_command())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn binary(&self) -> Result<PathBuf> {
        which::which(&self.program)
            .map_err(|_| Error::Backend(format!("agent command '{}' not found", self.program)))
    }

    /// Parse the JSON document printed by the agent command.
    pub fn parse_response(json_str: &str) -> Result<ReasoningResponse> {
        let raw: RawResponse = serde_json::from_str(json_str.trim())?;
        let failed = raw.is_error || raw.subtype.as_deref() == Some("error");
        if failed {
            let message = raw
                .error
                .or(raw.result)
                .unwrap_or_else(|| "agent reported an error".to_string());
            return Err(Error::Backend(message));
        }
        let text = raw
            .result
            .ok_or_else(|| Error::Backend("response has no result".to_string()))?;
        Ok(ReasoningResponse {
            text,
            cost_usd: raw.total_cost_usd.unwrap_or(0.0),
            duration_ms: raw.duration_ms.unwrap_or(0),
        })
    }
}

#[async_trait]
impl ReasoningBackend for CommandBackend {
    async fn complete(&self, request: &ReasoningRequest) -> Result<ReasoningResponse> {
        let binary = self.binary()?;
        alog_debug!(
            "CommandBackend: task={} program={} timeout={:?}",
            request.task_id,
            self.program,
            request.timeout
        );
        let started = Instant::now();
        let mut command = Command::new(&binary);
        command
            .args(&self.args)
            .arg("-p")
            .arg(request.full_prompt())
            .arg("--output-format")
            .arg("json")
            .kill_on_drop(true);
        let output = with_timeout(request.timeout, async { command.output().await.map_err(Error::Io) }).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match Self::parse_response(&stdout) {
            Ok(mut response) => {
                if response.duration_ms == 0 {
                    response.duration_ms = started.elapsed().as_millis() as u64;
                }
                Ok(response)
            }
            Err(e) if output.status.success() => {
                alog_warn!("CommandBackend: unparseable output for {}: {}", request.task_id, e);
                Ok(ReasoningResponse {
                    text: stdout.trim().to_string(),
                    cost_usd: 0.0,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(_) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = if stderr.trim().is_empty() {
                    format!(
                        "agent command failed with exit code {}",
                        output.status.code().unwrap_or(-1)
                    )
                } else {
                    stderr.trim().to_string()
                };
                Err(Error::Backend(message))
            }
        }
    }
}
