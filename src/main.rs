use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use aios::config::Config;
use aios::core::{TaskDeclaration, Values};
use aios::orchestration::{write_jsonl, Engine, EventSink, RunReport};
use aios::state::{ArtifactId, Verdict};
use aios::workflow::{build, validate_standalone, Document, WorkflowDeclaration};
use aios::{alog, alog_debug, alog_error, alog_warn, exit_codes, Error, Result};

/// aios - task orchestration engine
#[derive(Parser, Debug)]
#[command(name = "aios")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    AIOS_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.aios/aios.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Configuration file (default: ~/.aios/aios.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write engine events as JSON lines to this file
    #[arg(long, value_name = "PATH")]
    pub events: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a workflow or a single task
    Run {
        #[command(subcommand)]
        target: RunTarget,
    },

    /// Validate a task or workflow declaration without running it
    Validate {
        /// Declaration file (.toml or .json)
        path: PathBuf,
    },

    /// Quality gate commands
    Gate {
        #[command(subcommand)]
        action: GateAction,
    },

    /// Human review commands
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum RunTarget {
    /// Execute a workflow declaration
    Workflow {
        path: PathBuf,

        /// User input, repeatable; values parse as JSON when they can
        #[arg(long = "input", value_name = "K=V", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,
    },

    /// Execute one task outside any workflow
    Task {
        path: PathBuf,

        /// User input, repeatable; values parse as JSON when they can
        #[arg(long = "input", value_name = "K=V", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum GateAction {
    /// Run one gate layer on a stored artifact
    Run {
        /// Artifact id, `<runId>:<taskId>`
        artifact_id: String,

        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=3))]
        layer: u8,

        /// Answer the pending Layer 3 review first
        #[arg(long, value_enum)]
        verdict: Option<VerdictArg>,

        /// Reviewer comment recorded with the verdict
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ReviewAction {
    /// List review requests still waiting for a verdict
    List,

    /// Answer a review request and continue the run waiting on it
    Respond {
        /// Review id, e.g. `exec:<runId>:<taskId>:<attempt>` or `gate:<artifactId>`
        id: String,

        #[arg(long, value_enum)]
        verdict: VerdictArg,

        /// Reviewer comment recorded with the verdict
        #[arg(long)]
        comment: Option<String>,

        /// Output supplied with an approval, repeatable
        #[arg(long = "output", value_name = "K=V", value_parser = parse_input)]
        outputs: Vec<(String, Value)>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictArg {
    Approve,
    Reject,
}

fn parse_input(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected K=V, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty input name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() {
    let cli = Cli::parse();
    aios::log::init(cli.debug);
    alog!("aios starting: {:?}", cli.command);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            alog_error!("{}", e);
            eprintln!("error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    match cli.command {
        Command::Validate { path } => validate(&path, &config),
        Command::Run { target } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_target(target, config, cli.events))
        }
        Command::Gate {
            action:
                GateAction::Run {
                    artifact_id,
                    layer,
                    verdict,
                    comment,
                },
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_gate(config, &artifact_id, layer, verdict, comment))
        }
        Command::Review { action } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(review(config, action))
        }
    }
}

fn engine(config: Config, events: EventSink) -> Result<Arc<Engine>> {
    let state_dir = config.state_dir()?;
    Ok(Engine::builder(config)
        .events(events)
        .state_dir(state_dir)
        .build())
}

/// Validate a declaration and print the violations, if any.
fn validate(path: &Path, config: &Config) -> Result<i32> {
    let checked = match Document::from_path(path)? {
        Document::Task(decl) => validate_standalone(&decl, config).map(|task| ("task", task.id.to_string())),
        Document::Workflow(decl) => build(&decl, config).map(|wf| ("workflow", wf.id)),
    };
    match checked {
        Ok((kind, id)) => {
            let summary = serde_json::json!({ "valid": true, "kind": kind, "id": id });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(exit_codes::OK)
        }
        Err(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            alog_warn!("{} failed validation: {}", path.display(), report);
            Ok(exit_codes::VALIDATION)
        }
    }
}

async fn run_target(target: RunTarget, config: Config, events: Option<PathBuf>) -> Result<i32> {
    let (sink, writer) = match events {
        Some(path) => {
            let (sink, rx) = EventSink::channel();
            let writer = tokio::spawn(async move { write_jsonl(rx, &path).await });
            (sink, Some(writer))
        }
        None => (EventSink::disabled(), None),
    };

    let report = execute(target, config, sink).await;

    // Every sender is gone once the engine is dropped.
    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(count)) => alog_debug!("wrote {} event(s)", count),
            Ok(Err(e)) => alog_warn!("event stream failed: {}", e),
            Err(e) => alog_warn!("event writer panicked: {}", e),
        }
    }

    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.exit_code)
}

async fn execute(target: RunTarget, config: Config, events: EventSink) -> Result<RunReport> {
    match target {
        RunTarget::Workflow { path, inputs } => {
            let decl = WorkflowDeclaration::from_path(&path)?;
            let workflow = build(&decl, &config).map_err(Error::Validation)?;
            engine(config, events)?
                .run_workflow(Arc::new(workflow), inputs.into_iter().collect())
                .await
        }
        RunTarget::Task { path, inputs } => {
            let decl = TaskDeclaration::from_path(&path)?;
            let task = validate_standalone(&decl, &config).map_err(Error::Validation)?;
            engine(config, events)?
                .run_task(Arc::new(task), inputs.into_iter().collect::<Values>())
                .await
        }
    }
}

async fn run_gate(
    config: Config,
    artifact_id: &str,
    layer: u8,
    verdict: Option<VerdictArg>,
    comment: Option<String>,
) -> Result<i32> {
    let id: ArtifactId = artifact_id.parse()?;
    let verdict = verdict.map(|v| verdict_from(v, comment, Values::new()));
    let engine = engine(config, EventSink::disabled())?;
    let result = engine.run_gate(&id, layer, verdict).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if engine.store().is_some_and(|store| store.has_checkpoint(id.run_id)) {
        alog!("run {} still awaits review", id.run_id.short());
    }
    Ok(if result.blocks() {
        exit_codes::GATE_BLOCKED
    } else {
        exit_codes::OK
    })
}

fn verdict_from(arg: VerdictArg, comment: Option<String>, outputs: Values) -> Verdict {
    match arg {
        VerdictArg::Approve => Verdict {
            comment,
            ..Verdict::approve(outputs)
        },
        VerdictArg::Reject => Verdict::reject(comment.unwrap_or_else(|| "rejected".to_string())),
    }
}

async fn review(config: Config, action: ReviewAction) -> Result<i32> {
    let engine = engine(config, EventSink::disabled())?;
    match action {
        ReviewAction::List => {
            let pending = engine.pending_reviews()?;
            println!("{}", serde_json::to_string_pretty(&pending)?);
            Ok(exit_codes::OK)
        }
        ReviewAction::Respond {
            id,
            verdict,
            comment,
            outputs,
        } => {
            let verdict = verdict_from(verdict, comment, outputs.into_iter().collect());
            match engine.respond_review(&id, verdict.clone()).await? {
                Some(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    Ok(report.exit_code)
                }
                None => {
                    let summary = serde_json::json!({ "review": id, "verdict": verdict });
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    Ok(exit_codes::OK)
                }
            }
        }
    }
}
