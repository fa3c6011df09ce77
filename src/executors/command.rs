//! External command stage executor
//!
//! Runs a configured program for one item. The item's fields are passed as
//! `YARD_*` environment variables, and the exit status is mapped onto the
//! failure taxonomy:
//!
//! | exit code | outcome |
//! |-----------|---------|
//! | 0 | success; last non-empty stdout line is the artifact locator |
//! | 2 | `invalid-input` |
//! | 3 | `quota-exhausted` |
//! | other | `transient-io` |
//!
//! Stdout lines of the form `@key=value` become artifact metadata. The keys
//! `scheduled_at` and `published_at` (RFC 3339) also set the record timestamps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::{StageExecutor, StageFailure, StageOutput};
use crate::pipeline::{ItemRecord, Step};

pub const EXIT_INVALID_INPUT: i32 = 2;
pub const EXIT_QUOTA_EXHAUSTED: i32 = 3;

/// Program and arguments for one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

#[derive(Debug, Error, Clone)]
pub enum CommandError {
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },
    #[error("IO error: {message}")]
    Io { message: String },
}

/// Spawns processes; a seam so tests can script command results
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        env: &[(String, String)],
    ) -> Result<CommandOutput, CommandError>;
}

/// Real implementation using tokio::process. The child is killed if the
/// call is abandoned.
pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        env: &[(String, String)],
    ) -> Result<CommandOutput, CommandError> {
        let output = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CommandError::CommandNotFound {
                        command: spec.program.clone(),
                    }
                } else {
                    CommandError::Io {
                        message: e.to_string(),
                    }
                }
            })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub struct CommandStageExecutor {
    spec: CommandSpec,
    runner: Arc<dyn CommandRunner>,
}

impl CommandStageExecutor {
    pub fn new(spec: CommandSpec) -> Self {
        Self::with_runner(spec, Arc::new(ProcessCommandRunner))
    }

    pub fn with_runner(spec: CommandSpec, runner: Arc<dyn CommandRunner>) -> Self {
        Self { spec, runner }
    }
}

/// Environment handed to the external program
pub fn item_environment(step: Step, record: &ItemRecord) -> Vec<(String, String)> {
    let mut env = vec![
        ("YARD_STEP".to_string(), step.to_string()),
        ("YARD_ITEM_ID".to_string(), record.id.to_string()),
        ("YARD_ITEM_TITLE".to_string(), record.title.clone()),
        ("YARD_ITEM_DATE".to_string(), record.catalog_date.to_rfc3339()),
        ("YARD_ITEM_SEQUENCE".to_string(), record.sequence.to_string()),
        ("YARD_ATTEMPT".to_string(), (record.attempts(step) + 1).to_string()),
    ];
    if let Some(url) = &record.source_url {
        env.push(("YARD_SOURCE_URL".to_string(), url.clone()));
    }
    if let Some(at) = record.scheduled_at {
        env.push(("YARD_SCHEDULED_AT".to_string(), at.to_rfc3339()));
    }
    for (artifact_step, artifact) in &record.artifacts {
        env.push((
            format!("YARD_ARTIFACT_{}", artifact_step.as_str().to_ascii_uppercase()),
            artifact.locator.clone(),
        ));
    }
    env
}

/// Map a finished process onto the stage outcome
pub fn interpret_output(step: Step, output: &CommandOutput) -> Result<StageOutput, StageFailure> {
    if !output.success() {
        let detail = last_line(&output.stderr)
            .or_else(|| last_line(&output.stdout))
            .unwrap_or("no output");
        let message = format!("{} exited with status {}: {}", step, output.status_code, detail);
        return Err(match output.status_code {
            EXIT_INVALID_INPUT => StageFailure::invalid_input(message),
            EXIT_QUOTA_EXHAUSTED => StageFailure::quota_exhausted(message),
            _ => StageFailure::transient(message),
        });
    }

    let mut metadata = BTreeMap::new();
    let mut locator = None;
    for line in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some((key, value)) = line.strip_prefix('@').and_then(|kv| kv.split_once('=')) {
            metadata.insert(key.trim().to_string(), value.trim().to_string());
        } else {
            locator = Some(line.to_string());
        }
    }

    let locator = locator.ok_or_else(|| {
        StageFailure::transient(format!("{} succeeded but printed no artifact locator", step))
    })?;

    let mut stage_output = StageOutput::new(locator);
    stage_output.scheduled_at = parse_timestamp(&metadata, "scheduled_at")?;
    stage_output.published_at = parse_timestamp(&metadata, "published_at")?;
    stage_output.metadata = metadata;
    Ok(stage_output)
}

fn parse_timestamp(
    metadata: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<DateTime<Utc>>, StageFailure> {
    metadata
        .get(key)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StageFailure::invalid_input(format!("bad {key} '{raw}': {e}")))
        })
        .transpose()
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[async_trait]
impl StageExecutor for CommandStageExecutor {
    async fn execute(&self, step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        let env = item_environment(step, record);
        debug!(item_id = %record.id, step = %step, program = %self.spec.program, "Running stage command");

        let output = self.runner.run(&self.spec, &env).await.map_err(|e| match e {
            CommandError::CommandNotFound { .. } => StageFailure::invalid_input(e.to_string()),
            CommandError::Io { .. } => StageFailure::transient(e.to_string()),
        })?;

        interpret_output(step, &output)
    }
}
