//! Pluggable build execution.
//!
//! A [`BuildStrategy`] knows how to turn a prepared working directory into a build
//! outcome for one [`BuildKind`]. The worker pool only bounds, monitors and records
//! what a strategy does; it never inspects how the build runs.
//!
//! # Strategies
//!
//! - [`CompileStrategy`]: embedded firmware build (generated Makefile + `make`)
//! - [`DrcStrategy`]: KiCad design-rule checks and board previews
//!
//! The kind is declared once at submission ([`BuildSpec`] is a tagged enum stored in
//! the job record) and the pool looks up the matching strategy in a [`StrategySet`].

pub mod compile;
pub mod drc;
pub mod report;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::scheduler::job::{FailureKind, JobResult};
use crate::worker::executor::{ExecutionResult, JobExecutor, ProcessGroups, Termination};

pub use compile::CompileStrategy;
pub use drc::DrcStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildKind {
    Compile,
    Drc,
}

impl fmt::Display for BuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildKind::Compile => write!(f, "compile"),
            BuildKind::Drc => write!(f, "drc"),
        }
    }
}

impl FromStr for BuildKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "compile" => Ok(BuildKind::Compile),
            "drc" => Ok(BuildKind::Drc),
            other => Err(format!("unknown build kind '{}'", other)),
        }
    }
}

/// Firmware build parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSpec {
    /// Lab source files expected in the working directory. Missing ones are
    /// filled in from the lab template.
    pub source_files: Vec<String>,
    #[serde(default = "default_output_name")]
    pub output_name: String,
    /// Overrides `<template_root>/<lab_name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
}

fn default_output_name() -> String {
    "firmware".to_string()
}

/// One KiCad design-rule file and its display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl RuleSet {
    pub fn new(file: impl Into<String>, label: Option<String>) -> Self {
        Self {
            file: file.into(),
            label,
        }
    }

    pub fn label(&self) -> &str {
        match &self.label {
            Some(label) => label,
            None => file_stem(&self.file),
        }
    }

    /// Filesystem-safe name used for this rule set's report files.
    pub fn slug(&self) -> String {
        file_stem(&self.file).replace('-', "_")
    }
}

fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

/// Design-rule-check parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrcSpec {
    /// Board file to check; defaults to the first `*.kicad_pcb` in the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcb_file: Option<String>,
    /// Rule sets to run; empty means every `*.kicad_dru` in the working directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_sets: Vec<RuleSet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BuildSpec {
    Compile(CompileSpec),
    Drc(DrcSpec),
}

impl BuildSpec {
    pub fn kind(&self) -> BuildKind {
        match self {
            BuildSpec::Compile(_) => BuildKind::Compile,
            BuildSpec::Drc(_) => BuildKind::Drc,
        }
    }
}

/// Serialized into the job record's `build_params` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Prepared directory exclusively owned by the job; deleted once the job ends.
    pub work_dir: PathBuf,
    /// Where build outputs are copied before `work_dir` is deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_dir: Option<PathBuf>,
    pub spec: BuildSpec,
}

/// Everything a strategy gets for one build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub job_id: Uuid,
    pub lab_name: String,
    pub work_dir: PathBuf,
    pub spec: BuildSpec,
    /// Wall-clock budget for the build subprocess.
    pub max_runtime: Duration,
    /// Groups spawned for this build; the worker kills them if it abandons the task.
    pub processes: ProcessGroups,
}

impl BuildContext {
    /// Executor bounded by this build's budget and tracked in [`Self::processes`].
    pub fn executor(&self) -> JobExecutor {
        JobExecutor::new(self.max_runtime).with_process_groups(self.processes.clone())
    }
}

/// What a strategy reports back. Converted into the stored [`JobResult`].
#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub failure: Option<(FailureKind, String)>,
    /// Output files, relative to the working directory, worth publishing.
    pub artifacts: Vec<PathBuf>,
}

impl BuildOutcome {
    pub fn from_execution(exec: ExecutionResult) -> Self {
        let failure = match &exec.termination {
            Termination::Exited(Some(0)) => None,
            Termination::Exited(Some(code)) => Some((
                FailureKind::BuildFailed,
                format!("Build failed with exit code {}", code),
            )),
            Termination::Exited(None) => Some((
                FailureKind::BuildFailed,
                "Build tool was terminated by a signal".to_string(),
            )),
            Termination::TimedOut(limit) => Some((
                FailureKind::Timeout,
                format!("Build timed out (>{} seconds)", limit.as_secs()),
            )),
            Termination::SpawnFailed(reason) => Some((
                FailureKind::Spawn,
                format!("Failed to start build tool: {}", reason),
            )),
            Termination::WaitFailed(reason) => Some((
                FailureKind::Internal,
                format!("Lost track of build process: {}", reason),
            )),
        };

        Self {
            success: failure.is_none(),
            stdout: exec.stdout,
            stderr: exec.stderr,
            exit_code: exec.exit_code,
            failure,
            artifacts: Vec::new(),
        }
    }

    pub fn into_job_result(self, published: Vec<String>) -> JobResult {
        let (error_kind, error) = match self.failure {
            Some((kind, message)) => (Some(kind), Some(message)),
            None => (None, None),
        };
        JobResult {
            success: self.success,
            stdout: self.stdout,
            stderr: self.stderr,
            error,
            error_kind,
            exit_code: self.exit_code,
            artifacts: published,
        }
    }
}

/// Failure to prepare a build. Recorded as a `precondition` failure, never retried.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Required file missing: {0}")]
    MissingArtifact(String),

    #[error("Invalid build parameters: {0}")]
    InvalidSpec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of probing a strategy's external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainCheck {
    pub ok: bool,
    pub message: String,
}

impl ToolchainCheck {
    pub fn passed(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait BuildStrategy: Send + Sync {
    fn kind(&self) -> BuildKind;

    /// Checked once before a pool starts serving jobs.
    async fn verify_toolchain(&self) -> ToolchainCheck;

    /// Run one build. The strategy must bound its subprocess by `ctx.max_runtime`.
    async fn build(&self, ctx: &BuildContext) -> std::result::Result<BuildOutcome, StrategyError>;
}

/// The strategies one worker pool can execute, keyed by kind.
#[derive(Clone, Default)]
pub struct StrategySet {
    strategies: HashMap<BuildKind, Arc<dyn BuildStrategy>>,
}

impl StrategySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: Arc<dyn BuildStrategy>) -> Self {
        self.strategies.insert(strategy.kind(), strategy);
        self
    }

    pub fn get(&self, kind: BuildKind) -> Option<Arc<dyn BuildStrategy>> {
        self.strategies.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<BuildKind> {
        let mut kinds: Vec<BuildKind> = self.strategies.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Check every registered toolchain; any failure is fatal to starting a pool.
    pub async fn verify(&self) -> Result<()> {
        if self.strategies.is_empty() {
            return Err(QueueError::ToolchainUnavailable(
                "no build strategies configured".to_string(),
            ));
        }

        let mut problems = Vec::new();
        for kind in self.kinds() {
            let Some(strategy) = self.get(kind) else {
                continue;
            };
            let check = strategy.verify_toolchain().await;
            if check.ok {
                tracing::info!(kind = %kind, message = %check.message, "Toolchain verified");
            } else {
                tracing::error!(kind = %kind, message = %check.message, "Toolchain check failed");
                problems.push(format!("{}: {}", kind, check.message));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(QueueError::ToolchainUnavailable(problems.join("; ")))
        }
    }
}

/// Resolve a program the way a shell would: paths are checked directly, bare names
/// are searched on `PATH`.
pub(crate) fn find_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Student-supplied names must be plain file names built from `[A-Za-z0-9._-]`: they
/// stay inside the working directory and are written into Makefiles and shell recipes
/// unquoted.
pub(crate) fn validate_file_name(name: &str) -> std::result::Result<(), StrategyError> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !plain {
        return Err(StrategyError::InvalidSpec(format!(
            "'{}' is not a plain file name (letters, digits, '.', '_' and '-' only)",
            name
        )));
    }
    Ok(())
}

/// Rule-set labels end up inside double-quoted recipe arguments, so nothing the shell
/// or make would expand is allowed.
pub(crate) fn validate_label(label: &str) -> std::result::Result<(), StrategyError> {
    let safe = !label.trim().is_empty()
        && label.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, ' ' | '.' | '_' | '-' | ',' | '+' | '(' | ')' | '/' | ':')
        });
    if !safe {
        return Err(StrategyError::InvalidSpec(format!(
            "rule set label {:?} may only use letters, digits, spaces and . _ - , + ( ) / :",
            label
        )));
    }
    Ok(())
}

/// Keep only the outputs that were actually produced.
pub(crate) fn existing_outputs(work_dir: &Path, names: &[String]) -> Vec<PathBuf> {
    names
        .iter()
        .filter(|name| work_dir.join(name).is_file())
        .map(PathBuf::from)
        .collect()
}
