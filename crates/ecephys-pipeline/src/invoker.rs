//! Stage execution.
//!
//! [`run_stage`] owns the contract every stage goes through: write the input
//! document, launch, wait, and turn a non-zero exit or a missing output
//! document into a fatal error. Launching itself sits behind the
//! [`StageInvoker`] trait so tests can substitute the external tools.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::error::{PipelineError, Result};
use crate::spec::SessionKey;
use crate::stage::StageConfig;

/// Run/probe context attached to every invocation for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    pub session: SessionKey,
    pub probe: Option<String>,
}

impl StageContext {
    pub fn run(session: SessionKey) -> Self {
        Self {
            session,
            probe: None,
        }
    }

    pub fn probe(session: SessionKey, probe: impl Into<String>) -> Self {
        Self {
            session,
            probe: Some(probe.into()),
        }
    }
}

/// Everything needed to invoke one stage once.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub config: StageConfig,
    pub input_json: PathBuf,
    pub output_json: PathBuf,
    pub context: StageContext,
}

impl StageRequest {
    pub fn stage(&self) -> &str {
        &self.config.stage
    }
}

/// Result of a completed stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage_name: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub input_json: PathBuf,
    pub output_json: PathBuf,
    /// SHA-256 of the input document that was handed to the stage.
    pub input_digest: String,
}

/// Launches a stage process and waits for it to exit.
#[async_trait]
pub trait StageInvoker: Send + Sync {
    /// Run the stage to completion and return its exit code. The input
    /// document is already on disk when this is called.
    async fn launch(&self, request: &StageRequest) -> std::io::Result<i32>;
}

/// Runs stages as `<interpreter...> <namespace>.<stage> --input_json <in> --output_json <out>`.
#[derive(Debug, Clone)]
pub struct ProcessStageInvoker {
    /// Leading argv, e.g. `["python", "-W", "ignore", "-m"]`.
    pub interpreter: Vec<String>,

    /// Module namespace prefix, e.g. `ecephys_spike_sorting.modules`. Empty
    /// means the bare stage name is passed.
    pub namespace: String,

    /// Working directory of the child. CatGT writes its log here.
    pub working_dir: Option<PathBuf>,
}

impl ProcessStageInvoker {
    pub fn new(interpreter: Vec<String>, namespace: impl Into<String>) -> Self {
        Self {
            interpreter,
            namespace: namespace.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Full argv for a request.
    pub fn command_line(&self, request: &StageRequest) -> Vec<String> {
        let module = if self.namespace.is_empty() {
            request.stage().to_string()
        } else {
            format!("{}.{}", self.namespace, request.stage())
        };

        let mut argv = self.interpreter.clone();
        argv.push(module);
        argv.push("--input_json".to_string());
        argv.push(request.input_json.to_string_lossy().into_owned());
        argv.push("--output_json".to_string());
        argv.push(request.output_json.to_string_lossy().into_owned());
        argv
    }
}

#[async_trait]
impl StageInvoker for ProcessStageInvoker {
    async fn launch(&self, request: &StageRequest) -> std::io::Result<i32> {
        let argv = self.command_line(request);
        let (exe, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty interpreter command")
        })?;

        let mut command = Command::new(exe);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        // No timeout: sorting a long recording can take hours.
        let status = command.spawn()?.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Invoke one stage and enforce the stage contract.
pub async fn run_stage(invoker: &dyn StageInvoker, request: &StageRequest) -> Result<StageResult> {
    let start = Instant::now();
    let stage = request.stage().to_string();
    let probe = request.context.probe.as_deref().unwrap_or("-");

    request.config.write_document(&request.input_json)?;
    let input_digest = request.config.digest()?;

    // Only a document written by this launch counts as output.
    match std::fs::remove_file(&request.output_json) {
        Ok(()) => debug!(path = %request.output_json.display(), "Removed stale output document"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    info!(
        event = "stage.invoked",
        stage = %stage,
        session = %request.context.session,
        probe = %probe,
        input_json = %request.input_json.display(),
        output_json = %request.output_json.display(),
        input_digest = %&input_digest[..12],
    );

    let exit_code = invoker
        .launch(request)
        .await
        .map_err(|source| PipelineError::StageSpawn {
            stage: stage.clone(),
            session: request.context.session.to_string(),
            probe: request.context.probe.clone(),
            source,
        })?;

    if exit_code != 0 {
        error!(event = "stage.failed", stage = %stage, probe = %probe, exit_code);
        return Err(PipelineError::StageExecution {
            stage,
            session: request.context.session.to_string(),
            probe: request.context.probe.clone(),
            exit_code,
        });
    }

    if !request.output_json.exists() {
        return Err(PipelineError::StageOutputMissing {
            stage,
            path: request.output_json.clone(),
        });
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    info!(event = "stage.completed", stage = %stage, probe = %probe, duration_ms);

    Ok(StageResult {
        stage_name: stage,
        exit_code,
        duration_ms,
        input_json: request.input_json.clone(),
        output_json: request.output_json.clone(),
        input_digest,
    })
}

/// `<json_dir>/<stem>-input.json` and `<json_dir>/<stem>-output.json`.
pub fn json_pair(json_dir: &Path, stem: &str) -> (PathBuf, PathBuf) {
    (
        json_dir.join(format!("{stem}-input.json")),
        json_dir.join(format!("{stem}-output.json")),
    )
}
