//! In-process stand-ins for the external tools (testing only).
//!
//! [`RecordingInvoker`] records every launch, writes the output document a
//! real module would write, and for CatGT also creates the default output
//! folder and appends an edit-rate record to a CatGT-style log.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::invoker::{StageInvoker, StageRequest};
use crate::stage::{BuiltinStage, StageConfig};

/// One recorded launch.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage: String,
    pub probe: Option<String>,
    pub config: StageConfig,
}

#[derive(Debug, Default)]
struct Inner {
    invocations: Vec<Invocation>,
    failures: HashMap<(String, Option<String>), i32>,
    edit_rates: HashMap<String, f64>,
}

/// Fake [`StageInvoker`] that records launches.
#[derive(Debug, Default)]
pub struct RecordingInvoker {
    inner: Mutex<Inner>,
    catgt_log: Option<PathBuf>,
}

impl RecordingInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append CatGT edit-rate records to this log file.
    pub fn with_catgt_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.catgt_log = Some(path.into());
        self
    }

    /// Edit rate CatGT reports for `probe`.
    pub fn with_edit_rate(self, probe: &str, rate: f64) -> Self {
        self.inner
            .lock()
            .unwrap()
            .edit_rates
            .insert(probe.to_string(), rate);
        self
    }

    /// Make `stage` exit with `exit_code` (for one probe, or any when `None`).
    pub fn fail_on(self, stage: &str, probe: Option<&str>, exit_code: i32) -> Self {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert((stage.to_string(), probe.map(str::to_string)), exit_code);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.inner.lock().unwrap().invocations.clone()
    }

    /// Stage names in launch order.
    pub fn stages(&self) -> Vec<String> {
        self.invocations().into_iter().map(|i| i.stage).collect()
    }

    pub fn count(&self, stage: &str) -> usize {
        self.invocations().iter().filter(|i| i.stage == stage).count()
    }

    fn simulate_catgt(&self, request: &StageRequest, edit_rate: Option<f64>) -> std::io::Result<()> {
        let param = |key: &str| {
            request
                .config
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };
        let run_gate = format!("{}_g{}", param("catGT_run_name"), param("gate_string"));
        let default_dir = PathBuf::from(param("extracted_data_directory")).join(format!("catgt_{run_gate}"));
        std::fs::create_dir_all(&default_dir)?;
        std::fs::write(default_dir.join(format!("{run_gate}_tcat.imec.ap.bin")), b"")?;

        if let (Some(log), Some(rate)) = (&self.catgt_log, edit_rate) {
            let mut file = OpenOptions::new().create(true).append(true).open(log)?;
            writeln!(file, "[Thd 1 CPU 0] {run_gate} Gfix prb 0 edits/sec {rate:.4}")?;
        }
        Ok(())
    }
}

#[async_trait]
impl StageInvoker for RecordingInvoker {
    async fn launch(&self, request: &StageRequest) -> std::io::Result<i32> {
        let stage = request.stage().to_string();
        let probe = request.context.probe.clone();

        let (exit_code, edit_rate) = {
            let mut inner = self.inner.lock().unwrap();
            inner.invocations.push(Invocation {
                stage: stage.clone(),
                probe: probe.clone(),
                config: request.config.clone(),
            });
            let exit_code = inner
                .failures
                .get(&(stage.clone(), probe.clone()))
                .or_else(|| inner.failures.get(&(stage.clone(), None)))
                .copied()
                .unwrap_or(0);
            let edit_rate = probe.as_ref().and_then(|p| inner.edit_rates.get(p).copied());
            (exit_code, edit_rate)
        };

        if exit_code != 0 {
            return Ok(exit_code);
        }

        if stage == BuiltinStage::CatGt.name() {
            self.simulate_catgt(request, edit_rate)?;
        }

        let output = json!({ "stage": stage, "execution_time": 1.0 });
        std::fs::write(&request.output_json, serde_json::to_vec_pretty(&output)?)?;
        Ok(0)
    }
}
