//! Pipeline configuration (TOML).
//!
//! Defaults mirror a 3A "folder per probe" acquisition: CatGT with global
//! demux and gfix, the standard four SY extractions, Kilosort followed by
//! the usual post-processing modules, and TPrime on the trial TTL.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::extraction::{ExtractionCatalog, ExtractionRequest, Tolerance};
use crate::invoker::ProcessStageInvoker;
use crate::spec::RunSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    /// Run CatGT. When false, previously preprocessed data is reused.
    pub enabled: bool,
    pub stream_string: String,
    pub cmd_string: String,
    /// Delete CatGT.log, Tprime.log and C_Waves.log from the working
    /// directory before the batch starts.
    pub clear_tool_logs: bool,
    /// CatGT's internal probe ids for one invocation (3A: just "0").
    pub probe_ids: Vec<String>,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_string: "-prb_3A -ap -no_run_fld -t_miss_ok".to_string(),
            cmd_string: "-aphipass=300 -aplopass=9000 -gbldmx -gfix=0,0.10,0.02".to_string(),
            clear_tool_logs: true,
            probe_ids: vec!["0".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Run TPrime once per run after all probes.
    pub enabled: bool,
    /// Period of the sync signal in seconds.
    pub sync_period: f64,
    /// Extraction whose edges are the sync stream.
    pub sync: ExtractionRequest,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_period: 12.0,
            sync: ExtractionRequest::new(0, 0, Tolerance::Default),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    pub interpreter: Vec<String>,
    pub namespace: String,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            interpreter: ["python", "-W", "ignore", "-m"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            namespace: "ecephys_spike_sorting.modules".to_string(),
        }
    }
}

fn default_log_name() -> String {
    "pipeline_log.csv".to_string()
}

fn default_working_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_extraction() -> Vec<ExtractionRequest> {
    vec![
        ExtractionRequest::new(0, 0, Tolerance::Default),
        ExtractionRequest::new(1, 50, Tolerance::Default),
        ExtractionRequest::new(1, 10, Tolerance::Default),
        ExtractionRequest::new(1, 1200, Tolerance::Millis(0.2)),
    ]
}

fn default_event_extraction_index() -> usize {
    1
}

fn default_modules() -> Vec<String> {
    [
        "kilosort_helper",
        "kilosort_postprocessing",
        "noise_templates",
        "mean_waveforms",
        "quality_metrics",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_mutating_modules() -> Vec<String> {
    vec![
        "kilosort_postprocessing".to_string(),
        "noise_templates".to_string(),
    ]
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Raw data root: `<npx>/<probe>/<name>/<date>/*.bin`.
    pub npx_directory: PathBuf,

    /// Output root; one `<session>` folder per run is created beneath it.
    pub dest_parent: PathBuf,

    /// Where generated stage input/output documents are written.
    pub json_directory: PathBuf,

    /// Provenance log file name inside `dest_parent`.
    #[serde(default = "default_log_name")]
    pub log_name: String,

    /// Working directory for stage processes (holds CatGT.log).
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,

    #[serde(default)]
    pub preprocessing: PreprocessingConfig,

    #[serde(default = "default_extraction")]
    pub extraction: Vec<ExtractionRequest>,

    /// Catalog index of the extraction exported as PSTH events.
    #[serde(default = "default_event_extraction_index")]
    pub event_extraction_index: usize,

    #[serde(default)]
    pub alignment: AlignmentConfig,

    /// Per-probe modules, in execution order.
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,

    /// Modules that rewrite sorter output in place.
    #[serde(default = "default_mutating_modules")]
    pub mutating_modules: Vec<String>,

    #[serde(default)]
    pub invoker: InvokerConfig,

    #[serde(default)]
    pub runs: Vec<RunSpec>,
}

impl PipelineConfig {
    /// A configuration with every default and no runs.
    pub fn new(
        npx_directory: impl Into<PathBuf>,
        dest_parent: impl Into<PathBuf>,
        json_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            npx_directory: npx_directory.into(),
            dest_parent: dest_parent.into(),
            json_directory: json_directory.into(),
            log_name: default_log_name(),
            working_directory: default_working_directory(),
            preprocessing: PreprocessingConfig::default(),
            extraction: default_extraction(),
            event_extraction_index: default_event_extraction_index(),
            alignment: AlignmentConfig::default(),
            modules: default_modules(),
            mutating_modules: default_mutating_modules(),
            invoker: InvokerConfig::default(),
            runs: Vec::new(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Batch-wide checks. Individual runs are validated when they start, so
    /// one malformed run fails alone.
    pub fn validate(&self) -> Result<()> {
        if self.invoker.interpreter.is_empty() {
            return Err(PipelineError::Config(
                "invoker.interpreter must name at least the executable".to_string(),
            ));
        }
        if self.preprocessing.probe_ids.is_empty() {
            return Err(PipelineError::Config(
                "preprocessing.probe_ids must not be empty".to_string(),
            ));
        }
        if self.log_name.trim().is_empty() {
            return Err(PipelineError::Config("log_name must not be empty".to_string()));
        }
        if self.alignment.enabled {
            if !self.catalog().contains_sync() {
                return Err(PipelineError::Config(format!(
                    "alignment sync request ({}) is not in the extraction catalog",
                    self.alignment.sync
                )));
            }
            if self.alignment.sync_period <= 0.0 {
                return Err(PipelineError::Config(
                    "alignment.sync_period must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn catalog(&self) -> ExtractionCatalog {
        ExtractionCatalog::new(self.extraction.clone(), self.alignment.sync)
    }

    pub fn provenance_path(&self) -> PathBuf {
        self.dest_parent.join(&self.log_name)
    }

    /// Whether any configured module rewrites sorter output in place.
    pub fn keeps_original_sort(&self) -> bool {
        self.modules
            .iter()
            .any(|m| self.mutating_modules.contains(m))
    }

    pub fn process_invoker(&self) -> ProcessStageInvoker {
        ProcessStageInvoker::new(self.invoker.interpreter.clone(), self.invoker.namespace.clone())
            .with_working_dir(&self.working_directory)
    }
}
