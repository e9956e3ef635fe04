//! Per-probe module chain.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};

use crate::artifact::ArtifactLocation;
use crate::error::Result;
use crate::invoker::{json_pair, run_stage, StageContext, StageInvoker, StageRequest, StageResult};
use crate::provenance::{ProvenanceLog, ProvenanceLogEntry};
use crate::stage::StageConfig;

/// Inputs for one probe's chain.
#[derive(Debug, Clone)]
pub struct ProbeChainInput<'a> {
    pub context: StageContext,
    pub location: &'a ArtifactLocation,
    pub edit_rate: f64,
    /// Run-level parameters shared by every module of the run.
    pub shared: &'a StageConfig,
}

/// Outcome of a completed chain.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub entry: ProvenanceLogEntry,
    pub stages: Vec<StageResult>,
}

/// Runs an ordered module list for one probe at a time.
pub struct ModuleSequencer<'a> {
    invoker: &'a dyn StageInvoker,
    json_dir: &'a Path,
    modules: &'a [String],
    keep_original_sort: bool,
}

impl<'a> ModuleSequencer<'a> {
    pub fn new(
        invoker: &'a dyn StageInvoker,
        json_dir: &'a Path,
        modules: &'a [String],
        keep_original_sort: bool,
    ) -> Self {
        Self {
            invoker,
            json_dir,
            modules,
            keep_original_sort,
        }
    }

    pub fn modules(&self) -> &[String] {
        self.modules
    }

    /// Parameters every module of this probe receives.
    pub fn probe_config(&self, stage: &str, input: &ProbeChainInput<'_>) -> StageConfig {
        input
            .shared
            .for_stage(stage)
            .with_path("continuous_file", &input.location.continuous_file)
            .with_path("data_directory", &input.location.canonical_dir)
            .with_path("kilosort_output_directory", &input.location.sort_output_dir)
            .with("catGT_gfix_edits", input.edit_rate)
            .with("ks_make_copy", self.keep_original_sort)
            .with("noise_template_use_rf", false)
    }

    /// Run every module in order and append one provenance row.
    ///
    /// Stops at the first failing module; later modules are not invoked and
    /// nothing is appended. `on_module` is told which module is about to run.
    pub async fn run(
        &self,
        input: &ProbeChainInput<'_>,
        provenance: &ProvenanceLog,
        mut on_module: impl FnMut(usize, &str) + Send,
    ) -> Result<ChainOutcome> {
        let probe = input.context.probe.clone().unwrap_or_default();

        // Parameter record kept next to the data.
        self.probe_config("module_chain", input)
            .write_document(&input.location.parameter_record)?;

        let mut entry = ProvenanceLogEntry::new(input.context.session.clone(), &probe, input.edit_rate);
        let mut stages = Vec::with_capacity(self.modules.len());

        for (index, module) in self.modules.iter().enumerate() {
            on_module(index, module);
            debug!(module = %module, index, probe = %probe, "Running module");

            let stem = format!("{}_{}-{}", input.context.session, probe, module);
            let (input_json, output_json) = json_pair(self.json_dir, &stem);
            let request = StageRequest {
                config: self.probe_config(module, input),
                input_json,
                output_json,
                context: input.context.clone(),
            };

            let result = run_stage(self.invoker, &request).await?;
            entry.modules.push(module.clone());
            entry.module_times.push(execution_time(&result.output_json));
            stages.push(result);
        }

        provenance.append(&entry)?;
        info!(
            event = "chain.completed",
            session = %input.context.session,
            probe = %probe,
            modules = self.modules.len(),
        );
        Ok(ChainOutcome { entry, stages })
    }
}

/// `execution_time` from a module's output document, if it reported one.
fn execution_time(output_json: &Path) -> Option<f64> {
    let text = std::fs::read_to_string(output_json).ok()?;
    let doc: Value = serde_json::from_str(&text).ok()?;
    doc.get("execution_time")?.as_f64()
}
