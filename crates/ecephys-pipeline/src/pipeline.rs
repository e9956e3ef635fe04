//! Run state machine and batch driver.
//!
//! Each run moves through
//!
//! ```text
//! Resolving -> Preprocessing(p1) -> Sequencing(p1, 0..n) -> ... -> Preprocessing(pk)
//!           -> Sequencing(pk, 0..n) -> Aligning -> Done
//! ```
//!
//! and lands in `Failed` on the first fatal error. Everything is sequential:
//! one run, one probe, one stage at a time.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::accumulator::{ProbeRecord, RunAccumulator};
use crate::alignment::{AlignmentCoordinator, AlignmentStreams};
use crate::artifact::{ArtifactLayout, ArtifactLocation};
use crate::config::PipelineConfig;
use crate::edit_rate::{recover_edit_rates, EditRates, LogSource};
use crate::error::{LogParseWarning, PipelineError, Result};
use crate::invoker::{json_pair, run_stage, StageContext, StageInvoker, StageRequest, StageResult};
use crate::provenance::{ProvenanceLog, ProvenanceRegistry};
use crate::sequencer::{ModuleSequencer, ProbeChainInput};
use crate::spec::{ProbeSpec, RunSpec, SessionKey};
use crate::stage::{BuiltinStage, StageConfig};
use crate::telemetry;
use crate::trigger::ResolvedTriggers;

/// Logs the external tools leave in their working directory.
pub const TOOL_LOGS: [&str; 3] = ["CatGT.log", "Tprime.log", "C_Waves.log"];

/// Where a run currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    Resolving,
    Preprocessing { probe: String },
    Sequencing { probe: String, module_index: usize },
    Aligning,
    Done,
    Failed { reason: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed { .. })
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Resolving => f.write_str("resolving"),
            RunState::Preprocessing { probe } => write!(f, "preprocessing({probe})"),
            RunState::Sequencing {
                probe,
                module_index,
            } => write!(f, "sequencing({probe}, {module_index})"),
            RunState::Aligning => f.write_str("aligning"),
            RunState::Done => f.write_str("done"),
            RunState::Failed { reason } => write!(f, "failed({reason})"),
        }
    }
}

/// State history of one run.
#[derive(Debug)]
struct RunTracker {
    session: SessionKey,
    history: Vec<RunState>,
    triggers: Vec<(String, ResolvedTriggers)>,
    completed_probes: Vec<String>,
    alignment: Option<StageResult>,
}

impl RunTracker {
    fn new(session: SessionKey) -> Self {
        Self {
            session,
            history: Vec::new(),
            triggers: Vec::new(),
            completed_probes: Vec::new(),
            alignment: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        telemetry::emit_state(self.session.as_str(), &state);
        self.history.push(state);
    }

    fn current(&self) -> Option<&RunState> {
        self.history.last()
    }
}

/// Result of one run of the batch.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub session: SessionKey,
    /// `Done` or `Failed`.
    pub state: RunState,
    /// Every state entered, in order, ending with `state`.
    pub history: Vec<RunState>,
    /// Trigger range of each probe that was resolved, keyed by label.
    pub triggers: Vec<(String, ResolvedTriggers)>,
    /// Probe records; empty when the run failed.
    pub accumulator: RunAccumulator,
    /// Probes whose chain finished (and was logged) before the run ended.
    pub completed_probes: Vec<String>,
    pub alignment: Option<StageResult>,
    pub warnings: Vec<LogParseWarning>,
    pub error: Option<PipelineError>,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done
    }
}

/// Result of a whole batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub runs: Vec<RunOutcome>,
}

impl BatchOutcome {
    pub fn succeeded_count(&self) -> usize {
        self.runs.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.runs.iter().filter(|r| !r.succeeded()).count()
    }

    pub fn success(&self) -> bool {
        self.failed_count() == 0
    }
}

/// Drives runs through the external stages.
pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    invoker: &'a dyn StageInvoker,
    log_source: &'a dyn LogSource,
    layout: ArtifactLayout,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        invoker: &'a dyn StageInvoker,
        log_source: &'a dyn LogSource,
    ) -> Self {
        Self {
            config,
            invoker,
            log_source,
            layout: ArtifactLayout::new(&config.dest_parent),
        }
    }

    /// Run every configured run. Only startup problems are returned as
    /// errors; a failing run is recorded in its outcome and the batch moves on.
    /// The provenance log is truncated only by the first batch in the process.
    pub async fn run_batch(&self) -> Result<BatchOutcome> {
        self.config.validate()?;
        if self.config.preprocessing.clear_tool_logs {
            clear_tool_logs(&self.config.working_directory)?;
        }
        std::fs::create_dir_all(&self.config.json_directory)?;
        let provenance = ProvenanceRegistry::open_shared(&self.config.provenance_path())?;

        let mut runs = Vec::with_capacity(self.config.runs.len());
        for spec in &self.config.runs {
            runs.push(self.run(spec, &provenance).await);
        }

        let batch = BatchOutcome { runs };
        info!(
            event = "batch.finished",
            succeeded = batch.succeeded_count(),
            failed = batch.failed_count(),
        );
        Ok(batch)
    }

    /// Run one RunSpec to a terminal state.
    pub async fn run(&self, spec: &RunSpec, provenance: &ProvenanceLog) -> RunOutcome {
        let start = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let session = spec.session_key();
        let mut tracker = RunTracker::new(session.clone());

        let span = telemetry::run_span(session.as_str(), &run_id);
        let result = self
            .execute(spec, &mut tracker, provenance)
            .instrument(span)
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (accumulator, error) = match result {
            Ok(acc) => {
                tracker.enter(RunState::Done);
                telemetry::emit_run_finished(session.as_str(), duration_ms, acc.len());
                (acc, None)
            }
            Err(e) => {
                telemetry::emit_run_failed(session.as_str(), e.stage(), &e);
                let at = tracker
                    .current()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "validation".to_string());
                tracker.enter(RunState::Failed {
                    reason: format!("{at}: {e}"),
                });
                (RunAccumulator::new(), Some(e))
            }
        };

        let warnings = accumulator.warnings().cloned().collect();
        let state = tracker
            .current()
            .cloned()
            .unwrap_or(RunState::Done);

        RunOutcome {
            run_id,
            session,
            state,
            history: tracker.history,
            triggers: tracker.triggers,
            accumulator,
            completed_probes: tracker.completed_probes,
            alignment: tracker.alignment,
            warnings,
            error,
            duration_ms,
        }
    }

    async fn execute(
        &self,
        spec: &RunSpec,
        tracker: &mut RunTracker,
        provenance: &ProvenanceLog,
    ) -> Result<RunAccumulator> {
        spec.validate(self.config.alignment.enabled)?;
        let session = spec.session_key();
        telemetry::emit_run_started(session.as_str(), spec.probes.len());

        tracker.enter(RunState::Resolving);
        let reference = spec
            .reference_probe()
            .ok_or_else(|| PipelineError::Config(format!("run {session} declares no probes")))?;
        // Each probe records its own trigger files.
        for probe in &spec.probes {
            let folder = spec.run_folder(&self.config.npx_directory, probe);
            let triggers = spec.triggers.resolve(&folder, &spec.run_gate())?;
            tracker.triggers.push((probe.label.clone(), triggers));
        }
        let resolved = tracker.triggers.clone();

        std::fs::create_dir_all(self.layout.session_dir(spec))?;

        let mut acc = RunAccumulator::new();
        for (probe, (_, triggers)) in spec.probes.iter().zip(resolved) {
            acc = self
                .process_probe(spec, probe, triggers, acc, tracker, provenance)
                .await?;
            tracker.completed_probes.push(probe.label.clone());
        }

        if self.config.alignment.enabled {
            tracker.enter(RunState::Aligning);
            let streams = AlignmentStreams::collect(spec, &acc)?;
            let coordinator = AlignmentCoordinator::new(
                self.invoker,
                &self.config.json_directory,
                self.config.alignment.sync_period,
                self.config.alignment.sync,
            );
            let triggers = acc
                .get(&reference.label)
                .map(|record| record.triggers)
                .ok_or_else(|| {
                    PipelineError::Config(format!(
                        "reference probe {} produced no record",
                        reference.label
                    ))
                })?;
            let shared = self.run_parameters(spec, triggers);
            let result = coordinator.align(spec, &streams, &shared).await?;
            tracker.alignment = Some(result);
        }

        Ok(acc)
    }

    /// Preprocess one probe, recover its edit rate, move its output into
    /// place and run its module chain.
    async fn process_probe(
        &self,
        spec: &RunSpec,
        probe: &ProbeSpec,
        triggers: ResolvedTriggers,
        acc: RunAccumulator,
        tracker: &mut RunTracker,
        provenance: &ProvenanceLog,
    ) -> Result<RunAccumulator> {
        let session = spec.session_key();
        let context = StageContext::probe(session.clone(), &probe.label);
        let location = self.layout.locate(spec, probe);
        let plan = self
            .config
            .catalog()
            .plan(probe.sy_channel, &spec.run_gate(), &location.canonical_dir);
        let cmd_string = format!("{}{}", self.config.preprocessing.cmd_string, plan.args);

        tracker.enter(RunState::Preprocessing {
            probe: probe.label.clone(),
        });

        let probe_ids: Vec<&str> = self
            .config
            .preprocessing
            .probe_ids
            .iter()
            .map(String::as_str)
            .collect();

        let edit_rates = if self.config.preprocessing.enabled {
            location.ensure_canonical_free()?;

            let config = self
                .run_parameters(spec, triggers)
                .for_stage(BuiltinStage::CatGt.name())
                .with_path("npx_directory", &spec.run_folder(&self.config.npx_directory, probe))
                .with("catGT_cmd_string", cmd_string.as_str())
                .with_path("kilosort_output_directory", &self.layout.session_dir(spec));
            let (input_json, output_json) = json_pair(
                &self.config.json_directory,
                &format!("{session}_{}-catGT", probe.label),
            );
            let request = StageRequest {
                config,
                input_json,
                output_json,
                context: context.clone(),
            };
            let log_offset = self.log_source.end_offset();
            let result = run_stage(self.invoker, &request).await?;

            // Read the edit rate before anything else can append to the log.
            let output_doc = read_document(&result.output_json);
            let rates = recover_edit_rates(
                output_doc.as_ref(),
                self.log_source,
                log_offset,
                &spec.name,
                spec.gate,
                &probe_ids,
            );

            location.promote()?;
            rates
        } else {
            info!(probe = %probe.label, "Preprocessing disabled, reusing existing output");
            location.expect_existing();
            EditRates::zeros(&probe_ids)
        };

        let edit_rate = edit_rates.rates.first().map(|(_, r)| *r).unwrap_or(0.0);
        info!(probe = %probe.label, edit_rate, triggers = %triggers, "Recovered gfix edit rate");

        let shared = self
            .run_parameters(spec, triggers)
            .with("catGT_run_name", session.as_str())
            .with("catGT_cmd_string", cmd_string.as_str())
            .with("event_ex_param_str", self.event_param(probe));
        let sequencer = ModuleSequencer::new(
            self.invoker,
            &self.config.json_directory,
            &self.config.modules,
            self.config.keeps_original_sort(),
        );
        let input = ProbeChainInput {
            context,
            location: &location,
            edit_rate,
            shared: &shared,
        };
        let label = probe.label.clone();
        sequencer
            .run(&input, provenance, |module_index, _| {
                tracker.enter(RunState::Sequencing {
                    probe: label.clone(),
                    module_index,
                })
            })
            .await?;

        Ok(acc.with_probe(ProbeRecord {
            label: probe.label.clone(),
            triggers,
            edit_rate,
            sync_edge_path: plan.sync_edge_path,
            location,
            chain_completed: true,
            warnings: edit_rates.warnings,
        }))
    }

    /// Parameters common to every stage of a run.
    fn run_parameters(&self, spec: &RunSpec, triggers: ResolvedTriggers) -> StageConfig {
        StageConfig::new("run")
            .with_path("npx_directory", &self.config.npx_directory)
            .with("spikeGLX_data", true)
            .with("catGT_run_name", spec.name.as_str())
            .with("gate_string", spec.gate.to_string())
            .with("trigger_string", triggers.to_string())
            .with("probe_string", "")
            .with("catGT_stream_string", self.config.preprocessing.stream_string.as_str())
            .with("catGT_cmd_string", self.config.preprocessing.cmd_string.as_str())
            .with_path("extracted_data_directory", &self.layout.session_dir(spec))
    }

    fn event_param(&self, probe: &ProbeSpec) -> String {
        let psth = self.config.modules.iter().any(|m| m == "psth_events");
        let channel = if psth { probe.sy_channel } else { None };
        self.config
            .catalog()
            .event_param(self.config.event_extraction_index, channel)
    }
}

/// Dry-run view of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbePlan {
    pub label: String,
    pub raw_folder: PathBuf,
    /// Triggers resolved against `raw_folder`, or why they could not be
    /// resolved yet.
    pub triggers: std::result::Result<ResolvedTriggers, String>,
    pub location: ArtifactLocation,
    /// `-SY=` clauses appended to the CatGT command string.
    pub extraction_args: String,
    pub sync_edge_path: Option<PathBuf>,
    pub event_param: String,
}

/// Dry-run view of one run: what would be invoked and where output lands.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub session: SessionKey,
    pub session_dir: PathBuf,
    pub probes: Vec<ProbePlan>,
    pub modules: Vec<String>,
    pub alignment: bool,
}

/// Layout report for every configured run. Nothing is invoked or written.
pub fn plan(config: &PipelineConfig) -> Result<Vec<RunPlan>> {
    config.validate()?;
    let layout = ArtifactLayout::new(&config.dest_parent);
    let catalog = config.catalog();
    let psth = config.modules.iter().any(|m| m == "psth_events");

    let plans = config
        .runs
        .iter()
        .map(|spec| {
            let probes = spec
                .probes
                .iter()
                .map(|probe| {
                    let location = layout.locate(spec, probe);
                    let extraction =
                        catalog.plan(probe.sy_channel, &spec.run_gate(), &location.canonical_dir);
                    let channel = if psth { probe.sy_channel } else { None };
                    let raw_folder = spec.run_folder(&config.npx_directory, probe);
                    let triggers = spec
                        .triggers
                        .resolve(&raw_folder, &spec.run_gate())
                        .map_err(|e| e.to_string());
                    ProbePlan {
                        label: probe.label.clone(),
                        raw_folder,
                        triggers,
                        location,
                        extraction_args: extraction.args,
                        sync_edge_path: extraction.sync_edge_path,
                        event_param: catalog.event_param(config.event_extraction_index, channel),
                    }
                })
                .collect();

            RunPlan {
                session: spec.session_key(),
                session_dir: layout.session_dir(spec),
                probes,
                modules: config.modules.clone(),
                alignment: config.alignment.enabled,
            }
        })
        .collect();
    Ok(plans)
}

fn read_document(path: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Remove stale tool logs so edit rates are never read from an older batch.
pub fn clear_tool_logs(working_dir: &Path) -> Result<()> {
    for name in TOOL_LOGS {
        match std::fs::remove_file(working_dir.join(name)) {
            Ok(()) => info!(log = name, "Removed stale tool log"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
