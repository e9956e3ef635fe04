//! Ecephys Pipeline Core Library
//!
//! Orchestrates SpikeGLX recordings through preprocessing (CatGT), a
//! per-probe chain of analysis modules and cross-probe alignment (TPrime).
//! The external tools are reached through [`StageInvoker`]; everything else
//! (path layout, edit-rate recovery, provenance, run state) lives here.

pub mod accumulator;
pub mod alignment;
pub mod artifact;
pub mod config;
pub mod edit_rate;
pub mod error;
pub mod extraction;
pub mod fakes;
pub mod invoker;
pub mod pipeline;
pub mod provenance;
pub mod sequencer;
pub mod spec;
pub mod stage;
pub mod telemetry;
pub mod trigger;

pub use accumulator::{ProbeRecord, RunAccumulator};
pub use alignment::{AlignmentCoordinator, AlignmentStreams};
pub use artifact::{ArtifactLayout, ArtifactLocation};
pub use config::{AlignmentConfig, InvokerConfig, PipelineConfig, PreprocessingConfig};
pub use edit_rate::{
    parse_edit_rates, recover_edit_rates, EditRates, FileLogSource, LogSource, StaticLogSource,
    CATGT_LOG,
};
pub use error::{LogParseWarning, PipelineError, Result};
pub use extraction::{ExtractionCatalog, ExtractionPlan, ExtractionRequest, Tolerance};
pub use invoker::{
    run_stage, ProcessStageInvoker, StageContext, StageInvoker, StageRequest, StageResult,
};
pub use pipeline::{plan, BatchOutcome, Pipeline, ProbePlan, RunOutcome, RunPlan, RunState};
pub use provenance::{ProvenanceLog, ProvenanceLogEntry, ProvenanceRegistry};
pub use sequencer::{ChainOutcome, ModuleSequencer, ProbeChainInput};
pub use spec::{ProbeSpec, RunSpec, SessionKey};
pub use stage::{BuiltinStage, StageConfig};
pub use trigger::{ResolvedTriggers, TriggerBound, TriggerRange};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
