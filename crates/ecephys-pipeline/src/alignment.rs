//! Cross-probe alignment (TPrime), once per run.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::accumulator::RunAccumulator;
use crate::error::{PipelineError, Result};
use crate::extraction::ExtractionRequest;
use crate::invoker::{json_pair, run_stage, StageContext, StageInvoker, StageRequest, StageResult};
use crate::spec::RunSpec;
use crate::stage::{BuiltinStage, StageConfig};

/// Sync-edge files for one run: the reference stream and everything mapped onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentStreams {
    pub to_stream: PathBuf,
    pub from_streams: Vec<PathBuf>,
}

impl AlignmentStreams {
    /// Gather sync paths from the accumulator. The first probe of the run is
    /// the reference; other probes without a sync path are left out.
    pub fn collect(spec: &RunSpec, acc: &RunAccumulator) -> Result<Self> {
        let reference = spec
            .reference_probe()
            .ok_or_else(|| PipelineError::Config(format!("run {} has no probes", spec.session_key())))?;

        let to_stream = acc
            .get(&reference.label)
            .and_then(|r| r.sync_edge_path.clone())
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "reference probe '{}' of run {} produced no sync edge file",
                    reference.label,
                    spec.session_key()
                ))
            })?;

        let from_streams = spec
            .probes
            .iter()
            .skip(1)
            .filter_map(|p| acc.get(&p.label))
            .filter_map(|r| r.sync_edge_path.clone())
            .collect();

        Ok(Self {
            to_stream,
            from_streams,
        })
    }
}

/// Builds and invokes the single alignment stage of a run.
pub struct AlignmentCoordinator<'a> {
    invoker: &'a dyn StageInvoker,
    json_dir: &'a Path,
    sync_period: f64,
    sync: ExtractionRequest,
}

impl<'a> AlignmentCoordinator<'a> {
    pub fn new(
        invoker: &'a dyn StageInvoker,
        json_dir: &'a Path,
        sync_period: f64,
        sync: ExtractionRequest,
    ) -> Self {
        Self {
            invoker,
            json_dir,
            sync_period,
            sync,
        }
    }

    pub fn stage_config(&self, streams: &AlignmentStreams, shared: &StageConfig) -> StageConfig {
        let from: Vec<Value> = streams
            .from_streams
            .iter()
            .map(|p| Value::from(p.to_string_lossy().into_owned()))
            .collect();

        shared
            .for_stage(BuiltinStage::TPrime.name())
            .with("sync_period", self.sync_period)
            .with("sync_bit", self.sync.bit)
            .with("sync_span_ms", self.sync.span_ms)
            .with("toStream_sync_params", "")
            .with("niStream_sync_params", "")
            .with_path("toStream_path_3A", &streams.to_stream)
            .with("fromStream_list_3A", Value::Array(from))
    }

    /// Invoke TPrime once for the run.
    pub async fn align(
        &self,
        spec: &RunSpec,
        streams: &AlignmentStreams,
        shared: &StageConfig,
    ) -> Result<StageResult> {
        let session = spec.session_key();
        info!(
            event = "alignment.started",
            session = %session,
            to_stream = %streams.to_stream.display(),
            from_streams = streams.from_streams.len(),
        );

        let (input_json, output_json) = json_pair(self.json_dir, &format!("{session}_TPrime"));
        let request = StageRequest {
            config: self.stage_config(streams, shared),
            input_json,
            output_json,
            context: StageContext::run(session),
        };
        run_stage(self.invoker, &request).await
    }
}
