//! Per-run accumulation of what each probe produced.
//!
//! A [`RunAccumulator`] is created when a run starts, handed to each probe
//! step and handed back with that probe's [`ProbeRecord`] added. Alignment
//! reads the finished accumulator.

use std::path::PathBuf;

use serde::Serialize;

use crate::artifact::ArtifactLocation;
use crate::error::LogParseWarning;
use crate::trigger::ResolvedTriggers;

/// What one probe produced during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeRecord {
    pub label: String,
    /// Trigger range resolved against this probe's own raw folder.
    pub triggers: ResolvedTriggers,
    pub edit_rate: f64,
    /// `None` when the probe has no SY channel.
    pub sync_edge_path: Option<PathBuf>,
    pub location: ArtifactLocation,
    /// Whether the module chain ran to completion and was logged.
    pub chain_completed: bool,
    #[serde(skip)]
    pub warnings: Vec<LogParseWarning>,
}

/// Probe records for one run, in probe order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunAccumulator {
    probes: Vec<ProbeRecord>,
}

impl RunAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the record for `record.label`.
    pub fn with_probe(mut self, record: ProbeRecord) -> Self {
        match self.probes.iter_mut().find(|p| p.label == record.label) {
            Some(existing) => *existing = record,
            None => self.probes.push(record),
        }
        self
    }

    pub fn get(&self, label: &str) -> Option<&ProbeRecord> {
        self.probes.iter().find(|p| p.label == label)
    }

    pub fn records(&self) -> &[ProbeRecord] {
        &self.probes
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &LogParseWarning> {
        self.probes.iter().flat_map(|p| p.warnings.iter())
    }
}
