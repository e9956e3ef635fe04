//! Run specification model.
//!
//! A [`RunSpec`] declares one recording session: who/when it was recorded,
//! which gate and trigger range to process, and which probes took part.
//! It is read-only once loaded.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::trigger::TriggerRange;

/// Namespacing key for every artifact derived from a run: `<name>_<date>_g<gate>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One physical probe (and the computer that recorded it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// Probe / computer label, e.g. `ww2`.
    pub label: String,

    /// Auxiliary SY channel carrying the sync and event bits. `None` skips
    /// edge extraction for this probe.
    #[serde(default)]
    pub sy_channel: Option<u32>,
}

impl ProbeSpec {
    pub fn new(label: impl Into<String>, sy_channel: Option<u32>) -> Self {
        Self {
            label: label.into(),
            sy_channel,
        }
    }
}

/// Declarative description of one recording session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Undecorated run (animal) name, e.g. `dl56`.
    pub name: String,

    /// Recording date as `yyyymmdd`.
    pub date: String,

    /// Gate index.
    pub gate: u32,

    /// Trigger range, e.g. `"start,end"` or `"0,400"`.
    pub triggers: TriggerRange,

    /// Probes in this run. The first one is the alignment reference.
    pub probes: Vec<ProbeSpec>,
}

impl RunSpec {
    pub fn session_key(&self) -> SessionKey {
        SessionKey(format!("{}_{}_g{}", self.name, self.date, self.gate))
    }

    /// Prefix used by CatGT for everything it writes: `<name>_g<gate>`.
    pub fn run_gate(&self) -> String {
        format!("{}_g{}", self.name, self.gate)
    }

    /// Raw data folder for one probe: `<npx>/<probe>/<name>/<date>`.
    pub fn run_folder(&self, npx_directory: &Path, probe: &ProbeSpec) -> PathBuf {
        npx_directory
            .join(&probe.label)
            .join(&self.name)
            .join(&self.date)
    }

    /// The alignment reference ("to" stream) by convention.
    pub fn reference_probe(&self) -> Option<&ProbeSpec> {
        self.probes.first()
    }

    /// Check structural invariants before any stage is run.
    ///
    /// With `alignment` set, the reference probe must have an SY channel.
    pub fn validate(&self, alignment: bool) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("run name must not be empty".to_string()));
        }
        if self.probes.is_empty() {
            return Err(PipelineError::Config(format!(
                "run {} declares no probes",
                self.session_key()
            )));
        }

        let mut seen = HashSet::new();
        for probe in &self.probes {
            if !seen.insert(probe.label.as_str()) {
                return Err(PipelineError::Config(format!(
                    "run {} lists probe '{}' more than once",
                    self.session_key(),
                    probe.label
                )));
            }
        }

        if alignment {
            if let Some(reference) = self.reference_probe() {
                if reference.sy_channel.is_none() {
                    return Err(PipelineError::Config(format!(
                        "reference probe '{}' of run {} has no SY channel and cannot anchor alignment",
                        reference.label,
                        self.session_key()
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> RunSpec {
        RunSpec {
            name: "dl56".to_string(),
            date: "20181126".to_string(),
            gate: 0,
            triggers: "start,end".parse().unwrap(),
            probes: vec![
                ProbeSpec::new("ww2", Some(384)),
                ProbeSpec::new("ww4", Some(384)),
            ],
        }
    }

    #[test]
    fn test_session_key_format() {
        let spec = sample_spec();
        assert_eq!(spec.session_key().as_str(), "dl56_20181126_g0");
        assert_eq!(spec.run_gate(), "dl56_g0");
    }

    #[test]
    fn test_run_folder_layout() {
        let spec = sample_spec();
        let folder = spec.run_folder(Path::new("/npx"), &spec.probes[1]);
        assert_eq!(folder, PathBuf::from("/npx/ww4/dl56/20181126"));
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample_spec().validate(true).is_ok());
    }

    #[test]
    fn test_validate_rejects_reference_without_channel() {
        let mut spec = sample_spec();
        spec.probes[0].sy_channel = None;
        let err = spec.validate(true).unwrap_err();
        assert!(err.to_string().contains("reference probe 'ww2'"));
        // Without alignment the same spec is fine.
        assert!(spec.validate(false).is_ok());
    }

    #[test]
    fn test_validate_allows_dependent_without_channel() {
        let mut spec = sample_spec();
        spec.probes[1].sy_channel = None;
        assert!(spec.validate(true).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_probe() {
        let mut spec = sample_spec();
        spec.probes[1].label = "ww2".to_string();
        assert!(matches!(spec.validate(false), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_probe_list() {
        let mut spec = sample_spec();
        spec.probes.clear();
        assert!(spec.validate(false).is_err());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let spec: RunSpec = toml::from_str(
            r#"
            name = "dl56"
            date = "20181126"
            gate = 0
            triggers = "start,end"
            probes = [
                { label = "ww2", sy_channel = 384 },
                { label = "ww4" },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(spec.probes.len(), 2);
        assert_eq!(spec.probes[1].sy_channel, None);
        assert_eq!(spec.triggers.to_string(), "start,end");
    }
}
