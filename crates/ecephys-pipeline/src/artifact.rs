//! Canonical artifact layout.
//!
//! CatGT names its output folder after the run name and gate only
//! (`catgt_<run>_g<gate>`), so two probes of the same run processed one
//! after the other would land in the same place. Each probe's output is
//! therefore moved to a canonical folder that includes date and probe label
//! before anything downstream reads it.
//!
//! Layout under `<dest>/<name>_<date>_g<gate>/`:
//!
//! ```text
//! catgt_<name>_<date><probe>_g<gate>/
//!     <name>_g<gate>_tcat.imec.ap.bin
//!     <name>_g<gate>_tcat.imec.SY_<ch>_<bit>_<span>.txt
//!     <session>-input.json
//!     imec_<probe>_ks2/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::spec::{ProbeSpec, RunSpec};

/// Where one probe's preprocessing output lives before and after the rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactLocation {
    /// Folder CatGT writes to.
    pub default_dir: PathBuf,

    /// Folder the pipeline moves it to.
    pub canonical_dir: PathBuf,

    /// Concatenated AP binary inside the canonical folder.
    pub continuous_file: PathBuf,

    /// Sorter output folder inside the canonical folder.
    pub sort_output_dir: PathBuf,

    /// Copy of the module input document kept next to the data.
    pub parameter_record: PathBuf,
}

/// Path derivation rooted at the destination parent directory.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    dest_parent: PathBuf,
}

impl ArtifactLayout {
    pub fn new(dest_parent: impl Into<PathBuf>) -> Self {
        Self {
            dest_parent: dest_parent.into(),
        }
    }

    /// `<dest>/<session>`; CatGT's `-dest` for every probe of the run.
    pub fn session_dir(&self, spec: &RunSpec) -> PathBuf {
        self.dest_parent.join(spec.session_key().as_str())
    }

    pub fn locate(&self, spec: &RunSpec, probe: &ProbeSpec) -> ArtifactLocation {
        let session_dir = self.session_dir(spec);
        let run_gate = spec.run_gate();

        let default_dir = session_dir.join(format!("catgt_{run_gate}"));
        let canonical_dir = session_dir.join(format!(
            "catgt_{}_{}{}_g{}",
            spec.name, spec.date, probe.label, spec.gate
        ));
        let continuous_file = canonical_dir.join(format!("{run_gate}_tcat.imec.ap.bin"));
        let sort_output_dir = canonical_dir.join(format!("imec_{}_ks2", probe.label));
        let parameter_record = canonical_dir.join(format!("{}-input.json", spec.session_key()));

        ArtifactLocation {
            default_dir,
            canonical_dir,
            continuous_file,
            sort_output_dir,
            parameter_record,
        }
    }
}

fn is_non_empty_dir(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(path.exists());
    }
    Ok(fs::read_dir(path)?.next().is_some())
}

impl ArtifactLocation {
    /// Fails with `PathConflict` if the canonical folder already holds data.
    pub fn ensure_canonical_free(&self) -> Result<()> {
        if is_non_empty_dir(&self.canonical_dir)? {
            return Err(PipelineError::PathConflict {
                path: self.canonical_dir.clone(),
            });
        }
        Ok(())
    }

    /// Move the stage's default output to the canonical folder.
    ///
    /// An empty canonical folder is replaced; a non-empty one is a conflict.
    pub fn promote(&self) -> Result<()> {
        if !self.default_dir.exists() {
            return Err(PipelineError::ArtifactMissing {
                path: self.default_dir.clone(),
            });
        }
        self.ensure_canonical_free()?;
        if self.canonical_dir.is_dir() {
            fs::remove_dir(&self.canonical_dir)?;
        }

        fs::rename(&self.default_dir, &self.canonical_dir)?;
        info!(
            event = "artifact.renamed",
            from = %self.default_dir.display(),
            to = %self.canonical_dir.display(),
        );
        Ok(())
    }

    /// Preprocessing was skipped: the canonical folder should already exist
    /// from an earlier run. Its absence is tolerated but reported.
    pub fn expect_existing(&self) -> bool {
        let present = self.canonical_dir.is_dir();
        if !present {
            warn!(
                event = "artifact.absent",
                path = %self.canonical_dir.display(),
                "preprocessing skipped but canonical folder is missing",
            );
        }
        present
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RunSpec {
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
    fn test_layout_names() {
        let spec = spec();
        let loc = ArtifactLayout::new("/dest").locate(&spec, &spec.probes[0]);
        assert_eq!(loc.default_dir, PathBuf::from("/dest/dl56_20181126_g0/catgt_dl56_g0"));
        assert_eq!(
            loc.canonical_dir,
            PathBuf::from("/dest/dl56_20181126_g0/catgt_dl56_20181126ww2_g0")
        );
        assert_eq!(
            loc.continuous_file,
            PathBuf::from("/dest/dl56_20181126_g0/catgt_dl56_20181126ww2_g0/dl56_g0_tcat.imec.ap.bin")
        );
        assert_eq!(
            loc.sort_output_dir,
            PathBuf::from("/dest/dl56_20181126_g0/catgt_dl56_20181126ww2_g0/imec_ww2_ks2")
        );
    }

    #[test]
    fn test_canonical_paths_differ_per_probe_but_default_collides() {
        let spec = spec();
        let layout = ArtifactLayout::new("/dest");
        let a = layout.locate(&spec, &spec.probes[0]);
        let b = layout.locate(&spec, &spec.probes[1]);
        assert_eq!(a.default_dir, b.default_dir);
        assert_ne!(a.canonical_dir, b.canonical_dir);
        assert_ne!(a.sort_output_dir, b.sort_output_dir);
    }

    #[test]
    fn test_promote_moves_default_to_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec();
        let loc = ArtifactLayout::new(dir.path()).locate(&spec, &spec.probes[0]);
        fs::create_dir_all(&loc.default_dir).unwrap();
        fs::write(loc.default_dir.join("dl56_g0_tcat.imec.ap.bin"), b"x").unwrap();

        loc.promote().unwrap();
        assert!(!loc.default_dir.exists());
        assert!(loc.continuous_file.exists());
    }

    #[test]
    fn test_promote_replaces_empty_canonical_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec();
        let loc = ArtifactLayout::new(dir.path()).locate(&spec, &spec.probes[0]);
        fs::create_dir_all(&loc.default_dir).unwrap();
        fs::write(loc.default_dir.join("a.bin"), b"x").unwrap();
        fs::create_dir_all(&loc.canonical_dir).unwrap();

        loc.promote().unwrap();
        assert!(loc.canonical_dir.join("a.bin").exists());
    }

    #[test]
    fn test_promote_refuses_non_empty_canonical_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec();
        let loc = ArtifactLayout::new(dir.path()).locate(&spec, &spec.probes[0]);
        fs::create_dir_all(&loc.default_dir).unwrap();
        fs::create_dir_all(&loc.canonical_dir).unwrap();
        fs::write(loc.canonical_dir.join("old.bin"), b"x").unwrap();

        match loc.promote() {
            Err(PipelineError::PathConflict { path }) => assert_eq!(path, loc.canonical_dir),
            other => panic!("expected PathConflict, got {other:?}"),
        }
        // Nothing was moved.
        assert!(loc.default_dir.exists());
    }

    #[test]
    fn test_promote_without_default_output() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec();
        let loc = ArtifactLayout::new(dir.path()).locate(&spec, &spec.probes[0]);
        assert!(matches!(
            loc.promote(),
            Err(PipelineError::ArtifactMissing { .. })
        ));
    }

    #[test]
    fn test_expect_existing() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec();
        let loc = ArtifactLayout::new(dir.path()).locate(&spec, &spec.probes[1]);
        assert!(!loc.expect_existing());
        fs::create_dir_all(&loc.canonical_dir).unwrap();
        assert!(loc.expect_existing());
    }
}
