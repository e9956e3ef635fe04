//! Stage identities and the per-invocation parameter document.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::Result;

/// Stages the orchestrator drives itself, outside the per-probe module list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStage {
    /// CatGT: filtering, global demux, gfix and SY edge extraction.
    CatGt,

    /// TPrime: maps every stream's edges onto the reference stream.
    TPrime,
}

impl BuiltinStage {
    /// Module name under the stage namespace.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStage::CatGt => "catGT_helper",
            BuiltinStage::TPrime => "tPrime_helper",
        }
    }
}

/// Parameters handed to one stage invocation.
///
/// Built with the `with_*` methods right before invoking, then frozen: there
/// is no mutable access once construction is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage (module) name.
    pub stage: String,

    params: Map<String, Value>,
}

impl StageConfig {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            params: Map::new(),
        }
    }

    pub fn builtin(stage: BuiltinStage) -> Self {
        Self::new(stage.name())
    }

    /// A new config for `stage` starting from this one's parameters.
    pub fn for_stage(&self, stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            params: self.params.clone(),
        }
    }

    /// Add a parameter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Add a path parameter, stored as a string.
    pub fn with_path(self, key: &str, path: &Path) -> Self {
        let value = path.to_string_lossy().into_owned();
        self.with(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// The document the stage reads from `--input_json`.
    pub fn to_document(&self) -> Value {
        Value::Object(self.params.clone())
    }

    /// SHA-256 of the serialized document (keys are kept sorted, so this is stable).
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(&self.params)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Write the input document atomically: temp file in the same directory, then rename.
    pub fn write_document(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let content = serde_json::to_string_pretty(&self.to_document())?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
