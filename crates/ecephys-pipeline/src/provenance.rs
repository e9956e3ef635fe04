//! Append-only provenance log: one CSV row per completed probe chain.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::spec::SessionKey;

pub const HEADER: &str = "timestamp,session_key,probe,edit_rate,modules,module_times";

/// One completed probe chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvenanceLogEntry {
    pub timestamp: DateTime<Utc>,
    pub session: SessionKey,
    pub probe: String,
    pub edit_rate: f64,
    /// Modules executed, in order.
    pub modules: Vec<String>,
    /// `execution_time` reported by each module, where it reported one.
    pub module_times: Vec<Option<f64>>,
}

impl ProvenanceLogEntry {
    pub fn new(session: SessionKey, probe: impl Into<String>, edit_rate: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            session,
            probe: probe.into(),
            edit_rate,
            modules: Vec::new(),
            module_times: Vec::new(),
        }
    }

    pub fn to_csv_row(&self) -> String {
        let times = self
            .module_times
            .iter()
            .map(|t| t.map(|t| format!("{t:.2}")).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(";");
        [
            self.timestamp.to_rfc3339(),
            self.session.to_string(),
            self.probe.clone(),
            format!("{:.3}", self.edit_rate),
            self.modules.join(";"),
            times,
        ]
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",")
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// An open provenance log file.
#[derive(Debug, Clone)]
pub struct ProvenanceLog {
    path: PathBuf,
}

impl ProvenanceLog {
    /// Truncate (or create) the log and write the header.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        writeln!(file, "{HEADER}")?;
        file.sync_all()?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row. The file is reopened per row so a crash never loses
    /// earlier rows.
    pub fn append(&self, entry: &ProvenanceLogEntry) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", entry.to_csv_row())?;
        file.sync_data()?;
        info!(
            event = "provenance.appended",
            session = %entry.session,
            probe = %entry.probe,
            modules = entry.modules.len(),
        );
        Ok(())
    }
}

/// Hands out provenance logs, recreating each destination only the first
/// time it is requested through the registry.
#[derive(Debug, Default)]
pub struct ProvenanceRegistry {
    logs: HashMap<PathBuf, ProvenanceLog>,
}

static SHARED: OnceLock<Mutex<ProvenanceRegistry>> = OnceLock::new();

impl ProvenanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` through the process-wide registry. Every pipeline in the
    /// process shares it, so a destination is truncated at most once.
    pub fn open_shared(path: &Path) -> Result<ProvenanceLog> {
        SHARED
            .get_or_init(|| Mutex::new(ProvenanceRegistry::new()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open(path)
    }

    pub fn open(&mut self, path: &Path) -> Result<ProvenanceLog> {
        if let Some(log) = self.logs.get(path) {
            return Ok(log.clone());
        }
        let log = ProvenanceLog::create(path)?;
        self.logs.insert(path.to_path_buf(), log.clone());
        Ok(log)
    }
}
