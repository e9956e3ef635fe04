//! Recovery of the per-probe gfix edit rate after preprocessing.
//!
//! CatGT reports how many gfix edits per second it applied to each probe.
//! Later modules record it as a quality parameter. The value is taken from
//! the preprocessing output document when present; otherwise it is scraped
//! from CatGT's cumulative log, whose records look like
//!
//! ```text
//! ... dl56_g0 Gfix prb 0 edits/sec 0.0250
//! ```
//!
//! The log is cumulative and every 3A probe writes the same
//! `<run>_g<gate> Gfix prb 0` key, so only the text appended while the
//! current CatGT run executed is considered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::error::LogParseWarning;

/// File name CatGT appends to in its working directory.
pub const CATGT_LOG: &str = "CatGT.log";

/// Read access to the preprocessing log.
pub trait LogSource: Send + Sync {
    /// Display name for warnings.
    fn describe(&self) -> String;

    /// Full current contents of the log.
    fn read(&self) -> std::io::Result<String>;

    /// Byte length of the log right now; a missing log is empty.
    fn end_offset(&self) -> usize {
        self.read().map(|text| text.len()).unwrap_or(0)
    }

    /// Text appended after `offset`. A log that shrank or was replaced in
    /// the meantime is returned whole.
    fn read_since(&self, offset: usize) -> std::io::Result<String> {
        let text = self.read()?;
        Ok(match text.get(offset..) {
            Some(tail) => tail.to_string(),
            None => text,
        })
    }
}

/// The on-disk CatGT log.
#[derive(Debug, Clone)]
pub struct FileLogSource {
    path: PathBuf,
}

impl FileLogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `CatGT.log` inside `working_dir`.
    pub fn in_dir(working_dir: &Path) -> Self {
        Self::new(working_dir.join(CATGT_LOG))
    }
}

impl LogSource for FileLogSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn read(&self) -> std::io::Result<String> {
        std::fs::read_to_string(&self.path)
    }

    fn end_offset(&self) -> usize {
        std::fs::metadata(&self.path)
            .map(|m| m.len() as usize)
            .unwrap_or(0)
    }
}

/// Fixed log text, for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct StaticLogSource(pub String);

impl LogSource for StaticLogSource {
    fn describe(&self) -> String {
        "<static>".to_string()
    }

    fn read(&self) -> std::io::Result<String> {
        Ok(self.0.clone())
    }
}

/// Edit rates in probe-id order, plus any defaults applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditRates {
    pub rates: Vec<(String, f64)>,
    pub warnings: Vec<LogParseWarning>,
}

impl EditRates {
    pub fn get(&self, probe_id: &str) -> Option<f64> {
        self.rates
            .iter()
            .find(|(id, _)| id == probe_id)
            .map(|(_, rate)| *rate)
    }

    /// All probes at 0.0, used when preprocessing is skipped.
    pub fn zeros(probe_ids: &[&str]) -> Self {
        Self {
            rates: probe_ids.iter().map(|id| (id.to_string(), 0.0)).collect(),
            warnings: Vec::new(),
        }
    }
}

/// Parse edit rates for `<run_name>_g<gate>` from log text. The last
/// matching record for a probe wins.
pub fn parse_edit_rates(text: &str, run_name: &str, gate: u32, probe_ids: &[&str]) -> EditRates {
    let key = format!("{run_name}_g{gate}");
    let mut out = EditRates::default();

    let pattern = format!(r"(?:^|\s){} Gfix prb (\S+) edits/sec (\S+)", regex::escape(&key));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            out.warnings.push(LogParseWarning::LogUnavailable(e.to_string()));
            out.rates = EditRates::zeros(probe_ids).rates;
            return out;
        }
    };

    let mut last: HashMap<&str, &str> = HashMap::new();
    for caps in text.lines().filter_map(|line| re.captures(line)) {
        if let (Some(prb), Some(value)) = (caps.get(1), caps.get(2)) {
            last.insert(prb.as_str(), value.as_str());
        }
    }

    for id in probe_ids {
        let rate = match last.get(id) {
            Some(raw) => match raw.parse::<f64>() {
                Ok(rate) if rate.is_finite() => rate,
                _ => {
                    out.warnings.push(LogParseWarning::Unparseable {
                        key: key.clone(),
                        probe: id.to_string(),
                        value: raw.to_string(),
                    });
                    0.0
                }
            },
            None => {
                out.warnings.push(LogParseWarning::MissingRecord {
                    key: key.clone(),
                    probe: id.to_string(),
                });
                0.0
            }
        };
        out.rates.push((id.to_string(), rate));
    }
    out
}

/// Edit rates reported in the preprocessing output document, either as a
/// single number (one probe) or as an object keyed by probe id.
fn rates_from_document(doc: &Value, probe_ids: &[&str]) -> Option<Vec<(String, f64)>> {
    let field = doc.get("gfix_edits")?;
    match field {
        Value::Number(n) if probe_ids.len() == 1 => {
            Some(vec![(probe_ids[0].to_string(), n.as_f64()?)])
        }
        Value::Object(map) => probe_ids
            .iter()
            .map(|id| Some((id.to_string(), map.get(*id)?.as_f64()?)))
            .collect(),
        _ => None,
    }
}

/// Recover edit rates for one CatGT run: output document first, then the
/// log text written after `log_offset` (taken before the run started).
/// Never fails; missing values default to 0.0 with a warning.
pub fn recover_edit_rates(
    output_doc: Option<&Value>,
    log: &dyn LogSource,
    log_offset: usize,
    run_name: &str,
    gate: u32,
    probe_ids: &[&str],
) -> EditRates {
    if let Some(rates) = output_doc.and_then(|doc| rates_from_document(doc, probe_ids)) {
        return EditRates {
            rates,
            warnings: Vec::new(),
        };
    }

    let rates = match log.read_since(log_offset) {
        Ok(text) => parse_edit_rates(&text, run_name, gate, probe_ids),
        Err(e) => EditRates {
            rates: EditRates::zeros(probe_ids).rates,
            warnings: vec![LogParseWarning::LogUnavailable(format!(
                "{}: {e}",
                log.describe()
            ))],
        },
    };

    for warning in &rates.warnings {
        warn!(event = "edit_rate.defaulted", %warning);
    }
    rates
}
