//! Trigger range expressions and their resolution against a run folder.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// One end of a trigger range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerBound {
    /// Lowest trigger index present in the run folder.
    Start,
    /// Highest trigger index present in the run folder.
    End,
    Index(u32),
}

impl TriggerBound {
    fn is_symbolic(&self) -> bool {
        !matches!(self, TriggerBound::Index(_))
    }
}

impl FromStr for TriggerBound {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "start" => Ok(TriggerBound::Start),
            "end" => Ok(TriggerBound::End),
            other => other
                .parse::<u32>()
                .map(TriggerBound::Index)
                .map_err(|_| format!("invalid trigger bound '{other}'")),
        }
    }
}

impl fmt::Display for TriggerBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerBound::Start => f.write_str("start"),
            TriggerBound::End => f.write_str("end"),
            TriggerBound::Index(i) => write!(f, "{i}"),
        }
    }
}

/// A `first,last` trigger expression such as `"start,end"` or `"0,400"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TriggerRange {
    pub first: TriggerBound,
    pub last: TriggerBound,
}

impl FromStr for TriggerRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (first, last) = s
            .split_once(',')
            .ok_or_else(|| format!("trigger range '{s}' must be 'first,last'"))?;
        Ok(Self {
            first: first.parse()?,
            last: last.parse()?,
        })
    }
}

impl TryFrom<String> for TriggerRange {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TriggerRange> for String {
    fn from(range: TriggerRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for TriggerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.first, self.last)
    }
}

/// Concrete trigger bounds after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTriggers {
    pub first: u32,
    pub last: u32,
}

impl fmt::Display for ResolvedTriggers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.first, self.last)
    }
}

impl TriggerRange {
    /// Resolve symbolic bounds against the `<run_gate>_t<N>.imec*.ap.bin`
    /// files in `folder`. Literal ranges never touch the filesystem.
    pub fn resolve(&self, folder: &Path, run_gate: &str) -> Result<ResolvedTriggers> {
        let resolution_error = |reason: String| PipelineError::Resolution {
            expr: self.to_string(),
            folder: folder.to_path_buf(),
            reason,
        };

        let span = if self.first.is_symbolic() || self.last.is_symbolic() {
            let indices = trigger_indices(folder, run_gate).map_err(|e| resolution_error(e.to_string()))?;
            match (indices.iter().min(), indices.iter().max()) {
                (Some(&min), Some(&max)) => Some((min, max)),
                _ => {
                    return Err(resolution_error(format!(
                        "no {run_gate}_t*.ap.bin files found"
                    )))
                }
            }
        } else {
            None
        };

        let pick = |bound: TriggerBound| match (bound, span) {
            (TriggerBound::Index(i), _) => i,
            (TriggerBound::Start, Some((min, _))) => min,
            (TriggerBound::End, Some((_, max))) => max,
            // span is always Some when a symbolic bound is present
            (_, None) => 0,
        };

        let resolved = ResolvedTriggers {
            first: pick(self.first),
            last: pick(self.last),
        };
        if resolved.first > resolved.last {
            return Err(resolution_error(format!(
                "first trigger {} is after last trigger {}",
                resolved.first, resolved.last
            )));
        }

        debug!(expr = %self, resolved = %resolved, "Resolved trigger range");
        Ok(resolved)
    }
}

/// Trigger indices of all AP binaries for `run_gate` in `folder`.
fn trigger_indices(folder: &Path, run_gate: &str) -> std::io::Result<Vec<u32>> {
    let pattern = format!(r"^{}_t(\d+)\.imec[^.]*\.ap\.bin$", regex::escape(run_gate));
    let re = Regex::new(&pattern).map_err(|e| std::io::Error::other(e.to_string()))?;

    let mut indices = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(index) = re
            .captures(&name)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            indices.push(index);
        }
    }
    Ok(indices)
}
