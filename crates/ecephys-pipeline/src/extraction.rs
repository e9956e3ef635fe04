//! CatGT edge-extraction parameters.
//!
//! Each catalog entry becomes one `-SY=...` clause on the probe's CatGT
//! command line. The entry equal to the sync request also names the edge
//! file that TPrime later reads, so the path derivation here must stay
//! byte-for-byte stable between preprocessing and alignment.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Filler used for `event_ex_param_str` when no PSTH extraction applies.
pub const EVENT_PARAM_FILLER: &str = "SY=0,384,1,50";

/// Edge tolerance. `Default` lets CatGT use 20% of the span.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub enum Tolerance {
    #[default]
    Default,
    Millis(f64),
}

// Negative values (conventionally -1) select the default tolerance.
impl From<f64> for Tolerance {
    fn from(value: f64) -> Self {
        if value < 0.0 {
            Tolerance::Default
        } else {
            Tolerance::Millis(value)
        }
    }
}

impl From<Tolerance> for f64 {
    fn from(value: Tolerance) -> Self {
        match value {
            Tolerance::Default => -1.0,
            Tolerance::Millis(ms) => ms,
        }
    }
}

/// One named edge extraction: bit on the SY word, pulse span and tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub bit: u32,
    pub span_ms: u32,
    #[serde(default, rename = "tolerance_ms")]
    pub tolerance: Tolerance,
}

impl ExtractionRequest {
    pub fn new(bit: u32, span_ms: u32, tolerance: Tolerance) -> Self {
        Self {
            bit,
            span_ms,
            tolerance,
        }
    }

    /// CatGT clause for this request on `channel`, without the leading dash.
    pub fn clause(&self, channel: u32) -> String {
        match self.tolerance {
            Tolerance::Default => format!("SY=0,{},{},{}", channel, self.bit, self.span_ms),
            Tolerance::Millis(tol) => {
                format!("SY=0,{},{},{},{:.1}", channel, self.bit, self.span_ms, tol)
            }
        }
    }

    /// Name CatGT gives the extracted edge file for this request.
    pub fn edge_file_name(&self, run_gate: &str, channel: u32) -> String {
        format!(
            "{}_tcat.imec.SY_{}_{}_{}.txt",
            run_gate, channel, self.bit, self.span_ms
        )
    }
}

impl fmt::Display for ExtractionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bit {} span {}ms", self.bit, self.span_ms)?;
        if let Tolerance::Millis(tol) = self.tolerance {
            write!(f, " tol {tol}ms")?;
        }
        Ok(())
    }
}

/// Ordered extraction catalog plus the designated sync request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionCatalog {
    pub requests: Vec<ExtractionRequest>,
    pub sync: ExtractionRequest,
}

/// Extraction arguments and sync-edge path for one probe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractionPlan {
    /// Space-separated `-SY=` clauses, each with a leading space.
    pub args: String,

    /// Edge file for the sync request. `None` when the probe has no SY
    /// channel or the sync request is not in the catalog.
    pub sync_edge_path: Option<PathBuf>,
}

impl ExtractionCatalog {
    pub fn new(requests: Vec<ExtractionRequest>, sync: ExtractionRequest) -> Self {
        Self { requests, sync }
    }

    /// Whether the sync request is one of the catalog entries.
    pub fn contains_sync(&self) -> bool {
        self.requests.iter().any(|r| *r == self.sync)
    }

    /// Build the probe's extraction plan. `canonical_dir` is where the edge
    /// files end up after the preprocessing output is renamed.
    pub fn plan(&self, channel: Option<u32>, run_gate: &str, canonical_dir: &Path) -> ExtractionPlan {
        let Some(channel) = channel else {
            return ExtractionPlan::default();
        };

        let mut plan = ExtractionPlan::default();
        for request in &self.requests {
            plan.args.push_str(" -");
            plan.args.push_str(&request.clause(channel));
            if *request == self.sync && plan.sync_edge_path.is_none() {
                plan.sync_edge_path =
                    Some(canonical_dir.join(request.edge_file_name(run_gate, channel)));
            }
        }
        plan
    }

    /// `event_ex_param_str` for the PSTH module, or the filler when the
    /// index is out of range or the probe has no SY channel.
    pub fn event_param(&self, index: usize, channel: Option<u32>) -> String {
        match (self.requests.get(index), channel) {
            (Some(request), Some(channel)) => {
                format!("SY=0,{},{},{}", channel, request.bit, request.span_ms)
            }
            _ => EVENT_PARAM_FILLER.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ExtractionCatalog {
        ExtractionCatalog::new(
            vec![
                ExtractionRequest::new(0, 0, Tolerance::Default),
                ExtractionRequest::new(1, 50, Tolerance::Default),
                ExtractionRequest::new(1, 10, Tolerance::Default),
                ExtractionRequest::new(1, 1200, Tolerance::Millis(0.2)),
            ],
            ExtractionRequest::new(0, 0, Tolerance::Default),
        )
    }

    #[test]
    fn test_plan_args_concatenate_all_clauses() {
        let plan = catalog().plan(Some(384), "dl56_g0", Path::new("/out/catgt_x"));
        assert_eq!(
            plan.args,
            " -SY=0,384,0,0 -SY=0,384,1,50 -SY=0,384,1,10 -SY=0,384,1,1200,0.2"
        );
    }

    #[test]
    fn test_sync_edge_path_named_after_sync_request() {
        let plan = catalog().plan(Some(384), "dl56_g0", Path::new("/out/catgt_x"));
        assert_eq!(
            plan.sync_edge_path,
            Some(PathBuf::from("/out/catgt_x/dl56_g0_tcat.imec.SY_384_0_0.txt"))
        );
    }

    #[test]
    fn test_plan_is_deterministic() {
        let c = catalog();
        let a = c.plan(Some(384), "dl56_g0", Path::new("/out/p"));
        let b = c.plan(Some(384), "dl56_g0", Path::new("/out/p"));
        assert_eq!(a, b);
        assert_eq!(a.args.as_bytes(), b.args.as_bytes());
    }

    #[test]
    fn test_no_channel_skips_extraction() {
        let plan = catalog().plan(None, "dl56_g0", Path::new("/out/p"));
        assert!(plan.args.is_empty());
        assert!(plan.sync_edge_path.is_none());
    }

    #[test]
    fn test_sync_matched_by_identity_not_position() {
        let mut c = catalog();
        c.sync = ExtractionRequest::new(1, 10, Tolerance::Default);
        let plan = c.plan(Some(7), "r_g1", Path::new("/p"));
        assert_eq!(
            plan.sync_edge_path,
            Some(PathBuf::from("/p/r_g1_tcat.imec.SY_7_1_10.txt"))
        );

        // Same bit/span but a different tolerance is a different request.
        c.sync = ExtractionRequest::new(1, 1200, Tolerance::Default);
        assert!(!c.contains_sync());
        assert!(c.plan(Some(7), "r_g1", Path::new("/p")).sync_edge_path.is_none());
    }

    #[test]
    fn test_event_param() {
        let c = catalog();
        assert_eq!(c.event_param(1, Some(384)), "SY=0,384,1,50");
        assert_eq!(c.event_param(1, None), EVENT_PARAM_FILLER);
        assert_eq!(c.event_param(99, Some(384)), EVENT_PARAM_FILLER);
    }

    #[test]
    fn test_tolerance_sentinel_deserializes_to_default() {
        let req: ExtractionRequest =
            toml::from_str("bit = 1\nspan_ms = 50\ntolerance_ms = -1.0").unwrap();
        assert_eq!(req.tolerance, Tolerance::Default);

        let req: ExtractionRequest = toml::from_str("bit = 1\nspan_ms = 50").unwrap();
        assert_eq!(req.tolerance, Tolerance::Default);

        let req: ExtractionRequest =
            toml::from_str("bit = 1\nspan_ms = 1200\ntolerance_ms = 0.2").unwrap();
        assert_eq!(req.tolerance, Tolerance::Millis(0.2));
    }
}
