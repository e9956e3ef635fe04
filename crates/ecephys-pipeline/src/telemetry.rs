//! Tracing setup and run lifecycle events.
//!
//! Filtering follows `RUST_LOG` when set. Otherwise the pipeline crates log
//! at the level passed in and everything else (tokio, the subprocess
//! plumbing) only at `warn`. Log lines go to stderr so `plan --json` output
//! on stdout stays machine-readable.

use tracing::{info, warn, Level, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Crate targets that follow the requested level.
const PIPELINE_TARGETS: [&str; 2] = ["ecephys_pipeline", "ecephys"];

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(PIPELINE_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let layer = if json { layer.json().boxed() } else { layer.boxed() };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .ok();
}

/// Span covering one run; every stage event of the run is nested in it.
pub fn run_span(session: &str, run_id: &str) -> Span {
    tracing::info_span!("ecephys.run", session = %session, run_id = %run_id)
}

pub fn emit_run_started(session: &str, probes: usize) {
    info!(event = "run.started", session = %session, probes);
}

pub fn emit_state(session: &str, state: &dyn std::fmt::Display) {
    info!(event = "run.state", session = %session, state = %state);
}

pub fn emit_run_finished(session: &str, duration_ms: u64, probes: usize) {
    info!(event = "run.finished", session = %session, duration_ms, probes);
}

/// A run failed; the batch carries on with the next run.
pub fn emit_run_failed(session: &str, stage: Option<&str>, error: &dyn std::fmt::Display) {
    warn!(
        event = "run.failed",
        session = %session,
        stage = stage.unwrap_or("-"),
        error = %error,
    );
}
