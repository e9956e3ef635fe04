//! Ecephys pipeline CLI
//!
//! The `ecephys` command drives SpikeGLX recordings through CatGT, the
//! per-probe module chain and TPrime.
//!
//! ## Commands
//!
//! - `run`: Execute every run in the configuration
//! - `plan`: Print the artifact layout without invoking anything

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use ecephys_pipeline::{
    plan, BatchOutcome, FileLogSource, Pipeline, PipelineConfig, RunPlan, VERSION,
};

#[derive(Parser)]
#[command(name = "ecephys")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-probe SpikeGLX pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines (and JSON plan output)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured recording through the pipeline
    Run {
        /// Pipeline configuration (TOML)
        #[arg(short, long, env = "ECEPHYS_CONFIG")]
        config: PathBuf,

        /// Reuse existing CatGT output instead of running CatGT
        #[arg(long)]
        skip_preprocessing: bool,

        /// Do not run TPrime after the per-probe chains
        #[arg(long)]
        no_alignment: bool,
    },

    /// Print each run's resolved layout without invoking any stage
    Plan {
        /// Pipeline configuration (TOML)
        #[arg(short, long, env = "ECEPHYS_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ecephys_pipeline::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            skip_preprocessing,
            no_alignment,
        } => cmd_run(&config, skip_preprocessing, no_alignment).await,
        Commands::Plan { config } => cmd_plan(&config, cli.json),
    }
}

fn load_config(path: &Path, skip_preprocessing: bool, no_alignment: bool) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    if skip_preprocessing {
        config.preprocessing.enabled = false;
    }
    if no_alignment {
        config.alignment.enabled = false;
    }
    Ok(config)
}

async fn cmd_run(config_path: &Path, skip_preprocessing: bool, no_alignment: bool) -> Result<()> {
    let config = load_config(config_path, skip_preprocessing, no_alignment)?;
    info!(
        version = VERSION,
        runs = config.runs.len(),
        preprocessing = config.preprocessing.enabled,
        alignment = config.alignment.enabled,
        "Starting batch"
    );

    let invoker = config.process_invoker();
    let log_source = FileLogSource::in_dir(&config.working_directory);
    let batch = Pipeline::new(&config, &invoker, &log_source)
        .run_batch()
        .await
        .context("Pipeline failed to start")?;

    print_batch(&batch);
    println!(
        "Provenance log: {}",
        config.provenance_path().display()
    );

    if batch.success() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} of {} runs failed",
            batch.failed_count(),
            batch.runs.len()
        )
    }
}

fn print_batch(batch: &BatchOutcome) {
    for run in &batch.runs {
        let status = if run.succeeded() { "✓" } else { "✗" };
        println!(
            "  {} {} ({}ms, probes: {})",
            status,
            run.session,
            run.duration_ms,
            run.completed_probes.join(",")
        );
        if let Some(error) = &run.error {
            println!("      {}", error);
        }
        for warning in &run.warnings {
            println!("      warning: {}", warning);
        }
    }
    println!();
    println!(
        "Summary: {}/{} runs succeeded",
        batch.succeeded_count(),
        batch.runs.len()
    );
}

fn cmd_plan(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path, false, false)?;
    let plans = plan(&config).context("Failed to build plan")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
    } else {
        for run in &plans {
            print!("{}", render_plan(run));
        }
    }
    Ok(())
}

fn render_plan(run: &RunPlan) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", run.session));
    out.push_str(&format!("  destination: {}\n", run.session_dir.display()));
    out.push_str(&format!("  modules:     {}\n", run.modules.join(", ")));
    for probe in &run.probes {
        out.push_str(&format!("  probe {}\n", probe.label));
        out.push_str(&format!("    raw:       {}\n", probe.raw_folder.display()));
        match &probe.triggers {
            Ok(t) => out.push_str(&format!("    triggers:  {}\n", t)),
            Err(reason) => out.push_str(&format!("    triggers:  unresolved ({reason})\n")),
        }
        out.push_str(&format!(
            "    output:    {}\n",
            probe.location.canonical_dir.display()
        ));
        out.push_str(&format!("    extract:  {}\n", probe.extraction_args));
        match &probe.sync_edge_path {
            Some(path) => out.push_str(&format!("    sync:      {}\n", path.display())),
            None => out.push_str("    sync:      none\n"),
        }
    }
    if !run.alignment {
        out.push_str("  alignment disabled\n");
    }
    out
}
