//! End-to-end runs against the recording invoker.

use std::ops::RangeInclusive;
use std::path::PathBuf;

use ecephys_pipeline::fakes::RecordingInvoker;
use ecephys_pipeline::{
    FileLogSource, LogParseWarning, Pipeline, PipelineConfig, PipelineError, ProbeSpec, RunSpec,
    RunState, CATGT_LOG,
};
use serde_json::Value;

struct Fixture {
    _root: tempfile::TempDir,
    config: PipelineConfig,
}

impl Fixture {
    fn new(runs: Vec<RunSpec>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::new(
            root.path().join("npx"),
            root.path().join("dest"),
            root.path().join("json"),
        );
        config.working_directory = root.path().join("work");
        std::fs::create_dir_all(&config.working_directory).unwrap();
        config.modules = vec![
            "kilosort_helper".to_string(),
            "kilosort_postprocessing".to_string(),
            "mean_waveforms".to_string(),
        ];
        config.runs = runs;
        Self {
            _root: root,
            config,
        }
    }

    fn with_raw_files(self, run: &str, probe: &str, triggers: RangeInclusive<u32>) -> Self {
        let folder = self.config.npx_directory.join(probe).join(run).join("20181126");
        std::fs::create_dir_all(&folder).unwrap();
        for t in triggers {
            std::fs::write(folder.join(format!("{run}_g0_t{t}.imec.ap.bin")), b"").unwrap();
        }
        self
    }

    /// The same trigger files for both probes of `two_probe_run`.
    fn with_recording(self, run: &str, triggers: RangeInclusive<u32>) -> Self {
        self.with_raw_files(run, "ww2", triggers.clone())
            .with_raw_files(run, "ww4", triggers)
    }

    fn invoker(&self) -> RecordingInvoker {
        RecordingInvoker::new().with_catgt_log(self.config.working_directory.join(CATGT_LOG))
    }

    fn log_source(&self) -> FileLogSource {
        FileLogSource::in_dir(&self.config.working_directory)
    }

    fn provenance_rows(&self) -> Vec<String> {
        std::fs::read_to_string(self.config.provenance_path())
            .unwrap()
            .lines()
            .skip(1)
            .map(str::to_string)
            .collect()
    }

    fn canonical_dir(&self, run: &str, probe: &str) -> PathBuf {
        self.config
            .dest_parent
            .join(format!("{run}_20181126_g0"))
            .join(format!("catgt_{run}_20181126{probe}_g0"))
    }
}

fn two_probe_run(name: &str) -> RunSpec {
    RunSpec {
        name: name.to_string(),
        date: "20181126".to_string(),
        gate: 0,
        triggers: "start,end".parse().unwrap(),
        probes: vec![ProbeSpec::new("ww2", Some(384)), ProbeSpec::new("ww4", Some(384))],
    }
}

fn path_param(config: &Value) -> &str {
    config.as_str().unwrap_or_default()
}

#[tokio::test]
async fn test_two_probe_run_end_to_end() {
    let fixture = Fixture::new(vec![two_probe_run("dl56")]).with_recording("dl56", 0..=3);
    let invoker = fixture
        .invoker()
        .with_edit_rate("ww2", 0.010)
        .with_edit_rate("ww4", 0.025);
    let log_source = fixture.log_source();

    let batch = Pipeline::new(&fixture.config, &invoker, &log_source)
        .run_batch()
        .await
        .expect("batch should start");

    assert!(batch.success(), "run should succeed: {:?}", batch.runs[0].error);
    let outcome = &batch.runs[0];
    assert_eq!(outcome.session.as_str(), "dl56_20181126_g0");
    let triggers: Vec<String> = outcome
        .triggers
        .iter()
        .map(|(label, t)| format!("{label}={t}"))
        .collect();
    assert_eq!(triggers, vec!["ww2=0,3", "ww4=0,3"]);
    assert_eq!(outcome.completed_probes, vec!["ww2", "ww4"]);

    // Per probe: catGT then three modules; one alignment at the end.
    assert_eq!(invoker.count("catGT_helper"), 2);
    assert_eq!(invoker.count("kilosort_helper"), 2);
    assert_eq!(invoker.count("tPrime_helper"), 1);
    assert_eq!(invoker.stages().last().map(String::as_str), Some("tPrime_helper"));

    let catgt = &invoker.invocations()[0];
    assert_eq!(catgt.config.get("trigger_string"), Some(&Value::from("0,3")));
    let cmd = catgt.config.get("catGT_cmd_string").map(path_param).unwrap_or_default();
    assert!(cmd.starts_with("-aphipass=300"));
    assert!(cmd.contains("-SY=0,384,0,0"), "{cmd}");

    // Output was moved into the per-probe folder and the sorter points there.
    assert!(fixture.canonical_dir("dl56", "ww2").join("dl56_g0_tcat.imec.ap.bin").exists());
    assert!(fixture.canonical_dir("dl56", "ww4").is_dir());
    let sort = invoker
        .invocations()
        .into_iter()
        .find(|i| i.stage == "kilosort_helper" && i.probe.as_deref() == Some("ww4"))
        .unwrap();
    let sort_dir = sort
        .config
        .get("kilosort_output_directory")
        .map(path_param)
        .unwrap_or_default()
        .to_string();
    assert!(sort_dir.ends_with("imec_ww4_ks2"), "{sort_dir}");
    assert_eq!(sort.config.get("catGT_gfix_edits"), Some(&Value::from(0.025)));
    assert_eq!(sort.config.get("ks_make_copy"), Some(&Value::from(true)));

    // Alignment: ww2 is the reference, ww4 maps onto it.
    let tprime = invoker
        .invocations()
        .into_iter()
        .find(|i| i.stage == "tPrime_helper")
        .unwrap();
    let to_stream = tprime.config.get("toStream_path_3A").map(path_param).unwrap_or_default();
    assert!(to_stream.contains("catgt_dl56_20181126ww2_g0"), "{to_stream}");
    let from = tprime
        .config
        .get("fromStream_list_3A")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    assert_eq!(from.len(), 1);
    assert!(path_param(&from[0]).contains("catgt_dl56_20181126ww4_g0"));

    let rows = fixture.provenance_rows();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].contains(",ww2,0.010,"), "{}", rows[0]);
    assert!(rows[1].contains(",ww4,0.025,"), "{}", rows[1]);

    assert_eq!(outcome.history.first(), Some(&RunState::Resolving));
    assert!(outcome.history.contains(&RunState::Sequencing {
        probe: "ww4".to_string(),
        module_index: 2
    }));
    assert_eq!(outcome.history.iter().rev().nth(1), Some(&RunState::Aligning));
    assert_eq!(outcome.state, RunState::Done);
}

#[tokio::test]
async fn test_rerun_without_preprocessing_reuses_output() {
    let mut fixture = Fixture::new(vec![two_probe_run("dl56")]).with_recording("dl56", 0..=1);
    let log_source = fixture.log_source();

    let first = fixture.invoker().with_edit_rate("ww2", 0.5);
    let batch = Pipeline::new(&fixture.config, &first, &log_source)
        .run_batch()
        .await
        .unwrap();
    assert!(batch.success());

    fixture.config.preprocessing.enabled = false;
    let second = fixture.invoker();
    let batch = Pipeline::new(&fixture.config, &second, &log_source)
        .run_batch()
        .await
        .unwrap();

    assert!(batch.success(), "{:?}", batch.runs[0].error);
    assert_eq!(second.count("catGT_helper"), 0);
    assert_eq!(second.count("kilosort_helper"), 2);
    assert_eq!(second.count("tPrime_helper"), 1);

    // The log is shared by every batch in the process; the second batch
    // appends and skipped preprocessing reports zero.
    let rows = fixture.provenance_rows();
    assert_eq!(rows.len(), 4);
    assert!(rows[0].contains(",ww2,0.500,"), "{}", rows[0]);
    assert!(rows[2..].iter().all(|r| r.contains(",0.000,")));
}

#[tokio::test]
async fn test_failed_run_does_not_stop_batch() {
    let missing = two_probe_run("dl99");
    let fixture = Fixture::new(vec![missing, two_probe_run("dl56")]).with_recording("dl56", 0..=0);
    let invoker = fixture.invoker();
    let log_source = fixture.log_source();

    let batch = Pipeline::new(&fixture.config, &invoker, &log_source)
        .run_batch()
        .await
        .unwrap();

    assert_eq!(batch.failed_count(), 1);
    assert_eq!(batch.succeeded_count(), 1);

    let failed = &batch.runs[0];
    assert!(matches!(failed.error, Some(PipelineError::Resolution { .. })));
    assert!(matches!(failed.state, RunState::Failed { .. }));
    assert!(failed.accumulator.is_empty());
    assert!(batch.runs[1].succeeded());

    // Only the second run reached any stage.
    assert!(invoker
        .invocations()
        .iter()
        .all(|i| i.config.get("catGT_run_name") != Some(&Value::from("dl99"))));
}

#[tokio::test]
async fn test_stage_failure_stops_run_after_completed_probes() {
    let fixture = Fixture::new(vec![two_probe_run("dl56")]).with_recording("dl56", 0..=0);
    let invoker = fixture.invoker().fail_on("catGT_helper", Some("ww4"), 2);
    let log_source = fixture.log_source();

    let batch = Pipeline::new(&fixture.config, &invoker, &log_source)
        .run_batch()
        .await
        .unwrap();

    let outcome = &batch.runs[0];
    match &outcome.error {
        Some(PipelineError::StageExecution {
            stage,
            probe,
            exit_code,
            ..
        }) => {
            assert_eq!(stage, "catGT_helper");
            assert_eq!(probe.as_deref(), Some("ww4"));
            assert_eq!(*exit_code, 2);
        }
        other => panic!("expected stage failure, got {other:?}"),
    }
    assert_eq!(outcome.completed_probes, vec!["ww2"]);
    assert_eq!(invoker.count("tPrime_helper"), 0);
    assert_eq!(fixture.provenance_rows().len(), 1);
}

#[tokio::test]
async fn test_populated_canonical_folder_is_a_conflict() {
    let fixture = Fixture::new(vec![two_probe_run("dl56")]).with_recording("dl56", 0..=0);
    let stale = fixture.canonical_dir("dl56", "ww2");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("old_tcat.imec.ap.bin"), b"old").unwrap();

    let invoker = fixture.invoker();
    let log_source = fixture.log_source();
    let batch = Pipeline::new(&fixture.config, &invoker, &log_source)
        .run_batch()
        .await
        .unwrap();

    assert!(matches!(
        batch.runs[0].error,
        Some(PipelineError::PathConflict { ref path }) if path == &stale
    ));
    assert_eq!(invoker.count("catGT_helper"), 0);
    assert!(stale.join("old_tcat.imec.ap.bin").exists());
}

#[tokio::test]
async fn test_stale_catgt_log_is_cleared() {
    let fixture = Fixture::new(vec![two_probe_run("dl56")]).with_recording("dl56", 0..=0);
    let log = fixture.config.working_directory.join(CATGT_LOG);
    std::fs::write(&log, "dl56_g0 Gfix prb 0 edits/sec 9.9\n").unwrap();

    // No rate configured: nothing new is logged for either probe.
    let invoker = RecordingInvoker::new();
    let log_source = fixture.log_source();
    let batch = Pipeline::new(&fixture.config, &invoker, &log_source)
        .run_batch()
        .await
        .unwrap();

    assert!(batch.success());
    assert!(!log.exists());
    assert!(!batch.runs[0].warnings.is_empty());
    assert!(fixture.provenance_rows().iter().all(|r| r.contains(",0.000,")));
}

#[tokio::test]
async fn test_misconfigured_run_fails_alone() {
    let mut bad = two_probe_run("dl99");
    bad.probes[0].sy_channel = None;
    let fixture = Fixture::new(vec![bad, two_probe_run("dl56")]).with_recording("dl56", 0..=0);
    let invoker = fixture.invoker();
    let log_source = fixture.log_source();

    let batch = Pipeline::new(&fixture.config, &invoker, &log_source)
        .run_batch()
        .await
        .expect("a bad run must not reject the batch");

    let failed = &batch.runs[0];
    match &failed.error {
        Some(PipelineError::Config(msg)) => assert!(msg.contains("reference probe"), "{msg}"),
        other => panic!("expected config error, got {other:?}"),
    }
    assert!(matches!(failed.state, RunState::Failed { .. }));
    assert!(batch.runs[1].succeeded(), "{:?}", batch.runs[1].error);
    assert!(invoker
        .invocations()
        .iter()
        .all(|i| i.config.get("catGT_run_name") != Some(&Value::from("dl99"))));
}

#[tokio::test]
async fn test_each_probe_uses_its_own_trigger_files() {
    let fixture = Fixture::new(vec![two_probe_run("dl56")])
        .with_raw_files("dl56", "ww2", 0..=3)
        .with_raw_files("dl56", "ww4", 2..=8);
    let invoker = fixture.invoker();
    let log_source = fixture.log_source();

    let batch = Pipeline::new(&fixture.config, &invoker, &log_source)
        .run_batch()
        .await
        .unwrap();
    assert!(batch.success(), "{:?}", batch.runs[0].error);

    let trigger_string = |stage: &str, probe: &str| {
        invoker
            .invocations()
            .into_iter()
            .find(|i| i.stage == stage && i.probe.as_deref() == Some(probe))
            .and_then(|i| i.config.get("trigger_string").cloned())
    };
    assert_eq!(trigger_string("catGT_helper", "ww2"), Some(Value::from("0,3")));
    assert_eq!(trigger_string("catGT_helper", "ww4"), Some(Value::from("2,8")));
    assert_eq!(trigger_string("kilosort_helper", "ww4"), Some(Value::from("2,8")));

    let outcome = &batch.runs[0];
    let ww4 = outcome.accumulator.get("ww4").unwrap();
    assert_eq!(ww4.triggers.to_string(), "2,8");

    // Alignment follows the reference probe's range.
    let tprime = invoker
        .invocations()
        .into_iter()
        .find(|i| i.stage == "tPrime_helper")
        .unwrap();
    assert_eq!(tprime.config.get("trigger_string"), Some(&Value::from("0,3")));
}

#[tokio::test]
async fn test_silent_probe_does_not_inherit_earlier_edit_rate() {
    let fixture = Fixture::new(vec![two_probe_run("dl56")]).with_recording("dl56", 0..=1);
    // ww2 logs a rate; ww4's CatGT run writes nothing to the log.
    let invoker = fixture.invoker().with_edit_rate("ww2", 0.010);
    let log_source = fixture.log_source();

    let batch = Pipeline::new(&fixture.config, &invoker, &log_source)
        .run_batch()
        .await
        .unwrap();
    assert!(batch.success(), "{:?}", batch.runs[0].error);

    let rows = fixture.provenance_rows();
    assert!(rows[0].contains(",ww2,0.010,"), "{}", rows[0]);
    assert!(rows[1].contains(",ww4,0.000,"), "{}", rows[1]);

    let outcome = &batch.runs[0];
    assert_eq!(outcome.accumulator.get("ww4").map(|r| r.edit_rate), Some(0.0));
    assert!(outcome
        .warnings
        .iter()
        .any(|w| matches!(w, LogParseWarning::MissingRecord { .. })));
    assert!(outcome.accumulator.get("ww2").unwrap().warnings.is_empty());
}
