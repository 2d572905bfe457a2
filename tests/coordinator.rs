//! Full executions against a scripted controller and shell-script generators.

use std::path::Path;
use std::sync::Arc;

use ctlbench::config::{BenchConfig, CountSourceKind, DimensionConfig, NodeConfig, TestKind};
use ctlbench::dimensions::DimensionValue;
use ctlbench::error::TestError;
use ctlbench::run::Coordinator;
use ctlbench::sample::{FixedProbe, Measurement};
use ctlbench::test_utils::{write_script, ScriptedController};
use ctlbench::transport::LocalTransport;

fn ints(name: &str, values: &[i64]) -> DimensionConfig {
    DimensionConfig {
        name: name.to_string(),
        values: values.iter().copied().map(DimensionValue::Int).collect(),
    }
}

fn base_config(generator_dir: &Path, output_dir: &Path) -> BenchConfig {
    let mut config = BenchConfig::default();
    config.test.output_dir = output_dir.to_path_buf();
    config.controller.base_dir = "/opt/odl".into();
    config.controller.poll_interval_ms = 5;
    config.controller.start_timeout_secs = 1;
    config.generator.base_dir = generator_dir.to_path_buf();
    config.monitor.channel_timeout_secs = 5;
    config
}

fn coordinator(config: BenchConfig, fake: &Arc<ScriptedController>) -> Coordinator {
    Coordinator::new(config, fake.clone(), Arc::new(LocalTransport))
        .unwrap()
        .with_probe(Arc::new(FixedProbe::default()))
}

#[tokio::test]
async fn test_sample_ids_contiguous_across_combinations() {
    let gen_dir = tempfile::TempDir::new().unwrap();
    let out_dir = tempfile::TempDir::new().unwrap();
    write_script(
        gen_dir.path(),
        "run_handler.sh",
        "echo 'total = 1.0 per ms'\necho 'total = 2.0 per ms'",
    );

    let mut config = base_config(gen_dir.path(), out_dir.path());
    config.dimensions.push(ints("threads", &[1, 2]));
    config.test.test_repeats = Some(2);

    let fake = Arc::new(ScriptedController::new());
    let report = coordinator(config, &fake).run().await.unwrap();

    let ids: Vec<u64> = report.samples.iter().map(|s| s.global_sample_id).collect();
    assert_eq!(ids, (0..8).collect::<Vec<_>>());
    assert_eq!(report.failed_combinations, 0);
    assert_eq!(report.summary.failed_samples, 0);
    assert_eq!(report.summary.mean, Some(1500.0));

    // initial-state cycle plus one per combination
    let state = fake.state();
    assert_eq!(state.start_calls, 5);
    assert_eq!(state.stop_calls, 5);
    assert_eq!(state.clean_calls, 1);
    assert!(!state.running);
    drop(state);

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report.results_path).unwrap()).unwrap();
    let rows = written.as_array().unwrap();
    assert_eq!(rows.len(), 8);
    assert_eq!(rows[0]["threads"], 1);
    assert_eq!(rows[0]["repeat_id"], 0);
    assert_eq!(rows[2]["repeat_id"], 1);
    assert_eq!(rows[7]["threads"], 2);
    // unswept load settings are stamped too
    assert_eq!(rows[0]["generator_total_switches"], 50);
    assert_eq!(rows[7]["generator_total_switches"], 100);
    assert_eq!(rows[7]["generator_ms_per_test"], 10_000);
    assert_eq!(rows[7]["generator_mode"], "Latency");
    assert_eq!(rows[7]["controller_port"], 6653);

    assert!(report
        .to_string()
        .contains("8 samples (0 failed), 0 failed combination(s)"));
}

#[tokio::test]
async fn test_failed_combination_degrades_to_failed_sample() {
    let gen_dir = tempfile::TempDir::new().unwrap();
    let out_dir = tempfile::TempDir::new().unwrap();
    // $4 is the thread count
    write_script(
        gen_dir.path(),
        "run_handler.sh",
        "echo 'total = 3.0 per ms'\nif [ \"$4\" = \"2\" ]; then exit 3; fi",
    );

    let ctl_dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(ctl_dir.path().join("data")).unwrap();
    std::fs::write(ctl_dir.path().join("data/karaf.log"), "booted").unwrap();

    let mut config = base_config(gen_dir.path(), out_dir.path());
    config.controller.base_dir = ctl_dir.path().to_path_buf();
    config.controller.logs_dir = Some("data".into());
    config.dimensions.push(ints("threads", &[1, 2, 3]));

    let fake = Arc::new(ScriptedController::new());
    let report = coordinator(config, &fake).run().await.unwrap();

    assert_eq!(report.failed_combinations, 1);
    // logs of the failed combination, then of the whole execution
    assert_eq!(
        std::fs::read_to_string(out_dir.path().join("log/failed-1/karaf.log")).unwrap(),
        "booted"
    );
    assert!(!out_dir.path().join("log/failed-0").exists());
    assert!(out_dir.path().join("log/karaf.log").exists());
    let ids: Vec<u64> = report.samples.iter().map(|s| s.global_sample_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert!(report.samples[2].is_failure());
    assert_eq!(report.samples[2].throughput(), Some(-1.0));
    // the third combination still ran
    assert_eq!(report.samples[3].throughput(), Some(3000.0));
    assert_eq!(fake.state().start_calls, 4);
}

#[tokio::test]
async fn test_start_timeout_is_caught_per_combination() {
    let gen_dir = tempfile::TempDir::new().unwrap();
    let out_dir = tempfile::TempDir::new().unwrap();
    write_script(gen_dir.path(), "run_handler.sh", "echo 'total = 1 per ms'");

    let mut config = base_config(gen_dir.path(), out_dir.path());
    config.dimensions.push(ints("threads", &[1, 2]));

    let fake = Arc::new(ScriptedController::new());
    // only the pre-flight start binds the port
    fake.state().listen_limit = Some(1);

    let report = coordinator(config, &fake).run().await.unwrap();
    assert_eq!(report.failed_combinations, 2);
    assert!(report.samples.iter().all(|s| s.is_failure()));
    let ids: Vec<u64> = report.samples.iter().map(|s| s.global_sample_id).collect();
    assert_eq!(ids, vec![0, 1]);
}

#[tokio::test]
async fn test_missing_handler_aborts_before_any_combination() {
    let gen_dir = tempfile::TempDir::new().unwrap();
    let out_dir = tempfile::TempDir::new().unwrap();
    write_script(gen_dir.path(), "run_handler.sh", "echo 'total = 1 per ms'");

    let config = base_config(gen_dir.path(), out_dir.path());
    let fake = Arc::new(ScriptedController::new());
    fake.state().missing = vec!["start_handler.sh".to_string()];

    let err = coordinator(config, &fake).run().await.unwrap_err();
    let cause = err.downcast_ref::<TestError>().unwrap();
    assert!(matches!(cause, TestError::HandlerMissing { .. }));
    assert_eq!(fake.state().start_calls, 0);
}

#[tokio::test]
async fn test_missing_generator_handler_is_fatal() {
    let gen_dir = tempfile::TempDir::new().unwrap();
    let out_dir = tempfile::TempDir::new().unwrap();

    let config = base_config(gen_dir.path(), out_dir.path());
    let fake = Arc::new(ScriptedController::new());
    let err = coordinator(config, &fake).check_handlers().await.unwrap_err();
    match err {
        TestError::HandlerMissing { path } => assert!(path.ends_with("run_handler.sh")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_port_taken_fails_preflight() {
    let gen_dir = tempfile::TempDir::new().unwrap();
    let out_dir = tempfile::TempDir::new().unwrap();
    write_script(gen_dir.path(), "run_handler.sh", "true");

    let config = base_config(gen_dir.path(), out_dir.path());
    let fake = Arc::new(ScriptedController::new());
    fake.state().foreign_listener = true;

    assert!(coordinator(config, &fake).run().await.is_err());
    assert_eq!(fake.state().start_calls, 0);

    let written = std::fs::read_to_string(out_dir.path().join("results.json")).unwrap();
    let rows: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(rows, serde_json::json!([]));
}

#[tokio::test]
async fn test_remote_controller_counters_come_from_its_node() {
    let gen_dir = tempfile::TempDir::new().unwrap();
    let out_dir = tempfile::TempDir::new().unwrap();
    write_script(gen_dir.path(), "run_handler.sh", "echo 'total = 1 per ms'");

    let mut config = base_config(gen_dir.path(), out_dir.path());
    config.controller.node = Some(NodeConfig {
        host: "10.0.0.5".into(),
        ssh_port: 22,
        user: "ops".into(),
        identity_file: None,
    });

    let fake = Arc::new(ScriptedController::new());
    let report = Coordinator::new(config, fake.clone(), Arc::new(LocalTransport))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.samples.len(), 1);
    let resources = &report.samples[0].resources;
    assert_eq!(resources.one_minute_load, Some(0.5));
    assert_eq!(resources.total_memory_bytes, Some(8_000_000_000));
    assert_eq!(resources.controller_memory_bytes, Some(204_800 * 1024));
    assert!(fake
        .state()
        .invocations
        .iter()
        .any(|inv| inv.program == "ps"));
}

#[tokio::test]
async fn test_discovery_execution_with_stats_period_sweep() {
    let gen_dir = tempfile::TempDir::new().unwrap();
    let out_dir = tempfile::TempDir::new().unwrap();
    write_script(gen_dir.path(), "run_handler.sh", "exec sleep 30");

    let mut config = base_config(gen_dir.path(), out_dir.path());
    config.test.kind = TestKind::Discovery;
    config.watcher.source = CountSourceKind::Handler;
    config.watcher.count_handler = Some("count_switches.sh".into());
    config.watcher.poll_interval_ms = 5;
    config.generator.switches_per_thread = 2;
    config.dimensions.push(ints("controller_statistics_period_ms", &[1000, 5000]));

    let fake = Arc::new(ScriptedController::new());
    fake.state().counts = [2].into_iter().collect();

    let report = coordinator(config, &fake).run().await.unwrap();
    assert_eq!(report.samples.len(), 2);
    for (i, sample) in report.samples.iter().enumerate() {
        assert_eq!(sample.global_sample_id, i as u64);
        assert!(matches!(
            sample.measurement,
            Measurement::Discovery {
                discovered_switches: 2,
                discovery_converged: true,
                ..
            }
        ));
    }
    assert_eq!(
        fake.state().stats_periods,
        vec!["1000".to_string(), "5000".to_string()]
    );
}
