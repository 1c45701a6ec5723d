use std::path::PathBuf;
use std::time::Duration;

use ats_core::{
    BootEvidence, Phase, RunContext, RunId, RunResult, RunStatus, TestOutcome, TestStatus, AGGREGATE_TEST_NAME,
};

fn context() -> RunContext {
    RunContext {
        run_id: RunId::from_str("r1"),
        workspace: PathBuf::from("/work"),
        results_dir: PathBuf::from("/work/results"),
        manifest_path: PathBuf::from("/work/ats-manifest.yaml"),
        manifest_version: 1,
        artifact_name: "firmware.bin".into(),
        build_number: "42".into(),
        device_target: "esp32".into(),
        test_plan: vec!["boot".into()],
        port: None,
    }
}

#[test]
fn test_artifact_path_joins_workspace() {
    assert_eq!(context().artifact_path(), PathBuf::from("/work/firmware.bin"));
}

#[test]
fn test_manifest_summary_copies_fields() {
    let summary = context().manifest_summary();
    assert_eq!(summary.build_number, "42");
    assert_eq!(summary.device_target, "esp32");
}

#[test]
fn test_run_id_new_is_unique() {
    assert_ne!(RunId::new(), RunId::new());
}

#[test]
fn test_status_strings() {
    assert_eq!(TestStatus::Skip.as_str(), "SKIP");
    assert_eq!(RunStatus::Fail.exit_code(), 1);
    assert_eq!(RunStatus::Pass.exit_code(), 0);
}

#[test]
fn test_evidence_token_lookup() {
    let tokens = vec!["Guru Meditation Error".to_string(), "ESP-IDF".to_string()];
    let ev = BootEvidence::new(b"I (31) boot: ESP-IDF v5.1".to_vec(), Duration::from_millis(20));
    assert_eq!(ev.first_token(&tokens), Some("ESP-IDF"));

    let rec = ev.record(&tokens);
    assert_eq!(rec.since_reset_ms, 20);
    assert_eq!(rec.bytes, 25);
    assert_eq!(rec.token.as_deref(), Some("ESP-IDF"));
    assert_eq!(rec.captured_at, ev.captured_at);
}

#[test]
fn test_single_skip_after_flash_is_pass() {
    let tests = vec![TestOutcome::skip(AGGREGATE_TEST_NAME, "Test runner not found")];
    assert_eq!(RunResult::verdict(true, &tests), RunStatus::Pass);
}

#[test]
fn test_phase_terminal() {
    assert!(Phase::Done.is_terminal());
    assert!(!Phase::Reporting.is_terminal());
}
