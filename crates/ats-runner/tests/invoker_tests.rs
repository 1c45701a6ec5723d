#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ats_core::*;
use ats_runner::*;
use tempfile::{tempdir, TempDir};

// Writing a script while another test thread forks can make exec fail with ETXTBSY.
static SPAWN: Mutex<()> = Mutex::new(());

struct Bench {
    dir: TempDir,
    ctx: RunContext,
}

impl Bench {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(workspace.join("demo")).unwrap();
        let ctx = RunContext {
            run_id: RunId::from_str("run-inv"),
            results_dir: dir.path().join("results"),
            manifest_path: workspace.join("ats-manifest.yaml"),
            workspace,
            manifest_version: 1,
            artifact_name: "fw.bin".into(),
            build_number: "9".into(),
            device_target: "esp32".into(),
            test_plan: vec![],
            port: None,
        };
        std::fs::create_dir_all(&ctx.results_dir).unwrap();
        Self { dir, ctx }
    }

    fn script(&self, body: &str) -> PathBuf {
        let path = self.ctx.workspace.join("demo").join("run_tests.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn invoker(&self, path: PathBuf) -> TestInvoker {
        TestInvoker::new(path, self.ctx.workspace.join("demo"), Config::default().procedure.boot_tokens)
    }

    fn evidence(&self, bytes: &[u8]) -> PathBuf {
        ats_artifacts::save_evidence(&self.ctx.results_dir, bytes).unwrap()
    }

    fn results(&self) -> &Path {
        &self.ctx.results_dir
    }
}

#[test]
fn absent_procedure_is_skipped() {
    let bench = Bench::new();
    let sink = MemorySink::new();
    let inv = bench.invoker(bench.dir.path().join("missing.sh")).invoke(&bench.ctx, None, None, &sink);
    assert_eq!(inv.outcomes, vec![TestOutcome::skip(AGGREGATE_TEST_NAME, "Test runner not found")]);
    assert!(!inv.invoked);
    assert!(sink.events().iter().any(|e| matches!(e, RunEvent::Diagnostic { remedy: Some(Remedy::CheckTestProcedure), .. })));
}

#[test]
fn failing_procedure_reports_stderr() {
    let _guard = SPAWN.lock().unwrap_or_else(|e| e.into_inner());
    let bench = Bench::new();
    let path = bench.script("echo running checks\necho 'gpio_blink: pin 2 stuck low' >&2\nexit 1");
    let inv = bench.invoker(path).invoke(&bench.ctx, Some("/dev/ttyUSB0"), None, &MemorySink::new());
    assert_eq!(inv.outcomes, vec![TestOutcome::fail(AGGREGATE_TEST_NAME, "gpio_blink: pin 2 stuck low\n")]);
    assert!(!inv.reconciled);
    assert_eq!(std::fs::read_to_string(bench.results().join(STDOUT_LOG)).unwrap(), "running checks\n");
    assert_eq!(std::fs::read_to_string(bench.results().join(STDERR_LOG)).unwrap(), "gpio_blink: pin 2 stuck low\n");
}

#[test]
fn environment_contract_is_passed() {
    let _guard = SPAWN.lock().unwrap_or_else(|e| e.into_inner());
    let bench = Bench::new();
    let evidence = bench.evidence(b"rst:0x1 (POWERON_RESET)");
    let path = bench.script(
        "printf '%s\\n' \"$1\" \"$RESULTS_DIR\" \"$TEST_REPORT_DIR\" \"$WORKSPACE\" \"$SERIAL_PORT\" \"$BOOT_EVIDENCE_PATH\" \"$(pwd)\" > \"$RESULTS_DIR/env.txt\"",
    );
    let inv = bench.invoker(path).invoke(&bench.ctx, Some("/dev/ttyACM0"), Some(&evidence), &MemorySink::new());
    assert_eq!(inv.outcomes[0].status, TestStatus::Pass);

    let env = std::fs::read_to_string(bench.results().join("env.txt")).unwrap();
    let lines: Vec<_> = env.lines().collect();
    assert_eq!(lines[0], bench.ctx.manifest_path.display().to_string());
    assert_eq!(lines[1], bench.results().display().to_string());
    assert_eq!(lines[2], bench.results().display().to_string());
    assert_eq!(lines[3], bench.ctx.workspace.display().to_string());
    assert_eq!(lines[4], "/dev/ttyACM0");
    assert_eq!(lines[5], evidence.display().to_string());
    assert!(lines[6].ends_with("demo"), "{}", lines[6]);
}

#[test]
fn captured_evidence_overrides_procedure_boot_failure() {
    let _guard = SPAWN.lock().unwrap_or_else(|e| e.into_inner());
    let bench = Bench::new();
    let evidence = bench.evidence(b"ESP-ROM:esp32s3-20210327\r\nrst:0xc (RTC_SW_CPU_RST)");
    let path = bench.script("echo 'UART boot validation FAILED'\nexit 2");
    let sink = MemorySink::new();
    let inv = bench.invoker(path).invoke(&bench.ctx, None, Some(&evidence), &sink);

    assert_eq!(inv.outcomes, vec![TestOutcome::pass(AGGREGATE_TEST_NAME)]);
    assert!(inv.reconciled);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, RunEvent::OutcomeReconciled { from: TestStatus::Fail, to: TestStatus::Pass, .. })));
}

#[test]
fn unrunnable_procedure_fails() {
    let _guard = SPAWN.lock().unwrap_or_else(|e| e.into_inner());
    let bench = Bench::new();
    let path = bench.script("exit 0");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
    let inv = bench.invoker(path).invoke(&bench.ctx, None, None, &MemorySink::new());
    assert_eq!(inv.outcomes.len(), 1);
    assert_eq!(inv.outcomes[0].status, TestStatus::Fail);
    assert!(inv.outcomes[0].detail.contains("could not run"));
}
