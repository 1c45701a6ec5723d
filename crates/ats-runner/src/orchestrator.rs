//! One bring-up: flash, wait for boot, reset, make sure boot evidence is fresh,
//! run the test procedure, report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;

use ats_artifacts::{default_emitters, emit_all, EvidenceStore, ReportEmitter};
use ats_core::{
    BootEvidence, Clock, EventSink, Phase, Remedy, RunContext, RunDetails, RunEvent, RunId, RunResult, SystemClock,
    TestOutcome, AGGREGATE_TEST_NAME,
};
use ats_flash::{image_digest, Esptool, FlashTool, Flasher};
use ats_manifest::Manifest;
use ats_serial::{BootChannel, PortRepair, Serial2Opener, SerialBootChannel, SysfsRecovery};

use crate::{Config, TestInvoker};

pub const FLASH_FAILED: &str = "Flash failed";
pub const NO_BOOT_EVIDENCE: &str = "Test runner not found and no boot output was captured";

/// Hardware-facing collaborators. Production wiring comes from [`Hardware::from_config`];
/// tests and fixture scenarios substitute doubles.
pub struct Hardware {
    pub tool: Arc<dyn FlashTool>,
    pub repair: Arc<dyn PortRepair>,
    pub channel: Arc<dyn BootChannel>,
    pub clock: Arc<dyn Clock>,
}

impl Hardware {
    pub fn from_config(cfg: &Config) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            tool: Arc::new(Esptool::new(cfg.esptool_settings())),
            repair: Arc::new(SysfsRecovery::new(
                &cfg.serial.sysfs_root,
                std::time::Duration::from_millis(cfg.serial.recovery_settle_ms),
                clock.clone(),
            )),
            channel: Arc::new(SerialBootChannel::new(
                Box::new(Serial2Opener),
                clock.clone(),
                cfg.capture_settings(),
                cfg.timing.reset_pulse(),
            )),
            clock,
        }
    }

    /// Flasher over this hardware with the configured retry policy.
    pub fn flasher(&self, cfg: &Config) -> Flasher {
        Flasher::new(self.tool.clone(), self.repair.clone(), self.clock.clone())
            .with_policy(cfg.retry_policy())
            .with_busy_signatures(cfg.flash.busy_signatures.clone())
    }
}

/// Builds the immutable per-run context from CLI inputs and the loaded manifest.
pub fn run_context(
    manifest_path: &Path,
    manifest: &Manifest,
    workspace: PathBuf,
    results_dir: PathBuf,
    port: Option<String>,
) -> RunContext {
    RunContext {
        run_id: RunId::new(),
        workspace,
        results_dir,
        manifest_path: manifest_path.to_path_buf(),
        manifest_version: manifest.manifest_version as u32,
        artifact_name: manifest.artifact_name().to_string(),
        build_number: manifest.build.build_number.to_string(),
        device_target: manifest.device_target().to_string(),
        test_plan: manifest.test_plan().to_vec(),
        port,
    }
}

pub struct Orchestrator<'a> {
    cfg: &'a Config,
    hw: Hardware,
    flasher: Flasher,
    emitters: Vec<Box<dyn ReportEmitter>>,
}

/// Mutable state of one run; dropped once the result is built.
struct Run<'r> {
    ctx: &'r RunContext,
    events: &'r dyn EventSink,
    evidence: EvidenceStore,
    details: RunDetails,
}

impl Run<'_> {
    fn enter(&self, phase: Phase) {
        self.events.emit(RunEvent::PhaseEntered { phase });
    }

    fn diagnose(&mut self, message: String, remedy: Option<Remedy>) {
        self.details.diagnostics.push(message.clone());
        self.events.emit(RunEvent::diagnostic(message, remedy));
    }
}

impl<'a> Orchestrator<'a> {
    pub fn new(cfg: &'a Config, hw: Hardware) -> Self {
        let flasher = hw.flasher(cfg);
        Self { cfg, hw, flasher, emitters: Vec::new() }
    }

    /// Replaces the default report set (summary, JUnit, meta, metrics).
    pub fn with_emitters(mut self, emitters: Vec<Box<dyn ReportEmitter>>) -> Self {
        self.emitters = emitters;
        self
    }

    /// Drives one run to completion. Always produces a result, even when
    /// flashing or testing fails; only an unusable results directory is an error.
    pub fn run(&self, ctx: &RunContext, events: &dyn EventSink) -> Result<RunResult> {
        std::fs::create_dir_all(&ctx.results_dir)
            .with_context(|| format!("create results dir {}", ctx.results_dir.display()))?;
        let started_at = Utc::now();
        let mut run = Run {
            ctx,
            events,
            evidence: EvidenceStore::new(&ctx.results_dir),
            details: RunDetails { port: ctx.port.clone(), ..RunDetails::default() },
        };
        run.enter(Phase::Start);
        self.drop_previous_evidence(&mut run);

        let (flashed, tests) = self.bring_up(&mut run);

        run.enter(Phase::Reporting);
        let result = RunResult {
            run_id: ctx.run_id.clone(),
            status: RunResult::verdict(flashed, &tests),
            flashed,
            tests,
            manifest: ctx.manifest_summary(),
            manifest_version: ctx.manifest_version,
            started_at,
            finished_at: Utc::now(),
            details: run.details,
        };
        let defaults;
        let emitters: &[Box<dyn ReportEmitter>] = if self.emitters.is_empty() {
            defaults = default_emitters(self.cfg.metrics_path(&ctx.results_dir));
            &defaults
        } else {
            &self.emitters
        };
        emit_all(emitters, &ctx.results_dir, &result, events);
        events.emit(RunEvent::PhaseEntered { phase: Phase::Done });
        tracing::info!(run_id = %result.run_id, status = %result.status, "run finished");
        Ok(result)
    }

    fn bring_up(&self, run: &mut Run<'_>) -> (bool, Vec<TestOutcome>) {
        let ctx = run.ctx;
        if !self.cfg.is_supported_target(&ctx.device_target) {
            let msg = format!("Unknown device target: {}", ctx.device_target);
            run.diagnose(msg.clone(), Some(Remedy::FixManifest));
            return (false, vec![TestOutcome::skip(AGGREGATE_TEST_NAME, msg)]);
        }

        run.enter(Phase::Flashing);
        let image = ctx.artifact_path();
        run.details.image_sha256 = image_digest(&image).ok();
        let port = match self.flasher.flash(&image, ctx.port.as_deref(), &self.cfg.locator(), run.events) {
            Ok(report) => {
                run.details.flash_attempts = report.attempts;
                run.details.port_repairs = report.repairs;
                run.details.port = Some(report.port.clone());
                report.port
            }
            Err(e) => {
                run.details.flash_attempts = e.attempts();
                run.details.flash_error = Some(e.to_string());
                run.diagnose(format!("{FLASH_FAILED}: {e}"), Some(e.remedy()));
                return (false, vec![TestOutcome::skip(AGGREGATE_TEST_NAME, FLASH_FAILED)]);
            }
        };
        let flashed_at = self.hw.clock.now();

        let evidence = self.settle_and_capture(run, &port, flashed_at);

        run.enter(Phase::Testing);
        let invoker = TestInvoker::from_config(self.cfg, &ctx.workspace);
        let invocation = invoker.invoke(ctx, Some(&port), evidence.as_deref(), run.events);
        run.details.reconciled = invocation.reconciled;
        if !invocation.invoked && evidence.is_none() {
            // Nothing shows the firmware booted.
            run.diagnose(format!("{NO_BOOT_EVIDENCE} on {port}"), Some(Remedy::CheckTestProcedure));
            return (true, vec![TestOutcome::fail(AGGREGATE_TEST_NAME, NO_BOOT_EVIDENCE)]);
        }
        (true, invocation.outcomes)
    }

    /// BOOT_WAIT, optional RESET, STALENESS_CHECK and RECAPTURE. Returns the
    /// evidence path when bytes from this run's latest boot were saved.
    fn settle_and_capture(&self, run: &mut Run<'_>, port: &str, flashed_at: Instant) -> Option<PathBuf> {
        let timing = &self.cfg.timing;

        run.enter(Phase::BootWait);
        self.hw.clock.sleep(timing.boot_wait());

        if timing.explicit_reset {
            run.enter(Phase::Reset);
            self.reset(run, port);
            self.hw.clock.sleep(timing.reset_delay());
            self.hw.channel.drain(port, &self.cfg.serial.drain_bauds, run.events);
        }

        run.enter(Phase::StalenessCheck);
        let elapsed = self.hw.clock.now().saturating_duration_since(flashed_at);
        if elapsed > timing.staleness_threshold() {
            tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "boot window closed; resetting to reopen it");
            run.enter(Phase::Recapture);
            run.details.recaptured = true;
            self.drop_previous_evidence(run);
            if !self.reset(run, port) {
                return None;
            }
        }
        let reset_at = self.hw.clock.now();
        self.capture(run, port, reset_at)
    }

    /// Serial reset pulse; a port fault gets one driver rebind and a retry,
    /// then the flashing tool's own reset is tried.
    fn reset(&self, run: &mut Run<'_>, port: &str) -> bool {
        let err = match self.hw.channel.reset(port, run.events) {
            Ok(()) => return true,
            Err(e) => e,
        };
        tracing::warn!(%port, error = %err, "serial reset failed");
        if err.is_port_fault() && self.hw.repair.repair(port, run.events) {
            run.details.port_repairs += 1;
            if self.hw.channel.reset(port, run.events).is_ok() {
                return true;
            }
        }
        match self.flasher.reset(port, run.events) {
            Ok(()) => true,
            Err(e) => {
                let remedy = if err.is_permission_denied() { Remedy::CheckPermissions } else { Remedy::ReplugDevice };
                run.diagnose(format!("could not reset the board on {port}: {err}; tool reset: {e}"), Some(remedy));
                false
            }
        }
    }

    fn capture(&self, run: &mut Run<'_>, port: &str, reset_at: Instant) -> Option<PathBuf> {
        let cap = match self.hw.channel.capture(port, self.cfg.timing.capture_budget(), run.events) {
            Ok(cap) => cap,
            Err(e) => {
                let remedy = if e.is_permission_denied() { Remedy::CheckPermissions } else { Remedy::ReplugDevice };
                run.diagnose(format!("boot capture failed: {e}"), Some(remedy));
                return None;
            }
        };
        if !cap.found {
            tracing::warn!(%port, "no boot output captured");
            return None;
        }
        let evidence = BootEvidence::new(cap.bytes, self.hw.clock.now().saturating_duration_since(reset_at));
        let record = evidence.record(&self.cfg.procedure.boot_tokens);
        if let Some(token) = &record.token {
            tracing::debug!(%token, "boot token present in capture");
        }
        match run.evidence.save(&evidence.bytes) {
            Ok(path) => {
                run.events.emit(RunEvent::EvidenceSaved {
                    path: path.clone(),
                    bytes: record.bytes,
                    since_reset_ms: record.since_reset_ms,
                });
                run.details.evidence_path = Some(path.clone());
                run.details.boot = Some(record);
                Some(path)
            }
            Err(e) => {
                run.diagnose(format!("boot evidence not saved: {e:#}"), None);
                None
            }
        }
    }

    fn drop_previous_evidence(&self, run: &mut Run<'_>) {
        match run.evidence.discard() {
            Ok(true) => run.events.emit(RunEvent::EvidenceDiscarded { path: run.evidence.path() }),
            Ok(false) => {}
            Err(e) => run.diagnose(format!("{e:#}"), Some(Remedy::CheckPermissions)),
        }
        run.details.evidence_path = None;
        run.details.boot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ats_core::{ManualClock, MemorySink, RunStatus, TestStatus};
    use ats_flash::{ScriptedFlashTool, ScriptedStep};
    use ats_serial::{CountingRepair, ScriptedBootChannel};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Rig {
        dir: TempDir,
        ctx: RunContext,
        tool: Arc<ScriptedFlashTool>,
        repair: Arc<CountingRepair>,
        channel: Arc<ScriptedBootChannel>,
        clock: Arc<ManualClock>,
    }

    impl Rig {
        fn new(target: &str, steps: Vec<ScriptedStep>, channel: ScriptedBootChannel) -> Self {
            let dir = tempdir().unwrap();
            let workspace = dir.path().join("ws");
            std::fs::create_dir_all(&workspace).unwrap();
            std::fs::write(workspace.join("fw.bin"), b"\xe9firmware").unwrap();
            let ctx = RunContext {
                run_id: RunId::from_str("run-t"),
                results_dir: dir.path().join("results"),
                manifest_path: workspace.join("ats-manifest.yaml"),
                workspace,
                manifest_version: 1,
                artifact_name: "fw.bin".into(),
                build_number: "7".into(),
                device_target: target.into(),
                test_plan: vec!["boot".into()],
                port: Some("/dev/ttyUSB0".into()),
            };
            Self {
                dir,
                ctx,
                tool: Arc::new(ScriptedFlashTool::new(steps)),
                repair: Arc::new(CountingRepair::new(true)),
                channel: Arc::new(channel),
                clock: Arc::new(ManualClock::new()),
            }
        }

        fn hardware(&self) -> Hardware {
            Hardware { tool: self.tool.clone(), repair: self.repair.clone(), channel: self.channel.clone(), clock: self.clock.clone() }
        }

        fn run(&self, cfg: &Config) -> (RunResult, MemorySink) {
            let sink = MemorySink::new();
            let result = Orchestrator::new(cfg, self.hardware()).run(&self.ctx, &sink).unwrap();
            (result, sink)
        }
    }

    /// Procedure at the configured path that reports the evidence it was given and passes.
    #[cfg(unix)]
    fn install_passing_procedure(cfg: &Config, ctx: &RunContext) {
        use std::os::unix::fs::PermissionsExt;
        let path = cfg.procedure_path(&ctx.workspace);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "#!/bin/sh\necho \"evidence=${BOOT_EVIDENCE_PATH:-none}\"\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn unknown_target_never_touches_hardware() {
        let rig = Rig::new("stm32f4", vec![], ScriptedBootChannel::default());
        let (result, sink) = rig.run(&Config::default());
        assert_eq!(result.status, RunStatus::Fail);
        assert_eq!(result.tests.len(), 1);
        assert_eq!(result.tests[0].status, TestStatus::Skip);
        assert!(rig.tool.calls().is_empty());
        assert!(rig.channel.calls().is_empty());
        assert_eq!(sink.phases(), vec![Phase::Start, Phase::Reporting, Phase::Done]);
    }

    #[test]
    fn flash_failure_skips_testing() {
        let rig = Rig::new("esp32", vec![ScriptedStep::fail("A fatal error occurred: Invalid head of packet")], ScriptedBootChannel::default());
        let (result, sink) = rig.run(&Config::default());
        assert_eq!(result.status, RunStatus::Fail);
        assert!(!result.flashed);
        assert_eq!(result.tests, vec![TestOutcome::skip(AGGREGATE_TEST_NAME, FLASH_FAILED)]);
        assert_eq!(result.details.flash_attempts, 1);
        assert!(!sink.phases().contains(&Phase::Testing));
        assert!(rig.channel.calls().is_empty());
    }

    #[test]
    fn default_timing_is_stale_and_recaptures_after_fresh_reset() {
        let rig = Rig::new("esp32", vec![], ScriptedBootChannel::new(vec![b"rst:0x1 (POWERON_RESET)".to_vec()]));
        let (result, sink) = rig.run(&Config::default());

        assert!(result.details.recaptured);
        assert_eq!(rig.channel.calls(), vec!["reset", "drain", "reset", "capture"]);
        let saved = result.details.evidence_path.clone().unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), b"rst:0x1 (POWERON_RESET)");
        assert_eq!(rig.clock.sleeps()[..2], [Duration::from_millis(3000), Duration::from_millis(1000)]);
        assert_eq!(
            sink.phases(),
            vec![
                Phase::Start,
                Phase::Flashing,
                Phase::BootWait,
                Phase::Reset,
                Phase::StalenessCheck,
                Phase::Recapture,
                Phase::Testing,
                Phase::Reporting,
                Phase::Done
            ]
        );
        // No procedure in the workspace, but the board booted: SKIP does not fail the run.
        assert_eq!(result.tests[0].status, TestStatus::Skip);
        assert_eq!(result.status, RunStatus::Pass);

        let boot = result.details.boot.as_ref().unwrap();
        assert_eq!(boot.bytes, 23);
        assert_eq!(boot.token.as_deref(), Some("rst:0x"));
        assert!(sink.events().iter().any(|e| matches!(e, RunEvent::EvidenceSaved { bytes: 23, .. })));
    }

    #[test]
    fn silent_board_without_procedure_fails() {
        let rig = Rig::new("esp32", vec![], ScriptedBootChannel::new(vec![]));
        let (result, _) = rig.run(&Config::default());
        assert!(result.flashed);
        assert!(result.details.evidence_path.is_none());
        assert_eq!(result.tests, vec![TestOutcome::fail(AGGREGATE_TEST_NAME, NO_BOOT_EVIDENCE)]);
        assert_eq!(result.status, RunStatus::Fail);
        assert_eq!(result.exit_code(), 1);
        assert!(result.details.diagnostics.iter().any(|d| d.starts_with(NO_BOOT_EVIDENCE)));
    }

    #[test]
    fn missing_override_falls_back_to_candidate() {
        let mut rig = Rig::new("esp32", vec![], ScriptedBootChannel::new(vec![b"rst:0x1".to_vec()]));
        rig.ctx.port = None;
        let board = rig.dir.path().join("ttyACM0");
        std::fs::write(&board, b"").unwrap();
        let mut cfg = Config::default();
        cfg.serial.port_override = Some(rig.dir.path().join("ttyUSB-gone").display().to_string());
        cfg.serial.candidates = vec![board.display().to_string()];
        cfg.serial.scan_patterns = vec![];

        let (result, sink) = rig.run(&cfg);
        let board = board.display().to_string();
        assert!(rig.tool.calls().iter().all(|(_, _, port)| *port == board));
        assert_eq!(rig.tool.write_count(), 1);
        assert_eq!(result.details.port.as_deref(), Some(board.as_str()));
        assert!(sink.events().iter().any(|e| matches!(e, RunEvent::PortLocated { source, .. } if source == "candidate")));
        assert_eq!(rig.repair.calls(), 0);
    }

    #[test]
    fn fresh_window_captures_without_second_reset() {
        let rig = Rig::new("esp32", vec![], ScriptedBootChannel::new(vec![b"I (31) boot: ESP-IDF".to_vec()]));
        let mut cfg = Config::default();
        cfg.timing.boot_wait_ms = 500;
        cfg.timing.explicit_reset = false;
        let (result, sink) = rig.run(&cfg);
        assert!(!result.details.recaptured);
        assert_eq!(rig.channel.calls(), vec!["capture"]);
        assert!(result.details.evidence_path.is_some());
        assert!(!sink.phases().contains(&Phase::Recapture));
    }

    #[test]
    fn empty_capture_leaves_no_evidence_and_clears_old_file() {
        let rig = Rig::new("esp32", vec![], ScriptedBootChannel::new(vec![Vec::new()]));
        std::fs::create_dir_all(&rig.ctx.results_dir).unwrap();
        std::fs::write(rig.ctx.results_dir.join(ats_artifacts::BOOT_EVIDENCE_FILE), b"rst:0x1 from last week").unwrap();

        let (result, sink) = rig.run(&Config::default());
        assert!(result.details.evidence_path.is_none());
        assert!(!rig.ctx.results_dir.join(ats_artifacts::BOOT_EVIDENCE_FILE).exists());
        assert!(sink.events().iter().any(|e| matches!(e, RunEvent::EvidenceDiscarded { .. })));
    }

    #[test]
    fn reset_port_fault_is_repaired_once() {
        let rig = Rig::new("esp32", vec![], ScriptedBootChannel::new(vec![b"rst:0x1".to_vec()]).with_reset_faults(1));
        let (result, _) = rig.run(&Config::default());
        assert_eq!(rig.repair.calls(), 1);
        assert_eq!(result.details.port_repairs, 1);
        assert_eq!(rig.channel.calls()[..2], ["reset".to_string(), "reset".to_string()]);
        assert!(result.details.recaptured);
    }

    #[test]
    fn serial_reset_falls_back_to_flash_tool_after_rebind() {
        // Two faults per reset: the rebind does not help, the tool reset does.
        let rig = Rig::new("esp32", vec![], ScriptedBootChannel::new(vec![b"rst:0x1".to_vec()]).with_reset_faults(4));
        let (result, sink) = rig.run(&Config::default());

        assert_eq!(rig.repair.calls(), 2);
        assert_eq!(result.details.port_repairs, 2);
        assert_eq!(rig.channel.calls(), vec!["reset", "reset", "drain", "reset", "reset", "capture"]);
        let ops: Vec<String> = rig.tool.calls().into_iter().map(|(op, _, _)| op).collect();
        assert_eq!(ops, vec!["write_flash", "run", "run"]);
        let tool_resets = sink
            .events()
            .iter()
            .filter(|e| matches!(e, RunEvent::ResetIssued { method, .. } if method == "flash-tool"))
            .count();
        assert_eq!(tool_resets, 2);
        assert!(result.details.evidence_path.is_some());
        assert!(result.details.diagnostics.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn failed_fresh_reset_runs_procedure_without_evidence() {
        let _guard = crate::SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let refused = "A fatal error occurred: Failed to connect to ESP32: No serial data received.";
        let mut rig = Rig::new(
            "esp32",
            vec![ScriptedStep::ok(), ScriptedStep::fail(refused), ScriptedStep::fail(refused)],
            ScriptedBootChannel::new(vec![b"rst:0x1".to_vec()]).with_reset_faults(2),
        );
        rig.repair = Arc::new(CountingRepair::new(false));
        let cfg = Config::default();
        install_passing_procedure(&cfg, &rig.ctx);
        let (result, sink) = rig.run(&cfg);

        assert_eq!(rig.repair.calls(), 2);
        assert_eq!(result.details.port_repairs, 0);
        assert_eq!(rig.channel.calls(), vec!["reset", "drain", "reset"]);
        assert!(result.details.recaptured);
        assert!(result.details.evidence_path.is_none());
        assert!(result.details.boot.is_none());
        let failed_resets = result.details.diagnostics.iter().filter(|d| d.starts_with("could not reset the board")).count();
        assert_eq!(failed_resets, 2);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, RunEvent::Diagnostic { remedy: Some(Remedy::ReplugDevice), .. })));

        assert!(sink.events().iter().any(|e| matches!(e, RunEvent::ProcedureStarted { .. })));
        let stdout = std::fs::read_to_string(rig.ctx.results_dir.join(crate::STDOUT_LOG)).unwrap();
        assert_eq!(stdout.trim(), "evidence=none");
        assert_eq!(result.tests, vec![TestOutcome::pass(AGGREGATE_TEST_NAME)]);
        assert_eq!(result.status, RunStatus::Pass);
    }

    #[test]
    fn reports_are_written_into_results_dir() {
        let rig = Rig::new("esp32", vec![], ScriptedBootChannel::new(vec![b"rst:0x1".to_vec()]));
        let (_, sink) = rig.run(&Config::default());
        for file in ["ats-summary.json", "junit.xml", "meta.yaml", "ats-metrics.json"] {
            assert!(rig.ctx.results_dir.join(file).exists(), "{file} missing");
        }
        let written = sink.events().iter().filter(|e| matches!(e, RunEvent::ReportWritten { .. })).count();
        assert_eq!(written, 4);
    }
}
