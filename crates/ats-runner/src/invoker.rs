//! Runs the external test procedure and turns its result into test outcomes.
//!
//! The procedure does its own boot check by reading the live serial port,
//! which usually happens after the boot output is gone. Evidence captured by
//! the orchestrator therefore takes precedence when the two disagree.

use std::path::{Path, PathBuf};
use std::process::Command;

use ats_core::{find_boot_token, EventSink, Remedy, RunContext, RunEvent, TestOutcome, TestStatus, AGGREGATE_TEST_NAME};

use crate::util::write_text;
use crate::Config;

pub const BOOT_FAILED_MARKER: &str = "UART boot validation FAILED";
pub const BOOT_PASSED_MARKER: &str = "UART boot validation PASSED";
pub const RUNNER_NOT_FOUND: &str = "Test runner not found";
pub const STDOUT_LOG: &str = "test-runner.stdout.log";
pub const STDERR_LOG: &str = "test-runner.stderr.log";

/// Captured result of one procedure run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcedureOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcedureOutput {
    fn mentions(&self, marker: &str) -> bool {
        self.stdout.contains(marker) || self.stderr.contains(marker)
    }

    fn error_text(&self) -> String {
        if !self.stderr.trim().is_empty() {
            return self.stderr.clone();
        }
        match self.exit_code {
            Some(code) => format!("test procedure exited with status {code}"),
            None => "test procedure terminated by a signal".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciled {
    pub outcome: TestOutcome,
    /// Set when captured evidence overrode the procedure's own verdict.
    pub override_reason: Option<String>,
}

/// Decides the aggregate outcome from the procedure's output and the captured evidence.
pub fn reconcile(output: &ProcedureOutput, evidence: Option<&[u8]>, tokens: &[String]) -> Reconciled {
    if output.mentions(BOOT_FAILED_MARKER) {
        if let Some(token) = evidence.and_then(|bytes| find_boot_token(bytes, tokens)) {
            return Reconciled {
                outcome: TestOutcome::pass(AGGREGATE_TEST_NAME),
                override_reason: Some(format!("captured boot evidence contains {token:?}")),
            };
        }
    }
    if output.mentions(BOOT_PASSED_MARKER) {
        return Reconciled { outcome: TestOutcome::pass(AGGREGATE_TEST_NAME), override_reason: None };
    }
    let outcome = if output.exit_code == Some(0) {
        TestOutcome::pass(AGGREGATE_TEST_NAME)
    } else {
        TestOutcome::fail(AGGREGATE_TEST_NAME, output.error_text())
    };
    Reconciled { outcome, override_reason: None }
}

#[derive(Clone, Debug, Default)]
pub struct Invocation {
    pub outcomes: Vec<TestOutcome>,
    pub reconciled: bool,
    pub invoked: bool,
}

impl Invocation {
    fn single(outcome: TestOutcome) -> Self {
        Self { outcomes: vec![outcome], ..Self::default() }
    }
}

pub struct TestInvoker {
    procedure: PathBuf,
    working_dir: PathBuf,
    boot_tokens: Vec<String>,
}

impl TestInvoker {
    pub fn new(procedure: PathBuf, working_dir: PathBuf, boot_tokens: Vec<String>) -> Self {
        Self { procedure, working_dir, boot_tokens }
    }

    pub fn from_config(cfg: &Config, workspace: &Path) -> Self {
        Self::new(cfg.procedure_path(workspace), cfg.procedure_dir(workspace), cfg.procedure.boot_tokens.clone())
    }

    pub fn procedure(&self) -> &Path {
        &self.procedure
    }

    /// The procedure gets the manifest path as its only argument plus the
    /// environment contract below; it is never modified before running.
    pub fn command(&self, ctx: &RunContext, port: Option<&str>, evidence: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.procedure);
        cmd.arg(&ctx.manifest_path)
            .current_dir(self.run_dir(ctx))
            .env("TEST_REPORT_DIR", &ctx.results_dir)
            .env("RESULTS_DIR", &ctx.results_dir)
            .env("WORKSPACE", &ctx.workspace);
        if let Some(p) = port {
            cmd.env("SERIAL_PORT", p);
        }
        if let Some(e) = evidence {
            cmd.env("BOOT_EVIDENCE_PATH", e);
        }
        cmd
    }

    pub fn invoke(&self, ctx: &RunContext, port: Option<&str>, evidence: Option<&Path>, events: &dyn EventSink) -> Invocation {
        if !self.procedure.is_file() {
            events.emit(RunEvent::diagnostic(
                format!("{RUNNER_NOT_FOUND}: {}", self.procedure.display()),
                Some(Remedy::CheckTestProcedure),
            ));
            return Invocation::single(TestOutcome::skip(AGGREGATE_TEST_NAME, RUNNER_NOT_FOUND));
        }

        events.emit(RunEvent::ProcedureStarted { path: self.procedure.clone() });
        let output = match self.command(ctx, port, evidence).output() {
            Ok(out) => ProcedureOutput {
                exit_code: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            },
            Err(e) => {
                let detail = format!("could not run {}: {e}", self.procedure.display());
                events.emit(RunEvent::diagnostic(detail.clone(), Some(Remedy::CheckTestProcedure)));
                return Invocation { invoked: true, ..Invocation::single(TestOutcome::fail(AGGREGATE_TEST_NAME, detail)) };
            }
        };
        self.record_output(ctx, &output, events);
        events.emit(RunEvent::ProcedureFinished { exit_code: output.exit_code });

        let evidence_bytes = match evidence.map(ats_artifacts::load_evidence) {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                events.emit(RunEvent::diagnostic(format!("boot evidence unreadable: {e:#}"), None));
                None
            }
            None => None,
        };
        let r = reconcile(&output, evidence_bytes.as_deref(), &self.boot_tokens);
        let reconciled = r.override_reason.is_some();
        if let Some(reason) = r.override_reason {
            events.emit(RunEvent::OutcomeReconciled { from: TestStatus::Fail, to: r.outcome.status, reason });
        }
        Invocation { outcomes: vec![r.outcome], reconciled, invoked: true }
    }

    fn run_dir(&self, ctx: &RunContext) -> PathBuf {
        if self.working_dir.is_dir() {
            self.working_dir.clone()
        } else {
            ctx.workspace.clone()
        }
    }

    fn record_output(&self, ctx: &RunContext, output: &ProcedureOutput, events: &dyn EventSink) {
        for (stream, text, file) in [("stdout", &output.stdout, STDOUT_LOG), ("stderr", &output.stderr, STDERR_LOG)] {
            if !text.is_empty() {
                events.emit(RunEvent::ProcedureOutput { stream: stream.into(), text: text.clone() });
            }
            if let Err(e) = write_text(&ctx.results_dir.join(file), text) {
                tracing::warn!(error = %e, "procedure {stream} not saved");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> Vec<String> {
        Config::default().procedure.boot_tokens
    }

    fn output(exit_code: i32, stdout: &str, stderr: &str) -> ProcedureOutput {
        ProcedureOutput { exit_code: Some(exit_code), stdout: stdout.into(), stderr: stderr.into() }
    }

    #[test]
    fn evidence_overrides_missed_live_read() {
        let out = output(1, "UART boot validation FAILED: timeout\n", "no data");
        let r = reconcile(&out, Some(b"ets Jun  8 2016 00:22:57\r\nrst:0x1 (POWERON_RESET)"), &tokens());
        assert_eq!(r.outcome.status, TestStatus::Pass);
        assert!(r.override_reason.is_some());
    }

    #[test]
    fn failed_marker_without_tokens_keeps_exit_status() {
        let out = output(1, "UART boot validation FAILED\n", "boot check failed");
        let r = reconcile(&out, Some(b"\x00\xff garbage"), &tokens());
        assert_eq!(r.outcome, TestOutcome::fail(AGGREGATE_TEST_NAME, "boot check failed"));
        assert!(r.override_reason.is_none());

        let r = reconcile(&out, None, &tokens());
        assert_eq!(r.outcome.status, TestStatus::Fail);
    }

    #[test]
    fn passed_marker_wins_over_exit_status() {
        let out = output(3, "UART boot validation PASSED\n", "");
        let r = reconcile(&out, None, &tokens());
        assert_eq!(r.outcome.status, TestStatus::Pass);
        assert!(r.override_reason.is_none());
    }

    #[test]
    fn no_marker_nonzero_exit_fails_with_stderr() {
        let out = output(1, "running 3 checks\n", "check_gpio: expected HIGH\n");
        let r = reconcile(&out, Some(b"rst:0x1"), &tokens());
        assert_eq!(r.outcome.status, TestStatus::Fail);
        assert_eq!(r.outcome.detail, "check_gpio: expected HIGH\n");
    }

    #[test]
    fn no_marker_zero_exit_passes() {
        let r = reconcile(&output(0, "ok\n", ""), None, &tokens());
        assert_eq!(r.outcome, TestOutcome::pass(AGGREGATE_TEST_NAME));
    }

    #[test]
    fn silent_failure_still_has_detail() {
        let r = reconcile(&output(4, "", ""), None, &tokens());
        assert_eq!(r.outcome.detail, "test procedure exited with status 4");
        let killed = ProcedureOutput { exit_code: None, ..ProcedureOutput::default() };
        assert_eq!(reconcile(&killed, None, &tokens()).outcome.detail, "test procedure terminated by a signal");
    }
}
