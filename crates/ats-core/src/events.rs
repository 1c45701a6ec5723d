//! Structured run events and the sinks that receive them.
//!
//! Components get an `&dyn EventSink` passed in; nothing writes to a global log
//! file. The binary's entry point decides which sinks exist and flushes them.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use crate::model::{Phase, Remedy, TestStatus};

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    PhaseEntered { phase: Phase },
    PortLocated { port: String, source: String },
    PortMissing,
    FlashAttempt { attempt: u32, outcome: String, detail: String },
    PortRepaired { port: String, device: String },
    PortRepairSkipped { port: String, reason: String },
    ResetIssued { port: String, method: String },
    BuffersDrained { port: String, baud: Option<u32> },
    BootCaptured { port: String, bytes: usize, elapsed_ms: u64 },
    EvidenceSaved { path: PathBuf, bytes: usize, since_reset_ms: u64 },
    EvidenceDiscarded { path: PathBuf },
    ProcedureStarted { path: PathBuf },
    ProcedureOutput { stream: String, text: String },
    ProcedureFinished { exit_code: Option<i32> },
    OutcomeReconciled { from: TestStatus, to: TestStatus, reason: String },
    ReportWritten { kind: String, path: PathBuf },
    Diagnostic { message: String, remedy: Option<Remedy> },
}

impl RunEvent {
    pub fn diagnostic(message: impl Into<String>, remedy: Option<Remedy>) -> Self {
        RunEvent::Diagnostic { message: message.into(), remedy }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);

    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Forwards events to `tracing` so they show up in the console log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: RunEvent) {
        match &event {
            RunEvent::PhaseEntered { phase } => tracing::info!(phase = phase.as_str(), "phase"),
            RunEvent::PortLocated { port, source } => tracing::info!(%port, %source, "serial port located"),
            RunEvent::PortMissing => tracing::error!("no serial port found"),
            RunEvent::FlashAttempt { attempt, outcome, detail } => {
                if outcome == "success" {
                    tracing::info!(attempt, "firmware flashed");
                } else {
                    tracing::warn!(attempt, %outcome, %detail, "flash attempt failed");
                }
            }
            RunEvent::PortRepaired { port, device } => tracing::info!(%port, %device, "serial driver rebound"),
            RunEvent::PortRepairSkipped { port, reason } => tracing::warn!(%port, %reason, "serial driver rebind skipped"),
            RunEvent::ResetIssued { port, method } => tracing::info!(%port, %method, "reset issued"),
            RunEvent::BuffersDrained { port, baud } => tracing::debug!(%port, ?baud, "serial buffers drained"),
            RunEvent::BootCaptured { port, bytes, elapsed_ms } => {
                tracing::info!(%port, bytes, elapsed_ms, "boot output captured")
            }
            RunEvent::EvidenceSaved { path, bytes, since_reset_ms } => {
                tracing::info!(path = %path.display(), bytes, since_reset_ms, "boot evidence saved")
            }
            RunEvent::EvidenceDiscarded { path } => tracing::debug!(path = %path.display(), "stale boot evidence discarded"),
            RunEvent::ProcedureStarted { path } => tracing::info!(path = %path.display(), "running test procedure"),
            RunEvent::ProcedureOutput { stream, text } => {
                for line in text.lines() {
                    tracing::info!(target: "ats::procedure", %stream, "{line}");
                }
            }
            RunEvent::ProcedureFinished { exit_code } => tracing::info!(?exit_code, "test procedure finished"),
            RunEvent::OutcomeReconciled { from, to, reason } => {
                tracing::warn!(%from, %to, %reason, "test outcome overridden by captured boot evidence")
            }
            RunEvent::ReportWritten { kind, path } => tracing::info!(%kind, path = %path.display(), "report written"),
            RunEvent::Diagnostic { message, remedy } => match remedy {
                Some(r) => tracing::error!(hint = r.hint(), "{message}"),
                None => tracing::warn!("{message}"),
            },
        }
    }
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    ts: String,
    run_id: &'a str,
    #[serde(flatten)]
    event: &'a RunEvent,
}

/// Per-run debug log: one JSON object per line, truncated when opened.
pub struct JsonlSink {
    path: PathBuf,
    run_id: String,
    out: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(path: &Path, run_id: impl Into<String>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self { path: path.to_path_buf(), run_id: run_id.into(), out: Mutex::new(BufWriter::new(file)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: RunEvent) {
        let record = JsonlRecord { ts: Utc::now().to_rfc3339(), run_id: &self.run_id, event: &event };
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        // A broken debug log must never take the run down with it.
        let _ = writeln!(out, "{line}");
    }

    fn flush(&self) -> std::io::Result<()> {
        self.out.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}

/// Sends every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: RunEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.flush() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Records events in memory. Used by tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::PhaseEntered { phase } => Some(phase),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: RunEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}
