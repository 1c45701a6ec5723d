use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ats_core::{RunResult, RunStatus, TestStatus};
use serde::{Deserialize, Serialize};

use crate::ReportEmitter;

pub const METRICS_FILE: &str = "ats-metrics.json";

/// Cumulative counters across runs, updated read-modify-write after each run.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub runs_total: u64,
    pub runs_passed: u64,
    pub runs_failed: u64,
    pub flash_failures: u64,
    pub flash_attempts: u64,
    pub port_repairs: u64,
    pub recaptures: u64,
    pub reconciled_overrides: u64,
    pub tests_passed: u64,
    pub tests_failed: u64,
    pub tests_skipped: u64,
    pub last_run_id: Option<String>,
    pub last_run_at: Option<String>,
    pub last_status: Option<RunStatus>,
}

impl MetricsSnapshot {
    pub fn record(&mut self, result: &RunResult) {
        self.runs_total += 1;
        match result.status {
            RunStatus::Pass => self.runs_passed += 1,
            RunStatus::Fail => self.runs_failed += 1,
        }
        let d = &result.details;
        if d.flash_error.is_some() {
            self.flash_failures += 1;
        }
        self.flash_attempts += u64::from(d.flash_attempts);
        self.port_repairs += u64::from(d.port_repairs);
        self.recaptures += u64::from(d.recaptured);
        self.reconciled_overrides += u64::from(d.reconciled);
        self.tests_passed += result.count(TestStatus::Pass) as u64;
        self.tests_failed += result.count(TestStatus::Fail) as u64;
        self.tests_skipped += result.count(TestStatus::Skip) as u64;
        self.last_run_id = Some(result.run_id.as_str().to_string());
        self.last_run_at = Some(result.finished_at.to_rfc3339());
        self.last_status = Some(result.status);
    }

    /// Missing or unreadable snapshots start from zero.
    pub fn load(path: &Path) -> Self {
        let Ok(bytes) = std::fs::read(path) else {
            return Self::default();
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "metrics snapshot unreadable; starting over");
            Self::default()
        })
    }
}

pub struct MetricsWriter {
    path: PathBuf,
}

impl MetricsWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ReportEmitter for MetricsWriter {
    fn kind(&self) -> &'static str {
        "metrics"
    }

    fn emit(&self, _results_dir: &Path, result: &RunResult) -> Result<PathBuf> {
        let mut snapshot = MetricsSnapshot::load(&self.path);
        snapshot.record(result);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(&self.path, bytes).with_context(|| format!("write metrics {}", self.path.display()))?;
        Ok(self.path.clone())
    }
}
