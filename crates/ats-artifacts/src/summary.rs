use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ats_core::{ManifestSummary, RunResult, RunStatus, TestOutcome};
use serde::Serialize;

use crate::ReportEmitter;

pub const SUMMARY_FILE: &str = "ats-summary.json";

#[derive(Serialize)]
struct Summary<'a> {
    status: RunStatus,
    tests: &'a [TestOutcome],
    manifest: &'a ManifestSummary,
}

pub struct SummaryWriter;

impl ReportEmitter for SummaryWriter {
    fn kind(&self) -> &'static str {
        "summary"
    }

    fn emit(&self, results_dir: &Path, result: &RunResult) -> Result<PathBuf> {
        let path = results_dir.join(SUMMARY_FILE);
        let summary = Summary { status: result.status, tests: &result.tests, manifest: &result.manifest };
        let bytes = serde_json::to_vec_pretty(&summary)?;
        std::fs::write(&path, bytes).with_context(|| format!("write summary {}", path.display()))?;
        Ok(path)
    }
}
