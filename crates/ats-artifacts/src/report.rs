use std::path::{Path, PathBuf};

use anyhow::Result;
use ats_core::{EventSink, RunEvent, RunResult};

/// Serializes a finished run into one report file.
pub trait ReportEmitter: Send + Sync {
    fn kind(&self) -> &'static str;
    fn emit(&self, results_dir: &Path, result: &RunResult) -> Result<PathBuf>;
}

/// Runs every emitter. A failing emitter is reported and skipped; the others still run.
pub fn emit_all(emitters: &[Box<dyn ReportEmitter>], results_dir: &Path, result: &RunResult, events: &dyn EventSink) -> Vec<PathBuf> {
    let mut written = Vec::with_capacity(emitters.len());
    for emitter in emitters {
        match emitter.emit(results_dir, result) {
            Ok(path) => {
                events.emit(RunEvent::ReportWritten { kind: emitter.kind().into(), path: path.clone() });
                written.push(path);
            }
            Err(e) => events.emit(RunEvent::diagnostic(format!("{} report not written: {e:#}", emitter.kind()), None)),
        }
    }
    written
}

/// The standard set: summary, JUnit, metadata, metrics.
pub fn default_emitters(metrics_path: PathBuf) -> Vec<Box<dyn ReportEmitter>> {
    vec![
        Box::new(crate::SummaryWriter),
        Box::new(crate::JunitWriter),
        Box::new(crate::MetaWriter),
        Box::new(crate::MetricsWriter::new(metrics_path)),
    ]
}
