use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ats_core::{RunResult, RunStatus};
use serde::Serialize;

use crate::ReportEmitter;

pub const META_FILE: &str = "meta.yaml";

#[derive(Serialize)]
struct Meta<'a> {
    execution: Execution<'a>,
    manifest: ManifestMeta<'a>,
    flash: FlashMeta<'a>,
    boot: BootMeta<'a>,
    #[serde(skip_serializing_if = "no_diagnostics")]
    diagnostics: &'a [String],
}

#[derive(Serialize)]
struct Execution<'a> {
    timestamp: String,
    started_at: String,
    duration_ms: i64,
    exit_code: i32,
    status: RunStatus,
    run_id: &'a str,
}

#[derive(Serialize)]
struct ManifestMeta<'a> {
    version: u32,
    build_number: &'a str,
    device_target: &'a str,
}

#[derive(Serialize)]
struct FlashMeta<'a> {
    flashed: bool,
    port: Option<&'a str>,
    attempts: u32,
    port_repairs: u32,
    image_sha256: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct BootMeta<'a> {
    evidence_path: Option<String>,
    captured_at: Option<String>,
    since_reset_ms: Option<u64>,
    bytes: usize,
    token: Option<&'a str>,
    recaptured: bool,
    reconciled: bool,
}

fn no_diagnostics(d: &&[String]) -> bool {
    d.is_empty()
}

pub struct MetaWriter;

impl ReportEmitter for MetaWriter {
    fn kind(&self) -> &'static str {
        "meta"
    }

    fn emit(&self, results_dir: &Path, result: &RunResult) -> Result<PathBuf> {
        let d = &result.details;
        let meta = Meta {
            execution: Execution {
                timestamp: result.finished_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                started_at: result.started_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                duration_ms: (result.finished_at - result.started_at).num_milliseconds(),
                exit_code: result.exit_code(),
                status: result.status,
                run_id: result.run_id.as_str(),
            },
            manifest: ManifestMeta {
                version: result.manifest_version,
                build_number: &result.manifest.build_number,
                device_target: &result.manifest.device_target,
            },
            flash: FlashMeta {
                flashed: result.flashed,
                port: d.port.as_deref(),
                attempts: d.flash_attempts,
                port_repairs: d.port_repairs,
                image_sha256: d.image_sha256.as_deref(),
                error: d.flash_error.as_deref(),
            },
            boot: BootMeta {
                evidence_path: d.evidence_path.as_ref().map(|p| p.display().to_string()),
                captured_at: d.boot.as_ref().map(|b| b.captured_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
                since_reset_ms: d.boot.as_ref().map(|b| b.since_reset_ms),
                bytes: d.boot.as_ref().map_or(0, |b| b.bytes),
                token: d.boot.as_ref().and_then(|b| b.token.as_deref()),
                recaptured: d.recaptured,
                reconciled: d.reconciled,
            },
            diagnostics: &d.diagnostics,
        };
        let path = results_dir.join(META_FILE);
        let text = serde_yaml::to_string(&meta)?;
        std::fs::write(&path, text).with_context(|| format!("write meta {}", path.display()))?;
        Ok(path)
    }
}
