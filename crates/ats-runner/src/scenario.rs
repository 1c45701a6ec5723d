use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use ats_core::{ManualClock, MemorySink, Phase, RunEvent, RunResult, TestStatus};
use ats_flash::{ScriptedFlashTool, ScriptedStep};
use ats_serial::{CountingRepair, ScriptedBootChannel};

use crate::{run_context, Config, Hardware, Orchestrator};

#[derive(Debug, Deserialize)]
pub struct ScenarioExpected {
    pub scenario_id: String,
    pub status: String,
    pub exit_code: i32,
    pub tests: Vec<ExpectedTest>,
    #[serde(default)]
    pub procedure_invoked: bool,
    #[serde(default)]
    pub recaptured: bool,
    #[serde(default)]
    pub reconciled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExpectedTest {
    pub name: String,
    pub status: TestStatus,
    #[serde(default)]
    pub failure: Option<String>,
}

#[derive(Debug)]
pub struct ScenarioResult {
    pub result: RunResult,
    pub phases: Vec<Phase>,
    pub events: Vec<RunEvent>,
    pub procedure_invoked: bool,
    pub flash_calls: usize,
    pub channel_calls: Vec<String>,
    pub results_dir: PathBuf,
}

pub fn load_expected(dir: &Path) -> Result<ScenarioExpected> {
    let p = dir.join("expected.yaml");
    let s = std::fs::read_to_string(&p).with_context(|| format!("read expected.yaml: {}", p.display()))?;
    let exp: ScenarioExpected = serde_yaml::from_str(&s).with_context(|| "parse expected.yaml")?;
    Ok(exp)
}

/// Fixture-mode bring-up.
///
/// A scenario directory holds:
/// - `manifest.yaml` (required)
/// - `flash.yaml`: scripted flashing-tool results, in order; omitted means every call succeeds
/// - `boot.log`: bytes the board prints after each reset; omitted means a silent board
/// - `procedure.sh`: the test procedure, installed at the configured path; omitted means absent
/// - `config.toml`: optional config overrides
///
/// The flashing tool, serial channel and clock are doubles; the procedure is a
/// real subprocess. Everything is staged under `work_dir`.
pub fn simulate(dir: &Path, work_dir: &Path) -> Result<ScenarioResult> {
    let cfg = match dir.join("config.toml") {
        p if p.exists() => Config::load_from(&p)?,
        _ => Config::default(),
    };

    let workspace = work_dir.join("workspace");
    let results_dir = work_dir.join("results");
    std::fs::create_dir_all(&workspace).with_context(|| format!("create {}", workspace.display()))?;

    let manifest_path = workspace.join("ats-manifest.yaml");
    std::fs::copy(dir.join("manifest.yaml"), &manifest_path).with_context(|| "copy manifest.yaml")?;
    let manifest = ats_manifest::load_manifest(&manifest_path)?;

    let image = workspace.join(manifest.artifact_name());
    if let Some(parent) = image.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&image, b"\xe9 scenario firmware").with_context(|| format!("write {}", image.display()))?;

    let procedure = dir.join("procedure.sh");
    if procedure.exists() {
        install_procedure(&procedure, &cfg.procedure_path(&workspace))?;
        std::fs::create_dir_all(cfg.procedure_dir(&workspace))?;
    }

    let steps = read_flash_steps(dir)?;
    let boot = match std::fs::read(dir.join("boot.log")) {
        Ok(bytes) => vec![bytes],
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
        Err(e) => return Err(e).with_context(|| "read boot.log"),
    };
    let tool = Arc::new(ScriptedFlashTool::new(steps));
    let channel = Arc::new(ScriptedBootChannel::new(boot));
    let hw = Hardware {
        tool: tool.clone(),
        repair: Arc::new(CountingRepair::new(true)),
        channel: channel.clone(),
        clock: Arc::new(ManualClock::new()),
    };

    let ctx = run_context(&manifest_path, &manifest, workspace, results_dir.clone(), Some("/dev/ttyUSB0".into()));
    let sink = MemorySink::new();
    let result = Orchestrator::new(&cfg, hw).run(&ctx, &sink)?;

    let events = sink.events();
    Ok(ScenarioResult {
        phases: sink.phases(),
        procedure_invoked: events.iter().any(|e| matches!(e, RunEvent::ProcedureStarted { .. })),
        events,
        flash_calls: tool.write_count(),
        channel_calls: channel.calls(),
        result,
        results_dir,
    })
}

fn read_flash_steps(dir: &Path) -> Result<Vec<ScriptedStep>> {
    let p = dir.join("flash.yaml");
    if !p.exists() {
        return Ok(Vec::new());
    }
    let s = std::fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
    let steps: Vec<ScriptedStep> = serde_yaml::from_str(&s).with_context(|| format!("parse {}", p.display()))?;
    Ok(steps)
}

fn install_procedure(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dest).with_context(|| format!("install {}", dest.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
