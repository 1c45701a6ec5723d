use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ats_artifacts::EvidenceStore;
use ats_core::{BootEvidence, EventSink, FanoutSink, JsonlSink, Remedy, RunEvent, TracingSink};
use ats_runner::{doctor, run_context, Config, GpioPaths, Hardware, Orchestrator, Overrides};

const DEBUG_LOG: &str = "ats-debug.jsonl";

#[derive(Parser)]
#[command(name = "ats", version, about = "ESP32 hardware-in-the-loop bring-up and boot evidence capture")]
struct Cli {
    /// Optional TOML config; defaults apply when omitted
    #[arg(long, global = true, env = "ATS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Args, Clone, Default)]
struct PortArgs {
    /// Serial port of the board; skips discovery
    #[arg(long, env = "SERIAL_PORT")]
    port: Option<String>,

    #[arg(long = "esp32-port", env = "ESP32_PORT", hide = true)]
    esp32_port: Option<String>,
}

impl PortArgs {
    fn port(&self) -> Option<String> {
        self.port.clone().or_else(|| self.esp32_port.clone())
    }
}

#[derive(Subcommand)]
enum Command {
    /// Flash, capture boot evidence, run the test procedure, write reports
    Run {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        results_dir: PathBuf,
        #[arg(long)]
        workspace: PathBuf,
        #[command(flatten)]
        port: PortArgs,
        /// Skip the explicit reset after the post-flash boot wait
        #[arg(long)]
        no_reset: bool,
    },

    /// Print the serial port that would be used
    Locate {
        #[command(flatten)]
        port: PortArgs,
    },

    /// Flash an image with the retry policy, nothing else
    Flash {
        #[arg(long)]
        image: PathBuf,
        #[command(flatten)]
        port: PortArgs,
    },

    /// Reset the board and save its boot output as evidence
    Capture {
        #[arg(long)]
        results_dir: PathBuf,
        #[command(flatten)]
        port: PortArgs,
        /// Capture budget; defaults to timing.capture_budget_ms
        #[arg(long)]
        budget_ms: Option<u64>,
    },

    /// Rebind the kernel driver behind a stuck serial port
    Repair {
        #[command(flatten)]
        port: PortArgs,
    },

    /// Check tooling, port, GPIO and results directory
    Doctor {
        #[arg(long, default_value = "results")]
        results_dir: PathBuf,
        #[command(flatten)]
        port: PortArgs,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to this path
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load_or_default(cli.config.as_deref())?;

    match cli.cmd {
        Command::Run { manifest, results_dir, workspace, port, no_reset } => {
            let cfg = with_overrides(cfg, &port, no_reset);
            let code = run(&cfg, &manifest, results_dir, workspace)?;
            std::process::exit(code);
        }
        Command::Locate { port } => {
            let cfg = with_overrides(cfg, &port, false);
            match cfg.locator().locate() {
                Some(found) => println!("{} ({})", found.path, found.source.as_str()),
                None => {
                    eprintln!("no serial port found; {}", Remedy::PassExplicitPort.hint());
                    std::process::exit(1);
                }
            }
        }
        Command::Flash { image, port } => {
            let cfg = with_overrides(cfg, &port, false);
            let hw = Hardware::from_config(&cfg);
            let report = hw
                .flasher(&cfg)
                .flash(&image, None, &cfg.locator(), &TracingSink)
                .map_err(|e| anyhow!("{e}; {}", e.remedy().hint()))?;
            println!("flashed {} on {} (attempts: {}, repairs: {})", image.display(), report.port, report.attempts, report.repairs);
        }
        Command::Capture { results_dir, port, budget_ms } => {
            let cfg = with_overrides(cfg, &port, false);
            capture(&cfg, &results_dir, budget_ms)?;
        }
        Command::Repair { port } => {
            let cfg = with_overrides(cfg, &port, false);
            let port = located_port(&cfg)?;
            let hw = Hardware::from_config(&cfg);
            if hw.repair.repair(&port, &TracingSink) {
                println!("rebound driver for {port}");
            } else {
                eprintln!("could not rebind {port}; {}", Remedy::ReplugDevice.hint());
                std::process::exit(1);
            }
        }
        Command::Doctor { results_dir, port } => {
            let cfg = with_overrides(cfg, &port, false);
            let report = doctor(&cfg, &results_dir, &GpioPaths::default());
            for c in &report.checks {
                let mark = if c.ok { "ok  " } else { "FAIL" };
                println!("{mark} {:<12} {}", c.name, c.detail);
                if let Some(r) = c.remedy {
                    println!("     -> {}", r.hint());
                }
            }
            if !report.ok() {
                std::process::exit(1);
            }
            println!("OK");
        }
        Command::Config { write } => {
            print!("{}", cfg.to_toml()?);
            if let Some(path) = write {
                cfg.save_to(&path)?;
            }
        }
    }

    Ok(())
}

fn with_overrides(mut cfg: Config, port: &PortArgs, no_reset: bool) -> Config {
    cfg.apply_overrides(&Overrides { port: port.port(), no_reset });
    cfg
}

fn located_port(cfg: &Config) -> anyhow::Result<String> {
    cfg.locator()
        .locate()
        .map(|p| p.path)
        .ok_or_else(|| anyhow!("no serial port found; {}", Remedy::PassExplicitPort.hint()))
}

/// Full bring-up. Returns the process exit status.
fn run(cfg: &Config, manifest_path: &Path, results_dir: PathBuf, workspace: PathBuf) -> anyhow::Result<i32> {
    let manifest = match ats_manifest::load_manifest(manifest_path) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to load manifest {}: {e}", manifest_path.display());
            eprintln!("  -> {}", Remedy::FixManifest.hint());
            return Ok(1);
        }
    };
    tracing::info!(
        build = %manifest.build.build_number,
        artifact = manifest.artifact_name(),
        device = manifest.device_target(),
        test_plan = %manifest.test_plan().join(", "),
        "manifest loaded"
    );

    std::fs::create_dir_all(&results_dir).with_context(|| format!("create {}", results_dir.display()))?;
    // The locator checks that an override port exists before using it.
    let ctx = run_context(manifest_path, &manifest, workspace, results_dir, None);
    let jsonl = JsonlSink::create(&ctx.results_dir.join(DEBUG_LOG), ctx.run_id.as_str())
        .with_context(|| format!("open debug log in {}", ctx.results_dir.display()))?;
    let sink = FanoutSink::new().with(TracingSink).with(jsonl);

    let result = Orchestrator::new(cfg, Hardware::from_config(cfg)).run(&ctx, &sink);
    if let Err(e) = sink.flush() {
        tracing::warn!(error = %e, "debug log not flushed");
    }
    let result = result?;

    println!("{}: {} (exit code {})", result.run_id, result.status, result.exit_code());
    for t in &result.tests {
        if t.detail.is_empty() {
            println!("  {} {}", t.status, t.name);
        } else {
            println!("  {} {}: {}", t.status, t.name, t.detail.trim());
        }
    }
    Ok(result.exit_code())
}

fn capture(cfg: &Config, results_dir: &Path, budget_ms: Option<u64>) -> anyhow::Result<()> {
    let port = located_port(cfg)?;
    let hw = Hardware::from_config(cfg);
    let sink = TracingSink;
    let store = EvidenceStore::new(results_dir);
    if store.discard()? {
        sink.emit(RunEvent::EvidenceDiscarded { path: store.path() });
    }

    hw.channel.reset(&port, &sink).map_err(|e| anyhow!("{e}; {}", Remedy::ReplugDevice.hint()))?;
    let budget = budget_ms.map(std::time::Duration::from_millis).unwrap_or_else(|| cfg.timing.capture_budget());
    let cap = hw.channel.capture(&port, budget, &sink)?;
    if !cap.found {
        eprintln!("no boot output on {port} within {} ms", budget.as_millis());
        std::process::exit(1);
    }
    let evidence = BootEvidence::new(cap.bytes, cap.elapsed);
    let path = store.save(&evidence.bytes)?;
    sink.emit(RunEvent::EvidenceSaved {
        path: path.clone(),
        bytes: evidence.bytes.len(),
        since_reset_ms: evidence.since_reset_ms(),
    });
    match evidence.first_token(&cfg.procedure.boot_tokens) {
        Some(token) => println!("{} bytes -> {} (boot token {token:?})", evidence.bytes.len(), path.display()),
        None => println!("{} bytes -> {} (no boot token)", evidence.bytes.len(), path.display()),
    }
    Ok(())
}
