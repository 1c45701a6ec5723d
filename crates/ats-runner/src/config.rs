use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ats_core::RetryPolicy;
use ats_flash::{EsptoolSettings, DEFAULT_BUSY_SIGNATURES};
use ats_serial::{CaptureSettings, PortLocator};

use crate::util::expand_path;

/// Everything a run needs to know, built once at startup and passed by reference.
///
/// Durations are stored in milliseconds so the TOML file stays readable.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub flash: FlashConfig,
    pub timing: TimingConfig,
    pub procedure: ProcedureConfig,
    pub devices: DevicesConfig,
    pub reports: ReportsConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    pub port_override: Option<String>,
    pub candidates: Vec<String>,
    pub scan_patterns: Vec<String>,
    pub monitor_baud: u32,
    pub drain_bauds: Vec<u32>,
    pub sysfs_root: String,
    pub recovery_settle_ms: u64,
    pub stabilize_ms: u64,
    pub poll_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlashConfig {
    pub tool: String,
    pub chip: String,
    pub baud: u32,
    pub offset: String,
    pub flash_mode: String,
    pub flash_freq: String,
    pub flash_size: String,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub busy_signatures: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub boot_wait_ms: u64,
    pub explicit_reset: bool,
    pub reset_delay_ms: u64,
    pub staleness_threshold_ms: u64,
    pub capture_budget_ms: u64,
    pub reset_pulse_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcedureConfig {
    /// Relative paths resolve against the workspace.
    pub path: String,
    pub working_dir: String,
    pub boot_tokens: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DevicesConfig {
    pub targets: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportsConfig {
    /// Defaults to `<results>/ats-metrics.json`.
    pub metrics_path: Option<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_override: None,
            candidates: ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyACM0", "/dev/ttyACM1"].map(String::from).to_vec(),
            scan_patterns: ["/dev/ttyUSB*", "/dev/ttyACM*"].map(String::from).to_vec(),
            monitor_baud: 115_200,
            drain_bauds: vec![115_200, 74_880, 460_800],
            sysfs_root: "/sys".to_string(),
            recovery_settle_ms: 1000,
            stabilize_ms: 100,
            poll_ms: 50,
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        let esptool = EsptoolSettings::default();
        let policy = RetryPolicy::default();
        Self {
            tool: esptool.program,
            chip: esptool.chip,
            baud: esptool.baud,
            offset: esptool.offset,
            flash_mode: esptool.flash_mode,
            flash_freq: esptool.flash_freq,
            flash_size: esptool.flash_size,
            max_attempts: policy.max_attempts,
            retry_backoff_ms: policy.backoff.as_millis() as u64,
            busy_signatures: DEFAULT_BUSY_SIGNATURES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            boot_wait_ms: 3000,
            explicit_reset: true,
            reset_delay_ms: 1000,
            staleness_threshold_ms: 3000,
            capture_budget_ms: 5000,
            reset_pulse_ms: 100,
        }
    }
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            path: "ats-test-esp32-demo/agent/run_tests.sh".to_string(),
            working_dir: "ats-test-esp32-demo".to_string(),
            boot_tokens: ["rst:0x", "ESP-ROM:", "ets ", "ESP-IDF", "Guru Meditation Error", "I (", "W (", "E ("]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self { targets: vec!["esp32".to_string()] }
    }
}

/// Values supplied on the command line; they win over the file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub port: Option<String>,
    pub no_reset: bool,
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    /// Loads `path` if given, else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from(p),
            None => Ok(Self::default()),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = self.to_toml()?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).with_context(|| "serialize toml")
    }

    pub fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(port) = &o.port {
            self.serial.port_override = Some(port.clone());
        }
        if o.no_reset {
            self.timing.explicit_reset = false;
        }
    }

    pub fn is_supported_target(&self, target: &str) -> bool {
        self.devices.targets.iter().any(|t| t == target)
    }

    pub fn locator(&self) -> PortLocator {
        PortLocator::new(self.serial.port_override.clone(), self.serial.candidates.clone(), self.serial.scan_patterns.clone())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            baud: self.serial.monitor_baud,
            stabilize: ms(self.serial.stabilize_ms),
            poll: ms(self.serial.poll_ms),
        }
    }

    pub fn esptool_settings(&self) -> EsptoolSettings {
        EsptoolSettings {
            program: self.flash.tool.clone(),
            chip: self.flash.chip.clone(),
            baud: self.flash.baud,
            offset: self.flash.offset.clone(),
            flash_mode: self.flash.flash_mode.clone(),
            flash_freq: self.flash.flash_freq.clone(),
            flash_size: self.flash.flash_size.clone(),
            ..EsptoolSettings::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { max_attempts: self.flash.max_attempts, backoff: ms(self.flash.retry_backoff_ms) }
    }

    pub fn metrics_path(&self, results_dir: &Path) -> PathBuf {
        match &self.reports.metrics_path {
            Some(p) => expand_path(p),
            None => results_dir.join(ats_artifacts::METRICS_FILE),
        }
    }

    pub fn procedure_path(&self, workspace: &Path) -> PathBuf {
        workspace.join(expand_path(&self.procedure.path))
    }

    pub fn procedure_dir(&self, workspace: &Path) -> PathBuf {
        workspace.join(expand_path(&self.procedure.working_dir))
    }
}

impl TimingConfig {
    pub fn boot_wait(&self) -> Duration {
        ms(self.boot_wait_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        ms(self.reset_delay_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        ms(self.staleness_threshold_ms)
    }

    pub fn capture_budget(&self) -> Duration {
        ms(self.capture_budget_ms)
    }

    pub fn reset_pulse(&self) -> Duration {
        ms(self.reset_pulse_ms)
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}
