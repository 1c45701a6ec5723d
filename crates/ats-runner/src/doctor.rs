use std::path::{Path, PathBuf};

use ats_core::Remedy;

use crate::Config;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
    pub remedy: Option<Remedy>,
}

impl Check {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self { name, ok: true, detail: detail.into(), remedy: None }
    }

    fn fail(name: &'static str, detail: impl Into<String>, remedy: Remedy) -> Self {
        Self { name, ok: false, detail: detail.into(), remedy: Some(remedy) }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DoctorReport {
    pub checks: Vec<Check>,
}

impl DoctorReport {
    pub fn ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

/// Filesystem locations probed for GPIO access.
#[derive(Clone, Debug)]
pub struct GpioPaths(pub Vec<PathBuf>);

impl Default for GpioPaths {
    fn default() -> Self {
        Self(vec![PathBuf::from("/sys/class/gpio"), PathBuf::from("/dev/gpiomem")])
    }
}

/// Preflight for the bench: tool, port, GPIO, results directory.
pub fn doctor(cfg: &Config, results_dir: &Path, gpio: &GpioPaths) -> DoctorReport {
    let mut checks = vec![check_tool(&cfg.flash.tool)];
    checks.extend(check_port(cfg));
    checks.push(check_gpio(gpio));
    checks.push(check_results_dir(results_dir));
    DoctorReport { checks }
}

fn check_tool(program: &str) -> Check {
    match which::which(program) {
        Ok(path) => Check::pass("flash tool", path.display().to_string()),
        Err(_) => Check::fail("flash tool", format!("{program} not found on PATH"), Remedy::InstallFlashTool),
    }
}

fn check_port(cfg: &Config) -> Vec<Check> {
    let Some(found) = cfg.locator().locate() else {
        return vec![Check::fail("serial port", "no serial device found", Remedy::ReplugDevice)];
    };
    let located = Check::pass("serial port", format!("{} ({})", found.path, found.source.as_str()));
    let access = match open_rw(Path::new(&found.path)) {
        Ok(()) => Check::pass("port access", "read/write"),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Check::fail("port access", format!("{}: {e}", found.path), Remedy::CheckPermissions)
        }
        Err(e) => Check::fail("port access", format!("{}: {e}", found.path), Remedy::ReplugDevice),
    };
    vec![located, access]
}

/// Opens without waiting for carrier and without toggling modem lines.
fn open_rw(path: &Path) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.read(true).write(true);
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        // O_NONBLOCK | O_NOCTTY
        opts.custom_flags(0o4000 | 0o400);
    }
    opts.open(path).map(drop)
}

fn check_gpio(gpio: &GpioPaths) -> Check {
    match gpio.0.iter().find(|p| p.exists()) {
        Some(p) => Check::pass("gpio", p.display().to_string()),
        None => Check::fail("gpio", "no GPIO interface visible", Remedy::CheckPermissions),
    }
}

fn check_results_dir(dir: &Path) -> Check {
    let probe = dir.join(".ats-doctor");
    let res = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&probe, b"ok")).and_then(|_| std::fs::remove_file(&probe));
    match res {
        Ok(()) => Check::pass("results dir", dir.display().to_string()),
        Err(e) => Check::fail("results dir", format!("{}: {e}", dir.display()), Remedy::CheckPermissions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bench(dir: &Path) -> Config {
        let mut cfg = Config::default();
        cfg.flash.tool = "sh".into();
        let port = dir.join("ttyUSB9");
        std::fs::write(&port, b"").unwrap();
        cfg.serial.port_override = Some(port.display().to_string());
        cfg.serial.candidates.clear();
        cfg.serial.scan_patterns.clear();
        cfg
    }

    #[test]
    fn healthy_bench_passes() {
        let dir = tempdir().unwrap();
        let cfg = bench(dir.path());
        let gpio = GpioPaths(vec![dir.path().to_path_buf()]);
        let report = doctor(&cfg, &dir.path().join("results"), &gpio);
        assert!(report.ok(), "{:?}", report.checks);
        assert_eq!(report.checks.len(), 5);
    }

    #[test]
    fn missing_pieces_are_reported_with_remedies() {
        let dir = tempdir().unwrap();
        let mut cfg = bench(dir.path());
        cfg.flash.tool = "definitely-not-a-flash-tool".into();
        cfg.serial.port_override = None;
        let gpio = GpioPaths(vec![dir.path().join("nope")]);
        let report = doctor(&cfg, &dir.path().join("results"), &gpio);

        assert!(!report.ok());
        let failed: Vec<_> = report.checks.iter().filter(|c| !c.ok).map(|c| (c.name, c.remedy)).collect();
        assert_eq!(
            failed,
            vec![
                ("flash tool", Some(Remedy::InstallFlashTool)),
                ("serial port", Some(Remedy::ReplugDevice)),
                ("gpio", Some(Remedy::CheckPermissions)),
            ]
        );
    }
}
