use std::io::Read;
use std::path::Path;
use std::process::Command;

use sha2::{Digest, Sha256};

/// Captured result of one flashing-tool invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Error text to show the operator: stderr, or stdout when stderr is empty.
    pub fn error_text(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim()
        } else {
            err
        }
    }
}

/// External flashing tool. Implementations block until the subprocess exits.
pub trait FlashTool: Send + Sync {
    fn program(&self) -> &str;

    /// Write `image` to the device behind `port`. `Err` means the tool could not be started.
    fn write_flash(&self, image: &Path, port: &str) -> std::io::Result<ToolOutput>;

    /// Leave the bootloader and run the application (a tool-driven reset).
    fn run_app(&self, port: &str) -> std::io::Result<ToolOutput>;
}

/// Fixed argument template for `esptool.py`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EsptoolSettings {
    pub program: String,
    pub chip: String,
    pub baud: u32,
    pub offset: String,
    pub flash_mode: String,
    pub flash_freq: String,
    pub flash_size: String,
    pub before: String,
    pub after: String,
}

impl Default for EsptoolSettings {
    fn default() -> Self {
        Self {
            program: "esptool.py".into(),
            chip: "auto".into(),
            baud: 460_800,
            offset: "0x10000".into(),
            flash_mode: "dio".into(),
            flash_freq: "40m".into(),
            flash_size: "detect".into(),
            before: "default_reset".into(),
            after: "hard_reset".into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Esptool {
    pub settings: EsptoolSettings,
}

impl Esptool {
    pub fn new(settings: EsptoolSettings) -> Self {
        Self { settings }
    }

    pub fn write_flash_args(&self, image: &Path, port: &str) -> Vec<String> {
        let s = &self.settings;
        vec![
            "--chip".into(),
            s.chip.clone(),
            "--port".into(),
            port.to_string(),
            "--baud".into(),
            s.baud.to_string(),
            "--before".into(),
            s.before.clone(),
            "--after".into(),
            s.after.clone(),
            "write_flash".into(),
            "--flash_mode".into(),
            s.flash_mode.clone(),
            "--flash_freq".into(),
            s.flash_freq.clone(),
            "--flash_size".into(),
            s.flash_size.clone(),
            s.offset.clone(),
            image.display().to_string(),
        ]
    }

    fn run(&self, args: &[String]) -> std::io::Result<ToolOutput> {
        tracing::debug!(program = %self.settings.program, ?args, "spawning flashing tool");
        let out = Command::new(&self.settings.program).args(args).output()?;
        Ok(ToolOutput {
            exit_code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

impl FlashTool for Esptool {
    fn program(&self) -> &str {
        &self.settings.program
    }

    fn write_flash(&self, image: &Path, port: &str) -> std::io::Result<ToolOutput> {
        self.run(&self.write_flash_args(image, port))
    }

    fn run_app(&self, port: &str) -> std::io::Result<ToolOutput> {
        let args = ["--chip", self.settings.chip.as_str(), "--port", port, "run"].map(String::from);
        self.run(&args)
    }
}

/// Hex SHA-256 of a firmware image, streamed so large images are not buffered.
pub fn image_digest(path: &Path) -> std::io::Result<String> {
    let mut f = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
