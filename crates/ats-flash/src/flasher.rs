use std::path::{Path, PathBuf};
use std::sync::Arc;

use ats_core::{Clock, EventSink, Remedy, RetryAction, RetryPolicy, RunEvent};
use ats_serial::{PortLocator, PortRepair};

use crate::{FlashTool, ToolOutput};

/// Substrings in tool output that mean the port was busy or wedged, not that the flash was bad.
pub const DEFAULT_BUSY_SIGNATURES: [&str; 4] = ["could not open", "[Errno 5]", "Input/output error", "port is busy"];

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("no serial port found for the target board")]
    NoPort,
    #[error("firmware not found: {0}")]
    ImageMissing(PathBuf),
    #[error("{program} could not be started: {source}")]
    ToolUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serial port stayed busy after {attempts} attempts: {detail}")]
    PortBusy { attempts: u32, detail: String },
    #[error("flash failed on attempt {attempt}: {detail}")]
    Fatal { attempt: u32, detail: String },
}

impl FlashError {
    pub fn remedy(&self) -> Remedy {
        match self {
            FlashError::NoPort => Remedy::PassExplicitPort,
            FlashError::ImageMissing(_) => Remedy::CheckFirmwareImage,
            FlashError::ToolUnavailable { .. } => Remedy::InstallFlashTool,
            FlashError::PortBusy { .. } => Remedy::ReplugDevice,
            FlashError::Fatal { .. } => Remedy::CheckFirmwareImage,
        }
    }

    /// Tool invocations made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            FlashError::PortBusy { attempts, .. } => *attempts,
            FlashError::Fatal { attempt, .. } => *attempt,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashReport {
    pub port: String,
    pub attempts: u32,
    pub repairs: u32,
}

/// Classification of a single tool run. Private to the retry loop.
#[derive(Debug, PartialEq, Eq)]
enum FlashAttempt {
    Success,
    PortError(String),
    FatalError(String),
}

/// Runs the flashing tool with bounded retries for transient port errors.
pub struct Flasher {
    tool: Arc<dyn FlashTool>,
    repair: Arc<dyn PortRepair>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    busy_signatures: Vec<String>,
}

impl Flasher {
    pub fn new(tool: Arc<dyn FlashTool>, repair: Arc<dyn PortRepair>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tool,
            repair,
            clock,
            policy: RetryPolicy::default(),
            busy_signatures: DEFAULT_BUSY_SIGNATURES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_busy_signatures(mut self, signatures: Vec<String>) -> Self {
        self.busy_signatures = signatures;
        self
    }

    /// Resolves the port: a caller-pinned one as given, else whatever the locator
    /// finds. Configured overrides belong in the locator, which checks they exist.
    pub fn resolve_port(&self, port: Option<&str>, locator: &PortLocator, events: &dyn EventSink) -> Result<String, FlashError> {
        if let Some(p) = port {
            return Ok(p.to_string());
        }
        match locator.locate() {
            Some(found) => {
                events.emit(RunEvent::PortLocated { port: found.path.clone(), source: found.source.as_str().into() });
                Ok(found.path)
            }
            None => {
                events.emit(RunEvent::PortMissing);
                Err(FlashError::NoPort)
            }
        }
    }

    /// Flash `image`. A successful flash leaves the device freshly reset by the tool.
    pub fn flash(
        &self,
        image: &Path,
        port: Option<&str>,
        locator: &PortLocator,
        events: &dyn EventSink,
    ) -> Result<FlashReport, FlashError> {
        let port = self.resolve_port(port, locator, events)?;
        if !image.exists() {
            return Err(FlashError::ImageMissing(image.to_path_buf()));
        }

        tracing::info!(%port, image = %image.display(), "flashing firmware");
        let mut repairs = 0;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let output = self
                .tool
                .write_flash(image, &port)
                .map_err(|source| FlashError::ToolUnavailable { program: self.tool.program().to_string(), source })?;

            match self.classify(&output) {
                FlashAttempt::Success => {
                    events.emit(RunEvent::FlashAttempt { attempt, outcome: "success".into(), detail: String::new() });
                    return Ok(FlashReport { port, attempts: attempt, repairs });
                }
                FlashAttempt::FatalError(detail) => {
                    events.emit(RunEvent::FlashAttempt { attempt, outcome: "fatal".into(), detail: detail.clone() });
                    return Err(FlashError::Fatal { attempt, detail });
                }
                FlashAttempt::PortError(detail) => {
                    events.emit(RunEvent::FlashAttempt { attempt, outcome: "port_busy".into(), detail: detail.clone() });
                    match self.policy.after_port_error(attempt) {
                        None => return Err(FlashError::PortBusy { attempts: attempt, detail }),
                        Some(RetryAction::Repair) => {
                            if self.repair.repair(&port, events) {
                                repairs += 1;
                            }
                        }
                        Some(RetryAction::Wait(d)) => self.clock.sleep(d),
                    }
                }
            }
        }
    }

    /// Tool-driven reset (`run`). Not retried.
    pub fn reset(&self, port: &str, events: &dyn EventSink) -> Result<(), FlashError> {
        let output = self
            .tool
            .run_app(port)
            .map_err(|source| FlashError::ToolUnavailable { program: self.tool.program().to_string(), source })?;
        if output.success() {
            events.emit(RunEvent::ResetIssued { port: port.to_string(), method: "flash-tool".into() });
            Ok(())
        } else {
            Err(FlashError::Fatal { attempt: 1, detail: output.error_text().to_string() })
        }
    }

    fn classify(&self, output: &ToolOutput) -> FlashAttempt {
        if output.success() {
            return FlashAttempt::Success;
        }
        let detail = output.error_text().to_string();
        let busy = self
            .busy_signatures
            .iter()
            .any(|sig| output.stderr.contains(sig.as_str()) || output.stdout.contains(sig.as_str()));
        if busy {
            FlashAttempt::PortError(detail)
        } else {
            FlashAttempt::FatalError(detail)
        }
    }
}
