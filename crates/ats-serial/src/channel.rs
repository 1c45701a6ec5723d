use std::sync::Arc;
use std::time::Duration;

use ats_core::{Clock, EventSink, RunEvent};

use crate::{capture_boot, BootCapture, CaptureSettings, SerialError, SerialOpener};

/// Serial-side operations the orchestrator needs between flashing and testing.
///
/// Every call opens the port and closes it before returning; nothing holds the
/// device while the flashing tool runs.
pub trait BootChannel: Send + Sync {
    /// Pulses the reset line so the device boots from a known state.
    fn reset(&self, port: &str, events: &dyn EventSink) -> Result<(), SerialError>;

    /// Best-effort buffer flush. Tries each baud in order; returns the one that worked.
    fn drain(&self, port: &str, bauds: &[u32], events: &dyn EventSink) -> Option<u32>;

    fn capture(&self, port: &str, budget: Duration, events: &dyn EventSink) -> Result<BootCapture, SerialError>;
}

pub struct SerialBootChannel {
    opener: Box<dyn SerialOpener>,
    clock: Arc<dyn Clock>,
    settings: CaptureSettings,
    reset_pulse: Duration,
}

impl SerialBootChannel {
    pub fn new(opener: Box<dyn SerialOpener>, clock: Arc<dyn Clock>, settings: CaptureSettings, reset_pulse: Duration) -> Self {
        Self { opener, clock, settings, reset_pulse }
    }
}

impl BootChannel for SerialBootChannel {
    /// Classic ESP auto-reset wiring: RTS drives EN, DTR drives IO0.
    /// DTR stays released so the chip boots the application, not the ROM loader.
    fn reset(&self, port: &str, events: &dyn EventSink) -> Result<(), SerialError> {
        let mut link = self.opener.open(port, self.settings.baud).map_err(|e| SerialError::open(port, e))?;
        let io = |e| SerialError::io(port, e);
        link.set_dtr(false).map_err(io)?;
        link.set_rts(true).map_err(io)?;
        self.clock.sleep(self.reset_pulse);
        link.set_rts(false).map_err(io)?;
        events.emit(RunEvent::ResetIssued { port: port.to_string(), method: "rts-pulse".into() });
        Ok(())
    }

    fn drain(&self, port: &str, bauds: &[u32], events: &dyn EventSink) -> Option<u32> {
        for &baud in bauds {
            let drained = self.opener.open(port, baud).and_then(|mut link| link.discard_buffers());
            match drained {
                Ok(()) => {
                    events.emit(RunEvent::BuffersDrained { port: port.to_string(), baud: Some(baud) });
                    return Some(baud);
                }
                Err(e) => tracing::debug!(%port, baud, error = %e, "buffer drain attempt failed"),
            }
        }
        events.emit(RunEvent::BuffersDrained { port: port.to_string(), baud: None });
        None
    }

    fn capture(&self, port: &str, budget: Duration, events: &dyn EventSink) -> Result<BootCapture, SerialError> {
        let cap = capture_boot(self.opener.as_ref(), self.clock.as_ref(), port, &self.settings, budget)?;
        if let Some(reason) = &cap.interrupted {
            tracing::warn!(%port, %reason, "boot capture ended early");
        }
        events.emit(RunEvent::BootCaptured {
            port: port.to_string(),
            bytes: cap.bytes.len(),
            elapsed_ms: cap.elapsed.as_millis() as u64,
        });
        Ok(cap)
    }
}
