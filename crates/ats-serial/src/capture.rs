use std::time::Duration;

use ats_core::Clock;

use crate::{is_idle_read, SerialError, SerialOpener};

const CHUNK: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub baud: u32,
    /// Pause between opening the port and discarding its buffers.
    pub stabilize: Duration,
    /// Upper bound on a single blocking read.
    pub poll: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self { baud: 115_200, stabilize: Duration::from_millis(100), poll: Duration::from_millis(50) }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootCapture {
    pub found: bool,
    pub bytes: Vec<u8>,
    pub elapsed: Duration,
    /// Set when a read failed mid-capture; `bytes` holds what arrived before it.
    pub interrupted: Option<String>,
}

/// Records everything the device prints until `budget` runs out.
///
/// Must be called right after a reset: boot output only exists for a few
/// seconds. The budget covers stabilisation too, so the call returns at most
/// one `poll` interval after the budget expires. The port is closed on return.
pub fn capture_boot(
    opener: &dyn SerialOpener,
    clock: &dyn Clock,
    port: &str,
    settings: &CaptureSettings,
    budget: Duration,
) -> Result<BootCapture, SerialError> {
    let started = clock.now();
    let deadline = started + budget;

    let mut link = opener.open(port, settings.baud).map_err(|e| SerialError::open(port, e))?;
    clock.sleep(settings.stabilize.min(deadline.saturating_duration_since(clock.now())));
    link.discard_buffers().map_err(|e| SerialError::io(port, e))?;

    let mut bytes = Vec::new();
    let mut interrupted = None;
    let mut buf = [0u8; CHUNK];
    loop {
        let remaining = deadline.saturating_duration_since(clock.now());
        if remaining.is_zero() {
            break;
        }
        link.set_read_timeout(settings.poll.min(remaining)).map_err(|e| SerialError::io(port, e))?;
        match link.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => bytes.extend_from_slice(&buf[..n]),
            Err(e) if is_idle_read(&e) => {}
            Err(e) => {
                // USB-CDC devices can drop off the bus during reset; keep what we have.
                interrupted = Some(e.to_string());
                break;
            }
        }
    }

    Ok(BootCapture { found: !bytes.is_empty(), bytes, elapsed: clock.now() - started, interrupted })
}
