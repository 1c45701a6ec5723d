//! In-memory serial doubles for tests and fixture scenarios.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ats_core::{EventSink, RunEvent};

use crate::{BootCapture, BootChannel, SerialError, SerialLink, SerialOpener};

/// What a fake device does once opened.
#[derive(Debug, Default)]
pub struct FakeScript {
    chunks: VecDeque<Vec<u8>>,
    error_when_drained: bool,
    open_errors: VecDeque<io::Error>,
    failing_bauds: Vec<u32>,
}

impl FakeScript {
    /// Yields `chunks` one read at a time, then times out on every read.
    pub fn chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self { chunks: chunks.into(), ..Self::default() }
    }

    /// Yields `chunks`, then fails reads with EIO.
    pub fn chunks_then_error(chunks: Vec<Vec<u8>>) -> Self {
        Self { chunks: chunks.into(), error_when_drained: true, ..Self::default() }
    }

    /// The first open fails with `err`.
    pub fn open_error(err: io::Error) -> Self {
        Self { open_errors: VecDeque::from([err]), ..Self::default() }
    }

    /// Opens at any of `bauds` fail with an invalid-input error.
    pub fn rejecting_bauds(mut self, bauds: &[u32]) -> Self {
        self.failing_bauds.extend_from_slice(bauds);
        self
    }
}

#[derive(Debug, Default)]
struct FakeState {
    script: FakeScript,
    opened: Vec<(String, u32)>,
    discards: u32,
    lines: Vec<(&'static str, bool)>,
}

#[derive(Clone, Debug)]
pub struct FakeOpener {
    state: Arc<Mutex<FakeState>>,
}

impl FakeOpener {
    pub fn new(script: FakeScript) -> Self {
        Self { state: Arc::new(Mutex::new(FakeState { script, ..FakeState::default() })) }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn opened(&self) -> Vec<(String, u32)> {
        self.lock().opened.clone()
    }

    pub fn discards(&self) -> u32 {
        self.lock().discards
    }

    /// Modem-line writes in order, as `("dtr" | "rts", level)`.
    pub fn lines(&self) -> Vec<(&'static str, bool)> {
        self.lock().lines.clone()
    }
}

impl SerialOpener for FakeOpener {
    fn open(&self, port: &str, baud: u32) -> io::Result<Box<dyn SerialLink>> {
        let mut st = self.lock();
        if let Some(err) = st.script.open_errors.pop_front() {
            return Err(err);
        }
        if st.script.failing_bauds.contains(&baud) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported baud {baud}")));
        }
        st.opened.push((port.to_string(), baud));
        Ok(Box::new(FakeLink { state: self.state.clone(), timeout: Duration::from_millis(10) }))
    }
}

pub struct FakeLink {
    state: Arc<Mutex<FakeState>>,
    timeout: Duration,
}

impl FakeLink {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SerialLink for FakeLink {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut st = self.lock();
            if let Some(mut chunk) = st.script.chunks.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    st.script.chunks.push_front(chunk.split_off(n));
                }
                return Ok(n);
            }
            if st.script.error_when_drained {
                return Err(io::Error::from_raw_os_error(5));
            }
        }
        std::thread::sleep(self.timeout);
        Err(io::Error::from(io::ErrorKind::TimedOut))
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.lock().discards += 1;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.lock().lines.push(("dtr", level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.lock().lines.push(("rts", level));
        Ok(())
    }
}

/// Boot channel that replays canned captures and records every call.
#[derive(Default)]
pub struct ScriptedBootChannel {
    inner: Mutex<ScriptedInner>,
}

#[derive(Default)]
struct ScriptedInner {
    captures: VecDeque<Vec<u8>>,
    reset_faults: u32,
    calls: Vec<String>,
}

impl ScriptedBootChannel {
    pub fn new(captures: Vec<Vec<u8>>) -> Self {
        Self { inner: Mutex::new(ScriptedInner { captures: captures.into(), ..ScriptedInner::default() }) }
    }

    /// The next `n` resets fail with EIO.
    pub fn with_reset_faults(self, n: u32) -> Self {
        self.lock().reset_faults = n;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Call log: "reset", "drain", "capture".
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }
}

impl BootChannel for ScriptedBootChannel {
    fn reset(&self, port: &str, events: &dyn EventSink) -> Result<(), SerialError> {
        let mut inner = self.lock();
        inner.calls.push("reset".into());
        if inner.reset_faults > 0 {
            inner.reset_faults -= 1;
            return Err(SerialError::open(port, io::Error::from_raw_os_error(5)));
        }
        events.emit(RunEvent::ResetIssued { port: port.to_string(), method: "scripted".into() });
        Ok(())
    }

    fn drain(&self, port: &str, bauds: &[u32], events: &dyn EventSink) -> Option<u32> {
        self.lock().calls.push("drain".into());
        let baud = bauds.first().copied();
        events.emit(RunEvent::BuffersDrained { port: port.to_string(), baud });
        baud
    }

    fn capture(&self, port: &str, _budget: Duration, events: &dyn EventSink) -> Result<BootCapture, SerialError> {
        let mut inner = self.lock();
        inner.calls.push("capture".into());
        let bytes = inner.captures.pop_front().unwrap_or_default();
        events.emit(RunEvent::BootCaptured { port: port.to_string(), bytes: bytes.len(), elapsed_ms: 0 });
        Ok(BootCapture { found: !bytes.is_empty(), bytes, elapsed: Duration::ZERO, interrupted: None })
    }
}
