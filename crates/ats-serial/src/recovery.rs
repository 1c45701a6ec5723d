use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ats_core::{Clock, EventSink, RunEvent};

/// Last-resort remedy for a serial device stuck in an I/O-error state.
///
/// Only call this in reaction to an observed port-busy / EIO failure.
pub trait PortRepair: Send + Sync {
    fn repair(&self, port: &str, events: &dyn EventSink) -> bool;
}

/// The driver's bind/unbind control files for one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverBinding {
    pub device_id: String,
    pub driver_dir: PathBuf,
}

impl DriverBinding {
    pub fn unbind_path(&self) -> PathBuf {
        self.driver_dir.join("unbind")
    }

    pub fn bind_path(&self) -> PathBuf {
        self.driver_dir.join("bind")
    }
}

/// Rebinds the kernel driver behind a tty through sysfs.
pub struct SysfsRecovery {
    sysfs_root: PathBuf,
    settle: Duration,
    clock: Arc<dyn Clock>,
}

impl SysfsRecovery {
    pub fn new(sysfs_root: impl Into<PathBuf>, settle: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { sysfs_root: sysfs_root.into(), settle, clock }
    }

    /// Walks `class/tty/<name>/device` to the owning driver. `None` if any link is missing.
    pub fn resolve(&self, port: &str) -> Option<DriverBinding> {
        // Follow /dev/serial/by-id style symlinks to the real tty node first.
        let real = std::fs::canonicalize(port).unwrap_or_else(|_| PathBuf::from(port));
        let tty_name = real.file_name()?.to_str()?.to_string();

        let device = std::fs::canonicalize(self.sysfs_root.join("class").join("tty").join(&tty_name).join("device")).ok()?;
        let device_id = device.file_name()?.to_str()?.to_string();
        let driver_dir = std::fs::canonicalize(device.join("driver")).ok()?;

        let binding = DriverBinding { device_id, driver_dir };
        if binding.unbind_path().exists() && binding.bind_path().exists() {
            Some(binding)
        } else {
            None
        }
    }
}

impl PortRepair for SysfsRecovery {
    fn repair(&self, port: &str, events: &dyn EventSink) -> bool {
        let Some(binding) = self.resolve(port) else {
            events.emit(RunEvent::PortRepairSkipped {
                port: port.to_string(),
                reason: "driver binding not found in sysfs".into(),
            });
            return false;
        };

        if let Err(e) = write_control(&binding.unbind_path(), &binding.device_id) {
            events.emit(RunEvent::PortRepairSkipped { port: port.to_string(), reason: format!("unbind failed: {e}") });
            return false;
        }
        self.clock.sleep(self.settle);

        if let Err(e) = write_control(&binding.bind_path(), &binding.device_id) {
            events.emit(RunEvent::diagnostic(
                format!("driver for {port} was unbound but rebinding failed: {e}"),
                Some(ats_core::Remedy::ReplugDevice),
            ));
            return false;
        }
        self.clock.sleep(self.settle);

        events.emit(RunEvent::PortRepaired { port: port.to_string(), device: binding.device_id });
        true
    }
}

fn write_control(path: &Path, device_id: &str) -> std::io::Result<()> {
    std::fs::write(path, device_id.as_bytes())
}

/// Test double that counts calls and returns a fixed answer.
#[derive(Clone, Default)]
pub struct CountingRepair {
    calls: Arc<AtomicU32>,
    succeed: bool,
}

impl CountingRepair {
    pub fn new(succeed: bool) -> Self {
        Self { calls: Arc::new(AtomicU32::new(0)), succeed }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PortRepair for CountingRepair {
    fn repair(&self, port: &str, events: &dyn EventSink) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            events.emit(RunEvent::PortRepaired { port: port.to_string(), device: "fake".into() });
        }
        self.succeed
    }
}
