use std::io;
use std::time::Duration;

/// Minimal blocking serial channel. Dropping the link closes the port.
pub trait SerialLink: Send {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn discard_buffers(&mut self) -> io::Result<()>;
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;
    fn set_rts(&mut self, level: bool) -> io::Result<()>;
}

pub trait SerialOpener: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> io::Result<Box<dyn SerialLink>>;
}

/// Read errors that only mean "nothing arrived before the timeout".
pub fn is_idle_read(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Real hardware, via the `serial2` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct Serial2Opener;

impl SerialOpener for Serial2Opener {
    fn open(&self, port: &str, baud: u32) -> io::Result<Box<dyn SerialLink>> {
        let port = serial2::SerialPort::open(port, baud)?;
        Ok(Box::new(Serial2Link { port }))
    }
}

pub struct Serial2Link {
    port: serial2::SerialPort,
}

impl SerialLink for Serial2Link {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_read_timeout(timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.port.discard_buffers()
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port.set_dtr(level)
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.port.set_rts(level)
    }
}
