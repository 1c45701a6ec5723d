use std::io;

/// Linux errno values that mean the USB-serial channel is wedged rather than absent.
const EIO: i32 = 5;
const EBUSY: i32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("could not open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("serial i/o on {port} failed: {source}")]
    Io {
        port: String,
        #[source]
        source: io::Error,
    },
}

impl SerialError {
    pub fn open(port: &str, source: io::Error) -> Self {
        SerialError::Open { port: port.to_string(), source }
    }

    pub fn io(port: &str, source: io::Error) -> Self {
        SerialError::Io { port: port.to_string(), source }
    }

    pub fn source_io(&self) -> &io::Error {
        match self {
            SerialError::Open { source, .. } | SerialError::Io { source, .. } => source,
        }
    }

    /// True for stuck-driver symptoms (EIO / EBUSY) that a driver rebind can clear.
    pub fn is_port_fault(&self) -> bool {
        matches!(self.source_io().raw_os_error(), Some(EIO) | Some(EBUSY))
    }

    pub fn is_permission_denied(&self) -> bool {
        self.source_io().kind() == io::ErrorKind::PermissionDenied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eio_and_ebusy_are_port_faults() {
        assert!(SerialError::open("/dev/ttyUSB0", io::Error::from_raw_os_error(EIO)).is_port_fault());
        assert!(SerialError::io("/dev/ttyUSB0", io::Error::from_raw_os_error(EBUSY)).is_port_fault());
        assert!(!SerialError::open("/dev/ttyUSB0", io::Error::from(io::ErrorKind::NotFound)).is_port_fault());
    }
}
