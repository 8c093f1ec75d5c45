//! Access to the operating system's serial devices.
//!
//! COM ports and Prologix controllers never call `serialport` directly; they go
//! through a [`SerialBackend`] so tests can substitute
//! [`MockSerialBackend`](super::MockSerialBackend).

use super::error::PortError;
use super::sync_port::SyncSerialPort;
use super::traits::{SerialPortAdapter, SerialSettings};

/// Opens and enumerates serial devices.
pub trait SerialBackend: Send + Sync + std::fmt::Debug {
    /// Open `name` with the given line settings.
    fn open(
        &self,
        name: &str,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialPortAdapter>, PortError>;

    /// Names of the serial devices currently present.
    fn available_ports(&self) -> Result<Vec<String>, PortError>;
}

/// Serial backend using the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerialBackend;

impl SerialBackend for SystemSerialBackend {
    fn open(
        &self,
        name: &str,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialPortAdapter>, PortError> {
        Ok(Box::new(SyncSerialPort::open(name, settings)?))
    }

    fn available_ports(&self) -> Result<Vec<String>, PortError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .filter_map(|info| info.port_name.split(' ').next().map(str::to_string))
            .collect())
    }
}
