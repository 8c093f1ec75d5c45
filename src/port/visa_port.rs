//! Transports reached through the VISA resource manager: GPIB (VISA mode),
//! PXI, ASRL, USB-TMC and TCPIP.

use super::error::PortError;
use super::kind::PortKind;
use super::properties::PortProperties;
use super::traits::Transport;
use super::visa::{ResourceManager, VisaSession};
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// Write termination VISA sessions use unless a kind-specific one is set.
pub const DEFAULT_WRITE_TERMINATION: &str = "\r\n";

/// One VISA session, configured from port properties according to its kind.
#[derive(Debug)]
pub struct VisaPort {
    kind: PortKind,
    resource_manager: Arc<ResourceManager>,
    session: Option<Box<dyn VisaSession>>,
}

impl VisaPort {
    pub fn new(kind: PortKind, resource_manager: Arc<ResourceManager>) -> Self {
        Self {
            kind,
            resource_manager,
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut Box<dyn VisaSession>, PortError> {
        self.session.as_mut().ok_or(PortError::NotOpen)
    }

    /// Terminations `(write, read)` for this kind.
    fn terminations<'a>(&self, properties: &'a PortProperties) -> (Option<&'a str>, Option<&'a str>) {
        let (write, read) = match self.kind {
            PortKind::Gpib => (&properties.gpib_eol_write, &properties.gpib_eol_read),
            PortKind::Tcpip => (&properties.tcpip_eol_write, &properties.tcpip_eol_read),
            _ => (&None, &None),
        };
        (
            Some(write.as_deref().unwrap_or(DEFAULT_WRITE_TERMINATION)),
            read.as_deref(),
        )
    }

    /// ASRL and TCPIP sessions pause for `delay` after every write.
    fn pauses_after_write(&self) -> bool {
        matches!(self.kind, PortKind::Asrl | PortKind::Tcpip)
    }
}

impl Transport for VisaPort {
    fn open(&mut self, properties: &PortProperties) -> Result<(), PortError> {
        if let Some(mut stale) = self.session.take() {
            if let Err(e) = stale.close() {
                debug!("Closing stale session of {} failed: {}", properties.id, e);
            }
        }
        let backend = self.resource_manager.get()?;
        let mut session = backend.open(&properties.id, properties.timeout)?;
        session.set_timeout(properties.timeout)?;

        let (write_termination, read_termination) = self.terminations(properties);
        session.set_write_termination(write_termination)?;
        session.set_read_termination(read_termination)?;

        if self.kind == PortKind::Asrl {
            session.configure_serial(&properties.serial_settings())?;
            session.clear()?;
        }
        self.session = Some(session);
        Ok(())
    }

    fn close(&mut self, _properties: &PortProperties) -> Result<(), PortError> {
        if let Some(mut session) = self.session.take() {
            if self.kind == PortKind::Asrl {
                session.clear()?;
            }
            session.close()?;
        }
        Ok(())
    }

    fn clear(&mut self, _properties: &PortProperties) -> Result<(), PortError> {
        match self.session.as_mut() {
            Some(session) => session.clear(),
            None => Ok(()),
        }
    }

    fn write(&mut self, command: &str, properties: &PortProperties) -> Result<(), PortError> {
        let message = properties.encoding.encode(command).ok_or_else(|| {
            PortError::config(format!(
                "{command:?} cannot be encoded as {}",
                properties.encoding
            ))
        })?;
        self.write_raw(&message, properties)
    }

    fn write_raw(&mut self, data: &[u8], properties: &PortProperties) -> Result<(), PortError> {
        self.session()?.write(data)?;
        if self.pauses_after_write() && !properties.delay.is_zero() {
            thread::sleep(properties.delay);
        }
        Ok(())
    }

    /// VISA reads always return one complete message; `digits` is not used.
    fn read(&mut self, digits: usize, properties: &PortProperties) -> Result<String, PortError> {
        let message = match self.read_raw(digits, properties) {
            Err(PortError::Timeout(_)) if !properties.exception => return Ok(String::new()),
            other => other?,
        };
        properties.encoding.decode(&message).ok_or_else(|| PortError::Decode {
            resource: properties.id.clone(),
            encoding: properties.encoding.name().to_string(),
        })
    }

    fn read_raw(&mut self, _digits: usize, _properties: &PortProperties) -> Result<Vec<u8>, PortError> {
        self.session()?.read()
    }

    fn supports_identification(&self) -> bool {
        true
    }
}
