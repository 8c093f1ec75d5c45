//! The uniform port handle drivers talk to.
//!
//! A [`Port`] owns one transport and the effective properties of its
//! resource. It implements the behaviour shared by all transports: property
//! layering, idempotent open/close, write spacing, stripping and traffic
//! logging. Everything transport-specific is delegated to [`Transport`].

use super::encoding::latin1_lossless;
use super::error::PortError;
use super::kind::PortKind;
use super::properties::{PortProperties, PropertyIssue, PropertyOverrides};
use super::traits::Transport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, warn};

/// Identification returned by transports without a `*IDN?` query.
pub const IDENTIFICATION_NOT_AVAILABLE: &str = "not available";

/// A port as cached by the manager and handed out to drivers.
///
/// Every exchange must hold the lock; a query is two exchanges, so callers
/// that need it atomic keep the guard across both.
pub type SharedPort = Arc<Mutex<Port>>;

/// One communication channel to one resource.
#[derive(Debug)]
pub struct Port {
    properties: PortProperties,
    transport: Box<dyn Transport>,
    last_write: Option<Instant>,
}

impl Port {
    /// Wrap a transport. Properties start at the defaults of `kind`.
    pub fn new(kind: PortKind, resource: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let mut port = Self {
            properties: PortProperties::defaults(kind, resource),
            transport,
            last_write: None,
        };
        port.initialize_port_properties();
        port
    }

    pub fn into_shared(self) -> SharedPort {
        Arc::new(Mutex::new(self))
    }

    /// The resource string this port was created for.
    pub fn resource(&self) -> &str {
        &self.properties.id
    }

    pub fn kind(&self) -> PortKind {
        self.properties.kind
    }

    pub fn properties(&self) -> &PortProperties {
        &self.properties
    }

    pub fn is_open(&self) -> bool {
        self.properties.open
    }

    /// Whether this port showed up in the most recent discovery.
    pub fn is_active(&self) -> bool {
        self.properties.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.properties.active = active;
    }

    /// Reset every property to the defaults of the port's kind.
    ///
    /// Only the resource, the kind and the live open state survive; values
    /// applied by earlier requests are gone.
    pub fn initialize_port_properties(&mut self) {
        let mut fresh = PortProperties::defaults(self.properties.kind, self.properties.id.clone());
        fresh.open = self.properties.open;
        self.transport.initialize_properties(&mut fresh);
        self.properties = fresh;
    }

    /// Shallow-merge overrides into the current properties.
    ///
    /// Nothing is rejected; problems are logged and returned.
    pub fn update_properties(&mut self, overrides: &PropertyOverrides) -> Vec<PropertyIssue> {
        let issues = self.properties.apply(overrides);
        for issue in &issues {
            match issue {
                PropertyIssue::Unknown(key) => {
                    debug!("{}: keeping unknown property '{}'", self.properties.id, key)
                }
                PropertyIssue::Invalid { key, reason } => {
                    warn!("{}: ignoring property '{}': {}", self.properties.id, key, reason)
                }
                PropertyIssue::ReadOnly(key) => {
                    warn!("{}: property '{}' cannot be changed", self.properties.id, key)
                }
            }
        }
        issues
    }

    /// Open the channel. No-op when already open.
    pub fn open(&mut self) -> Result<(), PortError> {
        if self.properties.open {
            return Ok(());
        }
        self.transport.open(&self.properties)?;
        self.properties.open = true;
        if self.properties.clear {
            self.transport.clear(&self.properties)?;
        }
        debug!("Opened {}", self.properties.id);
        Ok(())
    }

    /// Close the channel. No-op when already closed.
    pub fn close(&mut self) -> Result<(), PortError> {
        if !self.properties.open {
            return Ok(());
        }
        self.transport.close(&self.properties)?;
        self.properties.open = false;
        debug!("Closed {}", self.properties.id);
        Ok(())
    }

    /// Flush the transport's buffers.
    pub fn clear(&mut self) -> Result<(), PortError> {
        self.transport.clear(&self.properties)
    }

    /// Send a command. Empty commands are not sent.
    pub fn write(&mut self, command: &str) -> Result<(), PortError> {
        if self.properties.debug {
            debug!("{} write: {:?}", self.properties.id, command);
        }
        if command.is_empty() {
            return Ok(());
        }
        self.wait_for_delay();
        self.transport.write(command, &self.properties)?;
        self.last_write = Some(Instant::now());
        Ok(())
    }

    /// Send bytes without encoding or termination.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), PortError> {
        if self.properties.debug {
            debug!("{} write_raw: {:?}", self.properties.id, latin1_lossless(data));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.wait_for_delay();
        self.transport.write_raw(data, &self.properties)?;
        self.last_write = Some(Instant::now());
        Ok(())
    }

    /// Read one answer.
    ///
    /// `digits == 0` reads up to the terminator, otherwise `digits` units.
    /// With `raw_read` the bytes are returned unstripped, one char per byte.
    pub fn read(&mut self, digits: usize) -> Result<String, PortError> {
        let answer = if self.properties.raw_read {
            latin1_lossless(&self.transport.read_raw(digits, &self.properties)?)
        } else {
            let answer = self.transport.read(digits, &self.properties)?;
            if self.properties.rstrip {
                answer.trim_end().to_string()
            } else {
                answer
            }
        };
        if self.properties.debug {
            debug!("{} read: {:?}", self.properties.id, answer);
        }
        Ok(answer)
    }

    /// Read one answer without decoding or stripping.
    pub fn read_raw(&mut self, digits: usize) -> Result<Vec<u8>, PortError> {
        let answer = self.transport.read_raw(digits, &self.properties)?;
        if self.properties.debug {
            debug!("{} read_raw: {:?}", self.properties.id, latin1_lossless(&answer));
        }
        Ok(answer)
    }

    /// Write `command`, then read the answer.
    pub fn query(&mut self, command: &str, digits: usize) -> Result<String, PortError> {
        self.write(command)?;
        self.read(digits)
    }

    /// `*IDN?` answer, or [`IDENTIFICATION_NOT_AVAILABLE`] on transports
    /// without one.
    pub fn get_identification(&mut self) -> Result<String, PortError> {
        if self.transport.supports_identification() {
            self.query("*IDN?", 0)
        } else {
            Ok(IDENTIFICATION_NOT_AVAILABLE.to_string())
        }
    }

    /// Turn traffic logging on or off.
    pub fn set_logging(&mut self, enabled: bool) {
        self.properties.debug = enabled;
    }

    pub fn logging(&self) -> bool {
        self.properties.debug
    }

    /// Sleep until `delay` has passed since the last write completed.
    fn wait_for_delay(&self) {
        let Some(last) = self.last_write else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed < self.properties.delay {
            thread::sleep(self.properties.delay - elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::com::ComPort;
    use crate::port::mock::MockSerialBackend;
    use crate::port::MockSerialPort;
    use serde_json::json;
    use std::time::Duration;

    fn com_port(resource: &str) -> (Port, MockSerialPort, MockSerialBackend) {
        let backend = MockSerialBackend::new();
        let device = backend.plug(resource);
        let port = Port::new(
            PortKind::Com,
            resource,
            Box::new(ComPort::new(Arc::new(backend.clone()))),
        );
        (port, device, backend)
    }

    #[test]
    fn test_open_close_idempotent() {
        let (mut port, _device, backend) = com_port("COM3");
        port.open().unwrap();
        port.open().unwrap();
        assert!(port.is_open());
        assert_eq!(backend.open_count("COM3"), 1);

        port.close().unwrap();
        port.close().unwrap();
        assert!(!port.is_open());
    }

    #[test]
    fn test_failed_write_does_not_delay_next_write() {
        let (mut port, device, _) = com_port("COM3");
        port.update_properties(&PropertyOverrides::new().with("delay", 2.0));
        port.open().unwrap();

        device.set_should_timeout(true);
        assert!(port.write("A").unwrap_err().is_timeout());

        device.expect_write(b"B\n");
        let start = Instant::now();
        port.write("B").unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        device.verify_expectations().unwrap();
    }

    #[test]
    fn test_initialize_discards_previous_overrides() {
        let (mut port, _device, _) = com_port("COM3");
        port.update_properties(&PropertyOverrides::new().with("baudrate", 115200).with("custom", 1));
        assert_eq!(port.properties().baudrate, 115200);
        port.open().unwrap();

        port.initialize_port_properties();
        assert_eq!(port.properties().baudrate, 9600);
        assert_eq!(port.properties().get("custom"), None);
        assert!(port.is_open());
    }

    #[test]
    fn test_read_strips_unless_raw() {
        let (mut port, device, _) = com_port("COM3");
        port.update_properties(&PropertyOverrides::new().with("EOLread", "\n"));
        port.open().unwrap();

        device.enqueue_read(b"  42  \n");
        assert_eq!(port.read(0).unwrap(), "  42");

        port.update_properties(&PropertyOverrides::new().with("raw_read", true));
        device.enqueue_read(b"  42  \n");
        assert_eq!(port.read(0).unwrap(), "  42  ");
    }

    #[test]
    fn test_empty_write_is_not_sent() {
        let (mut port, device, _) = com_port("COM3");
        port.open().unwrap();
        port.write("").unwrap();
        assert!(device.get_write_log().is_empty());
    }

    #[test]
    fn test_write_spacing() {
        let (mut port, _device, _) = com_port("COM3");
        port.update_properties(&PropertyOverrides::new().with("delay", 0.1));
        port.open().unwrap();

        let start = Instant::now();
        port.write("A").unwrap();
        port.write("B").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_query_and_identification() {
        let (mut port, device, _) = com_port("COM3");
        port.open().unwrap();
        device.respond_to(b"VOLT?\n", b"1.000\n");

        assert_eq!(port.query("VOLT?", 0).unwrap(), "1.000");
        assert_eq!(port.get_identification().unwrap(), IDENTIFICATION_NOT_AVAILABLE);
    }

    #[test]
    fn test_clear_on_open() {
        let (mut port, device, _) = com_port("COM3");
        port.update_properties(&PropertyOverrides::new().with("clear", true));
        port.open().unwrap();
        assert!(device.was_cleared());
    }

    #[test]
    fn test_failed_read_keeps_port_open() {
        let (mut port, _device, _) = com_port("COM3");
        port.open().unwrap();

        let err = port.read(0).unwrap_err();
        assert!(err.requires_close());
        assert!(port.is_open());
    }

    #[test]
    fn test_logging_toggle() {
        let (mut port, _device, _) = com_port("COM3");
        assert!(!port.logging());
        port.set_logging(true);
        assert!(port.logging());
        assert_eq!(port.properties().get("debug"), Some(json!(true)));
    }

    #[test]
    fn test_read_only_keys_are_reported() {
        let (mut port, _device, _) = com_port("COM3");
        let issues = port.update_properties(&PropertyOverrides::new().with("ID", "COM9"));
        assert_eq!(issues, vec![PropertyIssue::ReadOnly("ID".into())]);
        assert_eq!(port.resource(), "COM3");
    }
}
