//! Serial (COM) transport.

use super::encoding::TextEncoding;
use super::error::PortError;
use super::properties::PortProperties;
use super::serial_backend::SerialBackend;
use super::traits::{is_silence, SerialPortAdapter, Transport};
use std::sync::Arc;
use tracing::{debug, error};

/// A serial line opened through a [`SerialBackend`].
pub struct ComPort {
    backend: Arc<dyn SerialBackend>,
    link: Option<Box<dyn SerialPortAdapter>>,
}

impl std::fmt::Debug for ComPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComPort")
            .field("link", &self.link.as_ref().map(|l| l.name().to_string()))
            .finish()
    }
}

impl ComPort {
    pub fn new(backend: Arc<dyn SerialBackend>) -> Self {
        Self {
            backend,
            link: None,
        }
    }

    fn link(&mut self) -> Result<&mut Box<dyn SerialPortAdapter>, PortError> {
        self.link.as_mut().ok_or(PortError::NotOpen)
    }

    /// Read byte by byte until the read terminator or silence.
    ///
    /// Returns the payload without terminator and whether the terminator was
    /// seen.
    fn readline(&mut self, properties: &PortProperties) -> Result<(Vec<u8>, bool), PortError> {
        let eol = encode(properties.encoding, properties.read_terminator())?;
        let link = self.link()?;
        let mut line = Vec::new();
        while let Some(byte) = link.read_byte()? {
            line.push(byte);
            if !eol.is_empty() && line.ends_with(&eol) {
                line.truncate(line.len() - eol.len());
                return Ok((line, true));
            }
        }
        Ok((line, false))
    }

    /// Read exactly `digits` bytes, stopping early when the line goes quiet.
    fn read_exact(&mut self, digits: usize) -> Result<Vec<u8>, PortError> {
        let link = self.link()?;
        let mut buffer = vec![0u8; digits];
        let mut filled = 0;
        while filled < digits {
            match link.read_bytes(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if is_silence(&e) => break,
                Err(e) => return Err(e),
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn receive(
        &mut self,
        digits: usize,
        properties: &PortProperties,
    ) -> Result<(Vec<u8>, bool), PortError> {
        if digits == 0 {
            self.readline(properties)
        } else {
            Ok((self.read_exact(digits)?, true))
        }
    }
}

fn encode(encoding: TextEncoding, text: &str) -> Result<Vec<u8>, PortError> {
    encoding
        .encode(text)
        .ok_or_else(|| PortError::config(format!("{text:?} cannot be encoded as {encoding}")))
}

impl Transport for ComPort {
    fn open(&mut self, properties: &PortProperties) -> Result<(), PortError> {
        // reopen so that changed line settings take effect
        if self.link.take().is_some() {
            debug!("Reopening {} with current settings", properties.id);
        }
        let mut link = self
            .backend
            .open(&properties.id, &properties.serial_settings())?;
        link.clear_buffers()?;
        self.link = Some(link);
        Ok(())
    }

    fn close(&mut self, _properties: &PortProperties) -> Result<(), PortError> {
        self.link = None;
        Ok(())
    }

    fn clear(&mut self, _properties: &PortProperties) -> Result<(), PortError> {
        match self.link.as_mut() {
            Some(link) => link.clear_buffers(),
            None => Ok(()),
        }
    }

    fn write(&mut self, command: &str, properties: &PortProperties) -> Result<(), PortError> {
        let eol = properties.write_terminator();
        let message = if properties.raw_write {
            let mut bytes = encode(TextEncoding::Latin1, command)?;
            bytes.extend(encode(properties.encoding, eol)?);
            bytes
        } else {
            encode(properties.encoding, &format!("{command}{eol}"))?
        };
        self.link()?.write_bytes(&message).map(|_| ())
    }

    fn write_raw(&mut self, data: &[u8], _properties: &PortProperties) -> Result<(), PortError> {
        self.link()?.write_bytes(data).map(|_| ())
    }

    fn read(&mut self, digits: usize, properties: &PortProperties) -> Result<String, PortError> {
        let (bytes, eol_found) = self.receive(digits, properties)?;

        let answer = properties.encoding.decode(&bytes).ok_or_else(|| {
            error!(
                "Unable to decode the reading from {}. Check whether the baudrate and the \
                 terminator are correct, or set 'raw_read' to get the raw reading",
                properties.id
            );
            PortError::Decode {
                resource: properties.id.clone(),
                encoding: properties.encoding.name().to_string(),
            }
        })?;

        if answer.is_empty() && !eol_found && properties.exception {
            return Err(PortError::NoResponse {
                kind: properties.kind.to_string(),
                resource: properties.id.clone(),
            });
        }
        Ok(answer)
    }

    fn read_raw(&mut self, digits: usize, properties: &PortProperties) -> Result<Vec<u8>, PortError> {
        self.receive(digits, properties).map(|(bytes, _)| bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::kind::PortKind;
    use crate::port::mock::MockSerialBackend;
    use crate::port::traits::Parity;

    fn open_port(props: &PortProperties) -> (ComPort, crate::port::MockSerialPort, MockSerialBackend) {
        let backend = MockSerialBackend::new();
        let device = backend.plug(&props.id);
        let mut port = ComPort::new(Arc::new(backend.clone()));
        port.open(props).unwrap();
        (port, device, backend)
    }

    #[test]
    fn test_open_applies_line_settings() {
        let mut props = PortProperties::defaults(PortKind::Com, "COM3");
        props.baudrate = 115_200;
        props.parity = Parity::Even;
        props.rtscts = true;
        let (_port, device, backend) = open_port(&props);

        let settings = backend.last_settings("COM3").unwrap();
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.flow_control, crate::port::FlowControl::Hardware);
        assert!(device.was_cleared());
    }

    #[test]
    fn test_reopen_when_already_open() {
        let props = PortProperties::defaults(PortKind::Com, "COM3");
        let (mut port, _device, backend) = open_port(&props);
        port.open(&props).unwrap();
        assert_eq!(backend.open_count("COM3"), 2);
    }

    #[test]
    fn test_write_appends_terminator() {
        let mut props = PortProperties::defaults(PortKind::Com, "COM3");
        props.eol_write = Some("\r\n".to_string());
        let (mut port, device, _) = open_port(&props);

        port.write("*RST", &props).unwrap();
        assert_eq!(device.written_lines(), vec!["*RST\r\n"]);
    }

    #[test]
    fn test_readline_strips_terminator() {
        let mut props = PortProperties::defaults(PortKind::Com, "COM3");
        props.eol_read = Some("\r\n".to_string());
        let (mut port, device, _) = open_port(&props);

        device.enqueue_read(b"1.234\r\n5.678\r\n");
        assert_eq!(port.read(0, &props).unwrap(), "1.234");
        assert_eq!(port.read(0, &props).unwrap(), "5.678");
    }

    #[test]
    fn test_read_digits() {
        let props = PortProperties::defaults(PortKind::Com, "COM3");
        let (mut port, device, _) = open_port(&props);

        device.enqueue_read(b"ABCDEF");
        assert_eq!(port.read(4, &props).unwrap(), "ABCD");
        assert_eq!(port.read(4, &props).unwrap(), "EF");
    }

    #[test]
    fn test_write_timeout_keeps_port_usable() {
        let props = PortProperties::defaults(PortKind::Com, "COM3");
        let (mut port, device, _) = open_port(&props);

        device.set_should_timeout(true);
        let err = port.write("*RST", &props).unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.requires_close());

        device.expect_write(b"*RST\n");
        port.write("*RST", &props).unwrap();
        device.verify_expectations().unwrap();
    }

    #[test]
    fn test_silence_is_no_response() {
        let props = PortProperties::defaults(PortKind::Com, "COM3");
        let (mut port, _device, _) = open_port(&props);

        let err = port.read(0, &props).unwrap_err();
        assert!(matches!(err, PortError::NoResponse { .. }));
        assert!(err.requires_close());
    }

    #[test]
    fn test_silence_without_exception_is_empty() {
        let mut props = PortProperties::defaults(PortKind::Com, "COM3");
        props.exception = false;
        let (mut port, _device, _) = open_port(&props);

        assert_eq!(port.read(0, &props).unwrap(), "");
    }

    #[test]
    fn test_partial_line_without_terminator_is_returned() {
        let props = PortProperties::defaults(PortKind::Com, "COM3");
        let (mut port, device, _) = open_port(&props);

        device.enqueue_read(b"12");
        assert_eq!(port.read(0, &props).unwrap(), "12");
    }

    #[test]
    fn test_decode_failure() {
        let mut props = PortProperties::defaults(PortKind::Com, "COM3");
        props.encoding = TextEncoding::Utf8;
        let (mut port, device, _) = open_port(&props);

        device.enqueue_read(b"\xff\xfe\n");
        assert!(matches!(port.read(0, &props), Err(PortError::Decode { .. })));

        device.enqueue_read(b"\xff\xfe\n");
        assert_eq!(port.read_raw(0, &props).unwrap(), vec![0xff, 0xfe]);
    }

    #[test]
    fn test_closed_port_rejects_io() {
        let props = PortProperties::defaults(PortKind::Com, "COM3");
        let (mut port, _device, _) = open_port(&props);
        port.close(&props).unwrap();

        assert!(matches!(port.write("X", &props), Err(PortError::NotOpen)));
    }
}
