//! Raw TCP socket transport for `host:port` resources.

use super::error::PortError;
use super::properties::PortProperties;
use super::traits::Transport;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;

/// Timeout of a single receive call while waiting for a message.
pub const CHUNK_TIMEOUT: Duration = Duration::from_millis(50);

const CHUNK_SIZE: usize = 4096;

/// A TCP connection with a receive buffer kept across reads.
#[derive(Debug, Default)]
pub struct SocketPort {
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
}

impl SocketPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet returned by a read.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    fn stream(&mut self) -> Result<&mut TcpStream, PortError> {
        self.stream.as_mut().ok_or(PortError::NotOpen)
    }

    /// Length of the next message in the buffer, terminator included, and the
    /// length of its payload.
    fn complete_message(&self, digits: usize, eol: &[u8]) -> Option<(usize, usize)> {
        if digits > 0 {
            return (self.buffer.len() >= digits).then_some((digits, digits));
        }
        if eol.is_empty() {
            return (!self.buffer.is_empty()).then_some((self.buffer.len(), self.buffer.len()));
        }
        memchr::memmem::find(&self.buffer, eol).map(|at| (at + eol.len(), at))
    }

    /// Receive until a message is complete or `timeout` elapses.
    fn receive(&mut self, digits: usize, eol: &[u8], timeout: Duration) -> Result<Vec<u8>, PortError> {
        let start = Instant::now();
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            if let Some((consumed, payload)) = self.complete_message(digits, eol) {
                let mut message: Vec<u8> = self.buffer.drain(..consumed).collect();
                message.truncate(payload);
                return Ok(message);
            }
            if start.elapsed() >= timeout {
                return Err(PortError::timeout(timeout));
            }

            let stream = self.stream()?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(PortError::Io(std::io::Error::new(
                        ErrorKind::ConnectionAborted,
                        "connection closed by peer",
                    )))
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => return Err(PortError::Io(e)),
            }
        }
    }
}

/// `SOCKET_EOLwrite`, then `EOLwrite`, then `EOL`.
fn write_terminator(properties: &PortProperties) -> &str {
    properties
        .socket_eol_write
        .as_deref()
        .unwrap_or_else(|| properties.write_terminator())
}

/// `SOCKET_EOLread`, then `EOLread`, then `EOL`.
fn read_terminator(properties: &PortProperties) -> &str {
    properties
        .socket_eol_read
        .as_deref()
        .unwrap_or_else(|| properties.read_terminator())
}

fn connect(resource: &str, timeout: Duration) -> Result<TcpStream, PortError> {
    let addresses = resource
        .to_socket_addrs()
        .map_err(|e| PortError::construction(resource, e.to_string()))?;
    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error
        .map(PortError::Io)
        .unwrap_or_else(|| PortError::not_found(resource)))
}

impl Transport for SocketPort {
    fn open(&mut self, properties: &PortProperties) -> Result<(), PortError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let timeout = if properties.timeout.is_zero() {
            CHUNK_TIMEOUT
        } else {
            properties.timeout
        };
        let stream = connect(&properties.id, timeout)?;
        stream.set_read_timeout(Some(CHUNK_TIMEOUT))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.buffer.clear();
        Ok(())
    }

    fn close(&mut self, properties: &PortProperties) -> Result<(), PortError> {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
                debug!("Shutdown of {} failed: {}", properties.id, e);
            }
        }
        self.buffer.clear();
        Ok(())
    }

    /// Drops buffered input and whatever is already waiting on the socket.
    fn clear(&mut self, _properties: &PortProperties) -> Result<(), PortError> {
        self.buffer.clear();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        stream.set_nonblocking(true)?;
        let mut chunk = [0u8; CHUNK_SIZE];
        let drained = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(PortError::Io(e)),
            }
        };
        stream.set_nonblocking(false)?;
        drained
    }

    fn write(&mut self, command: &str, properties: &PortProperties) -> Result<(), PortError> {
        let message = format!("{command}{}", write_terminator(properties));
        let bytes = properties.encoding.encode(&message).ok_or_else(|| {
            PortError::config(format!("{command:?} cannot be encoded as {}", properties.encoding))
        })?;
        self.write_raw(&bytes, properties)
    }

    fn write_raw(&mut self, data: &[u8], _properties: &PortProperties) -> Result<(), PortError> {
        let stream = self.stream()?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

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

    fn read_raw(&mut self, digits: usize, properties: &PortProperties) -> Result<Vec<u8>, PortError> {
        let eol = properties
            .encoding
            .encode(read_terminator(properties))
            .unwrap_or_else(|| read_terminator(properties).as_bytes().to_vec());
        self.receive(digits, &eol, properties.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::kind::PortKind;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;

    fn echo_server() -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if writer.write_all(format!("{line}\n").as_bytes()).is_err() {
                    break;
                }
            }
        });
        (address, handle)
    }

    #[test]
    fn test_round_trip() {
        let (address, _server) = echo_server();
        let props = PortProperties::defaults(PortKind::Socket, address.as_str());
        let mut port = SocketPort::new();
        port.open(&props).unwrap();

        port.write("PING", &props).unwrap();
        assert_eq!(port.read(0, &props).unwrap(), "PING");
        port.close(&props).unwrap();
    }

    #[test]
    fn test_remainder_is_kept_for_next_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"1.5;2.5;").unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut props = PortProperties::defaults(PortKind::Socket, address.as_str());
        props.socket_eol_read = Some(";".to_string());
        let mut port = SocketPort::new();
        port.open(&props).unwrap();

        assert_eq!(port.read(0, &props).unwrap(), "1.5");
        assert_eq!(port.buffered(), b"2.5;");
        assert_eq!(port.read(0, &props).unwrap(), "2.5");
        server.join().unwrap();
    }

    #[test]
    fn test_read_digits() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"ABCDEFG").unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let props = PortProperties::defaults(PortKind::Socket, address.as_str());
        let mut port = SocketPort::new();
        port.open(&props).unwrap();
        assert_eq!(port.read(4, &props).unwrap(), "ABCD");
        assert_eq!(port.buffered(), b"EFG");
        server.join().unwrap();
    }

    #[test]
    fn test_timeout_without_terminator() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"partial").unwrap();
            thread::sleep(Duration::from_millis(400));
        });

        let mut props = PortProperties::defaults(PortKind::Socket, address.as_str());
        props.timeout = Duration::from_millis(150);
        let mut port = SocketPort::new();
        port.open(&props).unwrap();

        let start = Instant::now();
        assert!(matches!(port.read(0, &props), Err(PortError::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(port.buffered(), b"partial");

        props.exception = false;
        assert_eq!(port.read(0, &props).unwrap(), "");
        server.join().unwrap();
    }

    #[test]
    fn test_write_terminator_precedence() {
        let mut props = PortProperties::defaults(PortKind::Socket, "127.0.0.1:1");
        assert_eq!(write_terminator(&props), "\n");
        props.eol_write = Some("\r\n".to_string());
        assert_eq!(write_terminator(&props), "\r\n");
        props.socket_eol_write = Some("\r".to_string());
        assert_eq!(write_terminator(&props), "\r");
    }

    #[test]
    fn test_close_after_peer_hung_up() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let props = PortProperties::defaults(PortKind::Socket, address.as_str());
        let mut port = SocketPort::new();
        port.open(&props).unwrap();
        server.join().unwrap();

        port.close(&props).unwrap();
        assert!(matches!(port.write("X", &props), Err(PortError::NotOpen)));
    }

    #[test]
    fn test_io_on_closed_socket() {
        let props = PortProperties::defaults(PortKind::Socket, "127.0.0.1:1");
        let mut port = SocketPort::new();
        assert!(matches!(port.write("X", &props), Err(PortError::NotOpen)));
    }
}
