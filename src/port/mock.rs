//! Mock serial port implementation for testing.
//!
//! Provides a `MockSerialPort` that simulates serial port behavior without
//! requiring actual hardware, and a `MockSerialBackend` that hands such ports
//! out by name. Supports configurable read queues, canned responses and
//! expectation verification.

use super::error::PortError;
use super::serial_backend::SerialBackend;
use super::traits::{SerialPortAdapter, SerialSettings};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Inner state of the mock port, protected by a mutex for interior mutability.
#[derive(Debug, Default)]
struct MockPortState {
    /// Queue of bytes to be returned by read operations.
    read_queue: VecDeque<u8>,
    /// Log of all bytes written to the port.
    write_log: Vec<Vec<u8>>,
    /// Expected write operations (for verification).
    expected_writes: VecDeque<Vec<u8>>,
    /// Canned answers queued whenever a matching write arrives.
    responders: Vec<(Vec<u8>, Vec<u8>)>,
    /// Whether the next operation should time out.
    should_timeout: bool,
    /// Configured timeout duration.
    timeout: Duration,
    /// Whether buffers have been cleared.
    buffers_cleared: bool,
    /// Last RTS/DTR levels applied.
    control_lines: Option<(bool, bool)>,
}

/// Mock serial port implementation for testing.
///
/// Clones share their state, so a test can keep one handle while the code
/// under test owns another.
///
/// # Example
/// ```
/// use instrument_ports::port::{MockSerialPort, SerialPortAdapter};
///
/// let mut port = MockSerialPort::new("MOCK0");
///
/// // Enqueue data to be read
/// port.enqueue_read(b"Hello, World!");
///
/// let mut buffer = [0u8; 13];
/// let n = port.read_bytes(&mut buffer).unwrap();
/// assert_eq!(&buffer[..n], b"Hello, World!");
///
/// port.write_bytes(b"Response").unwrap();
/// assert_eq!(port.get_write_log(), vec![b"Response".to_vec()]);
/// ```
#[derive(Clone)]
pub struct MockSerialPort {
    /// The port name/identifier.
    name: String,
    /// The internal state, shared between clones.
    state: Arc<Mutex<MockPortState>>,
}

impl MockSerialPort {
    /// Create a new mock serial port with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockPortState {
                timeout: Duration::from_secs(1),
                ..Default::default()
            })),
        }
    }

    /// Enqueue bytes to be returned by subsequent read operations.
    pub fn enqueue_read(&self, data: &[u8]) {
        self.state.lock().read_queue.extend(data);
    }

    /// Queue `response` for reading every time exactly `command` is written.
    pub fn respond_to(&self, command: &[u8], response: &[u8]) {
        self.state
            .lock()
            .responders
            .push((command.to_vec(), response.to_vec()));
    }

    /// Expect a specific write operation.
    ///
    /// Use `verify_expectations()` to check that all expected writes occurred.
    pub fn expect_write(&self, data: &[u8]) {
        self.state.lock().expected_writes.push_back(data.to_vec());
    }

    /// Verify that all expected writes have occurred in order.
    pub fn verify_expectations(&self) -> Result<(), String> {
        let state = self.state.lock();

        if !state.expected_writes.is_empty() {
            return Err(format!(
                "Expected {} more write(s), but none occurred",
                state.expected_writes.len()
            ));
        }

        Ok(())
    }

    /// Get a copy of all data written to the port.
    pub fn get_write_log(&self) -> Vec<Vec<u8>> {
        self.state.lock().write_log.clone()
    }

    /// Written chunks rendered as text, for readable assertions.
    pub fn written_lines(&self) -> Vec<String> {
        self.state
            .lock()
            .write_log
            .iter()
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }

    /// Clear the write log.
    pub fn clear_write_log(&self) {
        self.state.lock().write_log.clear();
    }

    /// Set whether the next read/write operation should time out.
    pub fn set_should_timeout(&self, should_timeout: bool) {
        self.state.lock().should_timeout = should_timeout;
    }

    /// Get whether buffers have been cleared since the last reset.
    pub fn was_cleared(&self) -> bool {
        self.state.lock().buffers_cleared
    }

    /// Reset the "buffers cleared" flag.
    pub fn reset_cleared_flag(&self) {
        self.state.lock().buffers_cleared = false;
    }

    /// Last RTS/DTR levels applied, if any.
    pub fn control_lines(&self) -> Option<(bool, bool)> {
        self.state.lock().control_lines
    }

    /// Get the number of bytes available to read.
    pub fn available_bytes(&self) -> usize {
        self.state.lock().read_queue.len()
    }
}

impl SerialPortAdapter for MockSerialPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError> {
        let mut state = self.state.lock();

        if state.should_timeout {
            state.should_timeout = false;
            return Err(PortError::timeout(state.timeout));
        }

        state.write_log.push(data.to_vec());

        if let Some(expected) = state.expected_writes.pop_front() {
            if expected != data {
                return Err(PortError::config(format!(
                    "Expected write: {:?}, got: {:?}",
                    expected, data
                )));
            }
        }

        let responses: Vec<Vec<u8>> = state
            .responders
            .iter()
            .filter(|(command, _)| command.as_slice() == data)
            .map(|(_, response)| response.clone())
            .collect();
        for response in responses {
            state.read_queue.extend(response);
        }

        Ok(data.len())
    }

    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, PortError> {
        let mut state = self.state.lock();

        if state.should_timeout {
            state.should_timeout = false;
            return Err(PortError::timeout(state.timeout));
        }

        let mut bytes_read = 0;
        for byte in buffer.iter_mut() {
            if let Some(queued_byte) = state.read_queue.pop_front() {
                *byte = queued_byte;
                bytes_read += 1;
            } else {
                break;
            }
        }

        if bytes_read == 0 {
            // Simulate "would block" behavior by returning an I/O error
            Err(PortError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "No data available",
            )))
        } else {
            Ok(bytes_read)
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), PortError> {
        self.state.lock().timeout = timeout;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<(), PortError> {
        let mut state = self.state.lock();
        state.read_queue.clear();
        state.buffers_cleared = true;
        Ok(())
    }

    fn set_control_lines(&mut self, rts: bool, dtr: bool) -> Result<(), PortError> {
        self.state.lock().control_lines = Some((rts, dtr));
        Ok(())
    }

    fn bytes_to_read(&self) -> Option<usize> {
        Some(self.available_bytes())
    }
}

impl std::fmt::Debug for MockSerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSerialPort")
            .field("name", &self.name)
            .field("available_bytes", &self.available_bytes())
            .finish()
    }
}

#[derive(Debug, Default)]
struct MockBackendState {
    ports: BTreeMap<String, MockSerialPort>,
    open_settings: BTreeMap<String, Vec<SerialSettings>>,
}

/// Serial backend serving [`MockSerialPort`]s registered by name.
///
/// Opening a name that was never registered (or was unplugged) fails with
/// [`PortError::NotFound`], like a missing device.
#[derive(Debug, Clone, Default)]
pub struct MockSerialBackend {
    state: Arc<Mutex<MockBackendState>>,
}

impl MockSerialBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return a handle sharing its state.
    pub fn plug(&self, name: &str) -> MockSerialPort {
        let port = MockSerialPort::new(name);
        self.state
            .lock()
            .ports
            .insert(name.to_string(), port.clone());
        port
    }

    /// Remove a device, as if its cable was pulled.
    pub fn unplug(&self, name: &str) {
        self.state.lock().ports.remove(name);
    }

    /// Handle to a registered device.
    pub fn port(&self, name: &str) -> Option<MockSerialPort> {
        self.state.lock().ports.get(name).cloned()
    }

    /// How often `name` has been opened.
    pub fn open_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .open_settings
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Settings used for the most recent open of `name`.
    pub fn last_settings(&self, name: &str) -> Option<SerialSettings> {
        self.state
            .lock()
            .open_settings
            .get(name)
            .and_then(|all| all.last().cloned())
    }
}

impl SerialBackend for MockSerialBackend {
    fn open(
        &self,
        name: &str,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialPortAdapter>, PortError> {
        let mut state = self.state.lock();
        let port = state
            .ports
            .get(name)
            .cloned()
            .ok_or_else(|| PortError::not_found(name))?;
        state
            .open_settings
            .entry(name.to_string())
            .or_default()
            .push(settings.clone());
        Ok(Box::new(port))
    }

    fn available_ports(&self) -> Result<Vec<String>, PortError> {
        Ok(self.state.lock().ports.keys().cloned().collect())
    }
}
