//! In-memory VISA runtime for tests.
//!
//! [`MockVisaLibrary`] hands out a resource manager that knows a fixed set of
//! [`MockVisaInstrument`]s. Instruments answer canned responses and record
//! everything the port layer does to them (writes, terminations, clears,
//! serial settings) so tests can assert on it.

use super::error::PortError;
use super::traits::SerialSettings;
use super::visa::{VisaBackend, VisaLibrary, VisaSession};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct InstrumentState {
    write_log: Vec<Vec<u8>>,
    read_queue: VecDeque<Vec<u8>>,
    responders: Vec<(Vec<u8>, Vec<u8>)>,
    timeout: Option<Duration>,
    write_termination: Option<String>,
    read_termination: Option<String>,
    serial: Option<SerialSettings>,
    clear_count: usize,
    open_count: usize,
    close_count: usize,
}

/// A simulated VISA instrument. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockVisaInstrument {
    state: Arc<Mutex<InstrumentState>>,
}

impl MockVisaInstrument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `response` whenever exactly `command` is written (without
    /// termination).
    pub fn respond_to(&self, command: &str, response: &str) {
        self.state
            .lock()
            .responders
            .push((command.as_bytes().to_vec(), response.as_bytes().to_vec()));
    }

    /// Queue a message for the next read.
    pub fn enqueue_read(&self, message: &[u8]) {
        self.state.lock().read_queue.push_back(message.to_vec());
    }

    /// Everything written, including the appended write termination.
    pub fn written(&self) -> Vec<String> {
        self.state
            .lock()
            .write_log
            .iter()
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.state.lock().timeout
    }

    pub fn write_termination(&self) -> Option<String> {
        self.state.lock().write_termination.clone()
    }

    pub fn read_termination(&self) -> Option<String> {
        self.state.lock().read_termination.clone()
    }

    pub fn serial_settings(&self) -> Option<SerialSettings> {
        self.state.lock().serial.clone()
    }

    pub fn clear_count(&self) -> usize {
        self.state.lock().clear_count
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }
}

#[derive(Debug)]
struct MockSession {
    resource: String,
    instrument: MockVisaInstrument,
    closed: bool,
}

impl MockSession {
    fn check_open(&self) -> Result<(), PortError> {
        if self.closed {
            Err(PortError::visa(&self.resource, "VI_ERROR_INV_OBJECT (session closed)"))
        } else {
            Ok(())
        }
    }
}

impl VisaSession for MockSession {
    fn write(&mut self, message: &[u8]) -> Result<(), PortError> {
        self.check_open()?;
        let mut state = self.instrument.state.lock();
        let mut logged = message.to_vec();
        if let Some(term) = &state.write_termination {
            logged.extend_from_slice(term.as_bytes());
        }
        state.write_log.push(logged);
        let answers: Vec<Vec<u8>> = state
            .responders
            .iter()
            .filter(|(command, _)| command.as_slice() == message)
            .map(|(_, response)| response.clone())
            .collect();
        state.read_queue.extend(answers);
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>, PortError> {
        self.check_open()?;
        let mut state = self.instrument.state.lock();
        state
            .read_queue
            .pop_front()
            .ok_or_else(|| PortError::timeout(state.timeout.unwrap_or_default()))
    }

    fn clear(&mut self) -> Result<(), PortError> {
        self.check_open()?;
        let mut state = self.instrument.state.lock();
        state.read_queue.clear();
        state.clear_count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PortError> {
        if !self.closed {
            self.closed = true;
            self.instrument.state.lock().close_count += 1;
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), PortError> {
        self.instrument.state.lock().timeout = Some(timeout);
        Ok(())
    }

    fn set_write_termination(&mut self, termination: Option<&str>) -> Result<(), PortError> {
        self.instrument.state.lock().write_termination = termination.map(str::to_string);
        Ok(())
    }

    fn set_read_termination(&mut self, termination: Option<&str>) -> Result<(), PortError> {
        self.instrument.state.lock().read_termination = termination.map(str::to_string);
        Ok(())
    }

    fn configure_serial(&mut self, settings: &SerialSettings) -> Result<(), PortError> {
        self.instrument.state.lock().serial = Some(settings.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LibraryState {
    resources: BTreeMap<String, MockVisaInstrument>,
    unavailable: bool,
    manager_opens: usize,
    manager_closes: usize,
}

/// A VISA runtime whose resources are registered by the test.
#[derive(Debug, Clone, Default)]
pub struct MockVisaLibrary {
    state: Arc<Mutex<LibraryState>>,
}

impl MockVisaLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// A library that fails to load, like a machine without a VISA runtime.
    pub fn unavailable() -> Self {
        let library = Self::default();
        library.state.lock().unavailable = true;
        library
    }

    /// Register an instrument under `resource`.
    pub fn add_instrument(&self, resource: &str) -> MockVisaInstrument {
        let instrument = MockVisaInstrument::new();
        self.state
            .lock()
            .resources
            .insert(resource.to_string(), instrument.clone());
        instrument
    }

    pub fn remove_instrument(&self, resource: &str) {
        self.state.lock().resources.remove(resource);
    }

    pub fn instrument(&self, resource: &str) -> Option<MockVisaInstrument> {
        self.state.lock().resources.get(resource).cloned()
    }

    /// How many resource manager sessions have been opened.
    pub fn manager_opens(&self) -> usize {
        self.state.lock().manager_opens
    }

    /// How many resource manager sessions have been closed.
    pub fn manager_closes(&self) -> usize {
        self.state.lock().manager_closes
    }
}

impl VisaLibrary for MockVisaLibrary {
    fn open_resource_manager(&self) -> Result<Arc<dyn VisaBackend>, PortError> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(PortError::BackendUnavailable(
                "no VISA runtime installed".to_string(),
            ));
        }
        state.manager_opens += 1;
        Ok(Arc::new(MockResourceManager {
            library: self.clone(),
            open: Mutex::new(true),
        }))
    }
}

#[derive(Debug)]
struct MockResourceManager {
    library: MockVisaLibrary,
    open: Mutex<bool>,
}

impl MockResourceManager {
    fn check_open(&self) -> Result<(), PortError> {
        if *self.open.lock() {
            Ok(())
        } else {
            Err(PortError::NotOpen)
        }
    }
}

/// Match a VISA search expression of the `PREFIX?*SUFFIX` form.
fn matches_query(query: &str, resource: &str) -> bool {
    match query.split_once("?*") {
        Some((prefix, suffix)) => {
            resource.len() >= prefix.len() + suffix.len()
                && resource.starts_with(prefix)
                && resource.ends_with(suffix)
        }
        None => resource == query,
    }
}

impl VisaBackend for MockResourceManager {
    fn list_resources(&self, query: &str) -> Result<Vec<String>, PortError> {
        self.check_open()?;
        Ok(self
            .library
            .state
            .lock()
            .resources
            .keys()
            .filter(|resource| matches_query(query, resource))
            .cloned()
            .collect())
    }

    fn open(&self, resource: &str, timeout: Duration) -> Result<Box<dyn VisaSession>, PortError> {
        self.check_open()?;
        let instrument = self
            .library
            .instrument(resource)
            .ok_or_else(|| PortError::visa(resource, "VI_ERROR_RSRC_NFOUND"))?;
        {
            let mut state = instrument.state.lock();
            state.open_count += 1;
            state.timeout = Some(timeout);
        }
        Ok(Box::new(MockSession {
            resource: resource.to_string(),
            instrument,
            closed: false,
        }))
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }

    fn close(&self) -> Result<(), PortError> {
        let mut open = self.open.lock();
        if *open {
            *open = false;
            self.library.state.lock().manager_closes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::visa::ResourceManager;

    #[test]
    fn test_query_matching() {
        assert!(matches_query("GPIB?*INSTR", "GPIB0::5::INSTR"));
        assert!(!matches_query("GPIB?*INSTR", "GPIB0::INTFC"));
        assert!(matches_query("USB?*", "USB0::0x0957::0x1796::MY1::INSTR"));
        assert!(!matches_query("USB?*", "ASRL1::INSTR"));
    }

    #[test]
    fn test_session_round_trip() {
        let library = MockVisaLibrary::new();
        let instrument = library.add_instrument("USB0::1::INSTR");
        instrument.respond_to("*IDN?", "ACME,Scope,1,0.1");

        let rm = ResourceManager::new(Arc::new(library.clone()));
        let backend = rm.get().unwrap();
        let mut session = backend.open("USB0::1::INSTR", Duration::from_secs(1)).unwrap();
        session.set_write_termination(Some("\n")).unwrap();
        session.write(b"*IDN?").unwrap();

        assert_eq!(session.read().unwrap(), b"ACME,Scope,1,0.1");
        assert_eq!(instrument.written(), vec!["*IDN?\n"]);
        assert!(matches!(session.read(), Err(PortError::Timeout(_))));
    }

    #[test]
    fn test_resource_manager_reopens_after_close() {
        let library = MockVisaLibrary::new();
        let rm = ResourceManager::new(Arc::new(library.clone()));

        rm.get().unwrap();
        assert!(rm.is_open());
        rm.close().unwrap();
        assert!(!rm.is_open());
        rm.get().unwrap();

        assert_eq!(library.manager_opens(), 2);
        assert_eq!(library.manager_closes(), 1);
    }

    #[test]
    fn test_unavailable_library_lists_nothing() {
        let rm = ResourceManager::new(Arc::new(MockVisaLibrary::unavailable()));
        assert!(rm.list_resources("GPIB?*").is_empty());
        assert!(matches!(rm.get(), Err(PortError::BackendUnavailable(_))));
    }
}
