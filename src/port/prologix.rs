//! Prologix GPIB-USB controller support.
//!
//! A Prologix adapter tunnels a whole GPIB bus through one serial link. The
//! controller is configured with `++` commands; every other line is forwarded
//! to the currently addressed instrument. One [`PrologixController`] exists
//! per serial address and is shared by all GPIB ports on that bus.

use super::encoding::{latin1_lossless, TextEncoding};
use super::error::PortError;
use super::properties::PortProperties;
use super::serial_backend::SerialBackend;
use super::traits::{SerialPortAdapter, SerialSettings};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Highest primary GPIB address exposed as a virtual resource.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Limits of `++read_tmo_ms`.
const READ_TIMEOUT_MS_MIN: u64 = 1;
const READ_TIMEOUT_MS_MAX: u64 = 3000;

/// Inter-character timeout the controller is configured with on open.
const CONTROLLER_READ_TIMEOUT: Duration = Duration::from_millis(50);

const ESC: u8 = 27;

/// `++eos` code for a terminator: 0 CR+LF, 1 CR, 2 LF, 3 none.
pub fn eos_code(terminator: &str) -> Option<u8> {
    match terminator {
        "\r\n" => Some(0),
        "\r" => Some(1),
        "\n" => Some(2),
        "" => Some(3),
        _ => None,
    }
}

/// Escape a payload so the controller forwards it verbatim.
///
/// ESC is escaped first so the escapes added for CR, LF and `+` are not
/// doubled.
pub fn escape_payload(payload: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(payload.len());
    for &byte in payload {
        if matches!(byte, ESC | b'\r' | b'\n' | b'+') {
            escaped.push(ESC);
        }
        escaped.push(byte);
    }
    escaped
}

/// Per-address settings registered by the GPIB port that opened it.
#[derive(Debug, Clone, PartialEq)]
struct Target {
    timeout: Duration,
    encoding: TextEncoding,
    rstrip: bool,
}

impl From<&PortProperties> for Target {
    fn from(properties: &PortProperties) -> Self {
        Self {
            timeout: properties.timeout,
            encoding: properties.encoding,
            rstrip: properties.rstrip,
        }
    }
}

/// One Prologix adapter and the GPIB bus behind it.
pub struct PrologixController {
    address: String,
    backend: Arc<dyn SerialBackend>,
    link: Option<Box<dyn SerialPortAdapter>>,
    current_gpib_address: Option<u8>,
    targets: BTreeMap<u8, Target>,
}

impl std::fmt::Debug for PrologixController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrologixController")
            .field("address", &self.address)
            .field("open", &self.link.is_some())
            .field("current_gpib_address", &self.current_gpib_address)
            .finish()
    }
}

impl PrologixController {
    /// A controller reachable at serial `address`. Nothing is opened yet.
    pub fn new(address: impl Into<String>, backend: Arc<dyn SerialBackend>) -> Self {
        Self {
            address: address.into(),
            backend,
            link: None,
            current_gpib_address: None,
            targets: BTreeMap::new(),
        }
    }

    /// Serial address of the adapter.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// GPIB address the adapter currently forwards to.
    pub fn current_gpib_address(&self) -> Option<u8> {
        self.current_gpib_address
    }

    /// Virtual resource strings for every address on the bus.
    pub fn list_resources(&self) -> Vec<String> {
        (1..=MAX_GPIB_ADDRESS)
            .map(|gpib| format!("GPIB::{}::Prologix@{}", gpib, self.address))
            .collect()
    }

    /// Register a GPIB port and bring the adapter into controller mode.
    pub fn open(&mut self, gpib_address: u8, properties: &PortProperties) -> Result<(), PortError> {
        self.targets.insert(gpib_address, Target::from(properties));

        if self.link.is_none() {
            let link = self
                .backend
                .open(&self.address, &SerialSettings::prologix())
                .map_err(|e| {
                    PortError::Prologix(format!("cannot open controller at {}: {}", self.address, e))
                })?;
            self.link = Some(link);
            self.current_gpib_address = None;
        }
        self.clear()?;

        self.set_controller_in_charge()?;
        self.set_mode(1)?;

        let terminator = properties
            .gpib_eol_read
            .as_deref()
            .or(properties.gpib_eol_write.as_deref())
            .unwrap_or("\r\n");
        let eos = eos_code(terminator).unwrap_or_else(|| {
            debug!(
                "Terminator {:?} cannot be set for Prologix adapter at {}, falling back to CR+LF",
                terminator, properties.id
            );
            0
        });
        self.set_eos(eos)?;
        self.set_eoi(1)?;
        self.set_auto(0)?;
        self.set_read_timeout(CONTROLLER_READ_TIMEOUT)
    }

    /// Flush the serial link. No-op when closed.
    pub fn clear(&mut self) -> Result<(), PortError> {
        match self.link.as_mut() {
            Some(link) => link.clear_buffers(),
            None => Ok(()),
        }
    }

    /// Detach the GPIB port at `gpib_address`.
    ///
    /// The serial link closes once no GPIB port is attached any more.
    pub fn release(&mut self, gpib_address: u8) -> Result<(), PortError> {
        self.targets.remove(&gpib_address);
        if self.targets.is_empty() {
            self.close()
        } else {
            debug!(
                "GPIB {} released, {} address(es) still attached to {}",
                gpib_address,
                self.targets.len(),
                self.address
            );
            Ok(())
        }
    }

    /// Addresses of the GPIB ports currently attached.
    pub fn attached_addresses(&self) -> Vec<u8> {
        self.targets.keys().copied().collect()
    }

    /// Close the serial link. No-op when closed.
    pub fn close(&mut self) -> Result<(), PortError> {
        if self.link.take().is_some() {
            debug!("Closed Prologix controller at {}", self.address);
        }
        self.current_gpib_address = None;
        Ok(())
    }

    /// Send a command.
    ///
    /// Controller commands (`++...`) and writes without a GPIB address go to
    /// the adapter itself. Anything else is escaped, encoded with the
    /// address's encoding and forwarded, re-addressing the bus first when a
    /// different instrument was addressed last.
    pub fn write(&mut self, command: &str, gpib_address: Option<u8>) -> Result<(), PortError> {
        if command.is_empty() {
            return Ok(());
        }
        match gpib_address {
            Some(gpib) if !command.starts_with("++") => {
                let encoding = self.target(gpib)?.encoding;
                let payload = encoding.encode(command).ok_or_else(|| {
                    PortError::config(format!(
                        "command {:?} cannot be encoded as {}",
                        command, encoding
                    ))
                })?;
                self.write_payload(&payload, gpib)
            }
            _ => {
                let mut message = latin1_bytes(command)?;
                message.push(b'\n');
                self.link()?.write_bytes(&message).map(|_| ())
            }
        }
    }

    /// Forward bytes to an instrument without encoding.
    pub fn write_payload(&mut self, payload: &[u8], gpib_address: u8) -> Result<(), PortError> {
        if payload.is_empty() {
            return Ok(());
        }
        if self.current_gpib_address != Some(gpib_address) {
            self.write(&format!("++addr {gpib_address}"), None)?;
            self.current_gpib_address = Some(gpib_address);
        }
        let mut message = escape_payload(payload);
        message.push(b'\n');
        self.link()?.write_bytes(&message).map(|_| ())
    }

    /// Request an answer from `gpib_address` and return its raw bytes.
    ///
    /// Polls `++read eoi` until a full line arrived or the address's timeout
    /// elapsed. Trailing whitespace is removed when the port asked for it.
    pub fn read_bytes(&mut self, gpib_address: u8) -> Result<Vec<u8>, PortError> {
        let target = self.target(gpib_address)?.clone();
        if self.current_gpib_address != Some(gpib_address) {
            self.write(&format!("++addr {gpib_address}"), None)?;
            self.current_gpib_address = Some(gpib_address);
        }

        let start = Instant::now();
        let mut message = Vec::new();
        while start.elapsed() < target.timeout {
            self.write("++read eoi", None)?;
            message.extend(self.readline()?);
            if memchr::memchr(b'\n', &message).is_some() {
                break;
            }
        }

        if target.rstrip {
            let end = message
                .iter()
                .rposition(|b| !b.is_ascii_whitespace())
                .map_or(0, |i| i + 1);
            message.truncate(end);
        }
        Ok(message)
    }

    /// Request an answer from `gpib_address` and decode it.
    pub fn read(&mut self, gpib_address: u8) -> Result<String, PortError> {
        let encoding = self.target(gpib_address)?.encoding;
        let message = self.read_bytes(gpib_address)?;
        encoding.decode(&message).ok_or_else(|| PortError::Decode {
            resource: format!("GPIB::{}::Prologix@{}", gpib_address, self.address),
            encoding: encoding.name().to_string(),
        })
    }

    /// `++ifc`: assert interface clear and become controller in charge.
    pub fn set_controller_in_charge(&mut self) -> Result<(), PortError> {
        self.write("++ifc", None)
    }

    /// `++mode`: 1 controller, 0 device.
    pub fn set_mode(&mut self, mode: u8) -> Result<(), PortError> {
        self.write(&format!("++mode {mode}"), None)
    }

    pub fn get_mode(&mut self) -> Result<String, PortError> {
        self.ask("++mode")
    }

    /// `++eos`: terminator appended to forwarded commands, see [`eos_code`].
    pub fn set_eos(&mut self, eos: u8) -> Result<(), PortError> {
        self.write(&format!("++eos {eos}"), None)
    }

    pub fn get_eos(&mut self) -> Result<String, PortError> {
        self.ask("++eos")
    }

    /// `++eoi`: assert EOI with the last byte (1) or not (0).
    pub fn set_eoi(&mut self, eoi: u8) -> Result<(), PortError> {
        self.write(&format!("++eoi {eoi}"), None)
    }

    pub fn get_eoi(&mut self) -> Result<String, PortError> {
        self.ask("++eoi")
    }

    /// `++auto`: read-after-write (1) or explicit reads only (0).
    pub fn set_auto(&mut self, auto: u8) -> Result<(), PortError> {
        self.write(&format!("++auto {auto}"), None)
    }

    pub fn get_auto(&mut self) -> Result<String, PortError> {
        self.ask("++auto")
    }

    /// `++read_tmo_ms`, clamped to what the adapter accepts.
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), PortError> {
        let ms = u64::try_from(timeout.as_millis())
            .unwrap_or(READ_TIMEOUT_MS_MAX)
            .clamp(READ_TIMEOUT_MS_MIN, READ_TIMEOUT_MS_MAX);
        self.write(&format!("++read_tmo_ms {ms}"), None)
    }

    pub fn get_read_timeout(&mut self) -> Result<Duration, PortError> {
        let answer = self.ask("++read_tmo_ms")?;
        answer
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| PortError::Prologix(format!("unexpected read timeout answer {answer:?}")))
    }

    /// `++lon`: listen-only, only honoured in device mode.
    pub fn set_listen_only(&mut self, listen_only: bool) -> Result<(), PortError> {
        self.write(&format!("++lon {}", u8::from(listen_only)), None)
    }

    pub fn get_listen_only(&mut self) -> Result<String, PortError> {
        self.ask("++lon")
    }

    pub fn get_version(&mut self) -> Result<String, PortError> {
        self.ask("++ver")
    }

    fn ask(&mut self, command: &str) -> Result<String, PortError> {
        self.write(command, None)?;
        let line = self.readline()?;
        Ok(latin1_lossless(&line).trim_end().to_string())
    }

    /// Read up to and including `\n`, or until the link stays silent.
    fn readline(&mut self) -> Result<Vec<u8>, PortError> {
        let link = self.link()?;
        let mut line = Vec::new();
        while let Some(byte) = link.read_byte()? {
            line.push(byte);
            if byte == b'\n' {
                break;
            }
        }
        Ok(line)
    }

    fn link(&mut self) -> Result<&mut Box<dyn SerialPortAdapter>, PortError> {
        let address = &self.address;
        self.link
            .as_mut()
            .ok_or_else(|| PortError::Prologix(format!("controller at {address} is not open")))
    }

    fn target(&self, gpib_address: u8) -> Result<&Target, PortError> {
        self.targets.get(&gpib_address).ok_or_else(|| {
            PortError::Prologix(format!(
                "GPIB address {} was never opened on controller {}",
                gpib_address, self.address
            ))
        })
    }
}

fn latin1_bytes(command: &str) -> Result<Vec<u8>, PortError> {
    TextEncoding::Latin1
        .encode(command)
        .ok_or_else(|| PortError::config(format!("controller command {command:?} is not latin-1")))
}

/// Shared handle to a controller.
pub type SharedController = Arc<Mutex<PrologixController>>;

/// The Prologix controllers known to a port context, keyed by serial address.
#[derive(Debug, Default)]
pub struct PrologixRegistry {
    controllers: Mutex<BTreeMap<String, SharedController>>,
}

impl PrologixRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller. An address that is already registered keeps its
    /// existing controller so open GPIB ports stay attached to it.
    pub fn add(&self, address: &str, backend: Arc<dyn SerialBackend>) -> SharedController {
        let mut controllers = self.controllers.lock();
        Arc::clone(controllers.entry(address.to_string()).or_insert_with(|| {
            debug!("Registered Prologix controller at {}", address);
            Arc::new(Mutex::new(PrologixController::new(address, backend)))
        }))
    }

    /// Unregister a controller, closing its serial link.
    pub fn remove(&self, address: &str) -> Option<SharedController> {
        let removed = self.controllers.lock().remove(address);
        if let Some(controller) = &removed {
            if let Err(e) = controller.lock().close() {
                warn!("Failed to close removed Prologix controller at {}: {}", address, e);
            }
        }
        removed
    }

    pub fn get(&self, address: &str) -> Option<SharedController> {
        self.controllers.lock().get(address).cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.controllers.lock().contains_key(address)
    }

    /// Serial addresses of all registered controllers.
    pub fn addresses(&self) -> Vec<String> {
        self.controllers.lock().keys().cloned().collect()
    }

    pub fn controllers(&self) -> Vec<SharedController> {
        self.controllers.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::kind::PortKind;
    use crate::port::mock::MockSerialBackend;
    use proptest::prelude::*;

    fn gpib_properties(address: u8) -> PortProperties {
        let mut props = PortProperties::defaults(
            PortKind::Gpib,
            format!("GPIB::{address}::Prologix@COM9"),
        );
        props.timeout = Duration::from_millis(200);
        props
    }

    fn controller() -> (PrologixController, crate::port::MockSerialPort) {
        let backend = MockSerialBackend::new();
        let link = backend.plug("COM9");
        (PrologixController::new("COM9", Arc::new(backend)), link)
    }

    #[test]
    fn test_list_resources() {
        let (controller, _) = controller();
        let resources = controller.list_resources();
        assert_eq!(resources.len(), 30);
        assert_eq!(resources[0], "GPIB::1::Prologix@COM9");
        assert_eq!(resources[29], "GPIB::30::Prologix@COM9");
    }

    #[test]
    fn test_open_configures_controller() {
        let (mut controller, link) = controller();
        controller.open(5, &gpib_properties(5)).unwrap();

        assert_eq!(
            link.written_lines(),
            vec![
                "++ifc\n",
                "++mode 1\n",
                "++eos 0\n",
                "++eoi 1\n",
                "++auto 0\n",
                "++read_tmo_ms 50\n"
            ]
        );
        assert!(link.was_cleared());
    }

    #[test]
    fn test_unsupported_terminator_falls_back_to_crlf() {
        let (mut controller, link) = controller();
        let mut props = gpib_properties(5);
        props.gpib_eol_read = Some(";".to_string());
        controller.open(5, &props).unwrap();
        assert!(link.written_lines().contains(&"++eos 0\n".to_string()));

        link.clear_write_log();
        props.gpib_eol_read = Some("\n".to_string());
        controller.open(5, &props).unwrap();
        assert!(link.written_lines().contains(&"++eos 2\n".to_string()));
    }

    #[test]
    fn test_addresses_only_on_change() {
        let (mut controller, link) = controller();
        controller.open(5, &gpib_properties(5)).unwrap();
        controller.open(7, &gpib_properties(7)).unwrap();
        link.clear_write_log();

        controller.write("VOLT 1", Some(5)).unwrap();
        controller.write("VOLT 2", Some(5)).unwrap();
        controller.write("CURR?", Some(7)).unwrap();

        assert_eq!(
            link.written_lines(),
            vec![
                "++addr 5\n",
                "VOLT 1\n",
                "VOLT 2\n",
                "++addr 7\n",
                "CURR?\n"
            ]
        );
    }

    #[test]
    fn test_payload_is_escaped() {
        let (mut controller, link) = controller();
        controller.open(5, &gpib_properties(5)).unwrap();
        link.clear_write_log();

        controller.write("A+B", Some(5)).unwrap();
        let log = link.get_write_log();
        assert_eq!(log[1], b"A\x1b+B\n".to_vec());
    }

    #[test]
    fn test_read_polls_until_newline() {
        let (mut controller, link) = controller();
        controller.open(5, &gpib_properties(5)).unwrap();
        controller.write("*IDN?", Some(5)).unwrap();
        link.respond_to(b"++read eoi\n", b"ACME,DMM,0,1.0\r\n");

        assert_eq!(controller.read(5).unwrap(), "ACME,DMM,0,1.0");
    }

    #[test]
    fn test_read_without_answer_returns_empty_after_timeout() {
        let (mut controller, _link) = controller();
        let mut props = gpib_properties(5);
        props.timeout = Duration::from_millis(20);
        controller.open(5, &props).unwrap();

        let start = Instant::now();
        assert_eq!(controller.read(5).unwrap(), "");
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_read_timeout_is_clamped() {
        let (mut controller, link) = controller();
        controller.open(5, &gpib_properties(5)).unwrap();
        link.clear_write_log();

        controller.set_read_timeout(Duration::from_secs(10)).unwrap();
        controller.set_read_timeout(Duration::ZERO).unwrap();
        assert_eq!(
            link.written_lines(),
            vec!["++read_tmo_ms 3000\n", "++read_tmo_ms 1\n"]
        );
    }

    #[test]
    fn test_queries_read_controller_answer() {
        let (mut controller, link) = controller();
        controller.open(5, &gpib_properties(5)).unwrap();
        link.respond_to(b"++ver\n", b"Prologix GPIB-USB Controller version 6.107\r\n");
        link.respond_to(b"++read_tmo_ms\n", b"50\r\n");

        assert_eq!(
            controller.get_version().unwrap(),
            "Prologix GPIB-USB Controller version 6.107"
        );
        assert_eq!(
            controller.get_read_timeout().unwrap(),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_link_stays_open_until_last_release() {
        let (mut controller, link) = controller();
        controller.open(5, &gpib_properties(5)).unwrap();
        controller.open(7, &gpib_properties(7)).unwrap();

        controller.release(5).unwrap();
        assert!(controller.is_open());
        assert_eq!(controller.attached_addresses(), vec![7]);
        link.clear_write_log();
        controller.write("CURR?", Some(7)).unwrap();
        assert_eq!(link.written_lines(), vec!["++addr 7\n", "CURR?\n"]);
        assert!(matches!(
            controller.write("VOLT 1", Some(5)),
            Err(PortError::Prologix(_))
        ));

        controller.release(7).unwrap();
        assert!(!controller.is_open());
        assert!(controller.attached_addresses().is_empty());
    }

    #[test]
    fn test_write_to_unopened_address_fails() {
        let (mut controller, _link) = controller();
        controller.open(5, &gpib_properties(5)).unwrap();
        assert!(matches!(
            controller.write("*RST", Some(9)),
            Err(PortError::Prologix(_))
        ));
    }

    #[test]
    fn test_registry_keeps_existing_controller() {
        let backend: Arc<dyn SerialBackend> = Arc::new(MockSerialBackend::new());
        let registry = PrologixRegistry::new();
        let first = registry.add("COM9", Arc::clone(&backend));
        let second = registry.add("COM9", backend);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.addresses(), vec!["COM9".to_string()]);
        assert!(registry.remove("COM9").is_some());
        assert!(registry.get("COM9").is_none());
    }

    fn unescape(escaped: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut iter = escaped.iter();
        while let Some(&byte) = iter.next() {
            if byte == ESC {
                if let Some(&next) = iter.next() {
                    out.push(next);
                }
            } else {
                out.push(byte);
            }
        }
        out
    }

    proptest! {
        #[test]
        fn prop_escaping_round_trips(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let escaped = escape_payload(&payload);
            prop_assert_eq!(unescape(&escaped), payload);
        }

        #[test]
        fn prop_special_bytes_are_always_escaped(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let escaped = escape_payload(&payload);
            let mut i = 0;
            while i < escaped.len() {
                let byte = escaped[i];
                prop_assert!(!matches!(byte, b'\r' | b'\n' | b'+'));
                if byte == ESC {
                    prop_assert!(i + 1 < escaped.len());
                    i += 2;
                } else {
                    i += 1;
                }
            }
        }
    }
}
