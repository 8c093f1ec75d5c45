//! GPIB transport.
//!
//! A GPIB resource is served either by the VISA runtime
//! (`GPIB0::12::INSTR`) or by a Prologix adapter
//! (`GPIB::12::Prologix@COM7`). The mode is fixed by the resource string.

use super::error::PortError;
use super::kind::{parse_prologix_resource, PortKind};
use super::prologix::{PrologixRegistry, SharedController};
use super::properties::PortProperties;
use super::traits::Transport;
use super::visa::ResourceManager;
use super::visa_port::VisaPort;
use std::sync::Arc;

#[derive(Debug)]
enum Mode {
    Visa(VisaPort),
    Prologix {
        gpib_address: u8,
        controller_address: String,
        registry: Arc<PrologixRegistry>,
        controller: Option<SharedController>,
    },
}

#[derive(Debug)]
pub struct GpibPort {
    mode: Mode,
}

impl GpibPort {
    pub fn new(
        resource: &str,
        resource_manager: Arc<ResourceManager>,
        prologix: Arc<PrologixRegistry>,
    ) -> Self {
        let mode = match parse_prologix_resource(resource) {
            Some((gpib_address, controller_address)) => Mode::Prologix {
                gpib_address,
                controller_address,
                registry: prologix,
                controller: None,
            },
            None => Mode::Visa(VisaPort::new(PortKind::Gpib, resource_manager)),
        };
        Self { mode }
    }

    /// Whether this port talks through a Prologix adapter.
    pub fn is_prologix(&self) -> bool {
        matches!(self.mode, Mode::Prologix { .. })
    }
}

fn attached(controller: &Option<SharedController>) -> Result<&SharedController, PortError> {
    controller.as_ref().ok_or(PortError::NotOpen)
}

impl Transport for GpibPort {
    fn open(&mut self, properties: &PortProperties) -> Result<(), PortError> {
        match &mut self.mode {
            Mode::Visa(port) => port.open(properties),
            Mode::Prologix {
                gpib_address,
                controller_address,
                registry,
                controller,
            } => {
                let shared = registry.get(controller_address).ok_or_else(|| {
                    PortError::Prologix(format!(
                        "no Prologix controller registered at {controller_address}"
                    ))
                })?;
                shared.lock().open(*gpib_address, properties)?;
                *controller = Some(shared);
                Ok(())
            }
        }
    }

    /// Closing a Prologix GPIB port detaches it from the adapter. The
    /// adapter's serial link closes with the last attached port.
    fn close(&mut self, properties: &PortProperties) -> Result<(), PortError> {
        match &mut self.mode {
            Mode::Visa(port) => port.close(properties),
            Mode::Prologix {
                gpib_address,
                controller,
                ..
            } => match controller.take() {
                Some(shared) => shared.lock().release(*gpib_address),
                None => Ok(()),
            },
        }
    }

    fn clear(&mut self, properties: &PortProperties) -> Result<(), PortError> {
        match &mut self.mode {
            Mode::Visa(port) => port.clear(properties),
            Mode::Prologix { controller, .. } => match controller {
                Some(shared) => shared.lock().clear(),
                None => Ok(()),
            },
        }
    }

    fn write(&mut self, command: &str, properties: &PortProperties) -> Result<(), PortError> {
        match &mut self.mode {
            Mode::Visa(port) => port.write(command, properties),
            Mode::Prologix {
                gpib_address,
                controller,
                ..
            } => attached(controller)?
                .lock()
                .write(command, Some(*gpib_address)),
        }
    }

    fn write_raw(&mut self, data: &[u8], properties: &PortProperties) -> Result<(), PortError> {
        match &mut self.mode {
            Mode::Visa(port) => port.write_raw(data, properties),
            Mode::Prologix {
                gpib_address,
                controller,
                ..
            } => attached(controller)?
                .lock()
                .write_payload(data, *gpib_address),
        }
    }

    fn read(&mut self, digits: usize, properties: &PortProperties) -> Result<String, PortError> {
        match &mut self.mode {
            Mode::Visa(port) => port.read(digits, properties),
            Mode::Prologix {
                gpib_address,
                controller,
                ..
            } => {
                let answer = attached(controller)?.lock().read(*gpib_address)?;
                if answer.is_empty() && properties.exception {
                    return Err(PortError::NoResponse {
                        kind: properties.kind.to_string(),
                        resource: properties.id.clone(),
                    });
                }
                Ok(answer)
            }
        }
    }

    fn read_raw(&mut self, digits: usize, properties: &PortProperties) -> Result<Vec<u8>, PortError> {
        match &mut self.mode {
            Mode::Visa(port) => port.read_raw(digits, properties),
            Mode::Prologix {
                gpib_address,
                controller,
                ..
            } => attached(controller)?.lock().read_bytes(*gpib_address),
        }
    }

    fn supports_identification(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockSerialBackend;
    use crate::port::mock_visa::MockVisaLibrary;
    use std::time::Duration;

    fn registry_with_controller(backend: &MockSerialBackend) -> Arc<PrologixRegistry> {
        let registry = Arc::new(PrologixRegistry::new());
        registry.add("COM7", Arc::new(backend.clone()));
        registry
    }

    #[test]
    fn test_prologix_mode_delegates_to_controller() {
        let backend = MockSerialBackend::new();
        let link = backend.plug("COM7");
        let registry = registry_with_controller(&backend);
        let rm = Arc::new(ResourceManager::new(Arc::new(MockVisaLibrary::new())));
        let resource = "GPIB::5::Prologix@COM7";
        let props = PortProperties::defaults(PortKind::Gpib, resource);

        let mut port = GpibPort::new(resource, rm, registry);
        assert!(port.is_prologix());
        port.open(&props).unwrap();
        link.clear_write_log();

        link.respond_to(b"++read eoi\n", b"3.14\n");
        port.write("MEAS?", &props).unwrap();
        assert_eq!(port.read(0, &props).unwrap(), "3.14");
        assert_eq!(
            &link.written_lines()[..2],
            &["++addr 5\n".to_string(), "MEAS?\n".to_string()]
        );
    }

    #[test]
    fn test_prologix_without_controller_fails_to_open() {
        let registry = Arc::new(PrologixRegistry::new());
        let rm = Arc::new(ResourceManager::new(Arc::new(MockVisaLibrary::new())));
        let resource = "GPIB::5::Prologix@COM7";
        let props = PortProperties::defaults(PortKind::Gpib, resource);

        let mut port = GpibPort::new(resource, rm, registry);
        assert!(matches!(port.open(&props), Err(PortError::Prologix(_))));
        assert!(matches!(port.write("X", &props), Err(PortError::NotOpen)));
    }

    #[test]
    fn test_prologix_silence_is_no_response() {
        let backend = MockSerialBackend::new();
        backend.plug("COM7");
        let registry = registry_with_controller(&backend);
        let rm = Arc::new(ResourceManager::new(Arc::new(MockVisaLibrary::new())));
        let resource = "GPIB::5::Prologix@COM7";
        let mut props = PortProperties::defaults(PortKind::Gpib, resource);
        props.timeout = Duration::from_millis(10);

        let mut port = GpibPort::new(resource, rm, registry);
        port.open(&props).unwrap();
        assert!(matches!(
            port.read(0, &props),
            Err(PortError::NoResponse { .. })
        ));
    }

    #[test]
    fn test_visa_mode() {
        let library = MockVisaLibrary::new();
        let instrument = library.add_instrument("GPIB0::12::INSTR");
        instrument.respond_to("*IDN?", "ACME,SMU,0,2.0");
        let rm = Arc::new(ResourceManager::new(Arc::new(library)));
        let props = PortProperties::defaults(PortKind::Gpib, "GPIB0::12::INSTR");

        let mut port = GpibPort::new("GPIB0::12::INSTR", rm, Arc::new(PrologixRegistry::new()));
        assert!(!port.is_prologix());
        port.open(&props).unwrap();
        port.write("*IDN?", &props).unwrap();
        assert_eq!(port.read(0, &props).unwrap(), "ACME,SMU,0,2.0");
    }
}
