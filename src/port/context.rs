//! Shared collaborators of all ports in one process (or one test).

use super::discovery::{PortType, PortTypeRegistry};
use super::error::PortError;
use super::handle::Port;
use super::kind::PortKind;
use super::prologix::{PrologixRegistry, SharedController};
use super::serial_backend::{SerialBackend, SystemSerialBackend};
use super::visa::{default_library, ResourceManager, VisaLibrary};
use std::sync::Arc;

/// Serial backend, VISA resource manager, Prologix controllers and port
/// types, bundled so they can be swapped for mocks.
#[derive(Debug)]
pub struct PortContext {
    serial: Arc<dyn SerialBackend>,
    resource_manager: Arc<ResourceManager>,
    prologix: Arc<PrologixRegistry>,
    types: PortTypeRegistry,
}

impl PortContext {
    pub fn new(serial: Arc<dyn SerialBackend>, visa: Arc<dyn VisaLibrary>) -> Self {
        Self {
            serial,
            resource_manager: Arc::new(ResourceManager::new(visa)),
            prologix: Arc::new(PrologixRegistry::new()),
            types: PortTypeRegistry::new(),
        }
    }

    /// Context backed by the operating system and the compiled-in VISA runtime.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemSerialBackend), default_library())
    }

    pub fn serial_backend(&self) -> Arc<dyn SerialBackend> {
        Arc::clone(&self.serial)
    }

    pub fn resource_manager(&self) -> Arc<ResourceManager> {
        Arc::clone(&self.resource_manager)
    }

    pub fn prologix(&self) -> Arc<PrologixRegistry> {
        Arc::clone(&self.prologix)
    }

    pub fn port_types(&self) -> &PortTypeRegistry {
        &self.types
    }

    pub fn port_type(&self, kind: PortKind) -> Option<&dyn PortType> {
        self.types.get(kind)
    }

    pub fn add_prologix_controller(&self, address: &str) -> SharedController {
        self.prologix.add(address, self.serial_backend())
    }

    pub fn remove_prologix_controller(&self, address: &str) -> Option<SharedController> {
        self.prologix.remove(address)
    }

    /// Fresh discovery for one kind. Unregistered kinds have no resources.
    pub fn find_resources(&self, kind: PortKind) -> Vec<String> {
        self.port_type(kind)
            .map(|port_type| port_type.find_resources(self))
            .unwrap_or_default()
    }

    /// Build a closed port for `resource` with default properties.
    pub fn create_port(&self, resource: &str) -> Result<Port, PortError> {
        let kind = PortKind::from_resource(resource).ok_or_else(|| {
            PortError::construction(resource, "port type is not defined for this resource")
        })?;
        let port_type = self.port_type(kind).ok_or_else(|| {
            PortError::construction(resource, format!("{kind} ports are not registered"))
        })?;
        let transport = port_type.create_transport(resource, self)?;
        Ok(Port::new(kind, resource, transport))
    }
}

impl Default for PortContext {
    fn default() -> Self {
        Self::system()
    }
}
