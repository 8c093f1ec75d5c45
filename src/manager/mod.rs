//! Process-wide cache of ports.
//!
//! Drivers never build ports themselves. They ask the [`PortManager`] for a
//! resource and get back the one [`SharedPort`] living for it, freshly
//! re-initialized with their overrides and opened.
//!
//! # Architecture
//!
//! ```text
//! driver A ─┐                      ┌─> PortContext::create_port (first request)
//! driver B ─┼──> PortManager ──────┤
//! host     ─┘    (resource → port) └─> cached Port: reinit + overrides + open
//! ```

mod provider;
mod request;

pub use provider::{DialogOverrides, PropertyProvider};
pub use request::DriverPortRequest;

use crate::config::{Config, ConfigLoader};
use crate::diagnostics::report_error;
use crate::port::visa::{default_library, NoVisaLibrary, VisaLibrary};
use crate::port::{
    PortContext, PortError, PortKind, PropertyOverrides, SharedController, SharedPort,
    SystemSerialBackend, IDENTIFICATION_NOT_AVAILABLE,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

static GLOBAL: OnceCell<PortManager> = OnceCell::new();

/// Owns every port handed out in one context.
#[derive(Debug)]
pub struct PortManager {
    context: PortContext,
    ports: Mutex<BTreeMap<String, SharedPort>>,
    provider: Mutex<Option<Arc<dyn PropertyProvider>>>,
}

impl PortManager {
    /// Manager over an explicit context, with no property provider.
    pub fn new(context: PortContext) -> Self {
        Self {
            context,
            ports: Mutex::new(BTreeMap::new()),
            provider: Mutex::new(None),
        }
    }

    /// Manager over `context` configured from `config`: Prologix controllers
    /// are registered and `[ports]` overrides become the property provider.
    pub fn configured(context: PortContext, config: &Config) -> Self {
        let manager = Self::new(context);
        for address in &config.prologix.controllers {
            manager.add_prologix_controller(address);
        }
        manager.set_property_provider(Some(Arc::new(DialogOverrides::from_config(config))));
        manager
    }

    /// Manager on the real serial ports and VISA runtime.
    pub fn from_config(config: &Config) -> Self {
        let visa: Arc<dyn VisaLibrary> = if config.visa.enabled {
            default_library()
        } else {
            Arc::new(NoVisaLibrary)
        };
        Self::configured(PortContext::new(Arc::new(SystemSerialBackend), visa), config)
    }

    /// The process-wide manager, built on first use from the loaded
    /// configuration. A configuration that fails to load is reported and
    /// replaced by the defaults.
    pub fn global() -> &'static PortManager {
        GLOBAL.get_or_init(|| {
            let config = match ConfigLoader::load() {
                Ok(loader) => loader.into_config(),
                Err(e) => {
                    report_error("Cannot load configuration, using defaults", &e);
                    Config::default()
                }
            };
            Self::from_config(&config)
        })
    }

    pub fn context(&self) -> &PortContext {
        &self.context
    }

    // ========== Host hooks ==========

    /// Called once when the host starts.
    pub fn startup(&self) {}

    /// Called when the host loads a setting; dialog overrides are dropped.
    pub fn on_load_setting(&self) {
        if let Some(provider) = self.provider() {
            provider.clear();
        }
    }

    /// Called before a measurement starts.
    pub fn prepare_run(&self) {
        match self.open_resource_manager() {
            Ok(()) => {}
            Err(PortError::BackendUnavailable(reason)) => {
                debug!("Running without VISA: {}", reason)
            }
            Err(e) => report_error("Cannot open the VISA resource manager", &e),
        }
    }

    /// Called after a measurement; closes every port and releases VISA.
    pub fn prepare_stop(&self) {
        self.close_all_ports();
        if let Err(e) = self.close_resource_manager() {
            report_error("Cannot close the VISA resource manager", &e);
        }
    }

    // ========== Ports ==========

    /// The opened port for `resource`.
    ///
    /// The port is rebuilt from the transport defaults, then `overrides`,
    /// then whatever the property provider holds for the resource. A port
    /// that cannot be created or opened is reported and not cached.
    pub fn get_port(
        &self,
        resource: &str,
        overrides: &PropertyOverrides,
    ) -> Result<SharedPort, PortError> {
        self.acquire(resource, overrides).map_err(|e| {
            report_error(&format!("Port '{resource}' cannot be used"), &e);
            e
        })
    }

    fn acquire(
        &self,
        resource: &str,
        overrides: &PropertyOverrides,
    ) -> Result<SharedPort, PortError> {
        let types = self.context.port_types();
        for key in overrides.keys().filter(|key| !types.is_known_key(key)) {
            warn!(
                "Property '{}' of port '{}' is unknown to every port type",
                key, resource
            );
        }

        let mut properties = overrides.clone();
        if let Some(provider) = self.provider() {
            properties.merge(&provider.port_properties(resource));
        }

        let cached = self.ports.lock().get(resource).cloned();
        let shared = match cached {
            Some(shared) => {
                let mut port = shared.lock();
                port.initialize_port_properties();
                port.update_properties(&properties);
                drop(port);
                shared
            }
            None => {
                let mut port = self.context.create_port(resource)?;
                port.update_properties(&properties);
                port.open()?;
                let shared = port.into_shared();
                self.ports
                    .lock()
                    .insert(resource.to_string(), Arc::clone(&shared));
                info!("Created port {}", resource);
                shared
            }
        };

        let mut port = shared.lock();
        if !port.is_open() {
            port.open()?;
        }
        drop(port);
        Ok(shared)
    }

    /// Port for a driver, or `None` when the driver does not use the manager.
    pub fn acquire_for(
        &self,
        resource: &str,
        request: &DriverPortRequest,
    ) -> Result<Option<SharedPort>, PortError> {
        if !request.port_manager {
            return Ok(None);
        }
        self.get_port(resource, &request.port_properties).map(Some)
    }

    /// Forget a port without closing it.
    pub fn remove_port(&self, resource: &str) -> Option<SharedPort> {
        self.ports.lock().remove(resource)
    }

    /// The cached port for `resource`, if any.
    pub fn cached_port(&self, resource: &str) -> Option<SharedPort> {
        self.ports.lock().get(resource).cloned()
    }

    pub fn cached_resources(&self) -> Vec<String> {
        self.ports.lock().keys().cloned().collect()
    }

    /// Cached port or a new, closed one that is cached from now on.
    fn port_or_create(&self, resource: &str) -> Result<SharedPort, PortError> {
        if let Some(shared) = self.cached_port(resource) {
            return Ok(shared);
        }
        let shared = self.context.create_port(resource)?.into_shared();
        Ok(Arc::clone(
            self.ports
                .lock()
                .entry(resource.to_string())
                .or_insert(shared),
        ))
    }

    fn cached_or_not_found(&self, resource: &str) -> Result<SharedPort, PortError> {
        self.cached_port(resource)
            .ok_or_else(|| PortError::not_found(resource))
    }

    pub fn open_port(&self, resource: &str) -> Result<(), PortError> {
        self.cached_or_not_found(resource)?.lock().open()
    }

    pub fn close_port(&self, resource: &str) -> Result<(), PortError> {
        self.cached_or_not_found(resource)?.lock().close()
    }

    /// Close every cached port. Failures are reported and do not stop the
    /// remaining ports from being closed.
    pub fn close_all_ports(&self) {
        let ports: Vec<(String, SharedPort)> = self
            .ports
            .lock()
            .iter()
            .map(|(resource, port)| (resource.clone(), Arc::clone(port)))
            .collect();
        for (resource, port) in ports {
            if let Err(e) = port.lock().close() {
                report_error(&format!("Cannot close port '{resource}'"), &e);
            }
        }
    }

    /// Turn traffic logging on or off for `resource`, creating the port if
    /// needed.
    pub fn set_port_logging(&self, resource: &str, enabled: bool) -> Result<(), PortError> {
        self.port_or_create(resource)?.lock().set_logging(enabled);
        Ok(())
    }

    /// Open the port, ask for its identification, close it again and
    /// release the VISA resource manager.
    pub fn get_identification(&self, resource: &str) -> Result<String, PortError> {
        let result = self.identify(resource);
        if let Err(e) = self.close_resource_manager() {
            report_error("Cannot close the VISA resource manager", &e);
        }
        result.map_err(|e| {
            report_error(&format!("Cannot identify '{resource}'"), &e);
            e
        })
    }

    fn identify(&self, resource: &str) -> Result<String, PortError> {
        let shared = self.port_or_create(resource)?;
        let mut port = shared.lock();
        port.open()?;
        let identification = port.get_identification();
        let closed = port.close();
        let identification = identification?;
        closed?;
        if identification != IDENTIFICATION_NOT_AVAILABLE {
            port.update_properties(
                &PropertyOverrides::new().with("identification", identification.clone()),
            );
        }
        Ok(identification)
    }

    // ========== Discovery ==========

    /// Kinds with a registered port type.
    pub fn port_types(&self) -> Vec<PortKind> {
        self.context.port_types().kinds()
    }

    /// Fresh discovery per kind. An empty `kinds` searches every registered
    /// kind.
    pub fn find_resources(&self, kinds: &[PortKind]) -> BTreeMap<PortKind, Vec<String>> {
        let kinds = if kinds.is_empty() {
            self.port_types()
        } else {
            kinds.to_vec()
        };
        kinds
            .into_iter()
            .map(|kind| (kind, self.context.find_resources(kind)))
            .collect()
    }

    /// Resources of `kinds` that can be used right now.
    ///
    /// Cached ports of those kinds that were not rediscovered are pruned.
    /// USB-TMC resources whose identification is already known are only
    /// listed when it contains one of `identifications`; an empty filter
    /// lists everything.
    pub fn get_resources_available(
        &self,
        kinds: &[PortKind],
        identifications: &[String],
    ) -> Vec<String> {
        let mut resources: Vec<String> = Vec::new();
        for kind in kinds {
            for resource in self.context.find_resources(*kind) {
                if !resources.contains(&resource) {
                    resources.push(resource);
                }
            }
        }

        // Port guards are taken with the map unlocked: a driver holding its
        // port may ask the manager for another one meanwhile.
        let cached: Vec<(String, SharedPort)> = self
            .ports
            .lock()
            .iter()
            .map(|(resource, port)| (resource.clone(), Arc::clone(port)))
            .collect();

        let mut kept = Vec::new();
        let mut gone = Vec::new();
        for (resource, shared) in cached {
            let mut port = shared.lock();
            if !kinds.contains(&port.kind()) {
                continue;
            }
            let active = resources.contains(&resource);
            port.set_active(active);
            drop(port);
            if active {
                kept.push((resource, shared));
            } else {
                debug!("Port {} disappeared, dropping it", resource);
                gone.push((resource, shared));
            }
        }

        if !gone.is_empty() {
            let mut ports = self.ports.lock();
            for (resource, shared) in &gone {
                if ports.get(resource).is_some_and(|cached| Arc::ptr_eq(cached, shared)) {
                    ports.remove(resource);
                }
            }
        }

        if identifications.is_empty() {
            return resources;
        }
        resources.retain(|resource| {
            let Some((_, shared)) = kept.iter().find(|(cached, _)| cached == resource) else {
                return true;
            };
            let port = shared.lock();
            match (&port.properties().identification, port.kind()) {
                (Some(identification), PortKind::UsbTmc) => identifications
                    .iter()
                    .any(|wanted| identification.contains(wanted.as_str())),
                _ => true,
            }
        });
        resources
    }

    // ========== VISA & Prologix ==========

    pub fn open_resource_manager(&self) -> Result<(), PortError> {
        self.context.resource_manager().get().map(|_| ())
    }

    pub fn close_resource_manager(&self) -> Result<(), PortError> {
        self.context.resource_manager().close()
    }

    pub fn is_resource_manager(&self) -> bool {
        self.context.resource_manager().is_open()
    }

    pub fn add_prologix_controller(&self, address: &str) -> SharedController {
        self.context.add_prologix_controller(address)
    }

    pub fn remove_prologix_controller(&self, address: &str) -> Option<SharedController> {
        self.context.remove_prologix_controller(address)
    }

    // ========== Property provider ==========

    pub fn set_property_provider(&self, provider: Option<Arc<dyn PropertyProvider>>) {
        *self.provider.lock() = provider;
    }

    fn provider(&self) -> Option<Arc<dyn PropertyProvider>> {
        self.provider.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockSerialBackend, MockVisaLibrary};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn manager() -> (PortManager, MockSerialBackend, MockVisaLibrary) {
        let serial = MockSerialBackend::new();
        let visa = MockVisaLibrary::new();
        let context = PortContext::new(Arc::new(serial.clone()), Arc::new(visa.clone()));
        (PortManager::new(context), serial, visa)
    }

    #[test]
    fn test_same_resource_same_port() {
        let (manager, serial, _) = manager();
        serial.plug("COM3");

        let first = manager.get_port("COM3", &PropertyOverrides::new()).unwrap();
        let second = manager.get_port("COM3", &PropertyOverrides::new()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(serial.open_count("COM3"), 1);
    }

    #[test]
    fn test_provider_overrides_win() {
        let (manager, serial, _) = manager();
        serial.plug("COM3");
        let dialog = Arc::new(DialogOverrides::new());
        dialog.set("COM3", PropertyOverrides::new().with("baudrate", 19200));
        manager.set_property_provider(Some(dialog.clone()));

        let port = manager
            .get_port("COM3", &PropertyOverrides::new().with("baudrate", 115200))
            .unwrap();
        assert_eq!(port.lock().properties().baudrate, 19200);

        manager.on_load_setting();
        let port = manager
            .get_port("COM3", &PropertyOverrides::new().with("baudrate", 115200))
            .unwrap();
        assert_eq!(port.lock().properties().baudrate, 115200);
    }

    #[test]
    fn test_unknown_resource_is_not_cached() {
        let (manager, _, _) = manager();
        assert!(matches!(
            manager.get_port("LPT1", &PropertyOverrides::new()),
            Err(PortError::Construction { .. })
        ));
        assert!(manager.cached_resources().is_empty());
    }

    #[test]
    fn test_unknown_keys_are_kept() {
        let (manager, serial, _) = manager();
        serial.plug("COM3");
        let port = manager
            .get_port("COM3", &PropertyOverrides::new().with("Colour", "blue"))
            .unwrap();
        assert_eq!(port.lock().properties().get("Colour"), Some(json!("blue")));
    }

    #[test]
    fn test_closed_port_is_reopened() {
        let (manager, serial, _) = manager();
        serial.plug("COM3");
        manager.get_port("COM3", &PropertyOverrides::new()).unwrap();

        manager.close_port("COM3").unwrap();
        assert!(!manager.cached_port("COM3").unwrap().lock().is_open());

        let port = manager.get_port("COM3", &PropertyOverrides::new()).unwrap();
        assert!(port.lock().is_open());
        assert_eq!(serial.open_count("COM3"), 2);
    }

    #[test]
    fn test_open_close_unknown_port() {
        let (manager, _, _) = manager();
        assert!(matches!(
            manager.open_port("COM3"),
            Err(PortError::NotFound(_))
        ));
        assert!(matches!(
            manager.close_port("COM3"),
            Err(PortError::NotFound(_))
        ));
    }

    #[test]
    fn test_acquire_for_unmanaged_driver() {
        let (manager, serial, _) = manager();
        serial.plug("COM3");
        assert!(manager
            .acquire_for("COM3", &DriverPortRequest::unmanaged())
            .unwrap()
            .is_none());
        assert!(manager.cached_resources().is_empty());

        let request = DriverPortRequest::new(PropertyOverrides::new().with("baudrate", 57600));
        let port = manager.acquire_for("COM3", &request).unwrap().unwrap();
        assert_eq!(port.lock().properties().baudrate, 57600);
    }

    #[test]
    fn test_set_port_logging_creates_closed_port() {
        let (manager, _, _) = manager();
        manager.set_port_logging("COM8", true).unwrap();
        let port = manager.cached_port("COM8").unwrap();
        let port = port.lock();
        assert!(port.logging());
        assert!(!port.is_open());
    }

    #[test]
    fn test_identification_round_trip() {
        let (manager, _, visa) = manager();
        let instrument = visa.add_instrument("USB0::1::2::3::INSTR");
        instrument.respond_to("*IDN?", "ACME,Scope,42,1.0");

        let identification = manager.get_identification("USB0::1::2::3::INSTR").unwrap();
        assert_eq!(identification, "ACME,Scope,42,1.0");
        assert!(!manager.is_resource_manager());

        let port = manager.cached_port("USB0::1::2::3::INSTR").unwrap();
        assert!(!port.lock().is_open());
        assert_eq!(
            port.lock().properties().identification.as_deref(),
            Some("ACME,Scope,42,1.0")
        );
    }

    #[test]
    fn test_identification_filter() {
        let (manager, _, visa) = manager();
        visa.add_instrument("USB0::1::2::3::INSTR")
            .respond_to("*IDN?", "ACME,Scope,42,1.0");
        visa.add_instrument("USB0::1::2::4::INSTR")
            .respond_to("*IDN?", "Other,Meter,7,2.0");
        manager.get_identification("USB0::1::2::3::INSTR").unwrap();
        manager.get_identification("USB0::1::2::4::INSTR").unwrap();

        let all = manager.get_resources_available(&[PortKind::UsbTmc], &[]);
        assert_eq!(all.len(), 2);

        let scopes =
            manager.get_resources_available(&[PortKind::UsbTmc], &["Scope".to_string()]);
        assert_eq!(scopes, vec!["USB0::1::2::3::INSTR".to_string()]);
    }

    #[test]
    fn test_discovery_does_not_block_driver_holding_a_port() {
        let (manager, serial, _) = manager();
        serial.plug("COM3");
        serial.plug("COM4");
        let com3 = manager.get_port("COM3", &PropertyOverrides::new()).unwrap();
        let manager = &manager;
        let (done, finished) = mpsc::channel();

        thread::scope(|scope| {
            let guard = com3.lock();
            scope.spawn(move || manager.get_resources_available(&[PortKind::Com], &[]));
            thread::sleep(Duration::from_millis(50));
            scope.spawn(move || {
                let acquired = manager.get_port("COM4", &PropertyOverrides::new()).is_ok();
                let _ = done.send(acquired);
            });

            let result = finished.recv_timeout(Duration::from_secs(3));
            drop(guard);
            assert_eq!(result, Ok(true));
        });
        assert!(manager.cached_port("COM4").is_some());
    }

    #[test]
    fn test_find_resources_all_kinds() {
        let (manager, serial, visa) = manager();
        serial.plug("COM3");
        visa.add_instrument("GPIB0::5::INSTR");

        let found = manager.find_resources(&[]);
        assert_eq!(found.len(), PortKind::ALL.len());
        assert_eq!(found[&PortKind::Com], vec!["COM3".to_string()]);
        assert_eq!(found[&PortKind::Gpib], vec!["GPIB0::5::INSTR".to_string()]);
    }

    #[test]
    fn test_prepare_run_and_stop() {
        let (manager, serial, _) = manager();
        serial.plug("COM3");
        let port = manager.get_port("COM3", &PropertyOverrides::new()).unwrap();

        manager.prepare_run();
        assert!(manager.is_resource_manager());

        manager.prepare_stop();
        assert!(!manager.is_resource_manager());
        assert!(!port.lock().is_open());
    }

    #[test]
    fn test_prepare_run_without_visa() {
        let context = PortContext::new(
            Arc::new(MockSerialBackend::new()),
            Arc::new(MockVisaLibrary::unavailable()),
        );
        let manager = PortManager::new(context);
        manager.prepare_run();
        assert!(!manager.is_resource_manager());
    }

    #[test]
    fn test_configured_registers_controllers() {
        let serial = MockSerialBackend::new();
        serial.plug("COM7");
        let context = PortContext::new(Arc::new(serial), Arc::new(MockVisaLibrary::new()));
        let mut config = Config::default();
        config.prologix.controllers.push("COM7".to_string());

        let manager = PortManager::configured(context, &config);
        assert!(manager.context().prologix().contains("COM7"));
        assert!(manager.find_resources(&[PortKind::Com])[&PortKind::Com].is_empty());
    }
}
