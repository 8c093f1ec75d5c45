//! Property overrides injected on top of driver requests.

use crate::config::Config;
use crate::port::PropertyOverrides;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Supplies per-resource overrides that win over what a driver asked for.
///
/// A host application typically backs this with a port dialog; the default
/// implementation reads `[ports."<resource>"]` from the configuration.
pub trait PropertyProvider: Send + Sync + std::fmt::Debug {
    /// Overrides for `resource`. Empty when nothing is configured.
    fn port_properties(&self, resource: &str) -> PropertyOverrides;

    /// Forget all overrides, called when the host loads a new setting.
    fn clear(&self) {}
}

/// Overrides held in memory, seeded from the configuration file.
#[derive(Debug, Default)]
pub struct DialogOverrides {
    ports: Mutex<BTreeMap<String, PropertyOverrides>>,
}

impl DialogOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            ports: Mutex::new(config.ports.clone()),
        }
    }

    /// Replace the overrides of one resource.
    pub fn set(&self, resource: impl Into<String>, overrides: PropertyOverrides) {
        self.ports.lock().insert(resource.into(), overrides);
    }

    pub fn remove(&self, resource: &str) -> Option<PropertyOverrides> {
        self.ports.lock().remove(resource)
    }

    pub fn resources(&self) -> Vec<String> {
        self.ports.lock().keys().cloned().collect()
    }
}

impl PropertyProvider for DialogOverrides {
    fn port_properties(&self, resource: &str) -> PropertyOverrides {
        self.ports.lock().get(resource).cloned().unwrap_or_default()
    }

    fn clear(&self) {
        self.ports.lock().clear();
    }
}
