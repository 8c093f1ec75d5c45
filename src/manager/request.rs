//! What a driver declares about the port it needs.

use crate::port::PropertyOverrides;
use serde::{Deserialize, Serialize};

/// Port requirements of one driver.
///
/// Drivers that talk to their instrument through their own library set
/// `port_manager` to false and never receive a port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverPortRequest {
    /// Whether the driver wants a port from the manager.
    pub port_manager: bool,
    /// Overrides applied on top of the transport defaults.
    pub port_properties: PropertyOverrides,
}

impl DriverPortRequest {
    pub fn new(port_properties: PropertyOverrides) -> Self {
        Self {
            port_manager: true,
            port_properties,
        }
    }

    /// A request for drivers that manage their own connection.
    pub fn unmanaged() -> Self {
        Self::default()
    }
}
