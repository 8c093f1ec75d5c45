//! Port types and resource discovery.
//!
//! Each transport kind is described by a [`PortType`]: the property keys
//! it understands, how to find its resources and how to build a transport
//! for one of them. [`PortTypeRegistry`] holds
//! one of each and is what the manager iterates over.

use super::context::PortContext;
use super::com::ComPort;
use super::error::PortError;
use super::gpib::GpibPort;
use super::kind::PortKind;
use super::properties::keys_for;
use super::socket::SocketPort;
use super::traits::Transport;
use super::visa_port::VisaPort;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Static description of one transport kind.
pub trait PortType: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> PortKind;

    /// Property keys ports of this kind understand.
    fn property_keys(&self) -> Vec<&'static str> {
        keys_for(self.kind())
    }

    /// Resources of this kind currently present. Always queries afresh.
    fn find_resources(&self, ctx: &PortContext) -> Vec<String>;

    /// Build the transport for `resource`.
    fn create_transport(
        &self,
        resource: &str,
        ctx: &PortContext,
    ) -> Result<Box<dyn Transport>, PortError>;
}

/// Serial ports known to the OS, minus those owned by Prologix controllers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ComType;

impl PortType for ComType {
    fn kind(&self) -> PortKind {
        PortKind::Com
    }

    fn find_resources(&self, ctx: &PortContext) -> Vec<String> {
        let controllers = ctx.prologix().addresses();
        match ctx.serial_backend().available_ports() {
            Ok(ports) => ports
                .into_iter()
                .filter(|port| !controllers.contains(port))
                .collect(),
            Err(e) => {
                warn!("Error during finding COM ports: {}", e);
                Vec::new()
            }
        }
    }

    fn create_transport(
        &self,
        _resource: &str,
        ctx: &PortContext,
    ) -> Result<Box<dyn Transport>, PortError> {
        Ok(Box::new(ComPort::new(ctx.serial_backend())))
    }
}

/// GPIB instruments behind Prologix controllers and the VISA runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct GpibType;

impl PortType for GpibType {
    fn kind(&self) -> PortKind {
        PortKind::Gpib
    }

    fn find_resources(&self, ctx: &PortContext) -> Vec<String> {
        let mut resources: Vec<String> = ctx
            .prologix()
            .controllers()
            .iter()
            .flat_map(|controller| controller.lock().list_resources())
            .collect();
        resources.extend(without_interfaces(ctx.resource_manager().list_resources("GPIB?*")));
        resources
    }

    fn create_transport(
        &self,
        resource: &str,
        ctx: &PortContext,
    ) -> Result<Box<dyn Transport>, PortError> {
        Ok(Box::new(GpibPort::new(
            resource,
            ctx.resource_manager(),
            ctx.prologix(),
        )))
    }
}

/// A kind served entirely by the VISA runtime.
#[derive(Debug, Clone, Copy)]
pub struct VisaType {
    kind: PortKind,
    query: &'static str,
    drop_interfaces: bool,
}

impl VisaType {
    pub const fn pxi() -> Self {
        Self {
            kind: PortKind::Pxi,
            query: "PXI?*",
            drop_interfaces: true,
        }
    }

    pub const fn asrl() -> Self {
        Self {
            kind: PortKind::Asrl,
            query: "ASRL?*",
            drop_interfaces: false,
        }
    }

    pub const fn usbtmc() -> Self {
        Self {
            kind: PortKind::UsbTmc,
            query: "USB?*",
            drop_interfaces: false,
        }
    }

    pub const fn tcpip() -> Self {
        Self {
            kind: PortKind::Tcpip,
            query: "TCPIP?*",
            drop_interfaces: false,
        }
    }
}

impl PortType for VisaType {
    fn kind(&self) -> PortKind {
        self.kind
    }

    fn find_resources(&self, ctx: &PortContext) -> Vec<String> {
        let resources = ctx.resource_manager().list_resources(self.query);
        if self.drop_interfaces {
            without_interfaces(resources)
        } else {
            resources
        }
    }

    fn create_transport(
        &self,
        _resource: &str,
        ctx: &PortContext,
    ) -> Result<Box<dyn Transport>, PortError> {
        Ok(Box::new(VisaPort::new(self.kind, ctx.resource_manager())))
    }
}

/// Raw TCP endpoints listening on this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketType;

impl PortType for SocketType {
    fn kind(&self) -> PortKind {
        PortKind::Socket
    }

    fn find_resources(&self, _ctx: &PortContext) -> Vec<String> {
        local_listeners()
    }

    fn create_transport(
        &self,
        _resource: &str,
        _ctx: &PortContext,
    ) -> Result<Box<dyn Transport>, PortError> {
        Ok(Box::new(SocketPort::new()))
    }
}

fn without_interfaces(resources: Vec<String>) -> Vec<String> {
    resources
        .into_iter()
        .filter(|resource| !resource.contains("INTFC"))
        .collect()
}

#[cfg(target_os = "linux")]
fn local_listeners() -> Vec<String> {
    match std::fs::read_to_string("/proc/net/tcp") {
        Ok(table) => parse_tcp_listeners(&table),
        Err(e) => {
            debug!("Cannot read /proc/net/tcp: {}", e);
            Vec::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn local_listeners() -> Vec<String> {
    debug!("Socket discovery is only available on Linux");
    Vec::new()
}

/// `TCP_LISTEN` in the kernel's state column.
const TCP_LISTEN: &str = "0A";

/// Listening endpoints in a `/proc/net/tcp` table, as `ip:port`.
///
/// Addresses are printed by the kernel as native-endian hex. Wildcard
/// listeners are reported on the loopback address.
pub fn parse_tcp_listeners(table: &str) -> Vec<String> {
    let mut endpoints = BTreeSet::new();
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(_slot), Some(local), Some(_remote), Some(state)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if state != TCP_LISTEN {
            continue;
        }
        let Some((ip_hex, port_hex)) = local.split_once(':') else {
            continue;
        };
        let (Ok(ip), Ok(port)) = (
            u32::from_str_radix(ip_hex, 16),
            u16::from_str_radix(port_hex, 16),
        ) else {
            continue;
        };
        let mut ip = Ipv4Addr::from(ip.to_ne_bytes());
        if ip.is_unspecified() {
            ip = Ipv4Addr::LOCALHOST;
        }
        endpoints.insert((ip, port));
    }
    endpoints
        .into_iter()
        .map(|(ip, port)| format!("{ip}:{port}"))
        .collect()
}

/// One [`PortType`] per transport kind.
#[derive(Debug)]
pub struct PortTypeRegistry {
    types: Vec<Box<dyn PortType>>,
}

impl PortTypeRegistry {
    /// Registry with every built-in kind.
    pub fn new() -> Self {
        Self::with_types(vec![
            Box::new(ComType),
            Box::new(GpibType),
            Box::new(VisaType::pxi()),
            Box::new(VisaType::asrl()),
            Box::new(VisaType::usbtmc()),
            Box::new(VisaType::tcpip()),
            Box::new(SocketType),
        ])
    }

    /// Registry with custom port types.
    pub fn with_types(types: Vec<Box<dyn PortType>>) -> Self {
        Self { types }
    }

    pub fn get(&self, kind: PortKind) -> Option<&dyn PortType> {
        self.types
            .iter()
            .find(|t| t.kind() == kind)
            .map(|t| t.as_ref())
    }

    /// Registered kinds, in registration order.
    pub fn kinds(&self) -> Vec<PortKind> {
        self.types.iter().map(|t| t.kind()).collect()
    }

    /// Whether any registered kind understands `key`.
    pub fn is_known_key(&self, key: &str) -> bool {
        self.types
            .iter()
            .any(|t| t.property_keys().contains(&key))
    }
}

impl Default for PortTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PROC_NET_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:13A1 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0
   1: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12346 1 0000000000000000 100 0 0 10 0
   2: 0100007F:13A1 0100007F:D2F0 01 00000000:00000000 00:00000000 00000000  1000        0 12347 1 0000000000000000 20 4 30 10 -1
   3: garbage
";

    #[test]
    #[cfg(target_endian = "little")]
    fn test_parse_tcp_listeners() {
        assert_eq!(
            parse_tcp_listeners(PROC_NET_TCP),
            vec!["127.0.0.1:5025".to_string(), "127.0.0.1:8080".to_string()]
        );
    }

    #[test]
    fn test_interfaces_are_dropped() {
        let resources = vec!["GPIB0::INTFC".to_string(), "GPIB0::5::INSTR".to_string()];
        assert_eq!(without_interfaces(resources), vec!["GPIB0::5::INSTR".to_string()]);
    }

    #[test]
    fn test_registry_covers_every_kind() {
        let registry = PortTypeRegistry::new();
        assert_eq!(registry.kinds(), PortKind::ALL.to_vec());
        assert!(registry.is_known_key("baudrate"));
        assert!(registry.is_known_key("SOCKET_EOLread"));
        assert!(!registry.is_known_key("bogus"));
    }
}
