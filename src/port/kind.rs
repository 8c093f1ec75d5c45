//! Transport kinds and resource string classification.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `<IPv4 or hostname>:<port>`, the raw socket form.
static SOCKET_RESOURCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.\-]*:\d{1,5}$").expect("socket resource pattern is valid")
});

/// `GPIB::<addr>::Prologix@<serial-port>`
static PROLOGIX_RESOURCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^GPIB\d*::(\d{1,2})::Prologix@(.+)$").expect("prologix resource pattern is valid")
});

/// One kind of transport a port can be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortKind {
    /// Serial line opened through the operating system.
    Com,
    /// GPIB through VISA or through a Prologix controller.
    Gpib,
    /// PXI modules through VISA.
    Pxi,
    /// Serial line opened through VISA.
    Asrl,
    /// USB test & measurement class through VISA.
    UsbTmc,
    /// LAN instruments through VISA (VXI-11, HiSLIP, VISA sockets).
    Tcpip,
    /// Raw TCP socket opened directly.
    Socket,
}

impl PortKind {
    /// All kinds, in discovery order.
    pub const ALL: [PortKind; 7] = [
        PortKind::Com,
        PortKind::Gpib,
        PortKind::Pxi,
        PortKind::Asrl,
        PortKind::UsbTmc,
        PortKind::Tcpip,
        PortKind::Socket,
    ];

    /// Classify a resource string.
    ///
    /// Returns `None` when no transport kind claims the string.
    pub fn from_resource(resource: &str) -> Option<Self> {
        let resource = resource.trim();
        if resource.starts_with("COM")
            || resource.starts_with("/dev/tty")
            || resource.starts_with("/dev/cu.")
        {
            Some(Self::Com)
        } else if resource.starts_with("GPIB") {
            Some(Self::Gpib)
        } else if resource.starts_with("PXI") {
            Some(Self::Pxi)
        } else if resource.starts_with("ASRL") {
            Some(Self::Asrl)
        } else if resource.starts_with("USB") {
            Some(Self::UsbTmc)
        } else if resource.starts_with("TCPIP") {
            Some(Self::Tcpip)
        } else if SOCKET_RESOURCE.is_match(resource) {
            Some(Self::Socket)
        } else {
            None
        }
    }

    /// The short name used in resource lists and the `type` property.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Com => "COM",
            Self::Gpib => "GPIB",
            Self::Pxi => "PXI",
            Self::Asrl => "ASRL",
            Self::UsbTmc => "USBTMC",
            Self::Tcpip => "TCPIP",
            Self::Socket => "SOCKET",
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COM" => Ok(Self::Com),
            "GPIB" => Ok(Self::Gpib),
            "PXI" => Ok(Self::Pxi),
            "ASRL" => Ok(Self::Asrl),
            // "USB" is the name drivers historically use for USB-TMC
            "USB" | "USBTMC" => Ok(Self::UsbTmc),
            "TCPIP" => Ok(Self::Tcpip),
            "SOCKET" => Ok(Self::Socket),
            other => Err(format!("unknown port type '{other}'")),
        }
    }
}

/// GPIB address and controller serial port of a Prologix resource string.
///
/// `"GPIB::5::Prologix@COM7"` yields `Some((5, "COM7"))`.
pub fn parse_prologix_resource(resource: &str) -> Option<(u8, String)> {
    let caps = PROLOGIX_RESOURCE.captures(resource.trim())?;
    let address = caps.get(1)?.as_str().parse().ok()?;
    Some((address, caps.get(2)?.as_str().to_string()))
}
