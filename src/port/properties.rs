//! Port properties and their layered overrides.
//!
//! A port's effective settings are rebuilt from three layers every time the
//! port is (re)initialized: the defaults of its transport kind, the overrides
//! requested by the driver, and the overrides injected by a dialog or
//! configuration layer. Overrides use the historical string keys (`"baudrate"`,
//! `"EOLread"`, `"Exception"`, ...) so drivers can keep passing plain maps.

use super::encoding::TextEncoding;
use super::kind::PortKind;
use super::traits::{DataBits, FlowControl, Parity, SerialSettings, StopBits};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Keys shared by every transport kind.
pub const COMMON_KEYS: &[&str] = &[
    "type",
    "ID",
    "open",
    "active",
    "clear",
    "debug",
    "timeout",
    "delay",
    "EOL",
    "EOLwrite",
    "EOLread",
    "rstrip",
    "raw_write",
    "raw_read",
    "encoding",
    "Exception",
    "identification",
    "query",
    "VID",
    "PID",
    "RegID",
    "Manufacturer",
    "Product",
    "Description",
    "Name",
    "NrDevices",
];

/// Serial line keys (COM and ASRL).
pub const SERIAL_KEYS: &[&str] = &[
    "baudrate", "bytesize", "parity", "stopbits", "xonxoff", "rtscts", "dsrdtr", "rts", "dtr",
];

pub const GPIB_KEYS: &[&str] = &["GPIB_EOLwrite", "GPIB_EOLread"];

pub const SOCKET_KEYS: &[&str] = &["SOCKET_EOLwrite", "SOCKET_EOLread"];

pub const TCPIP_KEYS: &[&str] = &["TCPIP_EOLwrite", "TCPIP_EOLread"];

/// Property keys recognized by ports of the given kind.
pub fn keys_for(kind: PortKind) -> Vec<&'static str> {
    let specific: &[&str] = match kind {
        PortKind::Com | PortKind::Asrl => SERIAL_KEYS,
        PortKind::Gpib => GPIB_KEYS,
        PortKind::Socket => SOCKET_KEYS,
        PortKind::Tcpip => TCPIP_KEYS,
        PortKind::Pxi | PortKind::UsbTmc => &[],
    };
    COMMON_KEYS.iter().chain(specific).copied().collect()
}

/// A string-keyed set of property overrides, as requested by a driver or
/// injected by a dialog.
///
/// Values are JSON values so that overrides can come straight from
/// configuration files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyOverrides(BTreeMap<String, Value>);

impl PropertyOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Merge `other` on top of `self`; keys in `other` win.
    pub fn merge(&mut self, other: &PropertyOverrides) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for PropertyOverrides {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Outcome of applying one override key.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyIssue {
    /// No transport kind knows the key; the value was kept in `extra`.
    Unknown(String),
    /// The key is known but the value has the wrong shape; it was ignored.
    Invalid { key: String, reason: String },
    /// The key describes the port itself and cannot be overridden.
    ReadOnly(String),
}

/// The effective settings of one port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortProperties {
    pub kind: PortKind,
    pub id: String,
    pub open: bool,
    pub active: bool,
    /// Clear buffers right after opening.
    pub clear: bool,
    /// Log every write and read.
    pub debug: bool,
    pub timeout: Duration,
    /// Minimum spacing between two writes.
    pub delay: Duration,
    pub eol: String,
    pub eol_write: Option<String>,
    pub eol_read: Option<String>,
    pub rstrip: bool,
    pub raw_write: bool,
    pub raw_read: bool,
    pub encoding: TextEncoding,
    /// Fail instead of returning an empty answer when nothing arrives.
    pub exception: bool,
    pub identification: Option<String>,
    pub query: Option<String>,

    pub baudrate: u32,
    pub bytesize: DataBits,
    pub parity: Parity,
    pub stopbits: StopBits,
    pub xonxoff: bool,
    pub rtscts: bool,
    pub dsrdtr: bool,
    pub rts: bool,
    pub dtr: bool,

    pub gpib_eol_write: Option<String>,
    pub gpib_eol_read: Option<String>,
    pub socket_eol_write: Option<String>,
    pub socket_eol_read: Option<String>,
    pub tcpip_eol_write: Option<String>,
    pub tcpip_eol_read: Option<String>,

    pub vid: Option<Value>,
    pub pid: Option<Value>,
    pub reg_id: Option<Value>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub description: Option<String>,
    pub name: Option<String>,
    pub nr_devices: u32,

    /// Keys no transport kind knows about, kept verbatim.
    pub extra: BTreeMap<String, Value>,
}

impl PortProperties {
    /// Static defaults of a transport kind for the given resource.
    pub fn defaults(kind: PortKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            open: false,
            active: true,
            clear: false,
            debug: false,
            timeout: Duration::from_secs(2),
            delay: Duration::ZERO,
            eol: "\n".to_string(),
            eol_write: None,
            eol_read: None,
            rstrip: true,
            raw_write: false,
            raw_read: false,
            encoding: TextEncoding::Latin1,
            exception: true,
            identification: None,
            query: None,
            baudrate: 9600,
            bytesize: DataBits::Eight,
            parity: Parity::None,
            stopbits: StopBits::One,
            xonxoff: false,
            rtscts: false,
            dsrdtr: false,
            rts: true,
            dtr: true,
            gpib_eol_write: None,
            gpib_eol_read: None,
            socket_eol_write: None,
            socket_eol_read: None,
            tcpip_eol_write: None,
            tcpip_eol_read: None,
            vid: None,
            pid: None,
            reg_id: None,
            manufacturer: None,
            product: None,
            description: None,
            name: None,
            nr_devices: 0,
            extra: BTreeMap::new(),
        }
    }

    /// Terminator appended to written commands.
    pub fn write_terminator(&self) -> &str {
        self.eol_write.as_deref().unwrap_or(&self.eol)
    }

    /// Terminator expected at the end of answers.
    pub fn read_terminator(&self) -> &str {
        self.eol_read.as_deref().unwrap_or(&self.eol)
    }

    /// Serial line settings derived from these properties.
    pub fn serial_settings(&self) -> SerialSettings {
        let flow_control = if self.rtscts || self.dsrdtr {
            FlowControl::Hardware
        } else if self.xonxoff {
            FlowControl::Software
        } else {
            FlowControl::None
        };
        SerialSettings {
            baud_rate: self.baudrate,
            data_bits: self.bytesize,
            flow_control,
            parity: self.parity,
            stop_bits: self.stopbits,
            timeout: self.timeout,
            rts: self.rts,
            dtr: self.dtr,
        }
    }

    /// Shallow-merge overrides into these properties.
    ///
    /// Nothing is rejected outright: unknown keys are kept in `extra`, values
    /// of the wrong shape are skipped. Every such case is returned so the
    /// caller can log it.
    pub fn apply(&mut self, overrides: &PropertyOverrides) -> Vec<PropertyIssue> {
        overrides
            .iter()
            .filter_map(|(key, value)| self.set(key, value).err())
            .collect()
    }

    /// Set a single property by its historical key.
    pub fn set(&mut self, key: &str, value: &Value) -> Result<(), PropertyIssue> {
        let invalid = |expected: &str| PropertyIssue::Invalid {
            key: key.to_string(),
            reason: format!("expected {expected}, got {value}"),
        };

        match key {
            "type" | "ID" | "open" => return Err(PropertyIssue::ReadOnly(key.to_string())),
            "active" => self.active = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "clear" => self.clear = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "debug" => self.debug = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "timeout" => self.timeout = as_seconds(value).ok_or_else(|| invalid("seconds"))?,
            "delay" => self.delay = as_seconds(value).ok_or_else(|| invalid("seconds"))?,
            "EOL" => self.eol = as_string(value).ok_or_else(|| invalid("a string"))?,
            "EOLwrite" => self.eol_write = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?,
            "EOLread" => self.eol_read = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?,
            "rstrip" => self.rstrip = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "raw_write" => self.raw_write = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "raw_read" => self.raw_read = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "encoding" => {
                self.encoding = as_string(value)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| invalid("a supported encoding"))?
            }
            "Exception" => self.exception = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "identification" => {
                self.identification = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?
            }
            "query" => self.query = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?,
            "VID" => self.vid = non_null(value),
            "PID" => self.pid = non_null(value),
            "RegID" => self.reg_id = non_null(value),
            "Manufacturer" => {
                self.manufacturer = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?
            }
            "Product" => self.product = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?,
            "Description" => {
                self.description = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?
            }
            "Name" => self.name = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?,
            "NrDevices" => {
                self.nr_devices = as_u64(value)
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| invalid("a device count"))?
            }
            "baudrate" => {
                self.baudrate = as_u64(value)
                    .and_then(|n| u32::try_from(n).ok())
                    .filter(|&n| n > 0)
                    .ok_or_else(|| invalid("a baud rate"))?
            }
            "bytesize" => {
                self.bytesize = as_u64(value)
                    .and_then(DataBits::from_count)
                    .ok_or_else(|| invalid("5, 6, 7 or 8"))?
            }
            "parity" => {
                self.parity = as_string(value)
                    .and_then(|s| Parity::from_code(&s))
                    .ok_or_else(|| invalid("one of N, O, E, M, S"))?
            }
            "stopbits" => {
                self.stopbits = as_f64(value)
                    .and_then(StopBits::from_count)
                    .ok_or_else(|| invalid("1, 1.5 or 2"))?
            }
            "xonxoff" => self.xonxoff = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "rtscts" => self.rtscts = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "dsrdtr" => self.dsrdtr = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "rts" => self.rts = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "dtr" => self.dtr = as_bool(value).ok_or_else(|| invalid("a boolean"))?,
            "GPIB_EOLwrite" => {
                self.gpib_eol_write = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?
            }
            "GPIB_EOLread" => {
                self.gpib_eol_read = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?
            }
            "SOCKET_EOLwrite" => {
                self.socket_eol_write = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?
            }
            "SOCKET_EOLread" => {
                self.socket_eol_read = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?
            }
            "TCPIP_EOLwrite" => {
                self.tcpip_eol_write = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?
            }
            "TCPIP_EOLread" => {
                self.tcpip_eol_read = as_opt_string(value).ok_or_else(|| invalid("a string or null"))?
            }
            _ => {
                self.extra.insert(key.to_string(), value.clone());
                return Err(PropertyIssue::Unknown(key.to_string()));
            }
        }
        Ok(())
    }

    /// Look up a property by its historical key.
    pub fn get(&self, key: &str) -> Option<Value> {
        let value = match key {
            "type" => json!(self.kind.as_str()),
            "ID" => json!(self.id),
            "open" => json!(self.open),
            "active" => json!(self.active),
            "clear" => json!(self.clear),
            "debug" => json!(self.debug),
            "timeout" => json!(self.timeout.as_secs_f64()),
            "delay" => json!(self.delay.as_secs_f64()),
            "EOL" => json!(self.eol),
            "EOLwrite" => json!(self.eol_write),
            "EOLread" => json!(self.eol_read),
            "rstrip" => json!(self.rstrip),
            "raw_write" => json!(self.raw_write),
            "raw_read" => json!(self.raw_read),
            "encoding" => json!(self.encoding.name()),
            "Exception" => json!(self.exception),
            "identification" => json!(self.identification),
            "query" => json!(self.query),
            "VID" => self.vid.clone().unwrap_or(Value::Null),
            "PID" => self.pid.clone().unwrap_or(Value::Null),
            "RegID" => self.reg_id.clone().unwrap_or(Value::Null),
            "Manufacturer" => json!(self.manufacturer),
            "Product" => json!(self.product),
            "Description" => json!(self.description),
            "Name" => json!(self.name),
            "NrDevices" => json!(self.nr_devices),
            "baudrate" => json!(self.baudrate),
            "bytesize" => json!(self.bytesize.count()),
            "parity" => json!(self.parity.code().to_string()),
            "stopbits" => json!(self.stopbits.count()),
            "xonxoff" => json!(self.xonxoff),
            "rtscts" => json!(self.rtscts),
            "dsrdtr" => json!(self.dsrdtr),
            "rts" => json!(self.rts),
            "dtr" => json!(self.dtr),
            "GPIB_EOLwrite" => json!(self.gpib_eol_write),
            "GPIB_EOLread" => json!(self.gpib_eol_read),
            "SOCKET_EOLwrite" => json!(self.socket_eol_write),
            "SOCKET_EOLread" => json!(self.socket_eol_read),
            "TCPIP_EOLwrite" => json!(self.tcpip_eol_write),
            "TCPIP_EOLread" => json!(self.tcpip_eol_read),
            other => return self.extra.get(other).cloned(),
        };
        Some(value)
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_seconds(value: &Value) -> Option<Duration> {
    as_f64(value)
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn as_opt_string(value: &Value) -> Option<Option<String>> {
    match value {
        Value::Null => Some(None),
        Value::String(s) => Some(Some(s.clone())),
        _ => None,
    }
}

fn non_null(value: &Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value.clone())
    }
}
