//! Core traits for the port abstraction.
//!
//! Two seams live here:
//!
//! - [`SerialPortAdapter`] is the byte-stream interface shared by real serial
//!   devices and [`MockSerialPort`](super::MockSerialPort). COM ports and
//!   Prologix controllers are written against it.
//! - [`Transport`] is the capability every transport variant implements
//!   (COM, GPIB, VISA buses, sockets). [`Port`](super::Port) wraps one
//!   transport and adds the behaviour common to all of them.

use super::encoding::latin1_lossless;
use super::error::PortError;
use super::properties::PortProperties;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Line settings for a serial connection, derived from port properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate (bits per second).
    pub baud_rate: u32,

    /// Number of data bits (5, 6, 7, or 8).
    pub data_bits: DataBits,

    /// Flow control mode.
    pub flow_control: FlowControl,

    /// Parity checking mode.
    pub parity: Parity,

    /// Number of stop bits.
    pub stop_bits: StopBits,

    /// Read/write timeout.
    pub timeout: Duration,

    /// Request-to-send line level after opening.
    pub rts: bool,

    /// Data-terminal-ready line level after opening.
    pub dtr: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_secs(2),
            rts: true,
            dtr: true,
        }
    }
}

impl SerialSettings {
    /// Settings used for the link to a Prologix controller.
    ///
    /// The adapter detects the baud rate automatically; 115200 is what it is
    /// shipped with. Reads time out quickly because the controller is polled.
    pub fn prologix() -> Self {
        Self {
            baud_rate: 115_200,
            timeout: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    pub fn from_count(bits: u64) -> Option<Self> {
        match bits {
            5 => Some(Self::Five),
            6 => Some(Self::Six),
            7 => Some(Self::Seven),
            8 => Some(Self::Eight),
            _ => None,
        }
    }

    pub fn count(&self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Flow control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Parity checking modes, named by their one-letter codes `N`, `O`, `E`, `M`, `S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Some(Self::None),
            "O" | "ODD" => Some(Self::Odd),
            "E" | "EVEN" => Some(Self::Even),
            "M" | "MARK" => Some(Self::Mark),
            "S" | "SPACE" => Some(Self::Space),
            _ => None,
        }
    }

    pub fn code(&self) -> char {
        match self {
            Self::None => 'N',
            Self::Odd => 'O',
            Self::Even => 'E',
            Self::Mark => 'M',
            Self::Space => 'S',
        }
    }
}

impl TryFrom<Parity> for serialport::Parity {
    type Error = PortError;

    fn try_from(parity: Parity) -> Result<Self, Self::Error> {
        match parity {
            Parity::None => Ok(serialport::Parity::None),
            Parity::Odd => Ok(serialport::Parity::Odd),
            Parity::Even => Ok(serialport::Parity::Even),
            Parity::Mark | Parity::Space => Err(PortError::config(format!(
                "parity '{}' is not supported by the native serial driver",
                parity.code()
            ))),
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    pub fn from_count(bits: f64) -> Option<Self> {
        if bits == 1.0 {
            Some(Self::One)
        } else if bits == 1.5 {
            Some(Self::OnePointFive)
        } else if bits == 2.0 {
            Some(Self::Two)
        } else {
            None
        }
    }

    pub fn count(&self) -> f64 {
        match self {
            Self::One => 1.0,
            Self::OnePointFive => 1.5,
            Self::Two => 2.0,
        }
    }
}

impl TryFrom<StopBits> for serialport::StopBits {
    type Error = PortError;

    fn try_from(bits: StopBits) -> Result<Self, Self::Error> {
        match bits {
            StopBits::One => Ok(serialport::StopBits::One),
            StopBits::Two => Ok(serialport::StopBits::Two),
            StopBits::OnePointFive => Err(PortError::config(
                "1.5 stop bits are not supported by the native serial driver",
            )),
        }
    }
}

/// Trait for serial port I/O operations.
///
/// This trait abstracts over synchronous serial port operations, allowing both
/// real hardware ports and mock implementations for testing.
pub trait SerialPortAdapter: Send + std::fmt::Debug {
    /// Write bytes to the serial port.
    ///
    /// Returns the number of bytes actually written.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError>;

    /// Read bytes from the serial port into the provided buffer.
    ///
    /// Returns the number of bytes actually read.
    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, PortError>;

    /// Get the name/path of this serial port.
    fn name(&self) -> &str;

    /// Set the read/write timeout for this port.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), PortError>;

    /// Clear both input and output buffers.
    ///
    /// This discards any unread data in the receive buffer and any unsent
    /// data in the transmit buffer.
    fn clear_buffers(&mut self) -> Result<(), PortError>;

    /// Drive the RTS and DTR control lines.
    fn set_control_lines(&mut self, _rts: bool, _dtr: bool) -> Result<(), PortError> {
        Ok(())
    }

    /// Get the current bytes available to read (if supported).
    ///
    /// Returns `None` if the operation is not supported or cannot be determined.
    fn bytes_to_read(&self) -> Option<usize> {
        None
    }

    /// Read a single byte, treating silence (timeout, would-block, EOF) as `None`.
    fn read_byte(&mut self) -> Result<Option<u8>, PortError> {
        let mut byte = [0u8; 1];
        match self.read_bytes(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if is_silence(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Whether an adapter error only means that nothing arrived in time.
pub fn is_silence(error: &PortError) -> bool {
    match error {
        PortError::Timeout(_) => true,
        PortError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ),
        _ => false,
    }
}

/// Transport-specific behaviour behind a [`Port`](super::Port).
///
/// Implementors receive the port's current properties on every call so that
/// changed settings take effect without rebuilding the transport.
///
/// Transports are `Send` but deliberately not required to be `Sync`: a port
/// carries cross-call state (receive buffers, addressing caches) and must be
/// accessed by one caller at a time. [`SharedPort`](super::SharedPort) provides
/// the mutex that serializes access.
pub trait Transport: Send + std::fmt::Debug {
    /// Adjust freshly reset default properties before overrides are applied.
    fn initialize_properties(&self, _properties: &mut PortProperties) {}

    /// Acquire the underlying channel. Must tolerate being called while open.
    fn open(&mut self, properties: &PortProperties) -> Result<(), PortError>;

    /// Release the underlying channel. Must tolerate being called while closed.
    fn close(&mut self, properties: &PortProperties) -> Result<(), PortError>;

    /// Flush buffered input and output.
    fn clear(&mut self, _properties: &PortProperties) -> Result<(), PortError> {
        Ok(())
    }

    /// Send one command, applying encoding and termination.
    fn write(&mut self, command: &str, properties: &PortProperties) -> Result<(), PortError>;

    /// Send bytes without encoding or termination handling.
    ///
    /// Falls back to [`Transport::write`] for transports without a raw path.
    fn write_raw(&mut self, data: &[u8], properties: &PortProperties) -> Result<(), PortError> {
        self.write(&latin1_lossless(data), properties)
    }

    /// Read one answer: up to the terminator when `digits == 0`, otherwise
    /// exactly `digits` units.
    fn read(&mut self, digits: usize, properties: &PortProperties) -> Result<String, PortError>;

    /// Read one answer without decoding.
    ///
    /// Falls back to [`Transport::read`] for transports without a raw path.
    fn read_raw(&mut self, digits: usize, properties: &PortProperties) -> Result<Vec<u8>, PortError> {
        let answer = self.read(digits, properties)?;
        Ok(properties
            .encoding
            .encode(&answer)
            .unwrap_or_else(|| answer.into_bytes()))
    }

    /// Whether `*IDN?` is a meaningful identification query on this transport.
    fn supports_identification(&self) -> bool {
        false
    }
}
