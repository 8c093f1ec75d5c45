//! Port abstraction layer.
//!
//! Transports (serial, GPIB, VISA buses, raw sockets) implement
//! [`Transport`]; [`Port`] wraps one of them behind the uniform
//! read/write/query contract. Backends for serial devices and the VISA
//! runtime are traits so tests can run against mocks.

pub mod com;
pub mod context;
pub mod discovery;
pub mod encoding;
pub mod error;
pub mod gpib;
pub mod handle;
pub mod kind;
pub mod mock;
pub mod mock_visa;
pub mod prologix;
pub mod properties;
pub mod serial_backend;
pub mod socket;
pub mod sync_port;
pub mod traits;
pub mod visa;
pub mod visa_port;

#[cfg(feature = "visa")]
pub mod visa_native;

pub use context::PortContext;
pub use discovery::{PortType, PortTypeRegistry};
pub use encoding::TextEncoding;
pub use error::PortError;
pub use handle::{Port, SharedPort, IDENTIFICATION_NOT_AVAILABLE};
pub use kind::{parse_prologix_resource, PortKind};
pub use mock::{MockSerialBackend, MockSerialPort};
pub use mock_visa::{MockVisaInstrument, MockVisaLibrary};
pub use prologix::{PrologixController, PrologixRegistry, SharedController};
pub use properties::{PortProperties, PropertyIssue, PropertyOverrides};
pub use serial_backend::{SerialBackend, SystemSerialBackend};
pub use sync_port::*;
pub use traits::*;
pub use visa::{ResourceManager, VisaBackend, VisaLibrary, VisaSession};
