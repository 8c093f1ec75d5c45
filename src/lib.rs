//! instrument_ports library
//!
//! One port abstraction for laboratory instruments, whatever the wire:
//! serial lines, GPIB through VISA or a Prologix controller, USB-TMC, PXI,
//! VISA serial and LAN resources, and raw TCP sockets.
//!
//! # Modules
//!
//! - `port`: transports, properties, discovery and the [`Port`] handle
//! - `manager`: [`PortManager`], the cache drivers acquire ports from
//! - `config`: configuration management with TOML support
//! - `logging`: tracing subscriber setup
//! - `diagnostics`: error reporting with source chains
//!
//! # Example
//!
//! ```rust,no_run
//! use instrument_ports::{PortManager, PropertyOverrides};
//!
//! let manager = PortManager::global();
//! let port = manager.get_port("COM3", &PropertyOverrides::new().with("baudrate", 115200))?;
//! let answer = port.lock().query("*IDN?", 0)?;
//! println!("{answer}");
//! manager.prepare_stop();
//! # Ok::<(), instrument_ports::PortError>(())
//! ```

pub mod config;
pub mod diagnostics;
pub mod logging;
pub mod manager;
pub mod port;

// Re-export commonly used types for convenience
pub use manager::{DialogOverrides, DriverPortRequest, PortManager, PropertyProvider};
pub use port::{
    Port, PortContext, PortError, PortKind, PortProperties, PropertyOverrides, SharedPort,
    Transport,
};

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
