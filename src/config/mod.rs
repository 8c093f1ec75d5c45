//! Configuration for instrument_ports.
//!
//! TOML file with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! 1. `INSTRUMENT_PORTS_CONFIG` environment variable (explicit path)
//! 2. `./instrument_ports.toml` (current directory)
//! 3. The platform config directory (`~/.config/instrument-ports/` on Linux,
//!    `%APPDATA%\instrument-ports\config\` on Windows)
//! 4. Built-in defaults (no file required)
//!
//! # Example file
//!
//! ```toml
//! [visa]
//! enabled = true
//!
//! [prologix]
//! controllers = ["COM7"]
//!
//! [aliases]
//! dmm = "GPIB::22::Prologix@COM7"
//!
//! [ports."COM3"]
//! baudrate = 115200
//! EOLread = "\r\n"
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```
//!
//! # Environment Overrides
//!
//! - `INSTRUMENT_PORTS_VISA_ENABLED=false`
//! - `INSTRUMENT_PORTS_PROLOGIX_CONTROLLERS=COM7,COM8`
//! - `INSTRUMENT_PORTS_LOGGING_LEVEL=debug`, `_LOGGING_FORMAT`, `_LOGGING_FILE`
//! - `INSTRUMENT_PORTS_DEBUG=1`

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{Config, LogFormat, LoggingConfig, PrologixConfig, VisaConfig};
