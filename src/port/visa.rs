//! VISA resource manager handle and backend traits.
//!
//! All VISA-addressed transports (GPIB, PXI, ASRL, USB-TMC, TCPIP) reach the
//! instrumentation runtime through the [`ResourceManager`] held by the port
//! context. The handle opens the runtime lazily, can be closed between
//! measurement runs to release bus locks, and reopens transparently when it
//! is used again after being closed.

use super::error::PortError;
use super::traits::SerialSettings;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// An open session to one VISA resource.
pub trait VisaSession: Send + std::fmt::Debug {
    /// Write a complete message. The write termination is appended by the
    /// session when one is configured.
    fn write(&mut self, message: &[u8]) -> Result<(), PortError>;

    /// Read one message, up to the read termination or the END indicator.
    /// The termination is not part of the result.
    fn read(&mut self) -> Result<Vec<u8>, PortError>;

    /// Device clear.
    fn clear(&mut self) -> Result<(), PortError>;

    fn close(&mut self) -> Result<(), PortError>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), PortError>;

    fn set_write_termination(&mut self, termination: Option<&str>) -> Result<(), PortError>;

    fn set_read_termination(&mut self, termination: Option<&str>) -> Result<(), PortError>;

    /// Apply serial line settings (ASRL resources only).
    fn configure_serial(&mut self, _settings: &SerialSettings) -> Result<(), PortError> {
        Ok(())
    }
}

/// An open VISA resource manager session.
pub trait VisaBackend: Send + Sync + std::fmt::Debug {
    /// Resources matching a VISA search expression such as `"GPIB?*"`.
    fn list_resources(&self, query: &str) -> Result<Vec<String>, PortError>;

    /// Open a session to `resource`.
    fn open(&self, resource: &str, timeout: Duration) -> Result<Box<dyn VisaSession>, PortError>;

    /// Whether the manager session is still valid.
    fn is_open(&self) -> bool;

    fn close(&self) -> Result<(), PortError>;
}

/// A loadable VISA runtime.
pub trait VisaLibrary: Send + Sync + std::fmt::Debug {
    fn open_resource_manager(&self) -> Result<Arc<dyn VisaBackend>, PortError>;
}

/// Library used when no VISA runtime is compiled in or VISA is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVisaLibrary;

impl VisaLibrary for NoVisaLibrary {
    fn open_resource_manager(&self) -> Result<Arc<dyn VisaBackend>, PortError> {
        Err(PortError::BackendUnavailable(
            "disabled in configuration or built without the `visa` feature".to_string(),
        ))
    }
}

/// The VISA runtime selected at compile time.
pub fn default_library() -> Arc<dyn VisaLibrary> {
    #[cfg(feature = "visa")]
    {
        Arc::new(super::visa_native::NativeVisaLibrary)
    }

    #[cfg(not(feature = "visa"))]
    {
        Arc::new(NoVisaLibrary)
    }
}

/// Process-wide handle to the VISA resource manager.
#[derive(Debug)]
pub struct ResourceManager {
    library: Arc<dyn VisaLibrary>,
    current: Mutex<Option<Arc<dyn VisaBackend>>>,
}

impl ResourceManager {
    pub fn new(library: Arc<dyn VisaLibrary>) -> Self {
        Self {
            library,
            current: Mutex::new(None),
        }
    }

    /// Return the open resource manager, opening or reopening it as needed.
    pub fn get(&self) -> Result<Arc<dyn VisaBackend>, PortError> {
        let mut current = self.current.lock();
        if let Some(backend) = current.as_ref() {
            if backend.is_open() {
                return Ok(Arc::clone(backend));
            }
            debug!("VISA resource manager session is closed, reopening");
        }
        let backend = self.library.open_resource_manager()?;
        *current = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Close the resource manager. Safe to call when nothing is open.
    pub fn close(&self) -> Result<(), PortError> {
        if let Some(backend) = self.current.lock().take() {
            if backend.is_open() {
                backend.close()?;
            }
        }
        Ok(())
    }

    /// Whether a resource manager has been created and not closed.
    pub fn is_open(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|backend| backend.is_open())
    }

    /// List resources for a search expression, degrading to an empty list
    /// when the runtime is unavailable.
    pub fn list_resources(&self, query: &str) -> Vec<String> {
        let backend = match self.get() {
            Ok(backend) => backend,
            Err(e) => {
                debug!("Skipping VISA discovery for '{}': {}", query, e);
                return Vec::new();
            }
        };
        match backend.list_resources(query) {
            Ok(resources) => resources,
            Err(e) => {
                warn!("VISA discovery for '{}' failed: {}", query, e);
                Vec::new()
            }
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(default_library())
    }
}
