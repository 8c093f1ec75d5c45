//! VISA runtime access through `visa-rs`.
//!
//! Only compiled with the `visa` feature, which needs a VISA shared library
//! (NI-VISA, Keysight IO Libraries, R&S VISA, ...) at link time.

use super::error::PortError;
use super::traits::{Parity, SerialSettings, StopBits};
use super::visa::{VisaBackend, VisaLibrary, VisaSession};
use parking_lot::Mutex;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use visa_rs::attribute::{
    AttrAsrlBaud, AttrAsrlDataBits, AttrAsrlParity, AttrAsrlStopBits, AttrTermchar,
    AttrTermcharEn, AttrTmoValue,
};
use visa_rs::prelude::*;

fn visa_err(resource: &str, e: impl std::fmt::Display) -> PortError {
    PortError::visa(resource, e)
}

fn to_visa_string(text: &str) -> Result<VisaString, PortError> {
    CString::new(text)
        .map(VisaString::from)
        .map_err(|e| PortError::config(format!("invalid VISA string '{text}': {e}")))
}

/// The system VISA library.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeVisaLibrary;

impl VisaLibrary for NativeVisaLibrary {
    fn open_resource_manager(&self) -> Result<Arc<dyn VisaBackend>, PortError> {
        let rm = DefaultRM::new().map_err(|e| PortError::BackendUnavailable(e.to_string()))?;
        Ok(Arc::new(NativeResourceManager {
            rm: Mutex::new(Some(rm)),
        }))
    }
}

struct NativeResourceManager {
    rm: Mutex<Option<DefaultRM>>,
}

impl std::fmt::Debug for NativeResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeResourceManager")
            .field("open", &self.is_open())
            .finish()
    }
}

impl VisaBackend for NativeResourceManager {
    fn list_resources(&self, query: &str) -> Result<Vec<String>, PortError> {
        let guard = self.rm.lock();
        let rm = guard.as_ref().ok_or(PortError::NotOpen)?;
        let expr = to_visa_string(query)?;
        let mut list = match rm.find_res_list(&expr.into()) {
            Ok(list) => list,
            // VI_ERROR_RSRC_NFOUND just means "nothing matched"
            Err(_) => return Ok(Vec::new()),
        };
        let mut resources = Vec::new();
        while let Some(res) = list.find_next().map_err(|e| visa_err(query, e))? {
            resources.push(res.to_string());
        }
        Ok(resources)
    }

    fn open(&self, resource: &str, timeout: Duration) -> Result<Box<dyn VisaSession>, PortError> {
        let guard = self.rm.lock();
        let rm = guard.as_ref().ok_or(PortError::NotOpen)?;
        let res = to_visa_string(resource)?;
        let instr = rm
            .open(&res.into(), AccessMode::NO_LOCK, timeout)
            .map_err(|e| visa_err(resource, e))?;
        let mut session = NativeSession {
            resource: resource.to_string(),
            instr: Some(instr),
            timeout,
            write_termination: None,
            read_termination: None,
        };
        session.set_timeout(timeout)?;
        Ok(Box::new(session))
    }

    fn is_open(&self) -> bool {
        self.rm.lock().is_some()
    }

    fn close(&self) -> Result<(), PortError> {
        // dropping DefaultRM closes the session and every instrument opened from it
        self.rm.lock().take();
        Ok(())
    }
}

struct NativeSession {
    resource: String,
    instr: Option<Instrument>,
    timeout: Duration,
    write_termination: Option<String>,
    read_termination: Option<String>,
}

impl std::fmt::Debug for NativeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeSession")
            .field("resource", &self.resource)
            .field("open", &self.instr.is_some())
            .finish()
    }
}

impl NativeSession {
    fn instr(&self) -> Result<&Instrument, PortError> {
        self.instr.as_ref().ok_or(PortError::NotOpen)
    }
}

impl VisaSession for NativeSession {
    fn write(&mut self, message: &[u8]) -> Result<(), PortError> {
        let mut data = message.to_vec();
        if let Some(term) = &self.write_termination {
            data.extend_from_slice(term.as_bytes());
        }
        let mut instr = self.instr()?;
        instr.write_all(&data)?;
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>, PortError> {
        let term = self.read_termination.clone().map(String::into_bytes);
        let timeout = self.timeout;
        let mut instr = self.instr()?;
        let mut message = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = instr.read(&mut chunk).map_err(|e| {
                // visa-rs surfaces VI_ERROR_TMO as an io::Error carrying the VISA code
                if e.kind() == std::io::ErrorKind::TimedOut || e.to_string().contains("TMO") {
                    PortError::timeout(timeout)
                } else {
                    PortError::Io(e)
                }
            })?;
            message.extend_from_slice(&chunk[..n]);
            let terminated = term.as_ref().is_some_and(|t| message.ends_with(t));
            // a short read means END was asserted
            if n < chunk.len() || terminated {
                break;
            }
        }
        if let Some(t) = term {
            if message.ends_with(&t) {
                message.truncate(message.len() - t.len());
            }
        }
        Ok(message)
    }

    fn clear(&mut self) -> Result<(), PortError> {
        let resource = self.resource.clone();
        self.instr()?.clear().map_err(|e| visa_err(&resource, e))
    }

    fn close(&mut self) -> Result<(), PortError> {
        self.instr.take();
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), PortError> {
        self.timeout = timeout;
        let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let attr = AttrTmoValue::new_checked(ms)
            .ok_or_else(|| PortError::config(format!("invalid VISA timeout {ms} ms")))?;
        let resource = self.resource.clone();
        self.instr()?.set_attr(attr).map_err(|e| visa_err(&resource, e))
    }

    fn set_write_termination(&mut self, termination: Option<&str>) -> Result<(), PortError> {
        self.write_termination = termination.map(str::to_string);
        Ok(())
    }

    fn set_read_termination(&mut self, termination: Option<&str>) -> Result<(), PortError> {
        self.read_termination = termination.map(str::to_string);
        let resource = self.resource.clone();
        let instr = self.instr()?;
        match termination.and_then(|t| t.as_bytes().last().copied()) {
            Some(last) => {
                instr
                    .set_attr(AttrTermchar::new_unchecked(last))
                    .map_err(|e| visa_err(&resource, e))?;
                instr
                    .set_attr(AttrTermcharEn::new_unchecked(true as _))
                    .map_err(|e| visa_err(&resource, e))
            }
            None => instr
                .set_attr(AttrTermcharEn::new_unchecked(false as _))
                .map_err(|e| visa_err(&resource, e)),
        }
    }

    fn configure_serial(&mut self, settings: &SerialSettings) -> Result<(), PortError> {
        let resource = self.resource.clone();
        let instr = self.instr()?;
        let parity = match settings.parity {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
            Parity::Mark => 3,
            Parity::Space => 4,
        };
        let stop_bits = match settings.stop_bits {
            StopBits::One => 10,
            StopBits::OnePointFive => 15,
            StopBits::Two => 20,
        };
        instr
            .set_attr(AttrAsrlBaud::new_unchecked(settings.baud_rate))
            .map_err(|e| visa_err(&resource, e))?;
        instr
            .set_attr(AttrAsrlDataBits::new_unchecked(u16::from(settings.data_bits.count())))
            .map_err(|e| visa_err(&resource, e))?;
        instr
            .set_attr(AttrAsrlStopBits::new_unchecked(stop_bits))
            .map_err(|e| visa_err(&resource, e))?;
        instr
            .set_attr(AttrAsrlParity::new_unchecked(parity))
            .map_err(|e| visa_err(&resource, e))
    }
}
