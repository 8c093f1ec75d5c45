//! Shared test utilities for instrument_ports integration tests.
//!
//! - A [`Harness`] wiring a [`PortManager`] to mock serial and VISA backends
//! - A raw TCP echo server for socket tests

#![allow(dead_code)]

use instrument_ports::port::{MockSerialBackend, MockVisaLibrary};
use instrument_ports::{Config, PortContext, PortManager, PropertyOverrides};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;

/// A manager whose hardware is entirely simulated.
pub struct Harness {
    pub manager: PortManager,
    pub serial: MockSerialBackend,
    pub visa: MockVisaLibrary,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        let serial = MockSerialBackend::new();
        let visa = MockVisaLibrary::new();
        let context = PortContext::new(Arc::new(serial.clone()), Arc::new(visa.clone()));
        Self {
            manager: PortManager::configured(context, config),
            serial,
            visa,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// No overrides.
pub fn defaults() -> PropertyOverrides {
    PropertyOverrides::new()
}

/// Start a server that echoes every byte of one connection back.
pub fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind echo server");
    let address = listener.local_addr().expect("echo server address");
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buffer = [0u8; 256];
            loop {
                match stream.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buffer[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    address
}
