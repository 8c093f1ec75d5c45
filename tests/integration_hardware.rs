//! Tests requiring a real instrument.
//!
//! Skipped unless built with the `hardware-tests` feature and run with
//! `--ignored`.
//!
//! ```bash
//! export INSTRUMENT_PORTS_TEST_RESOURCE=COM3   # or GPIB0::22::INSTR, 192.168.1.5:5025
//! export INSTRUMENT_PORTS_TEST_QUERY='*IDN?'   # optional
//! cargo test --features hardware-tests -- --ignored
//! ```

#![cfg(feature = "hardware-tests")]

use instrument_ports::{PortKind, PortManager, PropertyOverrides};
use std::env;

fn test_resource() -> Option<String> {
    let resource = env::var("INSTRUMENT_PORTS_TEST_RESOURCE").ok();
    if resource.is_none() {
        println!("Skipping hardware test: INSTRUMENT_PORTS_TEST_RESOURCE not set");
    }
    resource
}

#[test]
#[ignore]
fn test_real_resource_is_discovered() {
    let Some(resource) = test_resource() else {
        return;
    };
    let kind = PortKind::from_resource(&resource).expect("test resource has a known prefix");

    let manager = PortManager::global();
    let available = manager.get_resources_available(&[kind], &[]);
    println!("{kind} resources: {available:?}");
    assert!(available.contains(&resource));
}

#[test]
#[ignore]
fn test_real_query() {
    let Some(resource) = test_resource() else {
        return;
    };
    let command = env::var("INSTRUMENT_PORTS_TEST_QUERY").unwrap_or_else(|_| "*IDN?".to_string());

    let manager = PortManager::global();
    let port = manager
        .get_port(&resource, &PropertyOverrides::new().with("timeout", 2.0))
        .expect("port opens");
    let answer = port.lock().query(&command, 0).expect("instrument answers");
    println!("{command} -> {answer}");
    assert!(!answer.is_empty());

    manager.prepare_stop();
    assert!(!port.lock().is_open());
}
