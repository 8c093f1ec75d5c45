//! `instrument-ports`: list, identify and talk to instruments from a shell.

use clap::{Parser, Subcommand};
use instrument_ports::config::{get_default_config_path, Config, ConfigLoader};
use instrument_ports::{logging, PortKind, PortManager, PropertyOverrides};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "instrument-ports",
    version,
    about = "Find laboratory instruments and exchange commands with them.",
    long_about = "Uniform access to instruments on serial lines, GPIB (VISA or Prologix), USB-TMC, PXI, VISA serial and LAN resources, and raw TCP sockets."
)]
struct Args {
    /// Configuration file (defaults to the standard search path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List resources that are available right now
    List {
        /// Port types to search, e.g. COM, GPIB, USBTMC (all when omitted)
        #[arg(short = 't', long = "type")]
        kinds: Vec<PortKind>,
    },
    /// Send a command and print the answer
    Query {
        resource: String,
        command: String,
        /// Read timeout in seconds
        #[arg(long)]
        timeout: Option<f64>,
        /// Extra port property, e.g. `-p baudrate=115200`
        #[arg(short, long = "property", value_parser = parse_property)]
        properties: Vec<(String, Value)>,
    },
    /// Print the `*IDN?` answer of a resource
    Identify { resource: String },
    /// Send a command without reading an answer
    Write {
        resource: String,
        command: String,
        #[arg(short, long = "property", value_parser = parse_property)]
        properties: Vec<(String, Value)>,
    },
    /// Show the effective configuration
    Config {
        /// Write a default configuration file if none exists yet
        #[arg(long)]
        init: bool,
    },
}

/// `key=value`; the value is read as JSON when it parses, as a string otherwise.
fn parse_property(arg: &str) -> Result<(String, Value), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{arg}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn load_config(path: Option<&PathBuf>) -> Result<ConfigLoader, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let loader = load_config(args.config.as_ref())?;
    let config = loader.config().clone();

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Logging disabled: {e}");
    }

    match args.command {
        Command::List { kinds } => {
            let manager = PortManager::from_config(&config);
            let kinds = if kinds.is_empty() {
                manager.port_types()
            } else {
                kinds
            };
            for (kind, resources) in manager.find_resources(&kinds) {
                println!("{kind}:");
                for resource in resources {
                    println!("  {resource}");
                }
            }
            manager.prepare_stop();
        }
        Command::Query {
            resource,
            command,
            timeout,
            properties,
        } => {
            let mut overrides: PropertyOverrides = properties.into_iter().collect();
            if let Some(timeout) = timeout {
                overrides.insert("timeout", timeout);
            }
            let answer = with_port(&config, &resource, &overrides, |port| {
                port.query(&command, 0)
            })?;
            println!("{answer}");
        }
        Command::Identify { resource } => {
            let manager = PortManager::from_config(&config);
            let identification = manager.get_identification(&config.resolve_resource(&resource));
            manager.prepare_stop();
            println!("{}", identification?);
        }
        Command::Write {
            resource,
            command,
            properties,
        } => {
            let overrides: PropertyOverrides = properties.into_iter().collect();
            with_port(&config, &resource, &overrides, |port| port.write(&command))?;
        }
        Command::Config { init } => {
            if init {
                let path = args
                    .config
                    .or_else(get_default_config_path)
                    .ok_or("no configuration directory on this platform")?;
                if path.exists() {
                    println!("{} already exists", path.display());
                } else {
                    ConfigLoader::with_defaults().save_to(&path)?;
                    println!("Wrote {}", path.display());
                }
            } else {
                match &loader.config_path {
                    Some(path) => println!("# {}", path.display()),
                    None => println!("# built-in defaults"),
                }
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Acquire `resource`, run `exchange` on it and release everything again.
fn with_port<T>(
    config: &Config,
    resource: &str,
    overrides: &PropertyOverrides,
    exchange: impl FnOnce(&mut instrument_ports::Port) -> Result<T, instrument_ports::PortError>,
) -> Result<T, instrument_ports::PortError> {
    let manager = PortManager::from_config(config);
    let resource = config.resolve_resource(resource);
    let result = manager
        .get_port(&resource, overrides)
        .and_then(|port| {
            let mut port = port.lock();
            exchange(&mut *port)
        });
    manager.prepare_stop();
    result
}
