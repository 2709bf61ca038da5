//! Command-line interface definitions and parsing

use std::path::PathBuf;

use blehome_core::MeshAddress;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "blehome", author, version, about = "BLEHome mesh gateway and tools", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (defaults to ./blehome.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Mesh address of this host node, e.g. 0x0001
    #[arg(long, global = true)]
    pub address: Option<MeshAddress>,

    /// Mesh address of the gateway device reached over BLE
    #[arg(long, global = true)]
    pub peer: Option<MeshAddress>,

    /// Connect to this gateway MAC instead of matching by name
    #[arg(long, global = true)]
    pub gateway_mac: Option<String>,

    /// Shared network key as 32 hex characters
    #[arg(long, global = true)]
    pub network_key: Option<String>,

    /// Print events and results as JSON lines
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run as the mesh gateway: stay connected, bridge sensors and print events
    Gateway {
        /// Periodically inject a synthetic BTHome temperature advertisement
        #[arg(long)]
        mock_bthome: bool,
        /// Do not listen for BTHome sensors over the air
        #[arg(long)]
        no_bthome_scan: bool,
    },
    /// Switch a device on or off
    Control {
        /// Destination mesh address
        address: MeshAddress,
        /// Desired power state
        #[arg(value_enum)]
        power: Power,
        /// Raw brightness level, 255 is full brightness
        #[arg(short, long, default_value_t = u8::MAX)]
        brightness: u8,
    },
    /// Ask a device for its current state
    Query {
        /// Destination mesh address
        address: MeshAddress,
    },
    /// Query a range of addresses for devices the gateway does not know yet
    Scan {
        /// Highest address to query (defaults to cli.scan_range)
        #[arg(long)]
        range: Option<u16>,
        /// Delay between queries in milliseconds (defaults to cli.scan_delay)
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Write raw bytes to the gateway link, bypassing the mesh
    Raw {
        /// Bytes as hex, e.g. a5010100...
        hex: String,
    },
    /// Run an in-memory mesh and exercise it end to end
    Simulate {
        /// Number of simulated devices
        #[arg(short, long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..=64))]
        devices: u16,
        /// How the devices are linked
        #[arg(short, long, value_enum, default_value_t = Topology::Chain)]
        topology: Topology,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
    On,
    Off,
}

impl Power {
    pub fn is_on(self) -> bool {
        self == Power::On
    }
}

/// Shape of a simulated mesh
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Gateway - d1 - d2 - ... ; every device is one hop further away
    Chain,
    /// Every device linked directly to the gateway
    Star,
}
