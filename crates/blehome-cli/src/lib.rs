//! BLEHome CLI library
//!
//! Building blocks of the `blehome` binary: argument parsing, layered
//! configuration, the BLE gateway application and the command handlers.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod output;
pub mod simulate;

pub use app::{GatewayApp, GatewayOptions, MockSensor};
pub use cli::{Cli, Commands, Power, Topology};
pub use commands::CommandDispatcher;
pub use config::{AppConfig, CliSettings, ConfigOverrides};
pub use error::{CliError, Result};
pub use simulate::{run_simulation, SimulationReport};
