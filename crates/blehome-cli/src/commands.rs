//! Command handlers for the BLEHome CLI

use std::time::Duration;

use blehome_ble::GattLink;
use blehome_core::{BlehomeError, CommandPayload, MeshAddress};
use tracing::info;

use crate::app::{GatewayApp, GatewayOptions};
use crate::cli::{Cli, Commands, Topology};
use crate::config::AppConfig;
use crate::error::{CliError, Result};
use crate::output::{print_json, render_devices, render_reading, render_receipt, render_stats};
use crate::simulate::{run_simulation, SimulationReport};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        let json = cli.json;
        match cli.command {
            Commands::Gateway {
                mock_bthome,
                no_bthome_scan,
            } => {
                let options = GatewayOptions {
                    mock_bthome,
                    scan_bthome: !no_bthome_scan,
                    json,
                };
                Self::handle_gateway_command(config, options).await
            }
            Commands::Control {
                address,
                power,
                brightness,
            } => {
                let command = CommandPayload::Control {
                    on: power.is_on(),
                    brightness,
                };
                Self::handle_send_command(config, address, command, json).await
            }
            Commands::Query { address } => {
                Self::handle_send_command(config, address, CommandPayload::Query, json).await
            }
            Commands::Scan { range, delay_ms } => {
                Self::handle_scan_command(config, range, delay_ms, json).await
            }
            Commands::Raw { hex } => Self::handle_raw_command(config, &hex).await,
            Commands::Simulate { devices, topology } => {
                Self::handle_simulate_command(config, devices, topology, json).await
            }
            Commands::Config => Self::handle_config_command(&config),
        }
    }

    /// Handle the gateway command
    async fn handle_gateway_command(config: AppConfig, options: GatewayOptions) -> Result<()> {
        let mut app = GatewayApp::new(config)?;
        app.run(options).await
    }

    /// Handle control and query: one command, one receipt
    async fn handle_send_command(
        config: AppConfig,
        address: MeshAddress,
        command: CommandPayload,
        json: bool,
    ) -> Result<()> {
        let mut app = GatewayApp::new(config)?;
        app.connect().await?;

        let result = app.mesh().send_command(address, command).await;
        app.stop().await?;

        let receipt = result?;
        if json {
            print_json(&receipt)?;
        } else {
            println!("{}", render_receipt(&receipt));
        }
        Ok(())
    }

    /// Handle the scan command
    async fn handle_scan_command(
        config: AppConfig,
        range: Option<u16>,
        delay_ms: Option<u64>,
        json: bool,
    ) -> Result<()> {
        let range = range.unwrap_or(config.cli.scan_range);
        if range == 0 {
            return Err(CliError::InvalidArgument("scan range must be at least 1".to_string()));
        }
        let delay = delay_ms
            .map(Duration::from_millis)
            .unwrap_or(config.cli.scan_delay);

        let mut app = GatewayApp::new(config)?;
        app.connect().await?;
        info!(range, ?delay, "Scanning mesh for devices");

        let result = async {
            let receipts = app.mesh().scan(1..=range, delay).await?;
            let devices = app.mesh().devices().await?;
            Ok::<_, CliError>((receipts, devices))
        }
        .await;
        app.stop().await?;

        let (receipts, devices) = result?;
        if json {
            print_json(&devices)?;
        } else {
            println!("{} new device(s) answered", receipts.len());
            for receipt in &receipts {
                println!("  {}", render_receipt(receipt));
            }
            println!("Known devices:");
            println!("{}", render_devices(&devices));
        }
        Ok(())
    }

    /// Handle the raw command: bytes go straight to the gateway characteristic
    async fn handle_raw_command(config: AppConfig, hex_bytes: &str) -> Result<()> {
        let cleaned: String = hex_bytes.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(cleaned)?;
        if bytes.is_empty() {
            return Err(CliError::InvalidArgument("nothing to write".to_string()));
        }

        let mut app = GatewayApp::new(config)?;
        let link = app.connect().await?;
        let result = link.write(&bytes).await;
        app.stop().await?;

        result.map_err(BlehomeError::from)?;
        println!("wrote {} byte(s) to {}", bytes.len(), link.peer());
        Ok(())
    }

    /// Handle the simulate command
    async fn handle_simulate_command(
        config: AppConfig,
        devices: u16,
        topology: Topology,
        json: bool,
    ) -> Result<()> {
        let report = run_simulation(&config, topology, devices).await?;
        if json {
            print_json(&report)
        } else {
            print_report(&report);
            Ok(())
        }
    }

    /// Handle the config command
    fn handle_config_command(config: &AppConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        if config.uses_development_key() {
            eprintln!("note: mesh.network_key is the public development key");
        }
        Ok(())
    }
}

fn print_report(report: &SimulationReport) {
    println!(
        "Simulated {} mesh: gateway {} with {} device(s)",
        report.topology,
        report.gateway,
        report.devices.len()
    );
    println!("Control: {}", render_receipt(&report.control));
    println!("Scan: {} device(s) answered", report.scanned.len());
    for receipt in &report.scanned {
        println!("  {}", render_receipt(receipt));
    }
    println!("Registry:");
    println!("{}", render_devices(&report.registry));
    match &report.reading {
        Some(reading) => println!("Bridged: {}", render_reading(reading)),
        None => println!("Bridged: no reading arrived"),
    }
    println!("{}", render_stats(&report.stats));
}
