//! BLEHome CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! - built-in defaults
//! - a TOML file (`blehome.toml`, or the path given with `--config`)
//! - environment variables prefixed `BLEHOME_`, nested with `__`
//!   (`BLEHOME_MESH__DEFAULT_TTL=6`, `BLEHOME_BLE__PEER_ADDRESS=0x0003`)
//! - command line flags

use std::path::PathBuf;
use std::time::Duration;

use blehome_ble::{parse_mac, BleLinkConfig};
use blehome_core::{MeshAddress, MeshConfig, NetworkKey};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::error::{CliError, Result};

/// Configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "blehome.toml";

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "BLEHOME_";

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of the `blehome` binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// The mesh node the host runs
    pub mesh: MeshConfig,
    /// GATT link to the gateway device
    pub ble: BleLinkConfig,
    pub cli: CliSettings,
}

/// Settings that only the command line tools use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    /// Highest address a scan queries
    pub scan_range: u16,
    /// Spacing between scan queries
    #[serde(with = "humantime_serde")]
    pub scan_delay: Duration,
    /// Inject synthetic BTHome readings in gateway mode
    pub bthome_mock: bool,
    #[serde(with = "humantime_serde")]
    pub bthome_mock_interval: Duration,
    /// Sensor MAC the synthetic readings claim to come from
    pub bthome_mock_mac: String,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            scan_range: 32,
            scan_delay: Duration::from_millis(250),
            bthome_mock: false,
            bthome_mock_interval: Duration::from_secs(10),
            bthome_mock_mac: "A4:C1:38:00:00:01".to_string(),
        }
    }
}

/// Values given on the command line, applied last
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub address: Option<MeshAddress>,
    pub peer: Option<MeshAddress>,
    pub gateway_mac: Option<String>,
    pub network_key: Option<String>,
}

impl From<&Cli> for ConfigOverrides {
    fn from(cli: &Cli) -> Self {
        Self {
            config_file: cli.config.clone(),
            address: cli.address,
            peer: cli.peer,
            gateway_mac: cli.gateway_mac.clone(),
            network_key: cli.network_key.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration with the standard priority order and validate it
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        let config: AppConfig = Self::figment(overrides)?.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(overrides: &ConfigOverrides) -> Result<Figment> {
        let file = match &overrides.config_file {
            Some(path) if !path.exists() => {
                return Err(CliError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )))
            }
            Some(path) => path.clone(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(address) = overrides.address {
            figment = figment.merge(("mesh.address", address.to_string()));
        }
        if let Some(peer) = overrides.peer {
            figment = figment.merge(("ble.peer_address", peer.to_string()));
        }
        if let Some(mac) = &overrides.gateway_mac {
            figment = figment.merge(("ble.gateway_mac", mac.clone()));
        }
        if let Some(key) = &overrides.network_key {
            figment = figment.merge(("mesh.network_key", key.clone()));
        }
        Ok(figment)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        self.mesh.validate()?;
        self.ble.gateway_mac_bytes()?;
        parse_mac(&self.cli.bthome_mock_mac)?;

        if !self.ble.peer_address.is_unicast() {
            return Err(CliError::Config(format!(
                "ble.peer_address {} is not a unicast address",
                self.ble.peer_address
            )));
        }
        if self.ble.peer_address == self.mesh.address {
            return Err(CliError::Config(format!(
                "ble.peer_address and mesh.address are both {}",
                self.mesh.address
            )));
        }
        if self.ble.keep_alive_interval.is_zero() {
            return Err(CliError::Config(
                "ble.keep_alive_interval must be greater than 0".to_string(),
            ));
        }
        if self.cli.scan_range == 0 {
            return Err(CliError::Config("cli.scan_range must be at least 1".to_string()));
        }
        if self.cli.bthome_mock_interval.is_zero() {
            return Err(CliError::Config(
                "cli.bthome_mock_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed MAC of the synthetic BTHome sensor
    pub fn mock_sensor_mac(&self) -> Result<[u8; 6]> {
        Ok(parse_mac(&self.cli.bthome_mock_mac)?)
    }

    /// Render as TOML, the format `load` reads back
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Whether the network key is still the well-known development key
    pub fn uses_development_key(&self) -> bool {
        self.mesh.network_key == NetworkKey::DEVELOPMENT
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn load(overrides: &ConfigOverrides) -> figment::error::Result<AppConfig> {
        AppConfig::load(overrides).map_err(|e| figment::Error::from(e.to_string()))
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mesh.address, MeshAddress::DEFAULT_GATEWAY);
        assert_eq!(config.ble.peer_address, MeshAddress::new(2));
        assert!(config.uses_development_key());
    }

    #[test]
    fn test_layering_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [mesh]
                default_ttl = 6
                address = "0x0010"

                [ble]
                keep_alive_interval = "45s"

                [cli]
                scan_range = 8
                "#,
            )?;
            jail.set_env("BLEHOME_MESH__DEFAULT_TTL", "7");
            jail.set_env("BLEHOME_CLI__SCAN_DELAY", "1s");

            let config = load(&ConfigOverrides {
                address: Some(MeshAddress::new(0x20)),
                ..Default::default()
            })?;

            // flag beats file
            assert_eq!(config.mesh.address, MeshAddress::new(0x20));
            // env beats file
            assert_eq!(config.mesh.default_ttl, 7);
            assert_eq!(config.cli.scan_delay, Duration::from_secs(1));
            // file beats defaults
            assert_eq!(config.ble.keep_alive_interval, Duration::from_secs(45));
            assert_eq!(config.cli.scan_range, 8);
            // untouched defaults survive
            assert_eq!(config.ble.connection_timeout, Duration::from_secs(15));
            Ok(())
        });
    }

    #[test]
    fn test_network_key_override() {
        Jail::expect_with(|_| {
            let config = load(&ConfigOverrides {
                network_key: Some("00112233445566778899aabbccddeeff".to_string()),
                ..Default::default()
            })?;
            assert!(!config.uses_development_key());
            assert_eq!(config.mesh.network_key.as_bytes()[1], 0x11);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        Jail::expect_with(|_| {
            let same_address = AppConfig::load(&ConfigOverrides {
                peer: Some(MeshAddress::DEFAULT_GATEWAY),
                ..Default::default()
            });
            assert!(matches!(same_address, Err(CliError::Config(_))));

            let bad_mac = AppConfig::load(&ConfigOverrides {
                gateway_mac: Some("not-a-mac".to_string()),
                ..Default::default()
            });
            assert!(matches!(bad_mac, Err(CliError::Ble(_))));

            let missing = AppConfig::load(&ConfigOverrides {
                config_file: Some(PathBuf::from("missing.toml")),
                ..Default::default()
            });
            assert!(matches!(missing, Err(CliError::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn test_toml_round_trip() {
        Jail::expect_with(|jail| {
            let mut config = AppConfig::default();
            config.cli.scan_range = 12;
            config.ble.gateway_mac = Some("A4:C1:38:00:1B:7F".to_string());
            jail.create_file("custom.toml", &config.to_toml().map_err(|e| e.to_string())?)?;

            let loaded = load(&ConfigOverrides {
                config_file: Some(PathBuf::from("custom.toml")),
                ..Default::default()
            })?;
            assert_eq!(loaded, config);
            Ok(())
        });
    }
}
