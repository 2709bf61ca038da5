//! Error handling for the BLEHome CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("BLEHome error: {0}")]
    Mesh(#[from] blehome_core::BlehomeError),

    #[error("BLE link error: {0}")]
    Ble(#[from] blehome_ble::BleLinkError),

    #[error("Mesh configuration error: {0}")]
    MeshConfig(#[from] blehome_core::ConfigError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration loading error: {0}")]
    Loading(#[from] Box<figment::Error>),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        CliError::Loading(Box::new(err))
    }
}
