//! Simulator error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type SimResult<T> = Result<T, SimError>;
