//! Fatal startup errors.
//!
//! Steady-state failures (fee estimation, balance reads, submissions) are carried as
//! `anyhow::Error` and only ever logged; the types here abort the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "Missing required environment variables. Make your own .env file and include: {}",
        .0.join(", ")
    )]
    MissingKeys(Vec<String>),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Unknown network '{0}' (not in the network registry)")]
    UnknownNetwork(String),

    #[error("RPC endpoint for {network} reports chain id {actual}, expected {expected}")]
    ChainIdMismatch {
        network: &'static str,
        expected: u64,
        actual: u64,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("Seed phrase is empty")]
    EmptySeed,

    #[error("Wallet depth must be at least 1")]
    ZeroDepth,

    #[error("Failed to derive account at {path}: {reason}")]
    Derive { path: String, reason: String },
}
