use crate::decision::{SweepPolicy, TRANSFER_GAS};
use crate::error::ConfigError;
use crate::fees::FeeSettings;
use ethers::types::{Address, U256};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Fee model a network accepts for plain value transfers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeeModel {
    /// Single `gasPrice` field (type 0 transactions).
    Legacy,
    /// `maxFeePerGas` / `maxPriorityFeePerGas` pair (EIP-1559, type 2 transactions).
    Eip1559,
}

/// A supported EVM network with its config key, chain ID, native token and fee model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvmNetwork {
    /// Lowercase key used in the environment, e.g. `goerli` for `goerli_rpc`.
    pub key: &'static str,
    pub label: &'static str,
    pub chain_id: u64,
    pub native_token: &'static str,
    pub fee_model: FeeModel,
}

impl EvmNetwork {
    pub const fn new(
        key: &'static str,
        label: &'static str,
        chain_id: u64,
        native_token: &'static str,
        fee_model: FeeModel,
    ) -> Self {
        Self {
            key,
            label,
            chain_id,
            native_token,
            fee_model,
        }
    }

    /// Environment key holding this network's RPC endpoint.
    pub fn rpc_env_key(&self) -> String {
        format!("{}_rpc", self.key)
    }
}

impl fmt::Display for EvmNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key)
    }
}

use FeeModel::*;

/// Every network the sweeper knows how to talk to, in scan order.
pub const NETWORKS: &[EvmNetwork] = &[
    EvmNetwork::new("mainnet", "Ethereum", 1, "ETH", Eip1559),
    EvmNetwork::new("ropsten", "Ropsten", 3, "ETH", Eip1559),
    EvmNetwork::new("rinkeby", "Rinkeby", 4, "ETH", Eip1559),
    EvmNetwork::new("goerli", "Goerli", 5, "ETH", Eip1559),
    EvmNetwork::new("kovan", "Kovan", 42, "ETH", Eip1559),
    EvmNetwork::new("sepolia", "Sepolia", 11155111, "ETH", Eip1559),
    EvmNetwork::new("holesky", "Holesky", 17000, "ETH", Eip1559),
    EvmNetwork::new("bsc", "BNB Chain", 56, "BNB", Legacy),
];

/// Networks swept when `sweep_networks` is not set.
pub const DEFAULT_NETWORKS: &[&str] = &["mainnet", "rinkeby", "kovan", "ropsten", "goerli"];

pub const DEFAULT_WALLET_DEPTH: u32 = 3;
pub const DEFAULT_SWEEP_FREQUENCY_MS: u64 = 30_000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MAX_SUBMIT_RETRIES: u32 = 1;

/// BIP-44 coin type for Ethereum; used for every EVM chain so addresses match across networks
pub const DEFAULT_COIN_TYPE: u32 = 60;

/// Find a network by its config key (case-insensitive)
pub fn find_network_by_key(key: &str) -> Option<&'static EvmNetwork> {
    let key = key.trim();
    NETWORKS.iter().find(|n| n.key.eq_ignore_ascii_case(key))
}

/// Address-index derivation path: m/44'/60'/0'/0/i
pub fn derivation_path(index: u32) -> String {
    format!("m/44'/{}'/0'/0/{}", DEFAULT_COIN_TYPE, index)
}

/// An enabled network and the RPC endpoint it is reached through.
#[derive(Clone, Debug)]
pub struct NetworkEndpoint {
    pub network: &'static EvmNetwork,
    pub rpc_url: Url,
}

/// Runtime configuration of the sweeper, read once at startup.
#[derive(Clone)]
pub struct SweepConfig {
    pub destination: Address,
    pub mnemonic: String,
    pub depth: u32,
    pub sweep_interval: Duration,
    pub fee_interval: Duration,
    pub rpc_timeout: Duration,
    pub max_submit_retries: u32,
    /// Enabled networks in registry order.
    pub endpoints: Vec<NetworkEndpoint>,
    /// Network whose new blocks additionally trigger sweeps.
    pub primary_network: Option<&'static EvmNetwork>,
    pub fee: FeeSettings,
    pub policy: SweepPolicy,
    pub log_file: Option<PathBuf>,
}

impl fmt::Debug for SweepConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepConfig")
            .field("destination", &self.destination)
            .field("mnemonic", &"<redacted>")
            .field("depth", &self.depth)
            .field("sweep_interval", &self.sweep_interval)
            .field("fee_interval", &self.fee_interval)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("max_submit_retries", &self.max_submit_retries)
            .field("endpoints", &self.endpoints)
            .field("primary_network", &self.primary_network.map(|n| n.key))
            .field("fee", &self.fee)
            .field("policy", &self.policy)
            .field("log_file", &self.log_file)
            .finish()
    }
}

impl SweepConfig {
    /// Read configuration from the process environment (call `dotenvy::dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration from any key/value source. Empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let networks = match get("sweep_networks") {
            Some(list) => parse_network_list(&list)?,
            None => parse_network_list(&DEFAULT_NETWORKS.join(","))?,
        };
        if networks.is_empty() {
            return Err(ConfigError::invalid("sweep_networks", "no networks listed"));
        }

        // Report every missing key at once
        let mut required = vec!["destination".to_string(), "sweep_mnemonic".to_string()];
        required.extend(networks.iter().map(|n| n.rpc_env_key()));
        let missing: Vec<String> = required
            .iter()
            .filter(|key| get(key.as_str()).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing));
        }

        let destination_raw = get("destination").unwrap_or_default();
        let destination = Address::from_str(&destination_raw)
            .map_err(|e| ConfigError::invalid("destination", e.to_string()))?;
        if destination.is_zero() {
            return Err(ConfigError::invalid(
                "destination",
                "refusing to sweep to the zero address",
            ));
        }

        let mnemonic = get("sweep_mnemonic").unwrap_or_default();

        let mut endpoints = Vec::with_capacity(networks.len());
        for network in networks {
            let key = network.rpc_env_key();
            let raw = get(key.as_str()).unwrap_or_default();
            let rpc_url = Url::parse(&raw).map_err(|e| ConfigError::invalid(&key, e.to_string()))?;
            endpoints.push(NetworkEndpoint { network, rpc_url });
        }

        let depth: u32 = parse_or(&get, "sweep_depth", DEFAULT_WALLET_DEPTH)?;
        if depth == 0 {
            return Err(ConfigError::invalid("sweep_depth", "must be at least 1"));
        }

        let sweep_ms: u64 = parse_or(&get, "sweep_frequency", DEFAULT_SWEEP_FREQUENCY_MS)?;
        let fee_ms: u64 = parse_or(&get, "sweep_fee_frequency", sweep_ms)?;
        let timeout_ms: u64 = parse_or(&get, "sweep_rpc_timeout", DEFAULT_RPC_TIMEOUT_MS)?;
        for (key, value) in [
            ("sweep_frequency", sweep_ms),
            ("sweep_fee_frequency", fee_ms),
            ("sweep_rpc_timeout", timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }

        let defaults = FeeSettings::default();
        let fee = FeeSettings {
            buffer_percent: parse_or(&get, "sweep_gas_buffer_percent", defaults.buffer_percent)?,
            sample_blocks: parse_or(&get, "sweep_fee_sample_blocks", defaults.sample_blocks)?,
        };
        if fee.sample_blocks == 0 {
            return Err(ConfigError::invalid("sweep_fee_sample_blocks", "must be at least 1"));
        }

        let transfer_gas: u64 = parse_or(&get, "sweep_transfer_gas", TRANSFER_GAS)?;
        let min_gas_price: u128 = parse_or(&get, "sweep_min_gas_price", 1u128)?;
        if transfer_gas == 0 {
            return Err(ConfigError::invalid("sweep_transfer_gas", "must be greater than zero"));
        }
        let policy = SweepPolicy {
            transfer_gas,
            min_fee_per_gas: U256::from(min_gas_price),
        };

        let primary_network = match get("sweep_primary_network") {
            Some(key) if key.eq_ignore_ascii_case("none") => None,
            Some(key) => {
                let network = find_network_by_key(&key)
                    .ok_or_else(|| ConfigError::UnknownNetwork(key.clone()))?;
                if !endpoints.iter().any(|e| e.network == network) {
                    return Err(ConfigError::invalid(
                        "sweep_primary_network",
                        format!("{} is not listed in sweep_networks", network.key),
                    ));
                }
                Some(network)
            }
            None => endpoints
                .iter()
                .map(|e| e.network)
                .find(|n| n.key == "mainnet"),
        };

        Ok(Self {
            destination,
            mnemonic,
            depth,
            sweep_interval: Duration::from_millis(sweep_ms),
            fee_interval: Duration::from_millis(fee_ms),
            rpc_timeout: Duration::from_millis(timeout_ms),
            max_submit_retries: parse_or(
                &get,
                "sweep_max_submit_retries",
                DEFAULT_MAX_SUBMIT_RETRIES,
            )?,
            endpoints,
            primary_network,
            fee,
            policy,
            log_file: get("sweep_log_file").map(PathBuf::from),
        })
    }

    pub fn networks(&self) -> Vec<&'static EvmNetwork> {
        self.endpoints.iter().map(|e| e.network).collect()
    }
}

/// Parse a comma-separated list of network keys, returned in registry order without duplicates
fn parse_network_list(list: &str) -> Result<Vec<&'static EvmNetwork>, ConfigError> {
    let mut selected = Vec::new();
    for key in list.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        let network =
            find_network_by_key(key).ok_or_else(|| ConfigError::UnknownNetwork(key.to_string()))?;
        selected.push(network);
    }
    Ok(NETWORKS
        .iter()
        .filter(|n| selected.contains(n))
        .collect())
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{}': {}", raw, e))),
        None => Ok(default),
    }
}
