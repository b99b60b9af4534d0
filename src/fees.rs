//! Fee estimation from recent on-chain activity.
//!
//! The estimate is the average legacy gas price of the transactions in the last few blocks,
//! plus a fixed percentage buffer. Results are kept per network in a [`FeeCache`] that the
//! sweep passes read from.

use crate::chain::ChainClient;
use crate::config::{EvmNetwork, FeeModel};
use crate::utils;
use anyhow::{anyhow, Result};
use ethers::types::{Transaction, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub const DEFAULT_GAS_BUFFER_PERCENT: u32 = 2;

/// Latest block plus the two before it.
pub const DEFAULT_FEE_SAMPLE_BLOCKS: u64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeSettings {
    /// Upward buffer applied to the sampled average, in percent.
    pub buffer_percent: u32,
    /// Number of most recent blocks sampled, including the latest.
    pub sample_blocks: u64,
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            buffer_percent: DEFAULT_GAS_BUFFER_PERCENT,
            sample_blocks: DEFAULT_FEE_SAMPLE_BLOCKS,
        }
    }
}

/// A per-network fee estimate. Always replaced as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeeEstimate {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl FeeEstimate {
    /// The most a transfer can pay per gas under this estimate.
    pub fn per_gas_ceiling(&self) -> U256 {
        match self {
            FeeEstimate::Legacy { gas_price } => *gas_price,
            FeeEstimate::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FeeEstimate::Legacy { gas_price } => {
                format!("gas price {} gwei", utils::format_gwei(*gas_price))
            }
            FeeEstimate::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => format!(
                "max fee {} gwei, priority fee {} gwei",
                utils::format_gwei(*max_fee_per_gas),
                utils::format_gwei(*max_priority_fee_per_gas)
            ),
        }
    }
}

/// Shared latest-estimate store, one slot per network.
///
/// Each slot is a `watch` channel, so a write swaps the whole estimate and a reader sees
/// either the previous or the new value, never a mix.
#[derive(Debug)]
pub struct FeeCache {
    slots: HashMap<u64, watch::Sender<Option<FeeEstimate>>>,
}

impl FeeCache {
    pub fn new<'a>(networks: impl IntoIterator<Item = &'a EvmNetwork>) -> Self {
        let slots = networks
            .into_iter()
            .map(|n| (n.chain_id, watch::channel(None).0))
            .collect();
        Self { slots }
    }

    pub fn current(&self, network: &EvmNetwork) -> Option<FeeEstimate> {
        self.slots
            .get(&network.chain_id)
            .and_then(|slot| *slot.borrow())
    }

    /// Replace the estimate for `network`. Unknown networks are ignored.
    pub fn publish(&self, network: &EvmNetwork, estimate: FeeEstimate) {
        if let Some(slot) = self.slots.get(&network.chain_id) {
            slot.send_replace(Some(estimate));
        }
    }
}

/// Legacy gas prices of `transactions` that are present and strictly positive.
pub fn priced_transactions(transactions: &[Transaction]) -> Vec<U256> {
    transactions
        .iter()
        .filter_map(|tx| tx.gas_price)
        .filter(|price| !price.is_zero())
        .collect()
}

/// `sum / max(1, count)`; zero when there is nothing to average.
pub fn average_gas_price(prices: &[U256]) -> U256 {
    let sum = prices
        .iter()
        .fold(U256::zero(), |acc, price| acc.saturating_add(*price));
    let divisor = U256::from(prices.len().max(1));
    sum / divisor
}

/// `average * (100 + buffer_percent) / 100` in integer arithmetic.
pub fn apply_buffer(average: U256, buffer_percent: u32) -> U256 {
    average.saturating_mul(U256::from(100u64 + buffer_percent as u64)) / U256::from(100u64)
}

/// Estimates fees for one network.
pub struct FeeEstimator {
    network: &'static EvmNetwork,
    client: Arc<dyn ChainClient>,
    settings: FeeSettings,
    timeout: Duration,
}

impl FeeEstimator {
    pub fn new(
        network: &'static EvmNetwork,
        client: Arc<dyn ChainClient>,
        settings: FeeSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            network,
            client,
            settings,
            timeout,
        }
    }

    /// Sample recent blocks and compute a fresh estimate.
    pub async fn estimate(&self) -> Result<FeeEstimate> {
        let latest = self.client.block_number().await?;
        let oldest = latest.saturating_sub(self.settings.sample_blocks.saturating_sub(1));

        let mut transactions = Vec::new();
        for number in (oldest..=latest).rev() {
            let mut block_txs = self.client.block_transactions(number).await?;
            transactions.append(&mut block_txs);
        }

        let prices = priced_transactions(&transactions);
        let average = average_gas_price(&prices);
        let buffered = apply_buffer(average, self.settings.buffer_percent);

        if prices.is_empty() {
            warn!(
                "No priced transactions in blocks {}..={} on {}, estimate is zero",
                oldest, latest, self.network
            );
        }

        let estimate = match self.network.fee_model {
            FeeModel::Legacy => FeeEstimate::Legacy {
                gas_price: buffered,
            },
            FeeModel::Eip1559 => {
                let priority = match self.client.max_priority_fee().await {
                    Ok(suggested) => suggested.min(buffered),
                    Err(e) => {
                        warn!(
                            "Priority fee suggestion failed on {}: {}, using 10% of max fee",
                            self.network, e
                        );
                        buffered / 10
                    }
                };
                FeeEstimate::Eip1559 {
                    max_fee_per_gas: buffered,
                    max_priority_fee_per_gas: priority,
                }
            }
        };

        Ok(estimate)
    }

    /// Estimate and publish into `cache`. On failure the previous estimate is kept.
    pub async fn refresh(&self, cache: &FeeCache) -> Option<FeeEstimate> {
        let result = match tokio::time::timeout(self.timeout, self.estimate()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("timed out after {:?}", self.timeout)),
        };

        match result {
            Ok(estimate) => {
                info!("Gas price estimate for {}: {}", self.network, estimate.describe());
                cache.publish(self.network, estimate);
                Some(estimate)
            }
            Err(e) => {
                warn!("Failed gas estimation for {}: {:#}", self.network, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::find_network_by_key;
    use crate::testing::{priced_tx, MockChain};

    fn mainnet() -> &'static EvmNetwork {
        find_network_by_key("mainnet").unwrap()
    }

    fn bsc() -> &'static EvmNetwork {
        find_network_by_key("bsc").unwrap()
    }

    fn prices(values: &[u64]) -> Vec<U256> {
        values.iter().map(|v| U256::from(*v)).collect()
    }

    // ==================== pure helpers ====================

    #[test]
    fn test_average_gas_price() {
        assert_eq!(average_gas_price(&prices(&[10, 20, 30])), U256::from(20u64));
        assert_eq!(average_gas_price(&prices(&[10, 11])), U256::from(10u64));
    }

    #[test]
    fn test_average_of_nothing_is_zero() {
        assert_eq!(average_gas_price(&[]), U256::zero());
    }

    #[test]
    fn test_apply_buffer_truncates() {
        // 20 * 102 / 100 = 20.4 -> 20
        assert_eq!(apply_buffer(U256::from(20u64), 2), U256::from(20u64));
        assert_eq!(apply_buffer(U256::from(100u64), 2), U256::from(102u64));
        assert_eq!(apply_buffer(U256::from(100u64), 5), U256::from(105u64));
        assert_eq!(apply_buffer(U256::from(100u64), 0), U256::from(100u64));
    }

    #[test]
    fn test_buffer_never_lowers_the_average() {
        for average in [0u64, 1, 49, 50, 99, 12_345_678_901] {
            for buffer in [0u32, 1, 2, 5, 100] {
                let average = U256::from(average);
                assert!(apply_buffer(average, buffer) >= average);
            }
        }
    }

    #[test]
    fn test_priced_transactions_drops_zero_and_missing_prices() {
        let mut unpriced = priced_tx(0);
        unpriced.gas_price = None;
        let txs = vec![priced_tx(10), priced_tx(0), unpriced, priced_tx(30)];
        assert_eq!(priced_transactions(&txs), prices(&[10, 30]));
    }

    // ==================== FeeCache ====================

    #[test]
    fn test_fee_cache_starts_empty_and_replaces_whole_values() {
        let cache = FeeCache::new([mainnet(), bsc()]);
        assert!(cache.current(mainnet()).is_none());

        let first = FeeEstimate::Eip1559 {
            max_fee_per_gas: U256::from(100u64),
            max_priority_fee_per_gas: U256::from(2u64),
        };
        cache.publish(mainnet(), first);
        assert_eq!(cache.current(mainnet()), Some(first));
        assert!(cache.current(bsc()).is_none());

        let second = FeeEstimate::Eip1559 {
            max_fee_per_gas: U256::from(200u64),
            max_priority_fee_per_gas: U256::from(3u64),
        };
        cache.publish(mainnet(), second);
        assert_eq!(cache.current(mainnet()), Some(second));
    }

    #[test]
    fn test_fee_cache_ignores_unknown_network() {
        let cache = FeeCache::new([mainnet()]);
        cache.publish(bsc(), FeeEstimate::Legacy { gas_price: U256::one() });
        assert!(cache.current(bsc()).is_none());
    }

    // ==================== FeeEstimator ====================

    #[tokio::test]
    async fn test_estimate_filters_zero_priced_and_applies_buffer() {
        let chain = Arc::new(MockChain::new(1));
        chain.push_block(vec![priced_tx(10), priced_tx(0)]);
        chain.push_block(vec![priced_tx(20)]);
        chain.push_block(vec![priced_tx(30)]);

        let estimator =
            FeeEstimator::new(bsc(), chain, FeeSettings::default(), Duration::from_secs(5));
        let estimate = estimator.estimate().await.unwrap();
        assert_eq!(estimate, FeeEstimate::Legacy { gas_price: U256::from(20u64) });
    }

    #[tokio::test]
    async fn test_estimate_samples_only_recent_blocks() {
        let chain = Arc::new(MockChain::new(1));
        chain.push_block(vec![priced_tx(1_000)]); // older than the sample window
        chain.push_block(vec![priced_tx(100)]);
        chain.push_block(vec![priced_tx(100)]);
        chain.push_block(vec![priced_tx(100)]);

        let estimator =
            FeeEstimator::new(bsc(), chain, FeeSettings::default(), Duration::from_secs(5));
        let estimate = estimator.estimate().await.unwrap();
        assert_eq!(estimate.per_gas_ceiling(), U256::from(102u64));
    }

    #[tokio::test]
    async fn test_estimate_with_no_priced_transactions_is_zero() {
        let chain = Arc::new(MockChain::new(1));
        chain.push_block(vec![priced_tx(0)]);
        chain.push_block(vec![]);

        let estimator =
            FeeEstimator::new(bsc(), chain, FeeSettings::default(), Duration::from_secs(5));
        let estimate = estimator.estimate().await.unwrap();
        assert_eq!(estimate.per_gas_ceiling(), U256::zero());
    }

    #[tokio::test]
    async fn test_estimate_eip1559_caps_priority_at_max_fee() {
        let chain = Arc::new(MockChain::new(1));
        chain.push_block(vec![priced_tx(100)]);
        chain.set_priority_fee(Some(U256::from(500u64)));

        let estimator = FeeEstimator::new(
            mainnet(),
            chain.clone(),
            FeeSettings::default(),
            Duration::from_secs(5),
        );
        assert_eq!(
            estimator.estimate().await.unwrap(),
            FeeEstimate::Eip1559 {
                max_fee_per_gas: U256::from(102u64),
                max_priority_fee_per_gas: U256::from(102u64),
            }
        );

        chain.set_priority_fee(Some(U256::from(3u64)));
        assert_eq!(
            estimator.estimate().await.unwrap(),
            FeeEstimate::Eip1559 {
                max_fee_per_gas: U256::from(102u64),
                max_priority_fee_per_gas: U256::from(3u64),
            }
        );
    }

    #[tokio::test]
    async fn test_estimate_eip1559_falls_back_when_suggestion_fails() {
        let chain = Arc::new(MockChain::new(1));
        chain.push_block(vec![priced_tx(1_000)]);
        chain.set_priority_fee(None);

        let estimator =
            FeeEstimator::new(mainnet(), chain, FeeSettings::default(), Duration::from_secs(5));
        assert_eq!(
            estimator.estimate().await.unwrap(),
            FeeEstimate::Eip1559 {
                max_fee_per_gas: U256::from(1_020u64),
                max_priority_fee_per_gas: U256::from(102u64),
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_publishes_estimate() {
        let chain = Arc::new(MockChain::new(1));
        chain.push_block(vec![priced_tx(50)]);
        let cache = FeeCache::new([bsc()]);

        let estimator =
            FeeEstimator::new(bsc(), chain, FeeSettings::default(), Duration::from_secs(5));
        let published = estimator.refresh(&cache).await;
        assert_eq!(published, Some(FeeEstimate::Legacy { gas_price: U256::from(51u64) }));
        assert_eq!(cache.current(bsc()), published);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_estimate() {
        let chain = Arc::new(MockChain::new(1));
        chain.push_block(vec![priced_tx(50)]);
        let cache = FeeCache::new([bsc()]);
        let previous = FeeEstimate::Legacy { gas_price: U256::from(7u64) };
        cache.publish(bsc(), previous);

        chain.fail_blocks(true);
        let estimator =
            FeeEstimator::new(bsc(), chain, FeeSettings::default(), Duration::from_secs(5));
        assert!(estimator.refresh(&cache).await.is_none());
        assert_eq!(cache.current(bsc()), Some(previous));
    }

    #[tokio::test]
    async fn test_refresh_times_out_without_publishing() {
        let chain = Arc::new(MockChain::new(1));
        chain.push_block(vec![priced_tx(50)]);
        chain.set_delay(Duration::from_millis(500));
        let cache = FeeCache::new([bsc()]);

        let estimator =
            FeeEstimator::new(bsc(), chain, FeeSettings::default(), Duration::from_millis(20));
        assert!(estimator.refresh(&cache).await.is_none());
        assert!(cache.current(bsc()).is_none());
    }
}
