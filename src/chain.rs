//! Chain connection used by the sweeper.
//! `EthersClient` talks to a JSON-RPC node over HTTP; tests drive the engine through a mock.

use crate::config::NetworkEndpoint;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// How often the HTTP provider polls its block filter.
const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(4);

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn block_number(&self) -> Result<u64>;

    /// Every transaction in block `number`, with full detail.
    async fn block_transactions(&self, number: u64) -> Result<Vec<Transaction>>;

    /// The node's suggested priority fee (`eth_maxPriorityFeePerGas`).
    async fn max_priority_fee(&self) -> Result<U256>;

    async fn balance(&self, address: Address) -> Result<U256>;

    /// Transaction count including pending transactions.
    async fn pending_nonce(&self, address: Address) -> Result<U256>;

    /// Transaction count as of the latest block.
    async fn latest_nonce(&self, address: Address) -> Result<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash>;

    /// Push new block numbers into `sender` until the feed ends or fails.
    async fn watch_blocks(&self, sender: mpsc::Sender<u64>) -> Result<()>;
}

/// `ChainClient` over an ethers HTTP provider.
#[derive(Clone, Debug)]
pub struct EthersClient {
    provider: Arc<Provider<Http>>,
}

impl EthersClient {
    pub fn new(provider: Arc<Provider<Http>>) -> Self {
        Self { provider }
    }

    pub fn connect(endpoint: &NetworkEndpoint) -> Result<Self> {
        let provider = Provider::<Http>::try_from(endpoint.rpc_url.as_str())
            .with_context(|| format!("Invalid RPC URL for {}", endpoint.network))?
            .interval(BLOCK_POLL_INTERVAL);
        Ok(Self::new(Arc::new(provider)))
    }
}

#[async_trait]
impl ChainClient for EthersClient {
    async fn chain_id(&self) -> Result<u64> {
        let id = self.provider.get_chainid().await?;
        Ok(id.as_u64())
    }

    async fn block_number(&self) -> Result<u64> {
        let number = self.provider.get_block_number().await?;
        Ok(number.as_u64())
    }

    async fn block_transactions(&self, number: u64) -> Result<Vec<Transaction>> {
        let block = self
            .provider
            .get_block_with_txs(number)
            .await?
            .ok_or_else(|| anyhow!("Block {} not found", number))?;
        Ok(block.transactions)
    }

    async fn max_priority_fee(&self) -> Result<U256> {
        let fee: U256 = self
            .provider
            .request("eth_maxPriorityFeePerGas", ())
            .await?;
        Ok(fee)
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        Ok(self.provider.get_balance(address, None).await?)
    }

    async fn pending_nonce(&self, address: Address) -> Result<U256> {
        let nonce = self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await?;
        Ok(nonce)
    }

    async fn latest_nonce(&self, address: Address) -> Result<U256> {
        let nonce = self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Latest.into()))
            .await?;
        Ok(nonce)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash> {
        let pending_tx = self.provider.send_raw_transaction(raw).await?;
        Ok(pending_tx.tx_hash())
    }

    async fn watch_blocks(&self, sender: mpsc::Sender<u64>) -> Result<()> {
        let mut stream = self.provider.watch_blocks().await?;
        while let Some(hash) = stream.next().await {
            let number = match self.provider.get_block(hash).await? {
                Some(block) => block.number,
                None => None,
            };
            let Some(number) = number else {
                debug!("Block {:?} not yet available, skipping", hash);
                continue;
            };
            if sender.send(number.as_u64()).await.is_err() {
                // Receiver dropped, nobody is listening anymore
                break;
            }
        }
        Ok(())
    }
}
