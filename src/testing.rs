//! In-memory chain used by unit tests.

use crate::chain::ChainClient;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::rlp::Rlp;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Hardhat / Anvil default development mnemonic.
pub(crate) const TEST_MNEMONIC: &str =
    "test test test test test test test test test test test junk";

pub(crate) fn priced_tx(gas_price: u64) -> Transaction {
    Transaction {
        gas_price: Some(U256::from(gas_price)),
        ..Default::default()
    }
}

/// Decode a signed raw transaction and recover its sender.
pub(crate) fn decode_signed(raw: &Bytes) -> (TypedTransaction, Address) {
    let rlp = Rlp::new(raw.as_ref());
    let (tx, signature) = TypedTransaction::decode_signed(&rlp).expect("valid signed transaction");
    let from = signature.recover(tx.sighash()).expect("recoverable signature");
    (tx, from)
}

struct SendFailure {
    message: String,
    remaining: u32,
}

#[derive(Default)]
struct MockState {
    blocks: Vec<Vec<Transaction>>,
    balances: HashMap<Address, U256>,
    pending_nonces: HashMap<Address, U256>,
    mined_nonces: HashMap<Address, U256>,
    hold_in_mempool: bool,
    mempool: Vec<(Address, U256)>,
    priority_fee: Option<U256>,
    fail_blocks: bool,
    failing_balances: Vec<Address>,
    send_failures: HashMap<Address, SendFailure>,
    sent: Vec<Bytes>,
    send_attempts: usize,
    delay: Duration,
    block_feed: Vec<u64>,
}

pub(crate) struct MockChain {
    chain_id: u64,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(MockState {
                priority_fee: Some(U256::one()),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn push_block(&self, transactions: Vec<Transaction>) {
        self.state().blocks.push(transactions);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    pub fn balance_of(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or_default()
    }

    pub fn set_priority_fee(&self, fee: Option<U256>) {
        self.state().priority_fee = fee;
    }

    pub fn fail_blocks(&self, fail: bool) {
        self.state().fail_blocks = fail;
    }

    pub fn fail_balance(&self, address: Address) {
        self.state().failing_balances.push(address);
    }

    /// Reject the next `times` broadcasts from `from` with `message`.
    pub fn fail_send(&self, from: Address, message: &str, times: u32) {
        self.state().send_failures.insert(
            from,
            SendFailure {
                message: message.to_string(),
                remaining: times,
            },
        );
    }

    /// Delay applied to every call.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    /// Keep accepted transactions pending until `mine_pending` instead of applying them at once.
    pub fn hold_in_mempool(&self, hold: bool) {
        self.state().hold_in_mempool = hold;
    }

    /// Apply every held transaction to balances and latest nonces.
    pub fn mine_pending(&self) {
        let mut state = self.state();
        let held = std::mem::take(&mut state.mempool);
        for (from, cost) in held {
            let balance = state.balances.get(&from).copied().unwrap_or_default();
            state.balances.insert(from, balance.saturating_sub(cost));
            *state.mined_nonces.entry(from).or_default() += U256::one();
        }
    }

    pub fn set_block_feed(&self, numbers: Vec<u64>) {
        self.state().block_feed = numbers;
    }

    /// Raw transactions accepted so far, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.state().sent.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.state().send_attempts
    }

    async fn pause(&self) {
        let delay = self.state().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64> {
        self.pause().await;
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64> {
        self.pause().await;
        let state = self.state();
        if state.fail_blocks {
            return Err(anyhow!("connection refused"));
        }
        Ok(state.blocks.len().saturating_sub(1) as u64)
    }

    async fn block_transactions(&self, number: u64) -> Result<Vec<Transaction>> {
        self.pause().await;
        let state = self.state();
        if state.fail_blocks {
            return Err(anyhow!("connection refused"));
        }
        state
            .blocks
            .get(number as usize)
            .cloned()
            .ok_or_else(|| anyhow!("Block {} not found", number))
    }

    async fn max_priority_fee(&self) -> Result<U256> {
        self.pause().await;
        self.state()
            .priority_fee
            .ok_or_else(|| anyhow!("method eth_maxPriorityFeePerGas not supported"))
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.pause().await;
        let state = self.state();
        if state.failing_balances.contains(&address) {
            return Err(anyhow!("bad response from node"));
        }
        Ok(state.balances.get(&address).copied().unwrap_or_default())
    }

    async fn pending_nonce(&self, address: Address) -> Result<U256> {
        self.pause().await;
        Ok(self.state().pending_nonces.get(&address).copied().unwrap_or_default())
    }

    async fn latest_nonce(&self, address: Address) -> Result<U256> {
        self.pause().await;
        Ok(self.state().mined_nonces.get(&address).copied().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash> {
        self.pause().await;
        let (tx, from) = decode_signed(&raw);
        let mut state = self.state();
        state.send_attempts += 1;

        if let Some(failure) = state.send_failures.get_mut(&from) {
            if failure.remaining > 0 {
                failure.remaining -= 1;
                return Err(anyhow!(failure.message.clone()));
            }
        }

        let value = tx.value().copied().unwrap_or_default();
        let gas = tx.gas().copied().unwrap_or_default();
        let fee = tx.gas_price().unwrap_or_default();
        let cost = value + gas * fee;
        let balance = state.balances.get(&from).copied().unwrap_or_default();
        if balance < cost {
            return Err(anyhow!("insufficient funds for gas * price + value"));
        }
        *state.pending_nonces.entry(from).or_default() += U256::one();
        if state.hold_in_mempool {
            state.mempool.push((from, cost));
        } else {
            state.balances.insert(from, balance - cost);
            *state.mined_nonces.entry(from).or_default() += U256::one();
        }
        state.sent.push(raw.clone());

        Ok(TxHash::from(ethers::utils::keccak256(raw.as_ref())))
    }

    async fn watch_blocks(&self, sender: mpsc::Sender<u64>) -> Result<()> {
        let feed = self.state().block_feed.clone();
        for number in feed {
            if sender.send(number).await.is_err() {
                return Ok(());
            }
        }
        // A live node's feed does not end on its own
        std::future::pending::<()>().await;
        Ok(())
    }
}
