//! One sweep pass over one network's derived accounts.
//! Provides the overlap guard, per-account failure isolation and broadcast retry logic.

use crate::chain::ChainClient;
use crate::config::EvmNetwork;
use crate::decision::{decide_for, SweepPolicy};
use crate::fees::{FeeCache, FeeEstimate};
use crate::operation_log::{OperationLog, SweepRecord};
use crate::utils;
use crate::wallet::DerivedAccount;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// First delay before re-broadcasting after a retryable failure; doubles each attempt.
pub const DEFAULT_SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Settings shared by every network's sweep passes.
#[derive(Clone, Debug)]
pub struct SweepSettings {
    pub destination: Address,
    pub policy: SweepPolicy,
    /// Upper bound on the work for a single account.
    pub account_timeout: Duration,
    pub max_submit_retries: u32,
    pub retry_delay: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountFailure {
    pub index: u32,
    pub address: Address,
    pub error: String,
}

#[derive(Clone, Debug, Default)]
pub struct PassReport {
    pub scanned: usize,
    pub swept: Vec<SweepRecord>,
    pub failures: Vec<AccountFailure>,
}

#[derive(Debug)]
pub enum PassOutcome {
    /// A pass for this network was still scanning.
    AlreadyRunning,
    /// No fee estimate has been obtained for this network yet.
    NoFeeEstimate,
    Completed(PassReport),
}

/// Build the sweep transfer for `fee`'s model.
pub fn build_transfer(
    network: &EvmNetwork,
    from: Address,
    to: Address,
    amount: U256,
    gas_limit: u64,
    fee: &FeeEstimate,
    nonce: U256,
) -> TypedTransaction {
    match *fee {
        FeeEstimate::Legacy { gas_price } => TransactionRequest::new()
            .from(from)
            .to(to)
            .value(amount)
            .gas(gas_limit)
            .gas_price(gas_price)
            .nonce(nonce)
            .chain_id(network.chain_id)
            .into(),
        FeeEstimate::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .value(amount)
            .gas(gas_limit)
            .max_fee_per_gas(max_fee_per_gas)
            .max_priority_fee_per_gas(max_priority_fee_per_gas)
            .nonce(nonce)
            .chain_id(network.chain_id)
            .into(),
    }
}

/// Determine if a broadcast error is worth retrying with the same signed bytes
pub fn is_retryable_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    if lower.contains("rejected")
        || lower.contains("denied")
        || lower.contains("insufficient funds")
        || lower.contains("nonce too low")
        || lower.contains("underpriced")
    {
        return false;
    }

    lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("network")
        || lower.contains("connection")
        || lower.contains("temporarily")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("bad response")
}

/// The node already has this exact transaction, e.g. from an earlier attempt that timed out
fn is_already_known(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("already known") || lower.contains("known transaction")
}

/// Clears the scanning flag when a pass ends, including when its future is dropped.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sweeps one network's accounts to the destination.
pub struct NetworkSweeper {
    network: &'static EvmNetwork,
    client: Arc<dyn ChainClient>,
    accounts: Arc<[DerivedAccount]>,
    fees: Arc<FeeCache>,
    settings: SweepSettings,
    ledger: Option<Arc<OperationLog>>,
    scanning: AtomicBool,
}

impl NetworkSweeper {
    pub fn new(
        network: &'static EvmNetwork,
        client: Arc<dyn ChainClient>,
        accounts: Arc<[DerivedAccount]>,
        fees: Arc<FeeCache>,
        settings: SweepSettings,
        ledger: Option<Arc<OperationLog>>,
    ) -> Self {
        Self {
            network,
            client,
            accounts,
            fees,
            settings,
            ledger,
            scanning: AtomicBool::new(false),
        }
    }

    /// Run one pass: every account in derivation order, failures isolated per account.
    pub async fn run_pass(&self) -> PassOutcome {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sweep of {} still running, skipping this trigger", self.network);
            return PassOutcome::AlreadyRunning;
        }
        let _guard = ScanGuard(&self.scanning);

        let Some(fee) = self.fees.current(self.network) else {
            info!("No gas estimate for {} yet, skipping sweep", self.network);
            return PassOutcome::NoFeeEstimate;
        };

        let mut report = PassReport::default();
        for account in self.accounts.iter() {
            report.scanned += 1;
            let result = match tokio::time::timeout(
                self.settings.account_timeout,
                self.sweep_account(account, &fee),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow!("timed out after {:?}", self.settings.account_timeout)),
            };

            match result {
                Ok(Some(record)) => report.swept.push(record),
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "Error sweeping {}-{} ({:?}): {:#}",
                        self.network, account.index, account.address, e
                    );
                    report.failures.push(AccountFailure {
                        index: account.index,
                        address: account.address,
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        info!(
            "Sweep of {} done: scanned {}, swept {}, failed {}",
            self.network,
            report.scanned,
            report.swept.len(),
            report.failures.len()
        );
        PassOutcome::Completed(report)
    }

    async fn sweep_account(
        &self,
        account: &DerivedAccount,
        fee: &FeeEstimate,
    ) -> Result<Option<SweepRecord>> {
        info!(
            "Scanning {}-{}: {}",
            self.network,
            account.index,
            utils::short_address(&account.address)
        );
        if account.address == self.settings.destination {
            debug!("{}-{} is the destination, nothing to do", self.network, account.index);
            return Ok(None);
        }

        // The latest balance still includes funds a pending sweep is moving
        let nonce = self
            .client
            .pending_nonce(account.address)
            .await
            .context("Failed to read nonce")?;
        let mined_nonce = self
            .client
            .latest_nonce(account.address)
            .await
            .context("Failed to read latest nonce")?;
        if nonce > mined_nonce {
            info!(
                "{}-{} has {} unconfirmed transaction(s), skipping until mined",
                self.network,
                account.index,
                nonce - mined_nonce
            );
            return Ok(None);
        }

        let balance = self
            .client
            .balance(account.address)
            .await
            .context("Failed to read balance")?;

        let Some(attempt) = decide_for(
            account.index,
            account.address,
            balance,
            fee,
            &self.settings.policy,
        ) else {
            debug!(
                "{}-{} balance {} {} does not cover transfer cost",
                self.network,
                account.index,
                utils::format_ether(balance),
                self.network.native_token
            );
            return Ok(None);
        };

        info!(
            "Worth transacting on {}-{} as {:?}: balance {} {}, transfer cost {} {}",
            self.network,
            account.index,
            account.address,
            utils::format_ether(attempt.balance),
            self.network.native_token,
            utils::format_ether(attempt.transfer_cost),
            self.network.native_token
        );

        let tx = build_transfer(
            self.network,
            account.address,
            self.settings.destination,
            attempt.amount,
            self.settings.policy.transfer_gas,
            fee,
            nonce,
        );
        let signature = account
            .signer()
            .sign_transaction_sync(&tx)
            .context("Failed to sign sweep transaction")?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = self.broadcast(raw).await?;
        info!(
            "Swept {} {} from {}-{} to {:?}: {:?}",
            utils::format_ether(attempt.amount),
            self.network.native_token,
            self.network,
            account.index,
            self.settings.destination,
            tx_hash
        );

        let (fee_per_gas, priority_fee_per_gas) = match *fee {
            FeeEstimate::Legacy { gas_price } => (gas_price, None),
            FeeEstimate::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => (max_fee_per_gas, Some(max_priority_fee_per_gas)),
        };
        let record = SweepRecord {
            timestamp: Utc::now(),
            network: self.network.key.to_string(),
            chain_id: self.network.chain_id,
            index: account.index,
            from: account.address,
            to: self.settings.destination,
            amount: attempt.amount,
            gas_limit: self.settings.policy.transfer_gas,
            fee_per_gas,
            priority_fee_per_gas,
            nonce,
            tx_hash,
        };

        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.append(&record) {
                warn!("Failed to write sweep log {}: {:#}", ledger.path().display(), e);
            }
        }

        Ok(Some(record))
    }

    /// Broadcast signed bytes, resending the same bytes on retryable errors.
    async fn broadcast(&self, raw: Bytes) -> Result<TxHash> {
        let mut attempt = 0;
        let mut delay = self.settings.retry_delay;

        loop {
            attempt += 1;
            match self.client.send_raw_transaction(raw.clone()).await {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(e) => {
                    let error_str = format!("{:#}", e);
                    if is_already_known(&error_str) {
                        let tx_hash = TxHash::from(ethers::utils::keccak256(raw.as_ref()));
                        info!("Node already has transaction {:?}", tx_hash);
                        return Ok(tx_hash);
                    }

                    let retryable = is_retryable_error(&error_str);
                    if attempt > self.settings.max_submit_retries || !retryable {
                        return Err(e.context(format!(
                            "Broadcast failed after {} attempt(s)",
                            attempt
                        )));
                    }

                    warn!(
                        "Broadcast attempt {} on {} failed (retrying after {:?}): {}",
                        attempt, self.network, delay, error_str
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}
