//! Per-network schedules: fee refresh timer, sweep timer and the primary network's block trigger.
//!
//! Each network runs as its own set of tasks. The only state shared between networks is
//! the [`FeeCache`], so a stalled endpoint never delays another network's sweeps.

use crate::chain::{ChainClient, EthersClient};
use crate::config::{EvmNetwork, SweepConfig};
use crate::error::ConfigError;
use crate::fees::{FeeCache, FeeEstimator};
use crate::operation_log::OperationLog;
use crate::sweep::{NetworkSweeper, SweepSettings, DEFAULT_SUBMIT_RETRY_DELAY};
use crate::wallet::WalletPool;
use anyhow::{anyhow, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wait before resubscribing after the block feed ends.
pub const FEED_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Blocks whose number is a multiple of this reuse the current estimate instead of refreshing.
const BLOCK_REFRESH_SKIP: u64 = 4;

/// Ask the endpoint which chain it serves. A mismatch is fatal; no answer is only logged.
pub async fn verify_chain_id(
    network: &'static EvmNetwork,
    client: &dyn ChainClient,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, client.chain_id()).await {
        Ok(Ok(actual)) if actual == network.chain_id => {
            info!("Connected to {} (chain id {})", network.label, actual);
            Ok(())
        }
        Ok(Ok(actual)) => Err(ConfigError::ChainIdMismatch {
            network: network.key,
            expected: network.chain_id,
            actual,
        }
        .into()),
        Ok(Err(e)) => {
            warn!("{} endpoint not reachable yet: {:#}", network, e);
            Ok(())
        }
        Err(_) => {
            warn!("{} endpoint did not answer within {:?}", network, timeout);
            Ok(())
        }
    }
}

/// Check every endpoint at once, so one silent node does not hold up the rest.
pub async fn verify_chain_ids(
    clients: &[(&'static EvmNetwork, Arc<dyn ChainClient>)],
    timeout: Duration,
) -> Result<()> {
    try_join_all(
        clients
            .iter()
            .map(|(network, client)| verify_chain_id(*network, client.as_ref(), timeout)),
    )
    .await?;
    Ok(())
}

/// Everything that runs for one network.
struct NetworkWorker {
    network: &'static EvmNetwork,
    client: Arc<dyn ChainClient>,
    estimator: FeeEstimator,
    sweeper: NetworkSweeper,
}

impl NetworkWorker {
    async fn on_block(&self, number: u64, fees: &FeeCache) {
        if fees.current(self.network).is_none() {
            debug!("Block {} on {} ignored, no gas estimate yet", number, self.network);
            return;
        }
        debug!("New block on {}: {}", self.network, number);
        if number % BLOCK_REFRESH_SKIP != 0 {
            self.estimator.refresh(fees).await;
        }
        self.sweeper.run_pass().await;
    }
}

pub struct Supervisor {
    workers: Vec<Arc<NetworkWorker>>,
    fees: Arc<FeeCache>,
    sweep_interval: Duration,
    fee_interval: Duration,
    primary_network: Option<&'static EvmNetwork>,
    feed_restart_delay: Duration,
}

impl Supervisor {
    /// Open an RPC connection per enabled network and check each serves the expected chain.
    pub async fn connect(config: &SweepConfig, pool: &WalletPool) -> Result<Self> {
        let mut clients: Vec<(&'static EvmNetwork, Arc<dyn ChainClient>)> =
            Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            let client: Arc<dyn ChainClient> = Arc::new(EthersClient::connect(endpoint)?);
            clients.push((endpoint.network, client));
        }
        verify_chain_ids(&clients, config.rpc_timeout).await?;
        Self::new(config, clients, pool)
    }

    /// Assemble from already connected clients, one per enabled network.
    pub fn new(
        config: &SweepConfig,
        clients: Vec<(&'static EvmNetwork, Arc<dyn ChainClient>)>,
        pool: &WalletPool,
    ) -> Result<Self> {
        let fees = Arc::new(FeeCache::new(config.networks()));
        let ledger = config
            .log_file
            .as_ref()
            .map(|path| Arc::new(OperationLog::new(path.clone())));
        let settings = SweepSettings {
            destination: config.destination,
            policy: config.policy,
            account_timeout: config.rpc_timeout,
            max_submit_retries: config.max_submit_retries,
            retry_delay: DEFAULT_SUBMIT_RETRY_DELAY,
        };

        let mut workers = Vec::with_capacity(clients.len());
        for (network, client) in clients {
            let accounts = pool
                .accounts(network)
                .ok_or_else(|| anyhow!("No derived accounts for {}", network))?;
            let estimator =
                FeeEstimator::new(network, client.clone(), config.fee, config.rpc_timeout);
            let sweeper = NetworkSweeper::new(
                network,
                client.clone(),
                accounts,
                fees.clone(),
                settings.clone(),
                ledger.clone(),
            );
            workers.push(Arc::new(NetworkWorker {
                network,
                client,
                estimator,
                sweeper,
            }));
        }

        Ok(Self {
            workers,
            fees,
            sweep_interval: config.sweep_interval,
            fee_interval: config.fee_interval,
            primary_network: config.primary_network,
            feed_restart_delay: FEED_RESTART_DELAY,
        })
    }

    pub fn fees(&self) -> Arc<FeeCache> {
        self.fees.clone()
    }

    pub fn with_feed_restart_delay(mut self, delay: Duration) -> Self {
        self.feed_restart_delay = delay;
        self
    }

    /// Run every network's schedules until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();

        for worker in &self.workers {
            tasks.spawn(fee_loop(worker.clone(), self.fees.clone(), self.fee_interval));
            tasks.spawn(sweep_loop(worker.clone(), self.sweep_interval));

            if self.primary_network == Some(worker.network) {
                info!("New blocks on {} trigger additional sweeps", worker.network);
                tasks.spawn(block_loop(
                    worker.clone(),
                    self.fees.clone(),
                    self.feed_restart_delay,
                ));
            }
        }
        info!(
            "Sweeping {} networks every {:?}",
            self.workers.len(),
            self.sweep_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Network task panicked: {}", e);
                        }
                    }
                }
            }
        }

        info!("Shutting down sweeper");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

async fn fee_loop(worker: Arc<NetworkWorker>, fees: Arc<FeeCache>, period: Duration) {
    worker.estimator.refresh(&fees).await;

    // Half a period out of phase with the sweep timer
    let mut ticker = interval_at(Instant::now() + period / 2, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        worker.estimator.refresh(&fees).await;
    }
}

async fn sweep_loop(worker: Arc<NetworkWorker>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        worker.sweeper.run_pass().await;
    }
}

async fn block_loop(worker: Arc<NetworkWorker>, fees: Arc<FeeCache>, restart_delay: Duration) {
    loop {
        let (sender, mut blocks) = mpsc::channel(16);
        let client = worker.client.clone();
        // Dropping the set aborts the feed along with this loop
        let mut feed = JoinSet::new();
        feed.spawn(async move { client.watch_blocks(sender).await });

        while let Some(mut number) = blocks.recv().await {
            // Only the newest of any backlog matters
            while let Ok(next) = blocks.try_recv() {
                number = next;
            }
            worker.on_block(number, &fees).await;
        }

        match feed.join_next().await {
            Some(Ok(Ok(()))) | None => warn!("Block feed for {} ended", worker.network),
            Some(Ok(Err(e))) => warn!("Block feed for {} failed: {:#}", worker.network, e),
            Some(Err(e)) => error!("Block feed task for {} died: {}", worker.network, e),
        }
        sleep(restart_delay).await;
        info!("Resubscribing to {} blocks", worker.network);
    }
}
