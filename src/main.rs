use anyhow::Result;
use hd_sweeper::{config::SweepConfig, supervisor::Supervisor, wallet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = SweepConfig::from_env()?;
    info!(
        "Sweeping {} accounts per network to {:?}",
        config.depth, config.destination
    );

    let pool = wallet::derive_wallets(&config.mnemonic, &config.networks(), config.depth)?;
    let supervisor = Supervisor::connect(&config, &pool).await?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ctrl_c.cancel(),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    supervisor.run(shutdown).await;
    Ok(())
}
