//! HD account derivation.
//! Every enabled network gets the same `depth` accounts, m/44'/60'/0'/0/0 upward,
//! each signer bound to that network's chain id.

use crate::config::{derivation_path, EvmNetwork};
use crate::error::DerivationError;
use ethers::prelude::*;
use ethers::signers::coins_bip39::English;
use std::sync::Arc;
use tracing::info;

/// One derived account on one network. Immutable after derivation.
#[derive(Clone, Debug)]
pub struct DerivedAccount {
    pub network: &'static EvmNetwork,
    pub index: u32,
    pub derivation_path: String,
    pub address: Address,
    signer: LocalWallet,
}

impl DerivedAccount {
    /// Signer for this account, carrying the owning network's chain id.
    pub fn signer(&self) -> &LocalWallet {
        &self.signer
    }
}

/// Derived accounts per network, in network registry order and derivation index order.
#[derive(Clone, Debug, Default)]
pub struct WalletPool {
    entries: Vec<(&'static EvmNetwork, Arc<[DerivedAccount]>)>,
}

impl WalletPool {
    pub fn accounts(&self, network: &EvmNetwork) -> Option<Arc<[DerivedAccount]>> {
        self.entries
            .iter()
            .find(|(n, _)| *n == network)
            .map(|(_, accounts)| accounts.clone())
    }

    pub fn networks(&self) -> impl Iterator<Item = &'static EvmNetwork> + '_ {
        self.entries.iter().map(|(n, _)| *n)
    }
}

/// Derive the signing key at `path` from `phrase`.
pub fn derive_signer(phrase: &str, path: &str) -> Result<LocalWallet, DerivationError> {
    let fail = |reason: String| DerivationError::Derive {
        path: path.to_string(),
        reason,
    };
    MnemonicBuilder::<English>::default()
        .phrase(phrase)
        .derivation_path(path)
        .map_err(|e| fail(e.to_string()))?
        .build()
        .map_err(|e| fail(e.to_string()))
}

/// Derive `depth` accounts for each of `networks` from one seed phrase.
///
/// Keys are derived once per index and rebound per network, so an index has the same
/// address on every network.
pub fn derive_wallets(
    seed_phrase: &str,
    networks: &[&'static EvmNetwork],
    depth: u32,
) -> Result<WalletPool, DerivationError> {
    let phrase = seed_phrase.trim();
    if phrase.is_empty() {
        return Err(DerivationError::EmptySeed);
    }
    if depth == 0 {
        return Err(DerivationError::ZeroDepth);
    }

    let mut keys = Vec::with_capacity(depth as usize);
    for index in 0..depth {
        let path = derivation_path(index);
        let signer = derive_signer(phrase, &path)?;
        keys.push((index, path, signer));
    }

    let mut entries = Vec::with_capacity(networks.len());
    for &network in networks {
        let accounts: Vec<DerivedAccount> = keys
            .iter()
            .map(|(index, path, signer)| DerivedAccount {
                network,
                index: *index,
                derivation_path: path.clone(),
                address: signer.address(),
                signer: signer.clone().with_chain_id(network.chain_id),
            })
            .collect();
        entries.push((network, Arc::from(accounts)));
    }

    for (index, path, signer) in &keys {
        info!("Account {} ({}): {:?}", index, path, signer.address());
    }
    info!(
        "Derived {} accounts on each of {} networks",
        depth,
        entries.len()
    );

    Ok(WalletPool { entries })
}
