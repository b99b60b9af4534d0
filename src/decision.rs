//! Whether a balance is worth sweeping, and for how much.

use crate::fees::FeeEstimate;
use ethers::types::{Address, U256};

/// Gas used by a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweepPolicy {
    /// Gas limit of the sweep transfer.
    pub transfer_gas: u64,
    /// Estimates priced below this per gas are not trusted enough to sweep with.
    pub min_fee_per_gas: U256,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            transfer_gas: TRANSFER_GAS,
            min_fee_per_gas: U256::one(),
        }
    }
}

impl SweepPolicy {
    /// Worst-case cost of the transfer under `fee`, saturating on overflow.
    pub fn transfer_cost(&self, fee: &FeeEstimate) -> U256 {
        U256::from(self.transfer_gas).saturating_mul(fee.per_gas_ceiling())
    }
}

/// Outcome of a successful sweep decision for one account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepAttempt {
    pub index: u32,
    pub address: Address,
    pub balance: U256,
    pub transfer_cost: U256,
    /// Always `balance - transfer_cost`.
    pub amount: U256,
}

/// Amount to sweep from `balance`, or `None` when the balance does not strictly exceed
/// the transfer cost or the estimate is below the policy's fee floor.
pub fn decide(balance: U256, fee: &FeeEstimate, policy: &SweepPolicy) -> Option<(U256, U256)> {
    if fee.per_gas_ceiling() < policy.min_fee_per_gas || fee.per_gas_ceiling().is_zero() {
        return None;
    }
    let transfer_cost = policy.transfer_cost(fee);
    if balance > transfer_cost {
        Some((balance - transfer_cost, transfer_cost))
    } else {
        None
    }
}

/// `decide` for a specific account, keeping the account identity alongside the numbers.
pub fn decide_for(
    index: u32,
    address: Address,
    balance: U256,
    fee: &FeeEstimate,
    policy: &SweepPolicy,
) -> Option<SweepAttempt> {
    decide(balance, fee, policy).map(|(amount, transfer_cost)| SweepAttempt {
        index,
        address,
        balance,
        transfer_cost,
        amount,
    })
}
