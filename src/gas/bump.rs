//! Replacement fee arithmetic

use super::calc_fee_cap;
use crate::config::{GasEstimatorConfig, TxmConfig};
use crate::error::{TxmError, TxmResult};

use ethers::types::U256;

/// Limits applied when replacing a stuck attempt
#[derive(Debug, Clone)]
pub struct BumpPolicy {
    /// Minimum increase over the previous fee the node accepts
    pub bump_percent: u16,
    pub bump_wei: U256,
    pub price_max: U256,
}

impl BumpPolicy {
    pub fn from_config(txm: &TxmConfig, gas: &GasEstimatorConfig) -> Self {
        Self {
            bump_percent: txm.gas_bump_percent,
            bump_wei: txm.gas_bump_wei(),
            price_max: gas.price_max(),
        }
    }

    /// Smallest value the node will accept as a replacement for `old`
    fn min_replacement(&self, old: U256) -> U256 {
        let scaled = old.saturating_mul(U256::from(100 + u64::from(self.bump_percent)));
        let by_percent = (scaled + U256::from(99)) / U256::from(100);
        std::cmp::max(by_percent, old.saturating_add(U256::one()))
    }

    fn bump(&self, current_estimate: U256, old: U256, what: &str) -> TxmResult<U256> {
        let min_required = self.min_replacement(old);
        if min_required > self.price_max {
            return Err(TxmError::GasBump(format!(
                "bumped {} would be {} but the maximum is {}",
                what, min_required, self.price_max
            )));
        }

        let bumped = std::cmp::max(
            std::cmp::max(old.saturating_add(self.bump_wei), min_required),
            current_estimate,
        );
        Ok(std::cmp::min(bumped, self.price_max))
    }
}

/// New legacy gas price for a replacement attempt
pub fn bump_legacy_gas_price(
    policy: &BumpPolicy,
    current_estimate: U256,
    old: U256,
) -> TxmResult<U256> {
    policy.bump(current_estimate, old, "gas price")
}

/// New `(tip_cap, fee_cap)` for a replacement dynamic fee attempt
///
/// Both values are bumped independently; the fee cap additionally covers the
/// bumped tip over `buffer_blocks` of base fee growth.
pub fn bump_dynamic_fee(
    policy: &BumpPolicy,
    current_tip: U256,
    base_fee: Option<U256>,
    buffer_blocks: u16,
    old_tip: U256,
    old_fee_cap: U256,
) -> TxmResult<(U256, U256)> {
    let tip = policy.bump(current_tip, old_tip, "tip cap")?;

    let fresh_fee_cap = base_fee
        .map(|base_fee| calc_fee_cap(base_fee, buffer_blocks, tip, policy.price_max))
        .unwrap_or_default();
    let fee_cap = policy.bump(fresh_fee_cap, old_fee_cap, "fee cap")?;

    Ok((tip, std::cmp::max(fee_cap, tip)))
}
