//! Gas pricing: block-history estimation, replacement bumps and rollup DA prices

mod bump;
mod da;
mod estimator;

pub use bump::{bump_dynamic_fee, bump_legacy_gas_price, BumpPolicy};
pub use da::DataAvailabilityPriceSource;
pub use estimator::{calc_fee_cap, percentile, GasEstimator, GasEstimatorState};

use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// Fee offered by a single transaction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Highest price per gas this fee can ever pay
    pub fn max_price(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    pub fn fee_type(&self) -> &'static str {
        match self {
            GasPrice::Legacy(_) => "legacy",
            GasPrice::Eip1559 { .. } => "eip1559",
        }
    }
}

/// Convert a wei amount to a float for gauges, saturating on overflow
pub(crate) fn wei_to_f64(value: U256) -> f64 {
    if value > U256::from(u128::MAX) {
        f64::MAX
    } else {
        value.as_u128() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_price_and_fee_type() {
        let legacy = GasPrice::Legacy(U256::from(10));
        assert_eq!(legacy.max_price(), U256::from(10));
        assert_eq!(legacy.fee_type(), "legacy");

        let dynamic = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(50),
            max_priority_fee_per_gas: U256::from(2),
        };
        assert_eq!(dynamic.max_price(), U256::from(50));
        assert_eq!(dynamic.fee_type(), "eip1559");
    }
}
