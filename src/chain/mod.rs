//! Chain module - the narrow RPC surface the transaction manager depends on
//!
//! This module provides:
//! - The `ChainClient` trait used by the estimator, tracker and manager
//! - Plain block/receipt types decoupled from the ethers wire types
//! - An ethers-backed client with multi-RPC failover

pub mod provider;

pub use provider::EthersChainClient;

use crate::error::TxmResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

/// A transaction as seen inside a fetched block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    /// EIP-2718 envelope type (0 legacy, 1 access list, 2 dynamic fee)
    pub tx_type: u8,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub gas_limit: u64,
}

impl BlockTransaction {
    pub fn legacy(gas_price: U256) -> Self {
        Self {
            tx_type: 0,
            gas_price: Some(gas_price),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            gas_limit: 21_000,
        }
    }

    pub fn dynamic(max_fee_per_gas: U256, max_priority_fee_per_gas: U256) -> Self {
        Self {
            tx_type: 2,
            gas_price: None,
            max_fee_per_gas: Some(max_fee_per_gas),
            max_priority_fee_per_gas: Some(max_priority_fee_per_gas),
            gas_limit: 21_000,
        }
    }

    /// Price per gas this transaction actually paid in a block with `base_fee`
    ///
    /// Returns `None` for transactions that say nothing about the market
    /// price: zero gas limit, missing price fields, or a tip above the fee cap.
    pub fn effective_gas_price(&self, base_fee: Option<U256>) -> Option<U256> {
        if self.gas_limit == 0 {
            return None;
        }

        let price = if self.tx_type == 2 {
            match self.gas_price {
                Some(price) => price,
                None => {
                    let fee_cap = self.max_fee_per_gas?;
                    let tip = self.max_priority_fee_per_gas?;
                    if tip > fee_cap {
                        return None;
                    }
                    match base_fee {
                        Some(base_fee) => std::cmp::min(tip, fee_cap.saturating_sub(base_fee))
                            .saturating_add(base_fee),
                        None => fee_cap,
                    }
                }
            }
        } else {
            self.gas_price?
        };

        if price.is_zero() {
            None
        } else {
            Some(price)
        }
    }

    /// Tip cap this transaction offered the block producer
    pub fn effective_tip(&self, base_fee: Option<U256>) -> Option<U256> {
        if self.gas_limit == 0 {
            return None;
        }

        let tip = if self.tx_type == 2 {
            let tip = self.max_priority_fee_per_gas?;
            if let Some(fee_cap) = self.max_fee_per_gas {
                if tip > fee_cap {
                    return None;
                }
            }
            tip
        } else {
            match base_fee {
                Some(base_fee) => self.gas_price?.saturating_sub(base_fee),
                None => self.gas_price?,
            }
        };

        if tip.is_zero() {
            None
        } else {
            Some(tip)
        }
    }
}

/// A block with the fields the gas estimator consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub hash: H256,
    pub base_fee_per_gas: Option<U256>,
    pub transactions: Vec<BlockTransaction>,
}

/// Transaction receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub block_hash: Option<H256>,
    /// 1 for success, 0 for revert
    pub status: Option<u64>,
}

impl Receipt {
    /// Receipts without a block are still pending
    pub fn is_unconfirmed(&self) -> bool {
        self.block_number.is_none() || self.block_hash.is_none()
    }
}

/// RPC operations required from the connected node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Latest block number reported by the node
    async fn block_number(&self) -> TxmResult<u64>;

    /// Pending transaction count for `address`
    async fn get_transaction_count(&self, address: Address) -> TxmResult<u64>;

    async fn send_raw_transaction(&self, raw: Bytes) -> TxmResult<H256>;

    async fn get_transaction_receipt(&self, hash: H256) -> TxmResult<Option<Receipt>>;

    /// Read-only contract call at the latest block
    async fn call(&self, to: Address, data: Bytes) -> TxmResult<Bytes>;

    async fn get_balance(&self, address: Address) -> TxmResult<U256>;

    /// Fetch full blocks by number; every number must resolve to a block
    async fn fetch_blocks(&self, numbers: &[u64]) -> TxmResult<Vec<Block>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn test_effective_price_dynamic_fee() {
        let tx = BlockTransaction::dynamic(gwei(100), gwei(2));
        assert_eq!(tx.effective_gas_price(Some(gwei(30))), Some(gwei(32)));
        assert_eq!(tx.effective_tip(Some(gwei(30))), Some(gwei(2)));

        // base fee close to the cap squeezes what was actually paid
        assert_eq!(tx.effective_gas_price(Some(gwei(99))), Some(gwei(100)));

        let mut reported = tx.clone();
        reported.gas_price = Some(gwei(35));
        assert_eq!(reported.effective_gas_price(Some(gwei(30))), Some(gwei(35)));
    }

    #[test]
    fn test_effective_price_legacy() {
        let tx = BlockTransaction::legacy(gwei(40));
        assert_eq!(tx.effective_gas_price(Some(gwei(30))), Some(gwei(40)));
        assert_eq!(tx.effective_tip(Some(gwei(30))), Some(gwei(10)));
        assert_eq!(tx.effective_tip(None), Some(gwei(40)));
    }

    #[test]
    fn test_invalid_transactions_are_ignored() {
        let tx = BlockTransaction::legacy(U256::zero());
        assert_eq!(tx.effective_gas_price(None), None);

        let mut no_gas = BlockTransaction::legacy(gwei(10));
        no_gas.gas_limit = 0;
        assert_eq!(no_gas.effective_gas_price(None), None);

        let inverted = BlockTransaction::dynamic(gwei(1), gwei(2));
        assert_eq!(inverted.effective_gas_price(Some(gwei(1))), None);
        assert_eq!(inverted.effective_tip(Some(gwei(1))), None);
    }

    #[test]
    fn test_receipt_without_block_is_unconfirmed() {
        let receipt = Receipt {
            tx_hash: H256::repeat_byte(1),
            block_number: None,
            block_hash: None,
            status: None,
        };
        assert!(receipt.is_unconfirmed());
    }
}
