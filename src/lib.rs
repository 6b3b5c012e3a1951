//! Gas estimation and reliable transaction submission for an EVM oracle node
//!
//! The [`gas::GasEstimator`] keeps a block-history price estimate fresh, and
//! the [`tx::TransactionManager`] turns requests into signed, nonce-ordered
//! transactions that are bumped until they confirm.

pub mod chain;
pub mod config;
pub mod error;
pub mod gas;
pub mod keystore;
pub mod metrics;
pub mod state;
pub mod tx;

#[cfg(test)]
mod test_utils;
