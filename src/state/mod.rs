//! State management for transactions and their attempts
//!
//! Handles:
//! - Durable Tx and TxAttempt records (PostgreSQL)
//! - An in-memory store for tests and database-less runs
//! - Monotonic attempt state transitions

mod memory;
mod postgres;

pub use memory::InMemoryTxStore;
pub use postgres::PgTxStore;

use crate::error::{TxmError, TxmResult};
use crate::tx::{AttemptState, Tx, TxAttempt};

use async_trait::async_trait;
use ethers::types::{Address, H256};
use uuid::Uuid;

/// Persistence for transactions and attempts
#[async_trait]
pub trait TxStore: Send + Sync {
    /// Insert or replace a transaction
    async fn save_tx(&self, tx: &Tx) -> TxmResult<()>;

    async fn find_tx(&self, id: Uuid) -> TxmResult<Option<Tx>>;

    /// Append an attempt; re-adding a known hash is a no-op
    async fn add_attempt(&self, attempt: &TxAttempt) -> TxmResult<()>;

    /// Attempts of a transaction in submission order
    async fn attempts_for(&self, tx_id: Uuid) -> TxmResult<Vec<TxAttempt>>;

    async fn find_attempt(&self, hash: H256) -> TxmResult<Option<TxAttempt>>;

    async fn set_attempt_state(&self, hash: H256, state: AttemptState) -> TxmResult<()>;

    /// Confirm a transaction through one of its attempts; other pending attempts go stale
    async fn mark_confirmed(&self, tx_id: Uuid, hash: H256) -> TxmResult<()>;

    async fn mark_failed(&self, tx_id: Uuid, reason: &str) -> TxmResult<()>;

    /// Unconfirmed transactions sent from `from`, nonce ascending
    async fn unconfirmed_txs(&self, from: Address) -> TxmResult<Vec<Tx>>;

    /// Nonces at or above `min_nonce` held by non-failed transactions from
    /// `from`, ascending
    async fn live_nonces(&self, from: Address, min_nonce: u64) -> TxmResult<Vec<u64>>;
}

fn check_transition(current: AttemptState, next: AttemptState) -> TxmResult<()> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(TxmError::InvalidStateTransition {
            from: current.to_string(),
            to: next.to_string(),
        })
    }
}
