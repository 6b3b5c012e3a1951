//! In-memory transaction store

use super::{check_transition, TxStore};
use crate::error::{TxmError, TxmResult};
use crate::tx::{AttemptState, Tx, TxAttempt, TxState};

use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    txes: HashMap<Uuid, Tx>,
    /// Append-only, in submission order
    attempts: Vec<TxAttempt>,
}

/// Store that keeps everything in process memory
#[derive(Default)]
pub struct InMemoryTxStore {
    inner: RwLock<Inner>,
}

impl InMemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TxStore for InMemoryTxStore {
    async fn save_tx(&self, tx: &Tx) -> TxmResult<()> {
        self.inner.write().await.txes.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn find_tx(&self, id: Uuid) -> TxmResult<Option<Tx>> {
        Ok(self.inner.read().await.txes.get(&id).cloned())
    }

    async fn add_attempt(&self, attempt: &TxAttempt) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.txes.contains_key(&attempt.tx_id) {
            return Err(TxmError::TransactionNotFound {
                tx_id: attempt.tx_id.to_string(),
            });
        }
        if inner.attempts.iter().all(|a| a.hash != attempt.hash) {
            inner.attempts.push(attempt.clone());
        }
        Ok(())
    }

    async fn attempts_for(&self, tx_id: Uuid) -> TxmResult<Vec<TxAttempt>> {
        Ok(self
            .inner
            .read()
            .await
            .attempts
            .iter()
            .filter(|a| a.tx_id == tx_id)
            .cloned()
            .collect())
    }

    async fn find_attempt(&self, hash: H256) -> TxmResult<Option<TxAttempt>> {
        Ok(self
            .inner
            .read()
            .await
            .attempts
            .iter()
            .find(|a| a.hash == hash)
            .cloned())
    }

    async fn set_attempt_state(&self, hash: H256, state: AttemptState) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        let attempt = inner
            .attempts
            .iter_mut()
            .find(|a| a.hash == hash)
            .ok_or_else(|| TxmError::AttemptNotFound {
                hash: format!("{:?}", hash),
            })?;

        check_transition(attempt.state, state)?;
        attempt.state = state;
        Ok(())
    }

    async fn mark_confirmed(&self, tx_id: Uuid, hash: H256) -> TxmResult<()> {
        let mut inner = self.inner.write().await;

        let position = inner
            .attempts
            .iter()
            .position(|a| a.hash == hash && a.tx_id == tx_id)
            .ok_or_else(|| TxmError::AttemptNotFound {
                hash: format!("{:?}", hash),
            })?;
        check_transition(inner.attempts[position].state, AttemptState::Confirmed)?;

        let tx = inner
            .txes
            .get_mut(&tx_id)
            .ok_or_else(|| TxmError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })?;
        tx.state = TxState::Confirmed;
        tx.confirmed_hash = Some(hash);

        for attempt in inner.attempts.iter_mut().filter(|a| a.tx_id == tx_id) {
            if attempt.hash == hash {
                attempt.state = AttemptState::Confirmed;
            } else if attempt.state == AttemptState::Pending {
                attempt.state = AttemptState::Stale;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, tx_id: Uuid, reason: &str) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        let tx = inner
            .txes
            .get_mut(&tx_id)
            .ok_or_else(|| TxmError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })?;
        tx.state = TxState::Failed;
        tx.error = Some(reason.to_string());
        Ok(())
    }

    async fn unconfirmed_txs(&self, from: Address) -> TxmResult<Vec<Tx>> {
        let mut txes: Vec<Tx> = self
            .inner
            .read()
            .await
            .txes
            .values()
            .filter(|tx| tx.from == from && tx.state == TxState::Unconfirmed)
            .cloned()
            .collect();
        txes.sort_by_key(|tx| tx.nonce);
        Ok(txes)
    }

    async fn live_nonces(&self, from: Address, min_nonce: u64) -> TxmResult<Vec<u64>> {
        let mut nonces: Vec<u64> = self
            .inner
            .read()
            .await
            .txes
            .values()
            .filter(|tx| tx.from == from && tx.state != TxState::Failed && tx.nonce >= min_nonce)
            .map(|tx| tx.nonce)
            .collect();
        nonces.sort_unstable();
        nonces.dedup();
        Ok(nonces)
    }
}
