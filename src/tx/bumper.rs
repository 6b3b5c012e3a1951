//! Broadcasting attempts and replacing stuck ones at a higher fee

use super::{AttemptBuilder, AttemptState, NonceManager, Tx, TxAttempt};
use crate::chain::ChainClient;
use crate::error::{SendErrorKind, TxmError, TxmResult};
use crate::gas::{bump_dynamic_fee, bump_legacy_gas_price, BumpPolicy, GasEstimator, GasPrice};
use crate::metrics::{self, AttemptKind};
use crate::state::TxStore;

use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How the node answered a broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// Nonce already used or transaction already known; rely on receipts
    NonceConflict(String),
    /// Fee too low to enter the pool or to replace the pending attempt
    Underpriced(String),
    /// Permanent rejection such as insufficient funds or an invalid signature
    Rejected(String),
    /// Network trouble or an unrecognised error; retried on the next cycle
    Transient(String),
}

impl SendOutcome {
    fn from_error(error: &TxmError) -> Self {
        let message = error.to_string();
        match error.send_kind() {
            Some(SendErrorKind::NonceTooLow) | Some(SendErrorKind::AlreadyKnown) => {
                SendOutcome::NonceConflict(message)
            }
            Some(SendErrorKind::ReplacementUnderpriced) | Some(SendErrorKind::Underpriced) => {
                SendOutcome::Underpriced(message)
            }
            Some(_) if !error.is_retryable() => SendOutcome::Rejected(message),
            _ => SendOutcome::Transient(message),
        }
    }
}

pub struct GasBumper {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn TxStore>,
    estimator: Arc<GasEstimator>,
    builder: AttemptBuilder,
    nonces: Arc<NonceManager>,
    policy: BumpPolicy,
    /// Immediate re-bumps allowed after an underpriced response
    max_bump_retries: u32,
}

impl GasBumper {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn TxStore>,
        estimator: Arc<GasEstimator>,
        builder: AttemptBuilder,
        nonces: Arc<NonceManager>,
        policy: BumpPolicy,
        max_bump_retries: u32,
    ) -> Self {
        Self {
            client,
            store,
            estimator,
            builder,
            nonces,
            policy,
            max_bump_retries,
        }
    }

    /// Submit a signed attempt and classify the result
    pub async fn broadcast(&self, attempt: &TxAttempt) -> SendOutcome {
        let chain_id = self.client.chain_id();

        match self
            .client
            .send_raw_transaction(attempt.signed_raw_tx.clone())
            .await
        {
            Ok(hash) => {
                if hash != attempt.hash {
                    warn!(
                        "Node returned hash {:?} for attempt {:?}",
                        hash, attempt.hash
                    );
                }
                debug!("Broadcast attempt {:?}", attempt.hash);
                SendOutcome::Accepted
            }
            Err(e) => {
                if let Some(kind) = e.send_kind() {
                    metrics::record_send_error(chain_id, kind);
                }
                SendOutcome::from_error(&e)
            }
        }
    }

    /// Sign, persist and broadcast the first attempt of `tx`
    ///
    /// A permanent rejection fails the transaction, hands its nonce back to
    /// the allocator and returns `TxFailed`; every other answer leaves it
    /// pending for the confirmation sweep.
    pub async fn send_initial(&self, tx: &Tx, current_block: u64) -> TxmResult<TxAttempt> {
        let fee = self.estimator.current_fee().await;
        let attempt = self.builder.build(tx, fee, current_block).await?;
        self.store.add_attempt(&attempt).await?;
        metrics::record_attempt(self.client.chain_id(), AttemptKind::Initial);

        match self.broadcast(&attempt).await {
            SendOutcome::Accepted => Ok(attempt),
            SendOutcome::Underpriced(message) => {
                warn!(
                    "Tx {} underpriced at {:?}, bumping immediately: {}",
                    tx.id, attempt.gas_price, message
                );
                match self.bump(tx, &attempt, current_block).await {
                    Ok(bumped) => Ok(bumped),
                    Err(e) => {
                        warn!("Immediate bump of tx {} failed: {}", tx.id, e);
                        Ok(attempt)
                    }
                }
            }
            SendOutcome::NonceConflict(message) | SendOutcome::Transient(message) => {
                warn!(
                    "Tx {} (nonce {}) not accepted yet, will re-check: {}",
                    tx.id, tx.nonce, message
                );
                Ok(attempt)
            }
            SendOutcome::Rejected(reason) => {
                error!("Tx {} rejected by node: {}", tx.id, reason);
                self.store
                    .set_attempt_state(attempt.hash, AttemptState::Stale)
                    .await?;
                self.store.mark_failed(tx.id, &reason).await?;
                self.nonces.release(tx.from, tx.nonce).await;
                metrics::record_tx_failed(self.client.chain_id());
                Err(TxmError::TxFailed {
                    tx_id: tx.id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Replace `previous` with a higher-priced attempt at the same nonce
    ///
    /// The previous attempt is marked stale but stays queryable, since it can
    /// still be mined.
    pub async fn bump(
        &self,
        tx: &Tx,
        previous: &TxAttempt,
        current_block: u64,
    ) -> TxmResult<TxAttempt> {
        let mut previous = previous.clone();
        let mut retries = 0;

        loop {
            let fee = self.bumped_fee(&previous.gas_price).await?;
            let attempt = self.builder.build(tx, fee, current_block).await?;
            self.store.add_attempt(&attempt).await?;
            self.store
                .set_attempt_state(previous.hash, AttemptState::Stale)
                .await?;
            metrics::record_attempt(self.client.chain_id(), AttemptKind::Bump);

            info!(
                "Bumped tx {} (nonce {}) from {} to {} at block {}",
                tx.id,
                tx.nonce,
                previous.gas_price.max_price(),
                attempt.gas_price.max_price(),
                current_block
            );

            match self.broadcast(&attempt).await {
                SendOutcome::Underpriced(message) if retries < self.max_bump_retries => {
                    retries += 1;
                    warn!(
                        "Bumped attempt for tx {} still underpriced (retry {}/{}): {}",
                        tx.id, retries, self.max_bump_retries, message
                    );
                    previous = attempt;
                }
                SendOutcome::Underpriced(message) => {
                    warn!(
                        "Giving up immediate bumps for tx {} after {} retries: {}",
                        tx.id, retries, message
                    );
                    return Ok(attempt);
                }
                SendOutcome::Rejected(message) => {
                    // an earlier attempt may still be mined, so the tx stays open
                    warn!("Bumped attempt for tx {} rejected: {}", tx.id, message);
                    return Ok(attempt);
                }
                SendOutcome::NonceConflict(message) | SendOutcome::Transient(message) => {
                    debug!("Bumped attempt for tx {} not accepted: {}", tx.id, message);
                    return Ok(attempt);
                }
                SendOutcome::Accepted => return Ok(attempt),
            }
        }
    }

    async fn bumped_fee(&self, old: &GasPrice) -> TxmResult<GasPrice> {
        match old {
            GasPrice::Legacy(old_price) => {
                let estimate = self.estimator.get_gas_price().await;
                Ok(GasPrice::Legacy(bump_legacy_gas_price(
                    &self.policy,
                    estimate,
                    *old_price,
                )?))
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let (tip, fee_cap) = bump_dynamic_fee(
                    &self.policy,
                    self.estimator.get_tip_cap().await,
                    self.estimator.get_base_fee().await,
                    self.estimator.fee_cap_buffer_blocks(),
                    *max_priority_fee_per_gas,
                    *max_fee_per_gas,
                )?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: fee_cap,
                    max_priority_fee_per_gas: tip,
                })
            }
        }
    }
}
