//! Receipt polling, confirmation depth and stuck-attempt detection

use super::{GasBumper, Tx, TxAttempt, TxState};
use crate::chain::ChainClient;
use crate::error::TxmResult;
use crate::metrics;
use crate::state::TxStore;

use ethers::types::{Address, H256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Where an attempt stands relative to the chain head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// No receipt yet
    Unconfirmed,
    /// Included, but not yet `min_confirmations` deep
    Mined { block_number: u64 },
    Confirmed { block_number: u64 },
}

pub struct ConfirmationTracker {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn TxStore>,
    bumper: Arc<GasBumper>,
    account: Address,
    min_confirmations: u64,
    gas_bump_threshold: u64,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl ConfirmationTracker {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn TxStore>,
        bumper: Arc<GasBumper>,
        account: Address,
        min_confirmations: u64,
        gas_bump_threshold: u64,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            store,
            bumper,
            account,
            min_confirmations,
            gas_bump_threshold,
            poll_interval,
            shutdown,
        }
    }

    /// Look up the receipt of `attempt` and compare its depth to `current_block`
    pub async fn inspect_attempt(
        &self,
        attempt: &TxAttempt,
        current_block: u64,
    ) -> TxmResult<Confirmation> {
        let receipt = match self.client.get_transaction_receipt(attempt.hash).await? {
            Some(receipt) if !receipt.is_unconfirmed() => receipt,
            _ => return Ok(Confirmation::Unconfirmed),
        };

        let block_number = receipt.block_number.unwrap_or_default();
        if receipt.status == Some(0) {
            warn!(
                "Attempt {:?} reverted in block {}",
                attempt.hash, block_number
            );
        }

        let safe_at = block_number.saturating_add(self.min_confirmations);
        if current_block < safe_at {
            debug!(
                "Attempt {:?} mined in block {}, safe at {} (head {})",
                attempt.hash, block_number, safe_at, current_block
            );
            Ok(Confirmation::Mined { block_number })
        } else {
            Ok(Confirmation::Confirmed { block_number })
        }
    }

    fn is_stale(&self, attempt: &TxAttempt, current_block: u64) -> bool {
        self.gas_bump_threshold > 0
            && current_block.saturating_sub(attempt.sent_at) >= self.gas_bump_threshold
    }

    async fn evaluate(
        &self,
        tx: &Tx,
        attempt: &TxAttempt,
        is_live: bool,
        current_block: u64,
    ) -> TxmResult<Confirmation> {
        let confirmation = self.inspect_attempt(attempt, current_block).await?;

        match confirmation {
            Confirmation::Confirmed { block_number } => {
                self.store.mark_confirmed(tx.id, attempt.hash).await?;
                metrics::record_tx_confirmed(
                    self.client.chain_id(),
                    block_number.saturating_sub(attempt.sent_at),
                );
                info!(
                    "Tx {} (nonce {}) confirmed by {:?} in block {}",
                    tx.id, tx.nonce, attempt.hash, block_number
                );
            }
            Confirmation::Unconfirmed if is_live && self.is_stale(attempt, current_block) => {
                debug!(
                    "Attempt {:?} unmined since block {}, bumping at {}",
                    attempt.hash, attempt.sent_at, current_block
                );
                if let Err(e) = self.bumper.bump(tx, attempt, current_block).await {
                    warn!(
                        "Failed to bump tx {}, retrying next cycle: {}",
                        tx.id, e
                    );
                }
            }
            _ => {}
        }

        Ok(confirmation)
    }

    /// Check one attempt; bumps it if it is the live attempt and stuck
    pub async fn check_attempt(
        &self,
        tx: &Tx,
        attempt: &TxAttempt,
        is_live: bool,
        current_block: u64,
    ) -> TxmResult<bool> {
        let confirmation = self.evaluate(tx, attempt, is_live, current_block).await?;
        Ok(matches!(confirmation, Confirmation::Confirmed { .. }))
    }

    /// Walk all attempts of `tx` in submission order
    ///
    /// Only the most recent attempt can be bumped, and only when no earlier
    /// attempt is already mined and, if `requested` is set, it is the attempt
    /// the caller asked about.
    pub async fn process_tx(
        &self,
        tx: &Tx,
        requested: Option<H256>,
        current_block: u64,
    ) -> TxmResult<bool> {
        match tx.state {
            TxState::Confirmed => return Ok(true),
            TxState::Failed => return Ok(false),
            TxState::Unconfirmed => {}
        }

        let attempts = self.store.attempts_for(tx.id).await?;
        if attempts.is_empty() {
            warn!(
                "Tx {} (nonce {}) has no attempts, sending first attempt",
                tx.id, tx.nonce
            );
            self.bumper.send_initial(tx, current_block).await?;
            return Ok(false);
        }

        let latest = attempts.len() - 1;
        let mut mined = false;
        for (i, attempt) in attempts.iter().enumerate() {
            let is_live = i == latest && !mined && requested.map_or(true, |h| h == attempt.hash);

            match self.evaluate(tx, attempt, is_live, current_block).await? {
                Confirmation::Confirmed { .. } => return Ok(true),
                Confirmation::Mined { .. } => mined = true,
                Confirmation::Unconfirmed => {}
            }
        }

        Ok(false)
    }

    /// Check every unconfirmed transaction of the account once
    ///
    /// Per-transaction failures are logged and left for the next sweep.
    pub async fn sweep(&self) -> TxmResult<usize> {
        let current_block = self.client.block_number().await?;
        let txes = self.store.unconfirmed_txs(self.account).await?;
        let mut confirmed = 0;

        for tx in &txes {
            match self.process_tx(tx, None, current_block).await {
                Ok(true) => confirmed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to check tx {} (nonce {}): {}", tx.id, tx.nonce, e),
            }
        }

        if !txes.is_empty() {
            debug!(
                "Sweep at block {}: {} unconfirmed, {} confirmed",
                current_block,
                txes.len(),
                confirmed
            );
        }
        Ok(confirmed)
    }

    /// Spawn the periodic confirmation sweep
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!(
                "Confirmation tracker started for {:?} (interval {:?})",
                tracker.account, tracker.poll_interval
            );
            let mut interval = tokio::time::interval(tracker.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = tracker.sweep().await {
                            warn!("Confirmation sweep skipped: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            info!("Confirmation tracker stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}
