//! Transaction manager: nonce allocation, submission and confirmation entry points

use super::{
    AttemptBuilder, ConfirmationTracker, GasBumper, NonceManager, Tx, TxAttempt, TxRequest,
    TxState,
};
use crate::chain::ChainClient;
use crate::config::TxmConfig;
use crate::error::{TxmError, TxmResult};
use crate::gas::{BumpPolicy, GasEstimator};
use crate::keystore::{Account, KeyStore};
use crate::metrics;
use crate::state::TxStore;

use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Turns requests into durable, eventually confirmed transactions
pub struct TransactionManager {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn TxStore>,
    keystore: Arc<dyn KeyStore>,
    nonces: Arc<NonceManager>,
    bumper: Arc<GasBumper>,
    tracker: Arc<ConfirmationTracker>,
    gas_limit_default: u64,
}

impl TransactionManager {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn TxStore>,
        keystore: Arc<dyn KeyStore>,
        estimator: Arc<GasEstimator>,
        config: &TxmConfig,
    ) -> Self {
        let builder = AttemptBuilder::new(keystore.clone(), client.chain_id());
        let nonces = Arc::new(NonceManager::new());
        let bumper = Arc::new(GasBumper::new(
            client.clone(),
            store.clone(),
            estimator.clone(),
            builder,
            nonces.clone(),
            BumpPolicy::from_config(config, estimator.config()),
            config.max_bump_retries,
        ));
        let tracker = Arc::new(ConfirmationTracker::new(
            client.clone(),
            store.clone(),
            bumper.clone(),
            keystore.account().address,
            config.min_confirmations,
            config.gas_bump_threshold,
            Duration::from_millis(config.poll_interval_ms.max(1)),
        ));

        Self {
            client,
            store,
            keystore,
            nonces,
            bumper,
            tracker,
            gas_limit_default: config.gas_limit_default,
        }
    }

    pub fn account(&self) -> Account {
        self.keystore.account()
    }

    pub fn tracker(&self) -> Arc<ConfirmationTracker> {
        self.tracker.clone()
    }

    /// Create and broadcast a zero-value transaction to `to`
    pub async fn create_tx(&self, to: Address, data: Bytes) -> TxmResult<Tx> {
        self.create_tx_with(TxRequest::new(to, data)).await
    }

    /// Create, persist and broadcast a transaction
    ///
    /// Only a permanent rejection of the first broadcast is returned as an
    /// error, and its nonce goes back to the allocator; anything else leaves
    /// the transaction for the confirmation sweep.
    pub async fn create_tx_with(&self, request: TxRequest) -> TxmResult<Tx> {
        let from = self.keystore.account().address;
        let current_block = self.client.block_number().await?;

        let nonce = self
            .nonces
            .next_nonce(from, self.client.as_ref(), self.store.as_ref())
            .await?;
        let gas_limit = request.gas_limit.unwrap_or(self.gas_limit_default);
        let tx = Tx::new(from, request, gas_limit, nonce);

        if let Err(e) = self.store.save_tx(&tx).await {
            self.nonces.release(from, nonce).await;
            return Err(e);
        }
        metrics::record_tx_created(self.client.chain_id());
        info!(
            "Created tx {} to {:?} with nonce {} at block {}",
            tx.id, tx.to, nonce, current_block
        );

        match self.bumper.send_initial(&tx, current_block).await {
            Ok(_) => Ok(tx),
            Err(e @ TxmError::TxFailed { .. }) => Err(e),
            Err(e) => {
                warn!(
                    "First attempt for tx {} not sent, the confirmation sweep will retry: {}",
                    tx.id, e
                );
                Ok(tx)
            }
        }
    }

    /// Whether the transaction owning attempt `hash` is confirmed
    ///
    /// Bumps the transaction when `hash` is its latest attempt and it has
    /// been stuck for the bump threshold. Pending is `Ok(false)`.
    pub async fn ensure_tx_confirmed(&self, hash: H256) -> TxmResult<bool> {
        let current_block = self.client.block_number().await?;

        let attempt = self
            .store
            .find_attempt(hash)
            .await?
            .ok_or_else(|| TxmError::AttemptNotFound {
                hash: format!("{:?}", hash),
            })?;
        let tx = self
            .store
            .find_tx(attempt.tx_id)
            .await?
            .ok_or_else(|| TxmError::TransactionNotFound {
                tx_id: attempt.tx_id.to_string(),
            })?;

        if tx.state == TxState::Failed {
            return Err(TxmError::TxFailed {
                tx_id: tx.id.to_string(),
                reason: tx.error.unwrap_or_default(),
            });
        }

        self.tracker.process_tx(&tx, Some(hash), current_block).await
    }

    pub async fn get_tx(&self, id: Uuid) -> TxmResult<Option<Tx>> {
        self.store.find_tx(id).await
    }

    /// Attempts of a transaction in submission order
    pub async fn attempts(&self, id: Uuid) -> TxmResult<Vec<TxAttempt>> {
        self.store.attempts_for(id).await
    }

    /// Balance of the signing account
    pub async fn balance(&self) -> TxmResult<U256> {
        let balance = self.client.get_balance(self.account().address).await?;
        metrics::record_wallet_balance(self.client.chain_id(), balance);
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GasEstimatorConfig;
    use crate::gas::GasPrice;
    use crate::keystore::WalletKeyStore;
    use crate::state::InMemoryTxStore;
    use crate::test_utils::{FakeChain, TEST_KEY};
    use crate::tx::{AttemptState, Confirmation};
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        chain: Arc<FakeChain>,
        store: Arc<InMemoryTxStore>,
        manager: Arc<TransactionManager>,
    }

    fn txm_config(gas_bump_threshold: u64, min_confirmations: u64) -> TxmConfig {
        TxmConfig {
            min_confirmations,
            gas_bump_threshold,
            gas_bump_wei: 5_000_000_000,
            gas_bump_percent: 20,
            gas_limit_default: 100_000,
            max_bump_retries: 3,
            poll_interval_ms: 10,
        }
    }

    fn manager_over(
        chain: Arc<FakeChain>,
        store: Arc<InMemoryTxStore>,
        gas_bump_threshold: u64,
        min_confirmations: u64,
    ) -> Arc<TransactionManager> {
        let keystore = Arc::new(WalletKeyStore::new(TEST_KEY.parse().unwrap()));
        let estimator = Arc::new(GasEstimator::new(
            chain.clone(),
            GasEstimatorConfig::default(),
            gas_bump_threshold,
            None,
        ));
        Arc::new(TransactionManager::new(
            chain,
            store,
            keystore,
            estimator,
            &txm_config(gas_bump_threshold, min_confirmations),
        ))
    }

    fn harness(head: u64, gas_bump_threshold: u64, min_confirmations: u64) -> Harness {
        let chain = Arc::new(FakeChain::new(10, head));
        let store = Arc::new(InMemoryTxStore::new());
        let manager = manager_over(
            chain.clone(),
            store.clone(),
            gas_bump_threshold,
            min_confirmations,
        );

        Harness {
            chain,
            store,
            manager,
        }
    }

    fn target() -> Address {
        Address::repeat_byte(0x42)
    }

    fn payload() -> Bytes {
        Bytes::from(vec![0x01, 0x02])
    }

    async fn first_hash(h: &Harness, tx: &Tx) -> H256 {
        h.manager.attempts(tx.id).await.unwrap()[0].hash
    }

    #[tokio::test]
    async fn test_end_to_end_bump_then_confirm() {
        let h = harness(23456, 12, 0);
        let tx = h.manager.create_tx(target(), payload()).await.unwrap();
        let hash = first_hash(&h, &tx).await;
        assert_eq!(h.chain.sent_count(), 1);

        h.chain.set_head(23467);
        assert!(!h.manager.ensure_tx_confirmed(hash).await.unwrap());
        assert_eq!(h.manager.attempts(tx.id).await.unwrap().len(), 1);

        h.chain.set_head(23468);
        assert!(!h.manager.ensure_tx_confirmed(hash).await.unwrap());
        let attempts = h.manager.attempts(tx.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].sent_at, 23468);

        h.chain.mine(hash, 23468);
        assert!(h.manager.ensure_tx_confirmed(hash).await.unwrap());

        let stored = h.manager.get_tx(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TxState::Confirmed);
        assert_eq!(stored.confirmed_hash, Some(hash));
    }

    #[tokio::test]
    async fn test_bump_happens_exactly_at_threshold() {
        let h = harness(100, 12, 1);
        let tx = h.manager.create_tx(target(), payload()).await.unwrap();
        let hash = first_hash(&h, &tx).await;

        h.chain.set_head(111);
        h.manager.ensure_tx_confirmed(hash).await.unwrap();
        assert_eq!(h.manager.attempts(tx.id).await.unwrap().len(), 1);

        h.chain.set_head(112);
        h.manager.ensure_tx_confirmed(hash).await.unwrap();
        let attempts = h.manager.attempts(tx.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].gas_price.max_price() > attempts[0].gas_price.max_price());
        assert_eq!(attempts[0].state, AttemptState::Stale);
        assert_eq!(attempts[1].state, AttemptState::Pending);
        assert_eq!(h.chain.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_confirmation_requires_min_confirmations() {
        let h = harness(190, 0, 3);
        let tx = h.manager.create_tx(target(), payload()).await.unwrap();
        let hash = first_hash(&h, &tx).await;
        h.chain.mine(hash, 200);

        h.chain.set_head(202);
        assert!(!h.manager.ensure_tx_confirmed(hash).await.unwrap());

        h.chain.set_head(203);
        assert!(h.manager.ensure_tx_confirmed(hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_recheck_is_idempotent() {
        let h = harness(100, 12, 1);
        let tx = h.manager.create_tx(target(), payload()).await.unwrap();
        let hash = first_hash(&h, &tx).await;
        h.chain.set_head(112);

        let first = h.manager.ensure_tx_confirmed(hash).await.unwrap();
        let attempts_after_first = h.manager.attempts(tx.id).await.unwrap().len();
        let second = h.manager.ensure_tx_confirmed(hash).await.unwrap();
        let attempts_after_second = h.manager.attempts(tx.id).await.unwrap().len();

        assert_eq!(first, second);
        assert_eq!(attempts_after_first, attempts_after_second);
    }

    #[tokio::test]
    async fn test_mined_attempt_blocks_bumping() {
        let h = harness(100, 12, 10);
        let tx = h.manager.create_tx(target(), payload()).await.unwrap();
        let hash = first_hash(&h, &tx).await;
        h.chain.mine(hash, 105);

        h.chain.set_head(112);
        assert!(!h.manager.ensure_tx_confirmed(hash).await.unwrap());
        assert_eq!(h.manager.attempts(tx.id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_tx_nonces_are_contiguous() {
        let h = harness(500, 12, 1);
        let from = h.manager.account().address;
        h.chain.set_nonce(from, 7);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let manager = h.manager.clone();
                tokio::spawn(async move { manager.create_tx(target(), payload()).await.unwrap() })
            })
            .collect();

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap().nonce);
        }
        nonces.sort_unstable();

        assert_eq!(nonces, (7..27).collect::<Vec<u64>>());
        assert_eq!(h.chain.nonce_queries(), 1);
    }

    #[tokio::test]
    async fn test_permanent_rejection_fails_tx_and_frees_nonce() {
        let h = harness(100, 12, 1);
        h.chain.push_send_error("insufficient funds for gas * price + value");

        let err = assert_err!(h.manager.create_tx(target(), payload()).await);
        let tx_id = match err {
            TxmError::TxFailed { tx_id, .. } => tx_id.parse::<Uuid>().unwrap(),
            other => panic!("unexpected error: {}", other),
        };

        let failed = h.manager.get_tx(tx_id).await.unwrap().unwrap();
        assert_eq!(failed.state, TxState::Failed);
        assert!(failed.error.unwrap().contains("insufficient funds"));

        let hash = h.manager.attempts(tx_id).await.unwrap()[0].hash;
        assert!(matches!(
            h.manager.ensure_tx_confirmed(hash).await,
            Err(TxmError::TxFailed { .. })
        ));

        let next = h.manager.create_tx(target(), payload()).await.unwrap();
        assert_eq!(next.nonce, failed.nonce);
    }

    #[tokio::test]
    async fn test_transient_send_error_keeps_pending_attempt() {
        let h = harness(100, 12, 1);
        h.chain.push_send_error("connection reset by peer");

        let tx = assert_ok!(h.manager.create_tx(target(), payload()).await);
        let attempts = h.manager.attempts(tx.id).await.unwrap();

        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].state, AttemptState::Pending);
        assert_eq!(h.chain.sent_count(), 0);
        assert_eq!(h.store.unconfirmed_txs(tx.from).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nonce_too_low_on_create_stays_pending() {
        let h = harness(100, 12, 1);
        h.chain.push_send_error("nonce too low");

        let tx = assert_ok!(h.manager.create_tx(target(), payload()).await);
        let stored = h.manager.get_tx(tx.id).await.unwrap().unwrap();

        assert_eq!(stored.state, TxState::Unconfirmed);
        assert_eq!(h.manager.attempts(tx.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_underpriced_create_bumps_immediately() {
        let h = harness(100, 12, 1);
        h.chain.push_send_error("transaction underpriced");

        let tx = h.manager.create_tx(target(), payload()).await.unwrap();
        let attempts = h.manager.attempts(tx.id).await.unwrap();

        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].gas_price.max_price() > attempts[0].gas_price.max_price());
        assert_eq!(h.chain.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_replacement_underpriced_rebumps() {
        let h = harness(100, 12, 1);
        let tx = h.manager.create_tx(target(), payload()).await.unwrap();
        let hash = first_hash(&h, &tx).await;

        h.chain.set_head(112);
        h.chain.push_send_error("replacement transaction underpriced");
        h.manager.ensure_tx_confirmed(hash).await.unwrap();

        let attempts = h.manager.attempts(tx.id).await.unwrap();
        assert_eq!(attempts.len(), 3);
        let prices: Vec<U256> = attempts.iter().map(|a| a.gas_price.max_price()).collect();
        assert!(prices[0] < prices[1] && prices[1] < prices[2]);
        assert_eq!(
            attempts[0].gas_price,
            GasPrice::Legacy(GasEstimatorConfig::default().price_default())
        );
    }

    #[tokio::test]
    async fn test_check_attempt_bumps_only_live_attempts() {
        let h = harness(100, 12, 1);
        let tx = h.manager.create_tx(target(), payload()).await.unwrap();
        let attempt = h.manager.attempts(tx.id).await.unwrap().remove(0);
        let tracker = h.manager.tracker();

        assert!(!tracker.check_attempt(&tx, &attempt, false, 112).await.unwrap());
        assert_eq!(h.manager.attempts(tx.id).await.unwrap().len(), 1);

        assert!(!tracker.check_attempt(&tx, &attempt, true, 112).await.unwrap());
        assert_eq!(h.manager.attempts(tx.id).await.unwrap().len(), 2);

        h.chain.mine(attempt.hash, 110);
        assert!(tracker.check_attempt(&tx, &attempt, true, 112).await.unwrap());
        assert_eq!(
            tracker.inspect_attempt(&attempt, 112).await.unwrap(),
            Confirmation::Confirmed { block_number: 110 }
        );
    }

    #[tokio::test]
    async fn test_unknown_hash_is_not_found() {
        let h = harness(100, 12, 1);
        assert!(matches!(
            h.manager.ensure_tx_confirmed(H256::repeat_byte(9)).await,
            Err(TxmError::AttemptNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sweep_confirms_and_bumps() {
        let h = harness(100, 12, 0);
        let mined = h.manager.create_tx(target(), payload()).await.unwrap();
        let stuck = h.manager.create_tx(target(), payload()).await.unwrap();
        h.chain.mine(first_hash(&h, &mined).await, 105);
        h.chain.set_head(112);

        let confirmed = h.manager.tracker().sweep().await.unwrap();

        assert_eq!(confirmed, 1);
        assert_eq!(
            h.manager.get_tx(mined.id).await.unwrap().unwrap().state,
            TxState::Confirmed
        );
        assert_eq!(h.manager.attempts(stuck.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_sends_first_attempt_for_attemptless_tx() {
        let h = harness(100, 12, 1);
        let from = h.manager.account().address;
        let orphan = Tx::new(from, TxRequest::new(target(), payload()), 100_000, 0);
        h.store.save_tx(&orphan).await.unwrap();

        h.manager.tracker().sweep().await.unwrap();

        let attempts = h.manager.attempts(orphan.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].sent_at, 100);
        assert_eq!(h.chain.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_nonce_below_in_flight_tx_is_reused() {
        let h = harness(100, 12, 1);
        let from = h.manager.account().address;
        let orphan = Tx::new(from, TxRequest::new(target(), payload()), 100_000, 0);
        h.store.save_tx(&orphan).await.unwrap();

        let in_flight = h.manager.create_tx(target(), payload()).await.unwrap();
        assert_eq!(in_flight.nonce, 1);

        h.chain.push_send_error("insufficient funds for gas * price + value");
        h.manager.tracker().sweep().await.unwrap();
        assert_eq!(
            h.manager.get_tx(orphan.id).await.unwrap().unwrap().state,
            TxState::Failed
        );

        let refill = h.manager.create_tx(target(), payload()).await.unwrap();
        assert_eq!(refill.nonce, 0);

        // a restarted manager seeds past every live nonce without a gap
        let restarted = manager_over(h.chain.clone(), h.store.clone(), 12, 1);
        let after_restart = restarted.create_tx(target(), payload()).await.unwrap();
        assert_eq!(after_restart.nonce, 2);

        let nonces: Vec<u64> = h
            .store
            .unconfirmed_txs(from)
            .await
            .unwrap()
            .iter()
            .map(|tx| tx.nonce)
            .collect();
        assert_eq!(nonces, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_restart_fills_gap_left_by_failed_tx() {
        let h = harness(100, 12, 1);
        let from = h.manager.account().address;
        let first = h.manager.create_tx(target(), payload()).await.unwrap();
        let second = h.manager.create_tx(target(), payload()).await.unwrap();
        h.store.mark_failed(first.id, "insufficient funds").await.unwrap();

        let restarted = manager_over(h.chain.clone(), h.store.clone(), 12, 1);
        let refill = restarted.create_tx(target(), payload()).await.unwrap();
        let next = restarted.create_tx(target(), payload()).await.unwrap();

        assert_eq!((first.nonce, second.nonce), (0, 1));
        assert_eq!((refill.nonce, next.nonce), (0, 2));
        assert_eq!(h.store.unconfirmed_txs(from).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_balance() {
        let h = harness(100, 12, 1);
        h.chain.set_balance(U256::exp10(18));
        assert_eq!(h.manager.balance().await.unwrap(), U256::exp10(18));
    }

    #[tokio::test]
    async fn test_tracker_start_and_stop() {
        let h = harness(100, 0, 0);
        let tx = h.manager.create_tx(target(), payload()).await.unwrap();
        h.chain.mine(first_hash(&h, &tx).await, 100);

        let tracker = h.manager.tracker();
        let handle = tracker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.stop();
        handle.await.unwrap();

        assert_eq!(
            h.manager.get_tx(tx.id).await.unwrap().unwrap().state,
            TxState::Confirmed
        );
    }
}
