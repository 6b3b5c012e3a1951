//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent callers never share a nonce
//! - Restart-safe seeding from the chain and the store, filling gaps left by failed transactions
//! - Releasing a nonce whose transaction never made it out

use crate::chain::ChainClient;
use crate::error::{TxmError, TxmResult};
use crate::state::TxStore;

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Per-account nonce state
#[derive(Default)]
struct AccountNonceState {
    /// Next never-used nonce; `None` until seeded
    next: Option<u64>,
    /// Released nonces below `next`, handed out lowest first
    free: BTreeSet<u64>,
}

/// Allocates nonces per account
#[derive(Default)]
pub struct NonceManager {
    accounts: DashMap<Address, Arc<Mutex<AccountNonceState>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn account_state(&self, address: Address) -> Arc<Mutex<AccountNonceState>> {
        self.accounts.entry(address).or_default().clone()
    }

    /// Reserve the next nonce for `address`
    ///
    /// The first call per account seeds from the chain's pending count and
    /// the live transactions in the store: nonces at or above the pending
    /// count that no live transaction holds are reused before the counter
    /// advances. Only that account's lock is held while seeding.
    pub async fn next_nonce(
        &self,
        address: Address,
        client: &dyn ChainClient,
        store: &dyn TxStore,
    ) -> TxmResult<u64> {
        let state = self.account_state(address);
        let mut state = state.lock().await;

        if state.next.is_none() {
            let on_chain = client
                .get_transaction_count(address)
                .await
                .map_err(|e| TxmError::Nonce {
                    address: format!("{:?}", address),
                    message: e.to_string(),
                })?;
            let live = store.live_nonces(address, on_chain).await?;
            let next = live.last().map_or(on_chain, |last| on_chain.max(last + 1));
            let held: BTreeSet<u64> = live.into_iter().collect();
            state.free = (on_chain..next).filter(|n| !held.contains(n)).collect();
            state.next = Some(next);
            debug!(
                "Seeded nonce for {:?}: chain {}, next {}, {} gaps",
                address,
                on_chain,
                next,
                state.free.len()
            );
        }

        let nonce = match state.free.pop_first() {
            Some(nonce) => nonce,
            None => {
                let nonce = state.next.unwrap_or_default();
                state.next = Some(nonce + 1);
                nonce
            }
        };

        debug!("Allocated nonce {} for {:?}", nonce, address);
        Ok(nonce)
    }

    /// Return a nonce whose transaction will never be mined
    ///
    /// The nonce is handed out again before any new one.
    pub async fn release(&self, address: Address, nonce: u64) {
        let state = self.account_state(address);
        let mut state = state.lock().await;

        let Some(next) = state.next else {
            return;
        };
        if nonce >= next {
            return;
        }

        if nonce + 1 == next {
            let mut next = nonce;
            while next > 0 && state.free.remove(&(next - 1)) {
                next -= 1;
            }
            state.next = Some(next);
        } else {
            state.free.insert(nonce);
        }
        debug!("Released nonce {} for {:?}", nonce, address);
    }
}
