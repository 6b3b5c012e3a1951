//! Block history gas estimator
//!
//! Keeps a sliding window of recent blocks and publishes a percentile of the
//! prices actually paid in them, escalated when that price would not have been
//! competitive in the most recent blocks.

use super::{DataAvailabilityPriceSource, GasPrice};
use crate::chain::{Block, BlockTransaction, ChainClient};
use crate::config::{fee_cap_buffer_blocks, GasEstimatorConfig};
use crate::error::{TxmError, TxmResult};
use crate::metrics;

use ethers::types::U256;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Base fee can grow by at most 12.5% per block
const BASE_FEE_GROWTH_NUMERATOR: u64 = 1125;
const BASE_FEE_GROWTH_DENOMINATOR: u64 = 1000;

/// Last published recommendation; `None` until the first successful cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GasEstimatorState {
    pub gas_price: Option<U256>,
    pub tip_cap: Option<U256>,
    pub fee_cap: Option<U256>,
    pub base_fee: Option<U256>,
    pub da_price: Option<U256>,
}

pub struct GasEstimator {
    client: Arc<dyn ChainClient>,
    config: GasEstimatorConfig,
    fee_cap_buffer_blocks: u16,
    gas_bump_threshold: u64,
    da_source: Option<DataAvailabilityPriceSource>,
    state: RwLock<GasEstimatorState>,
    /// Retained window, ascending by number; the lock also serializes refresh cycles
    blocks: Mutex<Vec<Block>>,
    shutdown: watch::Sender<bool>,
}

impl GasEstimator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        config: GasEstimatorConfig,
        gas_bump_threshold: u64,
        da_source: Option<DataAvailabilityPriceSource>,
    ) -> Self {
        let fee_cap_buffer_blocks =
            fee_cap_buffer_blocks(&config.block_history, gas_bump_threshold);
        let (shutdown, _) = watch::channel(false);

        Self {
            client,
            config,
            fee_cap_buffer_blocks,
            gas_bump_threshold,
            da_source,
            state: RwLock::new(GasEstimatorState::default()),
            blocks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &GasEstimatorConfig {
        &self.config
    }

    pub fn fee_cap_buffer_blocks(&self) -> u16 {
        self.fee_cap_buffer_blocks
    }

    /// Current legacy gas price, or the configured default before the first estimate
    pub async fn get_gas_price(&self) -> U256 {
        self.state
            .read()
            .await
            .gas_price
            .unwrap_or_else(|| self.config.price_default())
    }

    pub async fn get_tip_cap(&self) -> U256 {
        self.state
            .read()
            .await
            .tip_cap
            .unwrap_or_else(|| self.config.tip_cap_default())
    }

    pub async fn get_base_fee(&self) -> Option<U256> {
        self.state.read().await.base_fee
    }

    pub async fn get_da_price(&self) -> Option<U256> {
        self.state.read().await.da_price
    }

    pub async fn snapshot(&self) -> GasEstimatorState {
        self.state.read().await.clone()
    }

    /// Fee for a new transaction, read from a single consistent snapshot
    pub async fn current_fee(&self) -> GasPrice {
        let state = self.state.read().await;

        if self.config.eip1559_dynamic_fees {
            GasPrice::Eip1559 {
                max_fee_per_gas: state.fee_cap.unwrap_or_else(|| self.config.price_max()),
                max_priority_fee_per_gas: state
                    .tip_cap
                    .unwrap_or_else(|| self.config.tip_cap_default()),
            }
        } else {
            GasPrice::Legacy(state.gas_price.unwrap_or_else(|| self.config.price_default()))
        }
    }

    pub async fn set_gas_price(&self, price: U256) {
        self.state.write().await.gas_price = Some(price);
    }

    /// Fee cap that stays valid for the configured number of base fee increases
    pub fn fee_cap_for(&self, base_fee: U256, tip_cap: U256) -> U256 {
        if self.gas_bump_threshold == 0 {
            return self.config.price_max();
        }
        calc_fee_cap(
            base_fee,
            self.fee_cap_buffer_blocks,
            tip_cap,
            self.config.price_max(),
        )
    }

    /// Run one estimation cycle
    ///
    /// Any fetch error aborts the cycle before the cache or the published
    /// state is touched.
    pub async fn refresh(&self) -> TxmResult<()> {
        let mut blocks = self.blocks.lock().await;
        let history = &self.config.block_history;

        let head = self.client.block_number().await?;
        let target = head
            .checked_sub(u64::from(history.block_delay))
            .ok_or_else(|| {
                TxmError::GasEstimation(format!(
                    "head {} is below block delay {}",
                    head, history.block_delay
                ))
            })?;
        let lowest =
            target.saturating_sub(u64::from(history.block_history_size).saturating_sub(1));

        let cached: HashSet<u64> = blocks.iter().map(|b| b.number).collect();
        let missing: Vec<u64> = (lowest..=target)
            .rev()
            .filter(|n| !cached.contains(n))
            .collect();

        let mut fetched = Vec::with_capacity(missing.len());
        if !missing.is_empty() {
            let batch_size = match history.batch_size {
                0 => missing.len(),
                n => n as usize,
            };
            for batch in missing.chunks(batch_size) {
                fetched.extend(self.client.fetch_blocks(batch).await?);
            }
            debug!(
                "Fetched {} blocks for gas estimation (target {})",
                fetched.len(),
                target
            );
        }

        blocks.retain(|b| b.number >= lowest && b.number <= target);
        blocks.extend(
            fetched
                .into_iter()
                .filter(|b| b.number >= lowest && b.number <= target),
        );
        blocks.sort_by_key(|b| b.number);
        blocks.dedup_by_key(|b| b.number);

        self.recalculate(&blocks).await;
        Ok(())
    }

    async fn recalculate(&self, blocks: &[Block]) {
        let history = &self.config.block_history;
        let previous = self.state.read().await.clone();
        let mut next = previous.clone();

        let base_fee = blocks.iter().rev().find_map(|b| b.base_fee_per_gas);
        next.base_fee = base_fee.or(previous.base_fee);

        let prices = collect_sorted(blocks, BlockTransaction::effective_gas_price);
        if prices.is_empty() {
            warn!("No eligible transactions in block history, keeping previous gas price");
        } else {
            let candidate = percentile(&prices, history.transaction_percentile);
            let candidate =
                self.enforce_inclusion(blocks, candidate, BlockTransaction::effective_gas_price);
            next.gas_price = Some(clamp(
                candidate,
                self.config.price_min(),
                self.config.price_max(),
            ));
        }

        if self.config.eip1559_dynamic_fees {
            let tips = collect_sorted(blocks, BlockTransaction::effective_tip);
            if tips.is_empty() {
                warn!("No eligible tips in block history, keeping previous tip cap");
            } else {
                let candidate = percentile(&tips, history.transaction_percentile);
                let candidate =
                    self.enforce_inclusion(blocks, candidate, BlockTransaction::effective_tip);
                next.tip_cap = Some(clamp(
                    candidate,
                    self.config.tip_cap_min(),
                    self.config.price_max(),
                ));
            }

            match next.base_fee {
                Some(base_fee) => {
                    let tip = next.tip_cap.unwrap_or_else(|| self.config.tip_cap_default());
                    next.fee_cap = Some(self.fee_cap_for(base_fee, tip));
                }
                None => warn!("Dynamic fees enabled but no block reported a base fee"),
            }
        }

        if let Some(da_source) = &self.da_source {
            match da_source.get_price().await {
                Ok(price) => next.da_price = price,
                Err(e) => warn!(
                    "DA price from {:?} oracle unavailable, gas estimate degraded: {}",
                    da_source.oracle_type(),
                    e
                ),
            }
        }

        if next != previous {
            debug!(
                "Gas estimate updated: price={:?} tip={:?} fee_cap={:?} da={:?}",
                next.gas_price, next.tip_cap, next.fee_cap, next.da_price
            );
        }

        metrics::record_gas_estimate(self.client.chain_id(), &next);
        *self.state.write().await = next;
    }

    /// Raise `candidate` until it would have been at least as high as the
    /// configured share of transactions in the most recent blocks
    fn enforce_inclusion<F>(&self, blocks: &[Block], candidate: U256, extract: F) -> U256
    where
        F: Fn(&BlockTransaction, Option<U256>) -> Option<U256>,
    {
        let history = &self.config.block_history;
        let window = usize::from(history.check_inclusion_blocks);
        let pct = usize::from(history.check_inclusion_percentile);
        if window == 0 || pct == 0 {
            return candidate;
        }

        let recent = &blocks[blocks.len().saturating_sub(window)..];
        let observed = collect_sorted(recent, extract);
        if observed.is_empty() {
            return candidate;
        }

        let required = (observed.len() * pct + 99) / 100;
        let included = observed.iter().filter(|p| **p <= candidate).count();
        if included >= required {
            return candidate;
        }

        let escalated = observed[required - 1];
        debug!(
            "Inclusion check: {} of {} recent transactions at or below {}, raising to {}",
            included,
            observed.len(),
            candidate,
            escalated
        );
        escalated
    }

    /// Spawn the periodic refresh loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let estimator = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let refresh_interval = Duration::from_millis(self.config.refresh_interval_ms.max(1));

        tokio::spawn(async move {
            info!(
                "Gas estimator started (chain {}, interval {:?})",
                estimator.client.chain_id(),
                refresh_interval
            );
            let mut interval = tokio::time::interval(refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = estimator.refresh().await {
                            warn!("Gas estimator refresh skipped: {}", e);
                            metrics::record_estimator_failure(estimator.client.chain_id());
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            info!("Gas estimator stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

fn collect_sorted<F>(blocks: &[Block], extract: F) -> Vec<U256>
where
    F: Fn(&BlockTransaction, Option<U256>) -> Option<U256>,
{
    let mut values = Vec::new();
    for block in blocks {
        values.extend(
            block
                .transactions
                .iter()
                .filter_map(|tx| extract(tx, block.base_fee_per_gas)),
        );
    }
    values.sort();
    values
}

fn clamp(value: U256, min: U256, max: U256) -> U256 {
    std::cmp::min(std::cmp::max(value, min), max)
}

/// Nearest-rank percentile of an ascending, non-empty slice
pub fn percentile(sorted: &[U256], pct: u16) -> U256 {
    let pct = usize::from(pct.min(100));
    let idx = (sorted.len().saturating_sub(1) * pct) / 100;
    sorted[idx]
}

/// `base_fee * 1.125^buffer_blocks + tip_cap`, capped at `max`
pub fn calc_fee_cap(base_fee: U256, buffer_blocks: u16, tip_cap: U256, max: U256) -> U256 {
    let mut fee = base_fee;
    for _ in 0..buffer_blocks {
        if fee >= max {
            break;
        }
        fee = fee.saturating_mul(U256::from(BASE_FEE_GROWTH_NUMERATOR))
            / U256::from(BASE_FEE_GROWTH_DENOMINATOR);
    }
    std::cmp::min(fee.saturating_add(tip_cap), max)
}
