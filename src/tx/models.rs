//! Transaction and attempt records

use crate::error::{TxmError, TxmResult};
use crate::gas::GasPrice;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a logical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Unconfirmed,
    Confirmed,
    /// Permanently rejected; the reason is kept in `Tx::error`
    Failed,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Unconfirmed => "unconfirmed",
            TxState::Confirmed => "confirmed",
            TxState::Failed => "failed",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxState {
    type Err = TxmError;

    fn from_str(s: &str) -> TxmResult<Self> {
        match s {
            "unconfirmed" => Ok(TxState::Unconfirmed),
            "confirmed" => Ok(TxState::Confirmed),
            "failed" => Ok(TxState::Failed),
            other => Err(TxmError::Decode(format!("unknown tx state {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptState {
    Pending,
    Confirmed,
    /// Superseded by a later attempt; may still be mined
    Stale,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Confirmed => "confirmed",
            AttemptState::Stale => "stale",
        }
    }

    /// States only move forward; re-applying the current state is allowed
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Confirmed)
                | (Pending, Stale)
                | (Stale, Stale)
                | (Stale, Confirmed)
                | (Confirmed, Confirmed)
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = TxmError;

    fn from_str(s: &str) -> TxmResult<Self> {
        match s {
            "pending" => Ok(AttemptState::Pending),
            "confirmed" => Ok(AttemptState::Confirmed),
            "stale" => Ok(AttemptState::Stale),
            other => Err(TxmError::Decode(format!("unknown attempt state {}", other))),
        }
    }
}

/// One intended on-chain effect, bound to a single nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub id: Uuid,
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub nonce: u64,
    pub state: TxState,
    /// Hash of the attempt that was confirmed
    pub confirmed_hash: Option<H256>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tx {
    pub fn new(from: Address, request: TxRequest, gas_limit: u64, nonce: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to: request.to,
            data: request.data,
            value: request.value,
            gas_limit,
            nonce,
            state: TxState::Unconfirmed,
            confirmed_hash: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// One signed broadcast of a `Tx` at a specific fee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAttempt {
    pub tx_id: Uuid,
    pub gas_price: GasPrice,
    pub hash: H256,
    pub signed_raw_tx: Bytes,
    /// Block number observed when the attempt was broadcast
    pub sent_at: u64,
    pub state: AttemptState,
    pub created_at: DateTime<Utc>,
}

/// Caller input for `TransactionManager::create_tx_with`
#[derive(Debug, Clone, Default)]
pub struct TxRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Falls back to the configured default gas limit
    pub gas_limit: Option<u64>,
}

impl TxRequest {
    pub fn new(to: Address, data: Bytes) -> Self {
        Self {
            to,
            data,
            ..Default::default()
        }
    }
}
