//! PostgreSQL transaction store

use super::{check_transition, TxStore};
use crate::config::DatabaseConfig;
use crate::error::{TxmError, TxmResult};
use crate::gas::GasPrice;
use crate::tx::{AttemptState, Tx, TxAttempt, TxState};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Store for restart-durable transaction records
pub struct PgTxStore {
    pool: PgPool,
}

impl PgTxStore {
    /// Connect to the configured database
    pub async fn new(config: &DatabaseConfig) -> TxmResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> TxmResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txes (
                id UUID PRIMARY KEY,
                from_address VARCHAR(42) NOT NULL,
                to_address VARCHAR(42) NOT NULL,
                data BYTEA NOT NULL,
                value TEXT NOT NULL,
                gas_limit BIGINT NOT NULL,
                nonce BIGINT NOT NULL,
                state VARCHAR(20) NOT NULL,
                confirmed_hash VARCHAR(66),
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_txes_from_state
            ON txes (from_address, state, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tx_attempts (
                id BIGSERIAL PRIMARY KEY,
                tx_id UUID NOT NULL REFERENCES txes (id),
                hash VARCHAR(66) NOT NULL UNIQUE,
                fee_type VARCHAR(10) NOT NULL,
                gas_price TEXT,
                tip_cap TEXT,
                fee_cap TEXT,
                signed_raw_tx BYTEA NOT NULL,
                sent_at BIGINT NOT NULL,
                state VARCHAR(20) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_attempts_tx_id
            ON tx_attempts (tx_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> TxmResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TxStore for PgTxStore {
    async fn save_tx(&self, tx: &Tx) -> TxmResult<()> {
        sqlx::query(
            r#"
            INSERT INTO txes (id, from_address, to_address, data, value, gas_limit, nonce,
                              state, confirmed_hash, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id)
            DO UPDATE SET state = $8, confirmed_hash = $9, error = $10, updated_at = NOW()
            "#,
        )
        .bind(tx.id)
        .bind(format!("{:?}", tx.from))
        .bind(format!("{:?}", tx.to))
        .bind(tx.data.to_vec())
        .bind(tx.value.to_string())
        .bind(tx.gas_limit as i64)
        .bind(tx.nonce as i64)
        .bind(tx.state.as_str())
        .bind(tx.confirmed_hash.map(|h| format!("{:?}", h)))
        .bind(tx.error.as_deref())
        .bind(tx.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved tx {} (nonce {})", tx.id, tx.nonce);
        Ok(())
    }

    async fn find_tx(&self, id: Uuid) -> TxmResult<Option<Tx>> {
        let row = sqlx::query("SELECT * FROM txes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_tx).transpose()
    }

    async fn add_attempt(&self, attempt: &TxAttempt) -> TxmResult<()> {
        let (fee_type, gas_price, tip_cap, fee_cap) = encode_fee(&attempt.gas_price);

        sqlx::query(
            r#"
            INSERT INTO tx_attempts (tx_id, hash, fee_type, gas_price, tip_cap, fee_cap,
                                     signed_raw_tx, sent_at, state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(attempt.tx_id)
        .bind(format!("{:?}", attempt.hash))
        .bind(fee_type)
        .bind(gas_price)
        .bind(tip_cap)
        .bind(fee_cap)
        .bind(attempt.signed_raw_tx.to_vec())
        .bind(attempt.sent_at as i64)
        .bind(attempt.state.as_str())
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_foreign_key_violation()) {
                TxmError::TransactionNotFound {
                    tx_id: attempt.tx_id.to_string(),
                }
            } else {
                TxmError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn attempts_for(&self, tx_id: Uuid) -> TxmResult<Vec<TxAttempt>> {
        let rows = sqlx::query("SELECT * FROM tx_attempts WHERE tx_id = $1 ORDER BY id ASC")
            .bind(tx_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_attempt).collect()
    }

    async fn find_attempt(&self, hash: H256) -> TxmResult<Option<TxAttempt>> {
        let row = sqlx::query("SELECT * FROM tx_attempts WHERE hash = $1")
            .bind(format!("{:?}", hash))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn set_attempt_state(&self, hash: H256, state: AttemptState) -> TxmResult<()> {
        let hash = format!("{:?}", hash);
        let mut dbtx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state FROM tx_attempts WHERE hash = $1 FOR UPDATE")
            .bind(&hash)
            .fetch_optional(&mut *dbtx)
            .await?
            .ok_or_else(|| TxmError::AttemptNotFound { hash: hash.clone() })?;
        let current = AttemptState::from_str(row.try_get::<&str, _>("state")?)?;
        check_transition(current, state)?;

        sqlx::query("UPDATE tx_attempts SET state = $1 WHERE hash = $2")
            .bind(state.as_str())
            .bind(&hash)
            .execute(&mut *dbtx)
            .await?;

        dbtx.commit().await?;
        Ok(())
    }

    async fn mark_confirmed(&self, tx_id: Uuid, hash: H256) -> TxmResult<()> {
        let hash = format!("{:?}", hash);
        let mut dbtx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT state FROM tx_attempts WHERE hash = $1 AND tx_id = $2 FOR UPDATE",
        )
        .bind(&hash)
        .bind(tx_id)
        .fetch_optional(&mut *dbtx)
        .await?
        .ok_or_else(|| TxmError::AttemptNotFound { hash: hash.clone() })?;
        let current = AttemptState::from_str(row.try_get::<&str, _>("state")?)?;
        check_transition(current, AttemptState::Confirmed)?;

        let updated = sqlx::query(
            r#"
            UPDATE txes SET state = $1, confirmed_hash = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(TxState::Confirmed.as_str())
        .bind(&hash)
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(TxmError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            });
        }

        sqlx::query("UPDATE tx_attempts SET state = $1 WHERE hash = $2")
            .bind(AttemptState::Confirmed.as_str())
            .bind(&hash)
            .execute(&mut *dbtx)
            .await?;

        sqlx::query(
            "UPDATE tx_attempts SET state = $1 WHERE tx_id = $2 AND hash <> $3 AND state = $4",
        )
        .bind(AttemptState::Stale.as_str())
        .bind(tx_id)
        .bind(&hash)
        .bind(AttemptState::Pending.as_str())
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        Ok(())
    }

    async fn mark_failed(&self, tx_id: Uuid, reason: &str) -> TxmResult<()> {
        let updated = sqlx::query(
            "UPDATE txes SET state = $1, error = $2, updated_at = NOW() WHERE id = $3",
        )
        .bind(TxState::Failed.as_str())
        .bind(reason)
        .bind(tx_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(TxmError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            });
        }
        Ok(())
    }

    async fn unconfirmed_txs(&self, from: Address) -> TxmResult<Vec<Tx>> {
        let rows = sqlx::query(
            "SELECT * FROM txes WHERE from_address = $1 AND state = $2 ORDER BY nonce ASC",
        )
        .bind(format!("{:?}", from))
        .bind(TxState::Unconfirmed.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_tx).collect()
    }

    async fn live_nonces(&self, from: Address, min_nonce: u64) -> TxmResult<Vec<u64>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT nonce FROM txes
            WHERE from_address = $1 AND state <> $2 AND nonce >= $3
            ORDER BY nonce
            "#,
        )
        .bind(format!("{:?}", from))
        .bind(TxState::Failed.as_str())
        .bind(min_nonce as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut nonces = Vec::with_capacity(rows.len());
        for row in &rows {
            let nonce: i64 = row.try_get("nonce")?;
            nonces.push(nonce as u64);
        }
        Ok(nonces)
    }
}

fn row_to_tx(row: &PgRow) -> TxmResult<Tx> {
    let confirmed_hash: Option<String> = row.try_get("confirmed_hash")?;
    let data: Vec<u8> = row.try_get("data")?;

    Ok(Tx {
        id: row.try_get("id")?,
        from: parse_address(row.try_get("from_address")?)?,
        to: parse_address(row.try_get("to_address")?)?,
        data: Bytes::from(data),
        value: parse_u256(row.try_get("value")?)?,
        gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        state: TxState::from_str(row.try_get("state")?)?,
        confirmed_hash: confirmed_hash.as_deref().map(parse_hash).transpose()?,
        error: row.try_get("error")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn row_to_attempt(row: &PgRow) -> TxmResult<TxAttempt> {
    let signed_raw_tx: Vec<u8> = row.try_get("signed_raw_tx")?;

    Ok(TxAttempt {
        tx_id: row.try_get("tx_id")?,
        gas_price: decode_fee(
            row.try_get("fee_type")?,
            row.try_get("gas_price")?,
            row.try_get("tip_cap")?,
            row.try_get("fee_cap")?,
        )?,
        hash: parse_hash(row.try_get("hash")?)?,
        signed_raw_tx: Bytes::from(signed_raw_tx),
        sent_at: row.try_get::<i64, _>("sent_at")? as u64,
        state: AttemptState::from_str(row.try_get("state")?)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

/// Split a fee into `(fee_type, gas_price, tip_cap, fee_cap)` columns
fn encode_fee(fee: &GasPrice) -> (&'static str, Option<String>, Option<String>, Option<String>) {
    match fee {
        GasPrice::Legacy(price) => (fee.fee_type(), Some(price.to_string()), None, None),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => (
            fee.fee_type(),
            None,
            Some(max_priority_fee_per_gas.to_string()),
            Some(max_fee_per_gas.to_string()),
        ),
    }
}

fn decode_fee(
    fee_type: &str,
    gas_price: Option<String>,
    tip_cap: Option<String>,
    fee_cap: Option<String>,
) -> TxmResult<GasPrice> {
    let missing = |column: &str| TxmError::Decode(format!("{} attempt without {}", fee_type, column));

    match fee_type {
        "legacy" => Ok(GasPrice::Legacy(parse_u256(
            &gas_price.ok_or_else(|| missing("gas_price"))?,
        )?)),
        "eip1559" => Ok(GasPrice::Eip1559 {
            max_fee_per_gas: parse_u256(&fee_cap.ok_or_else(|| missing("fee_cap"))?)?,
            max_priority_fee_per_gas: parse_u256(&tip_cap.ok_or_else(|| missing("tip_cap"))?)?,
        }),
        other => Err(TxmError::Decode(format!("unknown fee type {}", other))),
    }
}

fn parse_address(value: &str) -> TxmResult<Address> {
    Address::from_str(value).map_err(|e| TxmError::Decode(format!("address {}: {}", value, e)))
}

fn parse_hash(value: &str) -> TxmResult<H256> {
    H256::from_str(value).map_err(|e| TxmError::Decode(format!("hash {}: {}", value, e)))
}

fn parse_u256(value: &str) -> TxmResult<U256> {
    U256::from_dec_str(value).map_err(|e| TxmError::Decode(format!("amount {}: {}", value, e)))
}
