//! Builds and signs transaction attempts

use super::{AttemptState, Tx, TxAttempt};
use crate::error::TxmResult;
use crate::gas::GasPrice;
use crate::keystore::KeyStore;

use chrono::Utc;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionRequest};
use std::sync::Arc;

pub struct AttemptBuilder {
    keystore: Arc<dyn KeyStore>,
    chain_id: u64,
}

impl AttemptBuilder {
    pub fn new(keystore: Arc<dyn KeyStore>, chain_id: u64) -> Self {
        Self { keystore, chain_id }
    }

    /// Sign `tx` at `gas_price`, recording `sent_at` as the broadcast block
    pub async fn build(&self, tx: &Tx, gas_price: GasPrice, sent_at: u64) -> TxmResult<TxAttempt> {
        let typed = self.typed_transaction(tx, &gas_price);
        let signed = self.keystore.sign_tx(&typed, self.chain_id).await?;

        Ok(TxAttempt {
            tx_id: tx.id,
            gas_price,
            hash: signed.hash,
            signed_raw_tx: signed.raw,
            sent_at,
            state: AttemptState::Pending,
            created_at: Utc::now(),
        })
    }

    fn typed_transaction(&self, tx: &Tx, gas_price: &GasPrice) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(tx.from)
                .to(tx.to)
                .data(tx.data.clone())
                .value(tx.value)
                .nonce(tx.nonce)
                .gas(tx.gas_limit)
                .gas_price(*price)
                .chain_id(self.chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(tx.from)
                .to(tx.to)
                .data(tx.data.clone())
                .value(tx.value)
                .nonce(tx.nonce)
                .gas(tx.gas_limit)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(self.chain_id)
                .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::WalletKeyStore;
    use crate::test_utils::TEST_KEY;
    use crate::tx::TxRequest;
    use ethers::types::{Address, Bytes, U256};
    use ethers::utils::rlp::Rlp;

    fn builder() -> AttemptBuilder {
        let keystore = WalletKeyStore::new(TEST_KEY.parse().unwrap());
        AttemptBuilder::new(Arc::new(keystore), 10)
    }

    fn sample_tx() -> Tx {
        Tx::new(
            Address::repeat_byte(0xaa),
            TxRequest::new(Address::repeat_byte(0xbb), Bytes::from(vec![0xca, 0xfe])),
            90_000,
            4,
        )
    }

    #[tokio::test]
    async fn test_legacy_attempt_encodes_fee_and_nonce() {
        let tx = sample_tx();
        let attempt = builder()
            .build(&tx, GasPrice::Legacy(U256::from(25_000_000_000u64)), 77)
            .await
            .unwrap();

        assert_eq!(attempt.tx_id, tx.id);
        assert_eq!(attempt.sent_at, 77);
        assert_eq!(attempt.state, AttemptState::Pending);

        let (decoded, _) =
            TypedTransaction::decode_signed(&Rlp::new(&attempt.signed_raw_tx)).unwrap();
        assert_eq!(decoded.nonce(), Some(&U256::from(4)));
        assert_eq!(decoded.gas_price(), Some(U256::from(25_000_000_000u64)));
        assert_eq!(decoded.data(), Some(&tx.data));
    }

    #[tokio::test]
    async fn test_different_fees_give_different_hashes() {
        let tx = sample_tx();
        let builder = builder();
        let first = builder
            .build(&tx, GasPrice::Legacy(U256::from(10)), 1)
            .await
            .unwrap();
        let second = builder
            .build(
                &tx,
                GasPrice::Eip1559 {
                    max_fee_per_gas: U256::from(12),
                    max_priority_fee_per_gas: U256::from(2),
                },
                1,
            )
            .await
            .unwrap();

        assert_ne!(first.hash, second.hash);
    }
}
