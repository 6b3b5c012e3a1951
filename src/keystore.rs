//! Signing accounts

use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use tracing::info;

/// An unlocked account able to sign transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub address: Address,
}

/// A signed, RLP-encoded transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub hash: H256,
    pub raw: Bytes,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    fn account(&self) -> Account;

    async fn sign_tx(&self, tx: &TypedTransaction, chain_id: u64) -> TxmResult<SignedTx>;
}

/// Key store backed by a single in-process private key
pub struct WalletKeyStore {
    wallet: LocalWallet,
}

impl WalletKeyStore {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load the signing key from the named environment variable
    pub fn from_env(var: &str) -> TxmResult<Self> {
        let key = std::env::var(var).map_err(|_| {
            TxmError::Wallet(format!("No wallet configured. Set {} to a private key", var))
        })?;

        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| TxmError::Wallet(format!("Invalid private key: {}", e)))?;

        info!("Loaded signing account {:?}", wallet.address());
        Ok(Self::new(wallet))
    }
}

#[async_trait]
impl KeyStore for WalletKeyStore {
    fn account(&self) -> Account {
        Account {
            address: self.wallet.address(),
        }
    }

    async fn sign_tx(&self, tx: &TypedTransaction, chain_id: u64) -> TxmResult<SignedTx> {
        let mut tx = tx.clone();
        tx.set_chain_id(chain_id);

        let wallet = self.wallet.clone().with_chain_id(chain_id);
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| TxmError::Wallet(format!("Failed to sign transaction: {}", e)))?;

        let raw = tx.rlp_signed(&signature);
        Ok(SignedTx {
            hash: H256::from(keccak256(&raw)),
            raw,
        })
    }
}
