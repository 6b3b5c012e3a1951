//! In-memory chain used by the transaction lifecycle tests

use crate::chain::{Block, ChainClient, Receipt};
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Well-known development key, never funded on a real network
pub const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

#[derive(Default)]
struct FakeChainState {
    head: u64,
    nonces: HashMap<Address, u64>,
    receipts: HashMap<H256, Receipt>,
    sent: Vec<Bytes>,
    send_errors: VecDeque<String>,
    balance: U256,
    nonce_queries: usize,
}

/// Chain whose head, receipts and send failures are driven by the test
pub struct FakeChain {
    chain_id: u64,
    state: Mutex<FakeChainState>,
}

impl FakeChain {
    pub fn new(chain_id: u64, head: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(FakeChainState {
                head,
                ..Default::default()
            }),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().unwrap().nonces.insert(address, nonce);
    }

    pub fn set_balance(&self, balance: U256) {
        self.state.lock().unwrap().balance = balance;
    }

    /// Include `hash` in `block`
    pub fn mine(&self, hash: H256, block: u64) {
        self.state.lock().unwrap().receipts.insert(
            hash,
            Receipt {
                tx_hash: hash,
                block_number: Some(block),
                block_hash: Some(H256::from_low_u64_be(block)),
                status: Some(1),
            },
        );
    }

    /// Make the next broadcast fail with `message`
    pub fn push_send_error(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .send_errors
            .push_back(message.to_string());
    }

    /// Broadcasts the node accepted
    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    pub fn nonce_queries(&self) -> usize {
        self.state.lock().unwrap().nonce_queries
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> TxmResult<u64> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn get_transaction_count(&self, address: Address) -> TxmResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.nonce_queries += 1;
        Ok(state.nonces.get(&address).copied().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> TxmResult<H256> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.send_errors.pop_front() {
            return Err(TxmError::from_node_message(message));
        }
        let hash = H256::from(keccak256(&raw));
        state.sent.push(raw);
        Ok(hash)
    }

    async fn get_transaction_receipt(&self, hash: H256) -> TxmResult<Option<Receipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn call(&self, _to: Address, _data: Bytes) -> TxmResult<Bytes> {
        Ok(Bytes::new())
    }

    async fn get_balance(&self, _address: Address) -> TxmResult<U256> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn fetch_blocks(&self, numbers: &[u64]) -> TxmResult<Vec<Block>> {
        Ok(numbers
            .iter()
            .map(|&number| Block {
                number,
                hash: H256::from_low_u64_be(number),
                base_fee_per_gas: None,
                transactions: Vec::new(),
            })
            .collect())
    }
}
