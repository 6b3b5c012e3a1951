//! Chain client with multi-RPC support and automatic failover

use super::{Block, BlockTransaction, ChainClient, Receipt};
use crate::config::NodeConfig;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct EthersChainClient {
    chain_id: u64,
    /// HTTP providers in failover order
    http_providers: Vec<Provider<Http>>,
    /// Endpoint of each provider, same order
    rpc_urls: Vec<Url>,
    /// Shared with the providers; used directly for batched calls
    http_client: reqwest::Client,
    /// Current active provider index
    current_provider: AtomicUsize,
    request_timeout: Duration,
}

/// One call inside a JSON-RPC batch
#[derive(Debug, Serialize)]
struct RpcCall {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcReplyError>,
}

#[derive(Debug, Deserialize)]
struct RpcReplyError {
    code: i64,
    message: String,
}

impl EthersChainClient {
    /// Create a new chain client
    pub fn new(config: &NodeConfig) -> TxmResult<Self> {
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TxmError::ChainConnection {
                chain_id: config.chain_id,
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        let mut http_providers = Vec::new();
        let mut rpc_urls = Vec::new();

        for url in &config.rpc_urls {
            match Url::parse(url) {
                Ok(parsed) => {
                    let provider =
                        Provider::new(Http::new_with_client(parsed.clone(), http_client.clone()))
                            .interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    rpc_urls.push(parsed);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TxmError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain_id: config.chain_id,
            http_providers,
            rpc_urls,
            http_client,
            current_provider: AtomicUsize::new(0),
            request_timeout,
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Run a read-only request, moving to the next provider on failure
    async fn with_failover<T, F, Fut>(&self, operation: &str, f: F) -> TxmResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        for _ in 0..self.http_providers.len() {
            match tokio::time::timeout(self.request_timeout, f(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!("{} failed on chain {}: {}", operation, self.chain_id, e);
                    self.failover();
                }
                Err(_) => {
                    warn!("{} timed out on chain {}", operation, self.chain_id);
                    self.failover();
                }
            }
        }

        Err(TxmError::ChainConnection {
            chain_id: self.chain_id,
            message: format!("All providers failed: {}", operation),
        })
    }

    /// Endpoint of the active provider
    fn rpc_url(&self) -> &Url {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.rpc_urls[idx % self.rpc_urls.len()]
    }

    async fn post_batch(&self, batch: &[RpcCall]) -> Result<Vec<RpcReply>, reqwest::Error> {
        self.http_client
            .post(self.rpc_url().clone())
            .json(batch)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

/// `eth_getBlockByNumber` with full transactions for each of `numbers`;
/// call ids are positions in `numbers`
fn block_batch(numbers: &[u64]) -> Vec<RpcCall> {
    numbers
        .iter()
        .enumerate()
        .map(|(id, number)| RpcCall {
            jsonrpc: "2.0",
            id: id as u64,
            method: "eth_getBlockByNumber",
            params: serde_json::json!([format!("0x{:x}", number), true]),
        })
        .collect()
}

/// Match batch replies to `numbers` by id, in request order
fn decode_block_batch(
    chain_id: u64,
    numbers: &[u64],
    replies: Vec<RpcReply>,
) -> TxmResult<Vec<Block>> {
    let mut by_id: HashMap<u64, RpcReply> =
        replies.into_iter().map(|reply| (reply.id, reply)).collect();
    let mut blocks = Vec::with_capacity(numbers.len());

    for (id, &number) in numbers.iter().enumerate() {
        let reply = by_id
            .remove(&(id as u64))
            .ok_or_else(|| TxmError::ChainConnection {
                chain_id,
                message: format!("No reply for block {}", number),
            })?;

        if let Some(error) = reply.error {
            return Err(TxmError::ChainConnection {
                chain_id,
                message: format!(
                    "eth_getBlockByNumber({}) failed: {} (code {})",
                    number, error.message, error.code
                ),
            });
        }

        let value = reply.result.ok_or_else(|| TxmError::ChainConnection {
            chain_id,
            message: format!("Block {} not found", number),
        })?;
        let block: ethers::types::Block<Transaction> = serde_json::from_value(value)
            .map_err(|e| TxmError::Decode(format!("block {}: {}", number, e)))?;
        blocks.push(convert_block(number, block));
    }

    Ok(blocks)
}

fn convert_block(number: u64, block: ethers::types::Block<Transaction>) -> Block {
    let transactions = block
        .transactions
        .iter()
        .map(|tx| BlockTransaction {
            tx_type: tx.transaction_type.map(|t| t.as_u64() as u8).unwrap_or(0),
            gas_price: tx.gas_price,
            max_fee_per_gas: tx.max_fee_per_gas,
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            gas_limit: tx.gas.low_u64(),
        })
        .collect();

    Block {
        number: block.number.map(|n| n.as_u64()).unwrap_or(number),
        hash: block.hash.unwrap_or_default(),
        base_fee_per_gas: block.base_fee_per_gas,
        transactions,
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> TxmResult<u64> {
        self.with_failover("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await
            .map(|n| n.as_u64())
    }

    async fn get_transaction_count(&self, address: Address) -> TxmResult<u64> {
        self.with_failover("eth_getTransactionCount", |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
        })
        .await
        .map(|n| n.as_u64())
    }

    /// Broadcast on the active provider only; node errors are classified
    /// rather than failed over, since a second node would see the same nonce
    async fn send_raw_transaction(&self, raw: Bytes) -> TxmResult<H256> {
        let send = self.http().send_raw_transaction(raw);

        match tokio::time::timeout(self.request_timeout, send).await {
            Ok(Ok(pending)) => Ok(pending.tx_hash()),
            Ok(Err(e)) => Err(TxmError::from_node_message(e.to_string())),
            Err(_) => Err(TxmError::Timeout {
                operation: "eth_sendRawTransaction".to_string(),
            }),
        }
    }

    async fn get_transaction_receipt(&self, hash: H256) -> TxmResult<Option<Receipt>> {
        let receipt = self
            .with_failover("eth_getTransactionReceipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;

        Ok(receipt.map(|r| Receipt {
            tx_hash: r.transaction_hash,
            block_number: r.block_number.map(|n| n.as_u64()),
            block_hash: r.block_hash,
            status: r.status.map(|s| s.as_u64()),
        }))
    }

    async fn call(&self, to: Address, data: Bytes) -> TxmResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();

        self.with_failover("eth_call", |p| {
            let tx = tx.clone();
            async move { p.call(&tx, None).await }
        })
        .await
    }

    async fn get_balance(&self, address: Address) -> TxmResult<U256> {
        self.with_failover("eth_getBalance", |p| async move {
            p.get_balance(address, None).await
        })
        .await
    }

    /// One JSON-RPC batch per call; the whole batch fails over together
    async fn fetch_blocks(&self, numbers: &[u64]) -> TxmResult<Vec<Block>> {
        if numbers.is_empty() {
            return Ok(Vec::new());
        }

        let batch = block_batch(numbers);
        for _ in 0..self.rpc_urls.len() {
            match self.post_batch(&batch).await {
                Ok(replies) => return decode_block_batch(self.chain_id, numbers, replies),
                Err(e) => {
                    warn!(
                        "Block batch of {} failed on chain {}: {}",
                        numbers.len(),
                        self.chain_id,
                        e
                    );
                    self.failover();
                }
            }
        }

        Err(TxmError::ChainConnection {
            chain_id: self.chain_id,
            message: "All providers failed: eth_getBlockByNumber batch".to_string(),
        })
    }
}
