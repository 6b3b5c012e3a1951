//! L1 data availability price for rollup chains

use crate::chain::ChainClient;
use crate::config::{DaOracleConfig, DaOracleType};
use crate::error::{TxmError, TxmResult};

use ethers::types::{Address, Bytes, U256};
use sha3::{Digest, Keccak256};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// OP Stack `GasPriceOracle` getter
const OP_STACK_L1_BASE_FEE: &str = "l1BaseFee()";
/// Arbitrum `ArbGasInfo` getter
const ARBITRUM_L1_BASE_FEE: &str = "getL1BaseFeeEstimate()";

/// Reads the DA price from a configured oracle contract
pub struct DataAvailabilityPriceSource {
    client: Arc<dyn ChainClient>,
    oracle_type: DaOracleType,
    oracle_address: Address,
    calldata: Bytes,
}

impl DataAvailabilityPriceSource {
    pub fn new(client: Arc<dyn ChainClient>, config: &DaOracleConfig) -> TxmResult<Self> {
        let oracle_address = Address::from_str(&config.oracle_address).map_err(|e| {
            TxmError::Config(format!(
                "invalid DA oracle address {}: {}",
                config.oracle_address, e
            ))
        })?;

        let calldata = match config.oracle_type {
            DaOracleType::OpStack => selector(OP_STACK_L1_BASE_FEE),
            DaOracleType::Arbitrum => selector(ARBITRUM_L1_BASE_FEE),
            DaOracleType::Custom => {
                let raw = config.custom_calldata.as_deref().ok_or_else(|| {
                    TxmError::Config("custom DA oracle requires calldata".to_string())
                })?;
                hex::decode(raw.trim_start_matches("0x"))
                    .map_err(|e| TxmError::Config(format!("invalid DA calldata: {}", e)))?
            }
        };

        Ok(Self {
            client,
            oracle_type: config.oracle_type,
            oracle_address,
            calldata: Bytes::from(calldata),
        })
    }

    pub fn oracle_type(&self) -> DaOracleType {
        self.oracle_type
    }

    /// Current DA price; `None` when the oracle returns no data
    pub async fn get_price(&self) -> TxmResult<Option<U256>> {
        let result = self
            .client
            .call(self.oracle_address, self.calldata.clone())
            .await?;

        if result.is_empty() {
            return Ok(None);
        }
        if result.len() < 32 {
            return Err(TxmError::Decode(format!(
                "DA oracle returned {} bytes, expected at least 32",
                result.len()
            )));
        }

        let price = U256::from_big_endian(&result[..32]);
        debug!("DA price from {:?}: {}", self.oracle_address, price);
        Ok(Some(price))
    }
}

/// First four bytes of the keccak hash of a function signature
fn selector(signature: &str) -> Vec<u8> {
    Keccak256::digest(signature.as_bytes())[..4].to_vec()
}
