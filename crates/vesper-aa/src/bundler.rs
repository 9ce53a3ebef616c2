use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;
use vesper_chain::abi::{encode, keccak256, Token};
use vesper_chain::rpc::{parse_data, parse_quantity, quantity};
use vesper_chain::{RpcError, RpcPool};
use vesper_common::{format_address, format_hash, parse_hash, Address, Hash32};

/// ERC-4337 (EntryPoint v0.6) UserOperation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: u64,
    pub init_code: Vec<u8>,
    pub call_data: Vec<u8>,
    pub call_gas_limit: u64,
    pub verification_gas_limit: u64,
    pub pre_verification_gas: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub paymaster_and_data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl UserOperation {
    /// `keccak(abi.encode(keccak(packed(op)), entryPoint, chainId))`, the hash the account owner signs.
    pub fn hash(&self, entry_point: &Address, chain_id: u64) -> Hash32 {
        let packed = encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce as u128),
            Token::Bytes32(keccak256(&self.init_code)),
            Token::Bytes32(keccak256(&self.call_data)),
            Token::Uint(self.call_gas_limit as u128),
            Token::Uint(self.verification_gas_limit as u128),
            Token::Uint(self.pre_verification_gas as u128),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::Bytes32(keccak256(&self.paymaster_and_data)),
        ]);
        keccak256(&encode(&[
            Token::Bytes32(keccak256(&packed)),
            Token::Address(*entry_point),
            Token::Uint(chain_id as u128),
        ]))
    }

    /// Total gas this op can consume.
    pub fn total_gas(&self) -> u64 {
        self.call_gas_limit
            .saturating_add(self.verification_gas_limit)
            .saturating_add(self.pre_verification_gas)
    }

    /// Maximum cost in wei.
    pub fn max_cost(&self) -> u128 {
        (self.total_gas() as u128).saturating_mul(self.max_fee_per_gas)
    }

    pub fn is_sponsored(&self) -> bool {
        !self.paymaster_and_data.is_empty()
    }

    pub fn apply_gas(&mut self, gas: &GasEstimate) {
        self.call_gas_limit = gas.call_gas_limit;
        self.verification_gas_limit = gas.verification_gas_limit;
        self.pre_verification_gas = gas.pre_verification_gas;
    }

    /// Bundler wire format: every numeric field is a hex quantity.
    pub fn to_rpc(&self) -> Value {
        json!({
            "sender": format_address(&self.sender),
            "nonce": quantity(self.nonce as u128),
            "initCode": format!("0x{}", hex::encode(&self.init_code)),
            "callData": format!("0x{}", hex::encode(&self.call_data)),
            "callGasLimit": quantity(self.call_gas_limit as u128),
            "verificationGasLimit": quantity(self.verification_gas_limit as u128),
            "preVerificationGas": quantity(self.pre_verification_gas as u128),
            "maxFeePerGas": quantity(self.max_fee_per_gas),
            "maxPriorityFeePerGas": quantity(self.max_priority_fee_per_gas),
            "paymasterAndData": format!("0x{}", hex::encode(&self.paymaster_and_data)),
            "signature": format!("0x{}", hex::encode(&self.signature)),
        })
    }
}

/// Placeholder signature for gas estimation: right length, never valid.
pub fn dummy_signature() -> Vec<u8> {
    let mut sig = vec![0xff; 15];
    sig.push(0xf0);
    sig.extend_from_slice(&[0u8; 15]);
    sig.push(0x07);
    sig.extend_from_slice(&[0xaa; 32]);
    sig.push(0x1c);
    sig
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GasEstimate {
    pub call_gas_limit: u64,
    pub verification_gas_limit: u64,
    pub pre_verification_gas: u64,
}

impl GasEstimate {
    pub(crate) fn from_rpc(value: &Value) -> Result<Self, BundlerError> {
        let field = |name: &str| -> Result<u64, BundlerError> {
            let v = value
                .get(name)
                .ok_or_else(|| BundlerError::InvalidResponse(format!("missing {name}")))?;
            // Some bundlers answer with plain numbers instead of quantities
            let n = match v.as_u64() {
                Some(n) => n as u128,
                None => parse_quantity(v)?,
            };
            u64::try_from(n).map_err(|_| BundlerError::InvalidResponse(format!("{name} out of range")))
        };
        Ok(Self {
            call_gas_limit: field("callGasLimit")?,
            verification_gas_limit: field("verificationGasLimit")?,
            pre_verification_gas: field("preVerificationGas")?,
        })
    }
}

/// Result of `eth_getUserOperationReceipt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOpReceipt {
    pub user_op_hash: Hash32,
    pub transaction_hash: Option<Hash32>,
    pub success: bool,
    pub actual_gas_cost: u128,
    pub reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum BundlerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("invalid bundler response: {0}")]
    InvalidResponse(String),
}

impl BundlerError {
    /// The text a bundler returned, used for classification.
    pub fn raw_message(&self) -> String {
        match self {
            BundlerError::Rpc(RpcError::JsonRpc { message, .. }) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Bundler operations the pipeline depends on.
#[async_trait]
pub trait BundlerClient: Send + Sync {
    async fn estimate_gas(&self, op: &UserOperation, entry_point: &Address) -> Result<GasEstimate, BundlerError>;

    /// Submit a signed op. Returns the bundler's op hash.
    async fn send(&self, op: &UserOperation, entry_point: &Address) -> Result<Hash32, BundlerError>;

    /// `None` until the op is included.
    async fn receipt(&self, op_hash: &Hash32) -> Result<Option<UserOpReceipt>, BundlerError>;

    /// Hash of the bundle transaction carrying the op, if the bundler has one.
    async fn transaction_hash(&self, op_hash: &Hash32) -> Result<Option<Hash32>, BundlerError>;
}

/// JSON-RPC bundler client.
pub struct HttpBundler {
    pool: Arc<RpcPool>,
}

impl HttpBundler {
    pub fn new(pool: Arc<RpcPool>) -> Self {
        Self { pool }
    }
}

fn parse_hash_field(value: &Value, name: &str) -> Result<Option<Hash32>, BundlerError> {
    match value.get(name).and_then(Value::as_str) {
        Some(s) => parse_hash(s)
            .map(Some)
            .map_err(|e| BundlerError::InvalidResponse(format!("{name}: {e}"))),
        None => Ok(None),
    }
}

#[async_trait]
impl BundlerClient for HttpBundler {
    async fn estimate_gas(&self, op: &UserOperation, entry_point: &Address) -> Result<GasEstimate, BundlerError> {
        let result = self
            .pool
            .request(
                "eth_estimateUserOperationGas",
                json!([op.to_rpc(), format_address(entry_point)]),
            )
            .await?;
        GasEstimate::from_rpc(&result)
    }

    async fn send(&self, op: &UserOperation, entry_point: &Address) -> Result<Hash32, BundlerError> {
        let result = self
            .pool
            .request("eth_sendUserOperation", json!([op.to_rpc(), format_address(entry_point)]))
            .await?;
        let bytes = parse_data(&result)?;
        let hash: Hash32 = bytes
            .try_into()
            .map_err(|_| BundlerError::InvalidResponse(format!("bad user op hash {result}")))?;
        debug!(op_hash = %format_hash(&hash), sender = %format_address(&op.sender), "user operation sent");
        Ok(hash)
    }

    async fn receipt(&self, op_hash: &Hash32) -> Result<Option<UserOpReceipt>, BundlerError> {
        let result = self
            .pool
            .request("eth_getUserOperationReceipt", json!([format_hash(op_hash)]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let transaction_hash = match result.get("receipt") {
            Some(inner) => parse_hash_field(inner, "transactionHash")?,
            None => None,
        };
        let actual_gas_cost = match result.get("actualGasCost") {
            Some(v) => parse_quantity(v)?,
            None => 0,
        };
        Ok(Some(UserOpReceipt {
            user_op_hash: parse_hash_field(&result, "userOpHash")?.unwrap_or(*op_hash),
            transaction_hash,
            success: result.get("success").and_then(Value::as_bool).unwrap_or(false),
            actual_gas_cost,
            reason: result
                .get("reason")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty() && *r != "0x")
                .map(str::to_string),
        }))
    }

    async fn transaction_hash(&self, op_hash: &Hash32) -> Result<Option<Hash32>, BundlerError> {
        let result = self
            .pool
            .request("eth_getUserOperationByHash", json!([format_hash(op_hash)]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_hash_field(&result, "transactionHash")
    }
}

/// Fee and gas margins applied on top of node/bundler estimates.
#[derive(Debug, Clone)]
pub struct FeeEstimator {
    /// Multiplier for gas price, in basis points (15000 = 1.5x).
    pub base_fee_margin_bps: u64,
    /// Default priority fee in wei.
    pub default_priority_fee: u128,
    /// Gas estimation margin in basis points.
    pub gas_margin_bps: u64,
}

impl Default for FeeEstimator {
    fn default() -> Self {
        Self {
            base_fee_margin_bps: 15000, // 1.5x
            default_priority_fee: 1_500_000_000, // 1.5 gwei
            gas_margin_bps: 12000, // 1.2x
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    pub max_fee: u128,
    pub priority_fee: u128,
}

impl FeeEstimator {
    pub fn new(base_fee_margin_bps: u64, default_priority_fee: u128, gas_margin_bps: u64) -> Self {
        Self {
            base_fee_margin_bps,
            default_priority_fee,
            gas_margin_bps,
        }
    }

    /// Fees for an op given the node's current gas price.
    pub fn estimate(&self, gas_price: u128) -> FeeEstimate {
        let adjusted = gas_price.saturating_mul(self.base_fee_margin_bps as u128) / 10000;
        let max_fee = adjusted.saturating_add(self.default_priority_fee);
        FeeEstimate {
            max_fee,
            priority_fee: self.default_priority_fee.min(max_fee),
        }
    }

    /// Apply gas margin to an estimated gas value.
    pub fn adjust_gas(&self, estimated_gas: u64) -> u64 {
        let adjusted = estimated_gas as u128 * self.gas_margin_bps as u128 / 10000;
        u64::try_from(adjusted).unwrap_or(u64::MAX)
    }

    pub fn adjust(&self, gas: &GasEstimate) -> GasEstimate {
        GasEstimate {
            call_gas_limit: self.adjust_gas(gas.call_gas_limit),
            verification_gas_limit: self.adjust_gas(gas.verification_gas_limit),
            pre_verification_gas: self.adjust_gas(gas.pre_verification_gas),
        }
    }
}
