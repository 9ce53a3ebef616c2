use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use vesper_common::{format_address, Address};

use crate::rpc::{parse_data, parse_quantity, RpcError, RpcPool};

/// Read-only access to contract state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Native balance in wei.
    async fn get_balance(&self, address: &Address) -> Result<u128, RpcError>;

    /// Deployed bytecode; empty for undeployed (counterfactual) accounts.
    async fn get_code(&self, address: &Address) -> Result<Vec<u8>, RpcError>;

    /// `eth_call` against `address` with ABI-encoded `call_data`.
    async fn read_contract(&self, address: &Address, call_data: &[u8]) -> Result<Vec<u8>, RpcError>;

    /// Current gas price in wei.
    async fn gas_price(&self) -> Result<u128, RpcError>;

    async fn has_code(&self, address: &Address) -> Result<bool, RpcError> {
        Ok(!self.get_code(address).await?.is_empty())
    }
}

/// JSON-RPC chain reader built on top of RpcPool.
pub struct RpcChainReader {
    pool: Arc<RpcPool>,
    /// Addresses observed with code. Code never disappears, so these skip the RPC.
    deployed: RwLock<HashSet<Address>>,
}

impl RpcChainReader {
    pub fn new(pool: Arc<RpcPool>) -> Self {
        Self {
            pool,
            deployed: RwLock::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn get_balance(&self, address: &Address) -> Result<u128, RpcError> {
        // Changes every block; cache briefly
        let result = self
            .pool
            .request_cached(
                "eth_getBalance",
                serde_json::json!([format_address(address), "latest"]),
                Duration::from_secs(2),
            )
            .await?;
        parse_quantity(&result)
    }

    async fn get_code(&self, address: &Address) -> Result<Vec<u8>, RpcError> {
        let addr = format_address(address);
        let cache_key = format!("code:{}:{addr}", self.pool.label());
        let known = self
            .deployed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address);
        if known {
            if let Some(cached) = self.pool.cached(&cache_key) {
                return parse_data(&cached);
            }
        }

        let result = self
            .pool
            .request("eth_getCode", serde_json::json!([addr, "latest"]))
            .await?;
        let code = parse_data(&result)?;
        if !code.is_empty() {
            debug!(address = %addr, len = code.len(), "code present");
            self.deployed
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(*address);
            self.pool.remember(cache_key, result, Duration::from_secs(3600));
        }
        Ok(code)
    }

    async fn read_contract(&self, address: &Address, call_data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let result = self
            .pool
            .request(
                "eth_call",
                serde_json::json!([
                    {"to": format_address(address), "data": format!("0x{}", hex::encode(call_data))},
                    "latest"
                ]),
            )
            .await?;
        parse_data(&result)
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        let result = self.pool.request("eth_gasPrice", serde_json::json!([])).await?;
        parse_quantity(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::tests::mock_rpc_server;

    #[tokio::test]
    async fn test_get_balance_parses_quantity() {
        let port = mock_rpc_server(vec![r#"{"jsonrpc":"2.0","result":"0xde0b6b3a7640000","id":1}"#]).await;
        let pool = Arc::new(RpcPool::new("chain", vec![format!("http://127.0.0.1:{port}")]));
        let reader = RpcChainReader::new(pool);
        let balance = reader.get_balance(&[1u8; 20]).await.unwrap();
        assert_eq!(balance, 1_000_000_000_000_000_000);
    }

    #[tokio::test]
    async fn test_empty_code_means_undeployed() {
        let port = mock_rpc_server(vec![r#"{"jsonrpc":"2.0","result":"0x","id":1}"#]).await;
        let pool = Arc::new(RpcPool::new("chain", vec![format!("http://127.0.0.1:{port}")]));
        let reader = RpcChainReader::new(pool);
        assert!(!reader.has_code(&[2u8; 20]).await.unwrap());
        assert!(reader.deployed.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_code_presence_is_remembered() {
        let port = mock_rpc_server(vec![
            r#"{"jsonrpc":"2.0","result":"0x6080","id":1}"#,
            r#"{"jsonrpc":"2.0","error":{"code":-32000,"message":"should not be called"},"id":2}"#,
        ])
        .await;
        let pool = Arc::new(RpcPool::new("chain", vec![format!("http://127.0.0.1:{port}")]));
        let reader = RpcChainReader::new(pool);
        assert_eq!(reader.get_code(&[3u8; 20]).await.unwrap(), vec![0x60, 0x80]);
        // Second read is served from cache
        assert_eq!(reader.get_code(&[3u8; 20]).await.unwrap(), vec![0x60, 0x80]);
    }

    #[tokio::test]
    async fn test_read_contract_returns_bytes() {
        let port = mock_rpc_server(vec![
            r#"{"jsonrpc":"2.0","result":"0x0000000000000000000000000000000000000000000000000000000000000007","id":1}"#,
        ])
        .await;
        let pool = Arc::new(RpcPool::new("chain", vec![format!("http://127.0.0.1:{port}")]));
        let reader = RpcChainReader::new(pool);
        let out = reader.read_contract(&[4u8; 20], &[0x70, 0xa0, 0x82, 0x31]).await.unwrap();
        assert_eq!(crate::abi::decode_uint(&out, 0), Some(7));
    }
}
