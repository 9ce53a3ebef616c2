use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use vesper_chain::abi::{decode_address, decode_uint, encode, encode_call, keccak256, uint_word, Token};
use vesper_chain::RpcError;
use vesper_common::{format_address, hex_address, Address, Hash32, ZERO_ADDRESS};

use crate::account::{create2_address, OperationCall, SmartAccount};
use crate::classify::is_already_exists;
use crate::error::ExecutionError;
use crate::paymaster::PaymasterError;
use crate::pipeline::{ExecuteOptions, ExecutionPipeline};

const ERC6551_PROXY_HEAD: [u8; 20] = [
    0x3d, 0x60, 0xad, 0x80, 0x60, 0x0a, 0x3d, 0x39, 0x81, 0xf3, 0x36, 0x3d, 0x3d, 0x37, 0x3d, 0x3d, 0x3d, 0x36, 0x3d,
    0x73,
];
const ERC6551_PROXY_TAIL: [u8; 15] = [
    0x5a, 0xf4, 0x3d, 0x82, 0x80, 0x3e, 0x90, 0x3d, 0x91, 0x60, 0x2b, 0x57, 0xfd, 0x5b, 0xf3,
];

#[derive(Debug, Error)]
pub enum CreationError {
    #[error("account holds no token from {}", format_address(.token_contract))]
    NoQualifyingToken { token_contract: Address },
    /// Service-side: the sponsor declined, not the user.
    #[error("sponsor rejected TBA creation: {0}")]
    SponsorRejected(PaymasterError),
    #[error(transparent)]
    Execution(ExecutionError),
    #[error("chain read failed: {0}")]
    Chain(#[from] RpcError),
}

impl From<ExecutionError> for CreationError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::SponsorRejected(e) => CreationError::SponsorRejected(e),
            other => CreationError::Execution(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TbaRecord {
    #[serde(with = "hex_address")]
    pub owner_account: Address,
    #[serde(with = "hex_address")]
    pub token_contract: Address,
    pub token_id: u128,
    #[serde(with = "hex_address")]
    pub implementation: Address,
    pub chain_id: u64,
    /// Known only when this flow created the account.
    pub salt: Option<Hash32>,
    #[serde(with = "hex_address")]
    pub derived_account_address: Address,
    /// `None` when an existing account was resolved.
    pub operation_hash: Option<Hash32>,
}

#[derive(Debug, Clone)]
pub struct TbaConfig {
    pub registry: Address,
    pub implementation: Address,
    pub chain_id: u64,
    /// Player-state contract that creates and registers TBAs in one call.
    pub game_contract: Address,
    pub mapping_attempts: u32,
    pub mapping_delay: Duration,
}

/// ERC-6551 account address for (implementation, chain, token, salt) under `registry`.
pub fn compute_tba_address(
    registry: &Address,
    implementation: &Address,
    salt: &Hash32,
    chain_id: u64,
    token_contract: &Address,
    token_id: u128,
) -> Address {
    let mut code = Vec::with_capacity(55 + 128);
    code.extend_from_slice(&ERC6551_PROXY_HEAD);
    code.extend_from_slice(implementation);
    code.extend_from_slice(&ERC6551_PROXY_TAIL);
    code.extend_from_slice(&encode(&[
        Token::Bytes32(*salt),
        Token::Uint(chain_id as u128),
        Token::Address(*token_contract),
        Token::Uint(token_id),
    ]));
    create2_address(registry, salt, &keccak256(&code))
}

/// Time-based salt so a fresh attempt does not collide with an abandoned one.
fn time_salt() -> Hash32 {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u128;
    uint_word(nanos)
}

/// Creates token-bound accounts for NFTs held by a smart account.
pub struct TbaCreator {
    pipeline: Arc<ExecutionPipeline>,
    config: TbaConfig,
}

impl TbaCreator {
    pub fn new(pipeline: Arc<ExecutionPipeline>, config: TbaConfig) -> Self {
        Self { pipeline, config }
    }

    fn record(&self, account: &SmartAccount, token_contract: &Address, token_id: u128, derived: Address) -> TbaRecord {
        TbaRecord {
            owner_account: account.address(),
            token_contract: *token_contract,
            token_id,
            implementation: self.config.implementation,
            chain_id: self.config.chain_id,
            salt: None,
            derived_account_address: derived,
            operation_hash: None,
        }
    }

    /// Canonical TBA registered for the token, if any.
    pub async fn registered_account(&self, token_contract: &Address, token_id: u128) -> Result<Option<Address>, RpcError> {
        let data = encode_call(
            "tokenBoundAccountOf(address,uint256)",
            &[Token::Address(*token_contract), Token::Uint(token_id)],
        );
        let ret = self
            .pipeline
            .reader()
            .read_contract(&self.config.game_contract, &data)
            .await?;
        Ok(decode_address(&ret, 0).filter(|a| *a != ZERO_ADDRESS))
    }

    /// Mapping read with retries, for right after our own submission.
    async fn await_registration(&self, token_contract: &Address, token_id: u128) -> Option<Address> {
        for attempt in 1..=self.config.mapping_attempts.max(1) {
            match self.registered_account(token_contract, token_id).await {
                Ok(Some(addr)) => return Some(addr),
                Ok(None) => debug!(attempt, "TBA not registered yet"),
                Err(e) => debug!(attempt, %e, "TBA mapping read failed"),
            }
            if attempt < self.config.mapping_attempts {
                tokio::time::sleep(self.config.mapping_delay).await;
            }
        }
        None
    }

    async fn holds_token(&self, account: &Address, token_contract: &Address) -> Result<bool, RpcError> {
        let data = encode_call("balanceOf(address)", &[Token::Address(*account)]);
        let ret = self.pipeline.reader().read_contract(token_contract, &data).await?;
        Ok(decode_uint(&ret, 0).unwrap_or(0) > 0)
    }

    /// Create and register the TBA for (`token_contract`, `token_id`) in one
    /// operation. Idempotent: an existing account is returned, not an error.
    pub async fn create(
        &self,
        account: &SmartAccount,
        token_contract: &Address,
        token_id: u128,
    ) -> Result<TbaRecord, CreationError> {
        if !self.holds_token(&account.address(), token_contract).await? {
            return Err(CreationError::NoQualifyingToken {
                token_contract: *token_contract,
            });
        }

        if let Some(existing) = self.registered_account(token_contract, token_id).await? {
            debug!(tba = %format_address(&existing), token_id, "TBA already registered");
            return Ok(self.record(account, token_contract, token_id, existing));
        }

        let salt = time_salt();
        let expected = compute_tba_address(
            &self.config.registry,
            &self.config.implementation,
            &salt,
            self.config.chain_id,
            token_contract,
            token_id,
        );
        let data = encode_call(
            "createTokenBoundAccount(address,address,bytes32,uint256,address,uint256)",
            &[
                Token::Address(self.config.registry),
                Token::Address(self.config.implementation),
                Token::Bytes32(salt),
                Token::Uint(self.config.chain_id as u128),
                Token::Address(*token_contract),
                Token::Uint(token_id),
            ],
        );
        let call = OperationCall::new(self.config.game_contract, data);

        match self.pipeline.execute(&account.context(), &call, ExecuteOptions::default()).await {
            Ok(submitted) => {
                let derived = match self.await_registration(token_contract, token_id).await {
                    Some(addr) => addr,
                    None => {
                        warn!(tba = %format_address(&expected), "registration not visible yet, using derived address");
                        expected
                    }
                };
                info!(tba = %format_address(&derived), token_id, "TBA created");
                Ok(TbaRecord {
                    salt: Some(salt),
                    operation_hash: Some(submitted.operation_hash),
                    ..self.record(account, token_contract, token_id, derived)
                })
            }
            Err(e) if !matches!(e, ExecutionError::SponsorRejected(_)) && is_already_exists(&e.to_string()) => {
                info!(token_id, "TBA already exists, resolving canonical mapping");
                match self.await_registration(token_contract, token_id).await {
                    Some(existing) => Ok(self.record(account, token_contract, token_id, existing)),
                    None => Err(CreationError::Execution(e)),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
