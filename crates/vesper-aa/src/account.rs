use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vesper_chain::abi::{encode, encode_call, keccak256, Token};
use vesper_chain::Signer;
use vesper_common::{format_address, hex_address, Address, Hash32, ImplementationKind};

use crate::pipeline::{DeploymentHook, DeploymentRecorder, ExecutionContext};

/// `keccak256(0xff ‖ deployer ‖ salt ‖ init_code_hash)[12..]`
pub fn create2_address(deployer: &Address, salt: &Hash32, init_code_hash: &Hash32) -> Address {
    let mut buf = Vec::with_capacity(85);
    buf.push(0xff);
    buf.extend_from_slice(deployer);
    buf.extend_from_slice(salt);
    buf.extend_from_slice(init_code_hash);
    let hash = keccak256(&buf);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    addr
}

/// A call made from the smart account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationCall {
    pub target: Address,
    pub value: u128,
    pub data: Vec<u8>,
}

impl OperationCall {
    pub fn new(target: Address, data: Vec<u8>) -> Self {
        Self { target, value: 0, data }
    }

    pub fn with_value(mut self, value: u128) -> Self {
        self.value = value;
        self
    }

    /// Account `execute(address,uint256,bytes)` calldata wrapping this call.
    pub fn encode_execute(&self) -> Vec<u8> {
        encode_call(
            "execute(address,uint256,bytes)",
            &[
                Token::Address(self.target),
                Token::Uint(self.value),
                Token::Bytes(self.data.clone()),
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// AccountFactory — deterministic CREATE2 address computation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AccountFactory {
    pub factory_address: Address,
    pub implementation: Address,
    pub kind: ImplementationKind,
}

impl AccountFactory {
    pub fn new(factory_address: Address, implementation: Address, kind: ImplementationKind) -> Self {
        Self {
            factory_address,
            implementation,
            kind,
        }
    }

    /// Counterfactual address for `owner`. No network access.
    pub fn compute_address(&self, owner: &Address, salt: u64) -> Address {
        let create2_salt = keccak256(&encode(&[Token::Address(*owner), Token::Uint(salt as u128)]));
        let mut init = Vec::with_capacity(40);
        init.extend_from_slice(&self.implementation);
        init.extend_from_slice(owner);
        create2_address(&self.factory_address, &create2_salt, &keccak256(&init))
    }

    /// `factory ‖ createAccount(owner, salt)`, attached to the first operation.
    pub fn encode_init_code(&self, owner: &Address, salt: u64) -> Vec<u8> {
        let mut init_code = self.factory_address.to_vec();
        init_code.extend_from_slice(&encode_call(
            "createAccount(address,uint256)",
            &[Token::Address(*owner), Token::Uint(salt as u128)],
        ));
        init_code
    }

    pub fn initial_state(&self, owner: &Address, salt: u64) -> SmartAccountState {
        SmartAccountState {
            owner_address: *owner,
            account_address: self.compute_address(owner, salt),
            is_deployed: false,
            implementation_kind: self.kind,
        }
    }
}

/// Per-owner smart-account state. `is_deployed` only ever moves false -> true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartAccountState {
    #[serde(with = "hex_address")]
    pub owner_address: Address,
    #[serde(with = "hex_address")]
    pub account_address: Address,
    pub is_deployed: bool,
    pub implementation_kind: ImplementationKind,
}

/// Account state as persisted between sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedAccountState {
    pub state: SmartAccountState,
    pub saved_at: DateTime<Utc>,
}

impl PersistedAccountState {
    pub fn storage_key(owner: &Address) -> String {
        format!("account:{}", format_address(owner))
    }
}

/// Live, signer-bound account. Built only when an action needs to sign.
#[derive(Clone)]
pub struct SmartAccount {
    state: SmartAccountState,
    signer: Arc<dyn Signer>,
    init_code: Vec<u8>,
    recorder: Option<Arc<dyn DeploymentRecorder>>,
}

impl SmartAccount {
    pub(crate) fn new(state: SmartAccountState, signer: Arc<dyn Signer>, init_code: Vec<u8>) -> Self {
        Self {
            state,
            signer,
            init_code,
            recorder: None,
        }
    }

    /// Share deployment state with `recorder`, so handles built before the
    /// first operation stop attaching init code once it lands.
    pub(crate) fn with_recorder(mut self, recorder: Arc<dyn DeploymentRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn is_deployed(&self) -> bool {
        self.state.is_deployed
            || self
                .recorder
                .as_ref()
                .is_some_and(|r| r.is_deployed(&self.state.owner_address))
    }

    pub fn state(&self) -> &SmartAccountState {
        &self.state
    }

    pub fn address(&self) -> Address {
        self.state.account_address
    }

    pub fn owner(&self) -> Address {
        self.state.owner_address
    }

    pub fn signer(&self) -> Arc<dyn Signer> {
        self.signer.clone()
    }

    /// Pipeline context; carries init code until the account is deployed.
    pub fn context(&self) -> ExecutionContext {
        let deployed = self.is_deployed();
        ExecutionContext {
            sender: self.state.account_address,
            signer: Some(self.signer.clone()),
            init_code: (!deployed).then(|| self.init_code.clone()),
            on_deployed: self.recorder.as_ref().filter(|_| !deployed).map(|recorder| DeploymentHook {
                owner: self.state.owner_address,
                recorder: recorder.clone(),
            }),
        }
    }
}

impl std::fmt::Debug for SmartAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartAccount")
            .field("state", &self.state)
            .field("signer", &format_address(&self.signer.address()))
            .finish()
    }
}
