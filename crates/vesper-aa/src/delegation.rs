use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vesper_chain::abi::{encode, encode_call, keccak256, Token};
use vesper_chain::{LocalKeySigner, Signer, SignerError};
use vesper_common::{format_address, format_hash, Address, Hash32, VesperError};
use vesper_vault::{Caveat, DelegationRecord, SecureDelegationStore, SessionKeyMaterial, StorageLocation};

use crate::account::{OperationCall, SmartAccount, SmartAccountState};
use crate::error::ExecutionError;
use crate::pipeline::{ExecuteOptions, ExecutionContext, ExecutionPipeline, SubmittedOperation};

#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("account must be deployed before delegating")]
    AccountNotDeployed,
    #[error("delegation signature rejected by user")]
    Rejected,
    #[error("signer error: {0}")]
    Signer(SignerError),
    #[error("delegation storage failed: {0}")]
    Storage(#[from] VesperError),
}

impl From<SignerError> for DelegationError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::Rejected => DelegationError::Rejected,
            other => DelegationError::Signer(other),
        }
    }
}

/// Enforcer contracts, one per caveat kind. A caveat without an enforcer is reported as failed.
#[derive(Debug, Clone, Default)]
pub struct CaveatEnforcers {
    pub action_limit: Option<Address>,
    pub rate_limit: Option<Address>,
    pub spending_limit: Option<Address>,
}

impl CaveatEnforcers {
    fn for_caveat(&self, caveat: &Caveat) -> Option<Address> {
        match caveat {
            Caveat::ActionLimit { .. } => self.action_limit,
            Caveat::RateLimit { .. } => self.rate_limit,
            Caveat::SpendingLimit { .. } => self.spending_limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DelegationConfig {
    pub validity: chrono::Duration,
    pub enforcers: CaveatEnforcers,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            validity: chrono::Duration::days(7),
            enforcers: CaveatEnforcers::default(),
        }
    }
}

/// Progress notifications for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DelegationEvent {
    CaveatRegistered { caveat: Caveat, operation_hash: String },
    CaveatFailed { caveat: Caveat, reason: String },
    /// The record lives only in unencrypted local storage.
    StoredLocally,
    /// The delegated path failed; the owner wallet will prompt instead.
    FallbackToWallet { reason: String },
    Disabled,
}

#[derive(Debug, Clone)]
pub struct CaveatOutcome {
    pub caveat: Caveat,
    pub result: Result<Hash32, String>,
}

/// Result of `enable`: the record, where it landed, and per-caveat outcomes.
#[derive(Debug, Clone)]
pub struct DelegationGrant {
    pub record: DelegationRecord,
    pub location: StorageLocation,
    pub caveats: Vec<CaveatOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    Delegated,
    Direct,
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub submitted: SubmittedOperation,
    pub path: ExecutionPath,
    /// The delegated path was tried and failed first.
    pub fell_back: bool,
}

fn caveat_terms(caveat: &Caveat) -> (u128, u128, u128) {
    match caveat {
        Caveat::ActionLimit { max_actions } => (1, *max_actions as u128, 0),
        Caveat::RateLimit {
            max_actions,
            period_secs,
        } => (2, *max_actions as u128, *period_secs as u128),
        Caveat::SpendingLimit { max_wei } => (3, *max_wei, 0),
    }
}

/// `keccak(abi.encode(delegator, delegate, keccak(terms), salt, validUntil))`
pub fn delegation_hash(
    delegator: &Address,
    delegate: &Address,
    caveats: &[Caveat],
    salt: u64,
    valid_until: DateTime<Utc>,
) -> Hash32 {
    let mut terms = Vec::with_capacity(caveats.len() * 96);
    for caveat in caveats {
        let (kind, a, b) = caveat_terms(caveat);
        terms.extend_from_slice(&encode(&[Token::Uint(kind), Token::Uint(a), Token::Uint(b)]));
    }
    keccak256(&encode(&[
        Token::Address(*delegator),
        Token::Address(*delegate),
        Token::Bytes32(keccak256(&terms)),
        Token::Uint(salt as u128),
        Token::Uint(valid_until.timestamp().max(0) as u128),
    ]))
}

/// Session key acting under a delegation. Signatures carry the delegation
/// hash and the owner's grant so the account can verify the chain of authority.
struct DelegatedSigner {
    session: Arc<LocalKeySigner>,
    delegation_hash: Hash32,
    owner_signature: Vec<u8>,
}

#[async_trait]
impl Signer for DelegatedSigner {
    fn address(&self) -> Address {
        self.session.address()
    }

    async fn sign_hash(&self, hash: &Hash32) -> Result<Vec<u8>, SignerError> {
        let mut sig = self.session.sign_hash(hash).await?;
        sig.extend_from_slice(&self.delegation_hash);
        sig.extend_from_slice(&self.owner_signature);
        Ok(sig)
    }
}

struct ActiveDelegation {
    record: DelegationRecord,
    location: StorageLocation,
    session: Arc<LocalKeySigner>,
}

/// Session-key delegation: opt-in, persistence, restore and execution with wallet fallback.
pub struct DelegationManager {
    store: Arc<SecureDelegationStore>,
    pipeline: Arc<ExecutionPipeline>,
    config: DelegationConfig,
    active: RwLock<Option<ActiveDelegation>>,
    events: broadcast::Sender<DelegationEvent>,
}

impl DelegationManager {
    pub fn new(store: Arc<SecureDelegationStore>, pipeline: Arc<ExecutionPipeline>, config: DelegationConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            pipeline,
            config,
            active: RwLock::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DelegationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DelegationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_active(&self, active: Option<ActiveDelegation>) {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = active;
    }

    /// Generate a session key, have the owner sign the grant, persist it and
    /// register any caveats. Caveats register independently.
    pub async fn enable(&self, account: &SmartAccount, caveats: Vec<Caveat>) -> Result<DelegationGrant, DelegationError> {
        if !account.is_deployed() {
            return Err(DelegationError::AccountNotDeployed);
        }
        let owner = account.owner();
        let delegator = account.address();

        let session = Arc::new(LocalKeySigner::generate());
        let salt: u64 = rand::random();
        let created_at = Utc::now();
        let valid_until = created_at + self.config.validity;
        let hash = delegation_hash(&delegator, &session.address(), &caveats, salt, valid_until);

        let signature = account.signer().sign_hash(&hash).await?;

        let record = DelegationRecord {
            id: Uuid::new_v4(),
            delegator,
            owner,
            session_key_address: session.address(),
            session_key: SessionKeyMaterial(session.secret()),
            delegation_hash: hash,
            signature,
            salt,
            caveats: caveats.clone(),
            created_at,
            valid_until,
        };

        let location = self.store.put(&owner, &record).await?;
        if location == StorageLocation::LocalFallback {
            self.emit(DelegationEvent::StoredLocally);
        }
        info!(
            account = %format_address(&delegator),
            session_key = %format_address(&record.session_key_address),
            valid_until = %valid_until,
            ?location,
            "delegation enabled"
        );
        self.set_active(Some(ActiveDelegation {
            record: record.clone(),
            location,
            session,
        }));

        let mut outcomes = Vec::with_capacity(caveats.len());
        for caveat in caveats {
            let result = self.register_caveat(account, &record, &caveat).await;
            match &result {
                Ok(op_hash) => self.emit(DelegationEvent::CaveatRegistered {
                    caveat: caveat.clone(),
                    operation_hash: format_hash(op_hash),
                }),
                Err(reason) => {
                    warn!(caveat = caveat.name(), %reason, "caveat registration failed");
                    self.emit(DelegationEvent::CaveatFailed {
                        caveat: caveat.clone(),
                        reason: reason.clone(),
                    })
                }
            }
            outcomes.push(CaveatOutcome { caveat, result });
        }

        Ok(DelegationGrant {
            record,
            location,
            caveats: outcomes,
        })
    }

    async fn register_caveat(&self, account: &SmartAccount, record: &DelegationRecord, caveat: &Caveat) -> Result<Hash32, String> {
        let enforcer = self
            .config
            .enforcers
            .for_caveat(caveat)
            .ok_or_else(|| format!("no enforcer configured for {}", caveat.name()))?;
        let (_, a, b) = caveat_terms(caveat);
        let data = encode_call(
            "registerCaveat(bytes32,address,uint256,uint256)",
            &[
                Token::Bytes32(record.delegation_hash),
                Token::Address(record.session_key_address),
                Token::Uint(a),
                Token::Uint(b),
            ],
        );
        self.pipeline
            .execute(&account.context(), &OperationCall::new(enforcer, data), ExecuteOptions::default())
            .await
            .map(|submitted| submitted.operation_hash)
            .map_err(|e| e.to_string())
    }

    /// Clear the record and drop the session key. On-chain caveats are left alone.
    pub async fn disable(&self, owner: &Address, account: &Address) -> Result<(), DelegationError> {
        self.set_active(None);
        self.emit(DelegationEvent::Disabled);
        self.store.remove(owner, account).await?;
        info!(account = %format_address(account), "delegation disabled");
        Ok(())
    }

    /// Reload a persisted delegation, e.g. at start-up. Returns where it was found.
    pub async fn restore(&self, owner: &Address, account: &Address) -> Option<StorageLocation> {
        let (record, location) = self.store.get(owner, account).await?;
        let session = match LocalKeySigner::from_secret(&record.session_key.0) {
            Ok(s) if s.address() == record.session_key_address => s,
            Ok(_) | Err(_) => {
                warn!(account = %format_address(account), "stored session key does not match record, ignoring");
                return None;
            }
        };
        if location == StorageLocation::LocalFallback {
            self.emit(DelegationEvent::StoredLocally);
        }
        debug!(account = %format_address(account), ?location, "delegation restored");
        self.set_active(Some(ActiveDelegation {
            record,
            location,
            session: Arc::new(session),
        }));
        Some(location)
    }

    /// Record present, unexpired, and bound to this owner and account.
    pub fn should_use_delegation(&self, owner: &Address, account: &Address) -> bool {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        active
            .as_ref()
            .is_some_and(|a| a.record.belongs_to(owner, account) && !a.record.is_expired(Utc::now()))
    }

    pub fn active_record(&self) -> Option<(DelegationRecord, StorageLocation)> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        active.as_ref().map(|a| (a.record.clone(), a.location))
    }

    fn delegated_signer(&self, owner: &Address, account: &Address) -> Option<DelegatedSigner> {
        if !self.should_use_delegation(owner, account) {
            return None;
        }
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        active.as_ref().map(|a| DelegatedSigner {
            session: a.session.clone(),
            delegation_hash: a.record.delegation_hash,
            owner_signature: a.record.signature.clone(),
        })
    }

    /// Execute with the session key. No wallet prompt.
    pub async fn execute_delegated(
        &self,
        account: &SmartAccountState,
        call: &OperationCall,
        options: ExecuteOptions,
    ) -> Result<SubmittedOperation, ExecutionError> {
        let signer = self
            .delegated_signer(&account.owner_address, &account.account_address)
            .ok_or_else(|| ExecutionError::PreconditionMissing("no active delegation".into()))?;
        let ctx = ExecutionContext {
            sender: account.account_address,
            signer: Some(Arc::new(signer)),
            init_code: None,
            on_deployed: None,
        };
        self.pipeline.execute(&ctx, call, options).await
    }

    /// Delegated when possible, falling back once to the owner-signed path.
    pub async fn execute_action(
        &self,
        account: &SmartAccount,
        call: &OperationCall,
        options: ExecuteOptions,
    ) -> Result<ActionOutcome, ExecutionError> {
        let mut fell_back = false;
        if self.should_use_delegation(&account.owner(), &account.address()) {
            match self.execute_delegated(account.state(), call, options).await {
                Ok(submitted) => {
                    return Ok(ActionOutcome {
                        submitted,
                        path: ExecutionPath::Delegated,
                        fell_back: false,
                    })
                }
                Err(e) => {
                    warn!(account = %format_address(&account.address()), %e, "delegated execution failed, falling back to wallet");
                    self.emit(DelegationEvent::FallbackToWallet { reason: e.user_message() });
                    fell_back = true;
                }
            }
        }
        let submitted = self.pipeline.execute(&account.context(), call, options).await?;
        Ok(ActionOutcome {
            submitted,
            path: ExecutionPath::Direct,
            fell_back,
        })
    }
}
