use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use vesper_chain::{RpcError, Signer};
use vesper_common::{format_address, format_hash, Address, Hash32};
use vesper_vault::RecordStore;

use crate::account::{AccountFactory, OperationCall, PersistedAccountState, SmartAccount, SmartAccountState};
use crate::error::ExecutionError;
use crate::pipeline::{DeploymentRecorder, ExecuteOptions, ExecutionPipeline};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("no signer available to deploy the account")]
    MissingSigner,
    #[error("no sponsor configured for gasless deployment")]
    MissingSponsor,
    #[error("chain read failed: {0}")]
    Chain(#[from] RpcError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("deployment {} submitted but bytecode not observed", format_hash(.operation_hash))]
    Unconfirmed { operation_hash: Hash32 },
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub salt: u64,
    /// How long persisted state is trusted without re-checking the chain.
    pub state_ttl: chrono::Duration,
    pub confirm_attempts: u32,
    pub confirm_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            salt: 0,
            state_ttl: chrono::Duration::days(7),
            confirm_attempts: 3,
            confirm_delay: Duration::from_secs(2),
        }
    }
}

/// Removes the owner from the in-flight set when the deploy finishes or is dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Address>>,
    owner: Address,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.owner);
    }
}

/// Known account states, shared with live handles and persisted on change.
struct AccountRegistry {
    factory: AccountFactory,
    salt: u64,
    store: Arc<dyn RecordStore>,
    states: Mutex<HashMap<Address, SmartAccountState>>,
}

impl AccountRegistry {
    fn cached(&self, owner: &Address) -> Option<SmartAccountState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(owner)
            .cloned()
    }

    async fn persist(&self, state: &SmartAccountState) {
        let key = PersistedAccountState::storage_key(&state.owner_address);
        let persisted = PersistedAccountState {
            state: state.clone(),
            saved_at: Utc::now(),
        };
        let result = match serde_json::to_vec(&persisted) {
            Ok(bytes) => self.store.put(&key, bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(%key, %e, "failed to persist account state");
        }
    }

    /// Flip `is_deployed` to true (once) and persist.
    async fn mark_deployed(&self, owner: &Address) -> SmartAccountState {
        let (state, changed) = {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            let entry = states
                .entry(*owner)
                .or_insert_with(|| self.factory.initial_state(owner, self.salt));
            let changed = !entry.is_deployed;
            entry.is_deployed = true;
            (entry.clone(), changed)
        };
        if changed {
            info!(owner = %format_address(owner), account = %format_address(&state.account_address), "account deployed");
        }
        self.persist(&state).await;
        state
    }
}

#[async_trait]
impl DeploymentRecorder for AccountRegistry {
    fn is_deployed(&self, owner: &Address) -> bool {
        self.cached(owner).is_some_and(|s| s.is_deployed)
    }

    async fn record_deployed(&self, owner: &Address) {
        self.mark_deployed(owner).await;
    }
}

/// Per-owner smart-account state: derivation, persistence and deployment.
pub struct AccountManager {
    registry: Arc<AccountRegistry>,
    pipeline: Arc<ExecutionPipeline>,
    config: LifecycleConfig,
    in_flight: Mutex<HashSet<Address>>,
}

impl AccountManager {
    pub fn new(
        factory: AccountFactory,
        pipeline: Arc<ExecutionPipeline>,
        store: Arc<dyn RecordStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry: Arc::new(AccountRegistry {
                factory,
                salt: config.salt,
                store,
                states: Mutex::new(HashMap::new()),
            }),
            pipeline,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn factory(&self) -> &AccountFactory {
        &self.registry.factory
    }

    /// Deterministic account address; no network access.
    pub fn account_address(&self, owner: &Address) -> Address {
        self.registry.factory.compute_address(owner, self.config.salt)
    }

    /// Current state for `owner`: in memory, else restored from storage, else freshly derived.
    /// Never touches the chain or the signer.
    pub async fn get_or_init_account(&self, owner: &Address) -> SmartAccountState {
        if let Some(state) = self.registry.cached(owner) {
            return state;
        }
        let state = match self.restore(owner).await {
            Some(state) => state,
            None => {
                debug!(owner = %format_address(owner), "deriving fresh account state");
                self.registry.factory.initial_state(owner, self.config.salt)
            }
        };
        let mut states = self.registry.states.lock().unwrap_or_else(|e| e.into_inner());
        // A concurrent caller may have won the race; keep whichever is further along
        let entry = states.entry(*owner).or_insert_with(|| state.clone());
        if state.is_deployed && !entry.is_deployed {
            entry.is_deployed = true;
        }
        entry.clone()
    }

    async fn restore(&self, owner: &Address) -> Option<SmartAccountState> {
        let key = PersistedAccountState::storage_key(owner);
        let bytes = match self.registry.store.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(%key, %e, "account state unreadable");
                return None;
            }
        };
        let persisted: PersistedAccountState = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(%key, %e, "discarding malformed account state");
                self.discard(&key).await;
                return None;
            }
        };

        let expected = self.account_address(owner);
        let expired = Utc::now() - persisted.saved_at > self.config.state_ttl;
        if persisted.state.owner_address != *owner || persisted.state.account_address != expected || expired {
            info!(%key, expired, "discarding stale account state");
            self.discard(&key).await;
            return None;
        }
        debug!(%key, deployed = persisted.state.is_deployed, "account state restored");
        Some(persisted.state)
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.registry.store.delete(key).await {
            warn!(%key, %e, "failed to delete account state");
        }
    }

    /// Check bytecode on chain and record deployment if present.
    pub async fn sync_deployment(&self, owner: &Address) -> Result<SmartAccountState, DeployError> {
        let state = self.get_or_init_account(owner).await;
        if state.is_deployed {
            return Ok(state);
        }
        if self.pipeline.reader().has_code(&state.account_address).await? {
            return Ok(self.registry.mark_deployed(owner).await);
        }
        Ok(state)
    }

    /// Signer-bound handle for actions. Built on demand, never during restore.
    /// An undeployed account gets one code read (no signer involved) so init
    /// code is never attached to an account that already exists on chain.
    pub async fn account(&self, owner: &Address, signer: Arc<dyn Signer>) -> SmartAccount {
        let mut state = self.get_or_init_account(owner).await;
        if !state.is_deployed {
            match self.pipeline.reader().has_code(&state.account_address).await {
                Ok(true) => state = self.registry.mark_deployed(owner).await,
                Ok(false) => {}
                Err(e) => debug!(owner = %format_address(owner), %e, "code check failed, assuming undeployed"),
            }
        }
        let init_code = self.registry.factory.encode_init_code(owner, self.config.salt);
        SmartAccount::new(state, signer, init_code).with_recorder(self.registry.clone())
    }

    /// Deploy through the account's first sponsored operation. A no-op when
    /// already deployed or when another deploy for this owner is in flight.
    pub async fn deploy(&self, owner: &Address, signer: Option<Arc<dyn Signer>>) -> Result<SmartAccountState, DeployError> {
        let state = self.get_or_init_account(owner).await;
        if state.is_deployed {
            return Ok(state);
        }

        let _guard = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(*owner) {
                debug!(owner = %format_address(owner), "deployment already in flight");
                return Ok(state);
            }
            InFlight {
                set: &self.in_flight,
                owner: *owner,
            }
        };

        let signer = signer.ok_or(DeployError::MissingSigner)?;
        if !self.pipeline.has_sponsor() {
            return Err(DeployError::MissingSponsor);
        }

        // Deployed elsewhere (another device, earlier session)
        if self.pipeline.reader().has_code(&state.account_address).await? {
            return Ok(self.registry.mark_deployed(owner).await);
        }

        let account = SmartAccount::new(
            state.clone(),
            signer,
            self.registry.factory.encode_init_code(owner, self.config.salt),
        );
        let noop = OperationCall::new(state.account_address, vec![]);
        info!(owner = %format_address(owner), account = %format_address(&state.account_address), "deploying account");
        let submitted = self
            .pipeline
            .execute(&account.context(), &noop, ExecuteOptions::default())
            .await?;

        for attempt in 1..=self.config.confirm_attempts.max(1) {
            match self.pipeline.reader().has_code(&state.account_address).await {
                Ok(true) => return Ok(self.registry.mark_deployed(owner).await),
                Ok(false) => debug!(attempt, "account code not visible yet"),
                Err(e) => debug!(attempt, %e, "code check failed"),
            }
            tokio::time::sleep(self.config.confirm_delay).await;
        }

        if submitted.receipt.success == Some(true) {
            return Ok(self.registry.mark_deployed(owner).await);
        }
        warn!(owner = %format_address(owner), op_hash = %format_hash(&submitted.operation_hash), "deployment not confirmed");
        Err(DeployError::Unconfirmed {
            operation_hash: submitted.operation_hash,
        })
    }

    /// Forget in-memory state; persisted state survives for the next connect.
    pub fn disconnect(&self, owner: &Address) {
        self.registry.states.lock().unwrap_or_else(|e| e.into_inner()).remove(owner);
    }

    /// Forget in-memory and persisted state.
    pub async fn reset(&self, owner: &Address) -> vesper_common::Result<()> {
        self.disconnect(owner);
        self.registry.store.delete(&PersistedAccountState::storage_key(owner)).await
    }
}
