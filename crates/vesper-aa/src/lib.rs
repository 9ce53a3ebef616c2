pub mod account;
pub mod bundler;
pub mod classify;
pub mod config;
pub mod delegation;
pub mod error;
pub mod lifecycle;
pub mod paymaster;
pub mod pipeline;
pub mod receipt;
pub mod tba;
pub mod watcher;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use vesper_chain::{ChainReader, RpcChainReader, RpcPool};
use vesper_common::{Result, SecretBytes, VesperError};
use vesper_vault::{EncryptedStore, EncryptionService, FileStore, HttpStore, RecordStore, SecureDelegationStore};

pub use account::{AccountFactory, OperationCall, SmartAccount, SmartAccountState};
pub use bundler::{BundlerClient, HttpBundler, UserOperation};
pub use classify::{classify, ErrorKind};
pub use config::EngineConfig;
pub use delegation::{DelegationConfig, DelegationEvent, DelegationManager};
pub use error::ExecutionError;
pub use lifecycle::{AccountManager, DeployError, LifecycleConfig};
pub use paymaster::{HttpPaymaster, PaymasterError, Sponsor};
pub use pipeline::{
    DeploymentHook, DeploymentRecorder, ExecuteOptions, ExecutionContext, ExecutionPipeline, PipelineConfig,
    SubmittedOperation,
};
pub use receipt::{ReceiptResolver, ReceiptStatus, TransactionReceipt};
pub use tba::{CreationError, TbaConfig, TbaCreator, TbaRecord};
pub use watcher::{spawn_watcher, IndexedEvent, IndexerSource, ReadCache};

/// Fully wired engine: one pipeline shared by the account, delegation and TBA flows.
pub struct AaEngine {
    pub config: EngineConfig,
    pub reader: Arc<dyn ChainReader>,
    pub pipeline: Arc<ExecutionPipeline>,
    pub accounts: Arc<AccountManager>,
    pub delegations: Arc<DelegationManager>,
    /// `None` unless a game contract and TBA implementation are configured.
    pub tba: Option<Arc<TbaCreator>>,
}

impl AaEngine {
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        if config.rpc_urls.is_empty() {
            return Err(VesperError::ConfigError("VESPER_RPC_URLS is empty".into()));
        }
        if config.bundler_urls.is_empty() {
            return Err(VesperError::ConfigError("VESPER_BUNDLER_URLS is empty".into()));
        }
        let factory_address = config
            .account_factory
            .ok_or_else(|| VesperError::ConfigError("VESPER_ACCOUNT_FACTORY is not set".into()))?;
        let implementation = config
            .account_implementation
            .ok_or_else(|| VesperError::ConfigError("VESPER_ACCOUNT_IMPLEMENTATION is not set".into()))?;

        let reader: Arc<dyn ChainReader> =
            Arc::new(RpcChainReader::new(Arc::new(RpcPool::new("rpc", config.rpc_urls.clone()))));
        let bundler: Arc<dyn BundlerClient> =
            Arc::new(HttpBundler::new(Arc::new(RpcPool::new("bundler", config.bundler_urls.clone()))));
        let sponsor: Option<Arc<dyn Sponsor>> = config.paymaster_url.as_ref().map(|url| {
            let paymaster = HttpPaymaster::new(Arc::new(RpcPool::new("paymaster", vec![url.clone()])));
            let paymaster = match &config.sponsorship_policy_id {
                Some(policy) => paymaster.with_policy(policy.clone()),
                None => paymaster,
            };
            Arc::new(paymaster) as Arc<dyn Sponsor>
        });

        let receipts = ReceiptResolver::for_bundler(bundler.clone(), config.receipt_attempts, config.receipt_delay());
        let pipeline = Arc::new(ExecutionPipeline::new(
            reader.clone(),
            bundler,
            sponsor,
            receipts,
            PipelineConfig {
                entry_point: config.entry_point,
                chain_id: config.chain_id,
                nonce_attempts: config.nonce_attempts,
                nonce_retry_delay: config.nonce_retry_delay(),
                allow_unsponsored: config.allow_unsponsored,
            },
        ));

        let accounts = Arc::new(AccountManager::new(
            AccountFactory::new(factory_address, implementation, config.account_kind),
            pipeline.clone(),
            Arc::new(FileStore::new(config.local_store_dir.join("accounts"))),
            LifecycleConfig {
                salt: config.account_salt,
                state_ttl: config.account_state_ttl(),
                confirm_attempts: config.confirm_attempts,
                confirm_delay: config.confirm_delay(),
            },
        ));

        let encryption = EncryptionService::new(SecretBytes(config.delegation_key_bytes()?))?;
        let primary: Arc<dyn RecordStore> = match &config.delegation_store_url {
            Some(url) => {
                let remote = HttpStore::new(url.clone());
                let remote = match &config.delegation_store_token {
                    Some(token) => remote.with_auth_token(token.clone()),
                    None => remote,
                };
                Arc::new(EncryptedStore::new(remote, encryption))
            }
            None => Arc::new(EncryptedStore::new(
                FileStore::new(config.local_store_dir.join("vault")),
                encryption,
            )),
        };
        let fallback = Arc::new(FileStore::new(config.local_store_dir.join("delegations")));
        let delegations = Arc::new(DelegationManager::new(
            Arc::new(SecureDelegationStore::new(primary, fallback)),
            pipeline.clone(),
            DelegationConfig {
                validity: config.delegation_validity(),
                enforcers: config.enforcers(),
            },
        ));

        let tba = match (config.game_contract, config.tba_implementation) {
            (Some(game_contract), Some(implementation)) => Some(Arc::new(TbaCreator::new(
                pipeline.clone(),
                TbaConfig {
                    registry: config.tba_registry,
                    implementation,
                    chain_id: config.chain_id,
                    game_contract,
                    mapping_attempts: config.tba_mapping_attempts,
                    mapping_delay: config.tba_mapping_delay(),
                },
            ))),
            _ => None,
        };

        tracing::info!(
            chain_id = config.chain_id,
            sponsored = pipeline.has_sponsor(),
            tba = tba.is_some(),
            "engine initialised"
        );
        Ok(Self {
            config,
            reader,
            pipeline,
            accounts,
            delegations,
            tba,
        })
    }

    /// Start the background read-cache refresher. The write path never waits on it.
    pub fn watch(
        &self,
        source: Arc<dyn IndexerSource>,
        capacity: usize,
        interval: Duration,
    ) -> (Arc<RwLock<ReadCache>>, JoinHandle<()>) {
        let cache = Arc::new(RwLock::new(ReadCache::new(capacity)));
        let handle = spawn_watcher(source, cache.clone(), interval);
        (cache, handle)
    }
}
