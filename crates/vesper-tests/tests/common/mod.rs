#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vesper_aa::delegation::{DelegationConfig, DelegationManager};
use vesper_aa::lifecycle::{AccountManager, LifecycleConfig};
use vesper_aa::pipeline::{ExecutionPipeline, PipelineConfig};
use vesper_aa::receipt::ReceiptResolver;
use vesper_aa::tba::{TbaConfig, TbaCreator};
use vesper_aa::testing::{MockBundler, MockChain, MockSponsor, PromptCountingSigner, CHAIN_ID, ENTRY_POINT};
use vesper_aa::AccountFactory;
use vesper_chain::Signer;
use vesper_common::{Address, ImplementationKind};
use vesper_vault::{InMemoryStore, SecureDelegationStore};

pub const FACTORY: Address = [0xFA; 20];
pub const IMPLEMENTATION: Address = [0x1A; 20];
pub const TBA_REGISTRY: Address = [0x65; 20];
pub const TBA_IMPLEMENTATION: Address = [0x1B; 20];
pub const GAME: Address = [0x6A; 20];
pub const NFT: Address = [0x4E; 20];

pub struct Harness {
    pub chain: Arc<MockChain>,
    pub bundler: Arc<MockBundler>,
    pub sponsor: Arc<MockSponsor>,
    pub signer: Arc<PromptCountingSigner>,
    pub pipeline: Arc<ExecutionPipeline>,
    pub account_store: InMemoryStore,
    pub accounts: Arc<AccountManager>,
    pub delegation_primary: InMemoryStore,
    pub delegation_local: InMemoryStore,
    pub delegations: Arc<DelegationManager>,
    pub tba: TbaCreator,
}

impl Harness {
    pub fn owner(&self) -> Address {
        self.signer.address()
    }

    /// Another manager over the same persisted account state, as after a restart.
    pub fn restarted_accounts(&self) -> AccountManager {
        account_manager(self.pipeline.clone(), self.account_store.clone())
    }
}

fn account_manager(pipeline: Arc<ExecutionPipeline>, store: InMemoryStore) -> AccountManager {
    AccountManager::new(
        AccountFactory::new(FACTORY, IMPLEMENTATION, ImplementationKind::Hybrid),
        pipeline,
        Arc::new(store),
        LifecycleConfig {
            confirm_attempts: 2,
            confirm_delay: Duration::from_millis(1),
            ..Default::default()
        },
    )
}

pub fn harness() -> Harness {
    harness_with(|bundler| bundler)
}

/// `customize` adjusts the chain-attached bundler before it is wired in.
pub fn harness_with(customize: impl FnOnce(MockBundler) -> MockBundler) -> Harness {
    let chain = Arc::new(MockChain::new());
    let bundler = Arc::new(customize(MockBundler::new().with_chain(chain.clone())));
    let sponsor = Arc::new(MockSponsor::new());
    let pipeline = Arc::new(ExecutionPipeline::new(
        chain.clone(),
        bundler.clone(),
        Some(sponsor.clone()),
        ReceiptResolver::for_bundler(bundler.clone(), 2, Duration::from_millis(1)),
        PipelineConfig {
            entry_point: ENTRY_POINT,
            chain_id: CHAIN_ID,
            nonce_attempts: 3,
            nonce_retry_delay: Duration::from_millis(1),
            allow_unsponsored: false,
        },
    ));

    let account_store = InMemoryStore::new();
    let accounts = Arc::new(account_manager(pipeline.clone(), account_store.clone()));

    let delegation_primary = InMemoryStore::new();
    let delegation_local = InMemoryStore::new();
    let delegations = Arc::new(DelegationManager::new(
        Arc::new(SecureDelegationStore::new(
            Arc::new(delegation_primary.clone()),
            Arc::new(delegation_local.clone()),
        )),
        pipeline.clone(),
        DelegationConfig::default(),
    ));

    let tba = TbaCreator::new(
        pipeline.clone(),
        TbaConfig {
            registry: TBA_REGISTRY,
            implementation: TBA_IMPLEMENTATION,
            chain_id: CHAIN_ID,
            game_contract: GAME,
            mapping_attempts: 2,
            mapping_delay: Duration::from_millis(1),
        },
    );

    Harness {
        chain,
        bundler,
        sponsor,
        signer: Arc::new(PromptCountingSigner::new()),
        pipeline,
        account_store,
        accounts,
        delegation_primary,
        delegation_local,
        delegations,
        tba,
    }
}
