mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{harness, GAME, NFT};
use vesper_aa::testing::{address_return, uint_return};
use vesper_aa::{ExecuteOptions, OperationCall};
use vesper_chain::Signer;
use vesper_common::{SecretBytes, ZERO_ADDRESS};
use vesper_vault::{Caveat, DelegationRecord, InMemoryStore, RecordStore, SecureDelegationStore, SessionKeyMaterial};

#[tokio::test]
async fn sequential_executions_never_reuse_a_nonce() {
    let h = harness();
    let account = h.accounts.account(&h.owner(), h.signer.clone()).await;

    for i in 0..5u8 {
        let call = OperationCall::new(GAME, vec![i; 4]);
        h.pipeline
            .execute(&account.context(), &call, ExecuteOptions::default())
            .await
            .unwrap();
    }

    let nonces: Vec<u64> = h.bundler.sent().iter().map(|op| op.nonce).collect();
    assert_eq!(nonces, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn first_action_deploys_the_account_once() {
    let h = harness();
    let owner = h.owner();
    let account = h.accounts.account(&owner, h.signer.clone()).await;
    let first = OperationCall::new(GAME, vec![0x01]);
    let second = OperationCall::new(GAME, vec![0x02]);

    h.delegations
        .execute_action(&account, &first, ExecuteOptions::default())
        .await
        .unwrap();
    assert!(h.chain.has_code_now(&account.address()));
    assert!(h.accounts.get_or_init_account(&owner).await.is_deployed);

    h.delegations
        .execute_action(&account, &second, ExecuteOptions::default())
        .await
        .unwrap();

    let init_lens: Vec<usize> = h.bundler.sent().iter().map(|op| op.init_code.len()).collect();
    assert_eq!(init_lens.len(), 2);
    assert!(init_lens[0] > 0);
    assert_eq!(init_lens[1], 0);

    // After a restart the persisted flag alone keeps init code off
    let restarted = h.restarted_accounts();
    let again = restarted.account(&owner, h.signer.clone()).await;
    assert!(again.context().init_code.is_none());
}

#[tokio::test]
async fn overlapping_executions_for_one_sender_get_distinct_nonces() {
    let h = harness();
    let account = h.accounts.account(&h.owner(), h.signer.clone()).await;
    let ctx = account.context();
    let (a, b, c) = (
        OperationCall::new(GAME, vec![1]),
        OperationCall::new(GAME, vec![2]),
        OperationCall::new(GAME, vec![3]),
    );

    let (ra, rb, rc) = tokio::join!(
        h.pipeline.execute(&ctx, &a, ExecuteOptions::default()),
        h.pipeline.execute(&ctx, &b, ExecuteOptions::default()),
        h.pipeline.execute(&ctx, &c, ExecuteOptions::default()),
    );
    let submitted = [ra.unwrap(), rb.unwrap(), rc.unwrap()];

    let nonces: HashSet<u64> = submitted.iter().map(|s| s.nonce).collect();
    assert_eq!(nonces.len(), 3);
    let hashes: HashSet<[u8; 32]> = submitted.iter().map(|s| s.operation_hash).collect();
    assert_eq!(hashes.len(), 3);
}

#[tokio::test]
async fn restoring_persisted_state_never_prompts() {
    let h = harness();
    let owner = h.owner();
    let signer: Arc<dyn Signer> = h.signer.clone();
    h.accounts.deploy(&owner, Some(signer)).await.unwrap();
    let prompts = h.signer.prompts();
    assert_eq!(prompts, 1);

    let restarted = h.restarted_accounts();
    let state = restarted.get_or_init_account(&owner).await;
    assert!(state.is_deployed);
    assert_eq!(state.account_address, h.accounts.account_address(&owner));
    assert_eq!(h.signer.prompts(), prompts);
}

#[tokio::test]
async fn tba_create_twice_yields_same_address() {
    let h = harness();
    let created = [0xC0; 20];
    h.chain.set_call(&NFT, "balanceOf(address)", uint_return(1));
    // First call: empty pre-check, then registered. Second call: lagging pre-check, then registered.
    h.chain.script_call(
        &GAME,
        "tokenBoundAccountOf(address,uint256)",
        vec![
            Ok(address_return(&ZERO_ADDRESS)),
            Ok(address_return(&created)),
            Ok(address_return(&ZERO_ADDRESS)),
            Ok(address_return(&created)),
        ],
    );
    let account = h.accounts.account(&h.owner(), h.signer.clone()).await;

    let first = h.tba.create(&account, &NFT, 9).await.unwrap();
    h.bundler.fail_next_send("AccountAlreadyExists()");
    let second = h.tba.create(&account, &NFT, 9).await.unwrap();

    assert_eq!(first.derived_account_address, created);
    assert_eq!(second.derived_account_address, first.derived_account_address);
    assert!(first.operation_hash.is_some());
    assert!(second.operation_hash.is_none());
    assert_eq!(h.bundler.sent().len(), 1);

    let third = h.tba.create(&account, &NFT, 9).await.unwrap();
    assert_eq!(third.derived_account_address, created);
    assert_eq!(h.bundler.send_calls(), 2);
}

#[tokio::test]
async fn disable_then_should_use_delegation_is_false() {
    let h = harness();
    let owner = h.owner();
    let signer: Arc<dyn Signer> = h.signer.clone();
    h.accounts.deploy(&owner, Some(signer)).await.unwrap();
    let account = h.accounts.account(&owner, h.signer.clone()).await;

    h.delegations.enable(&account, vec![]).await.unwrap();
    assert!(h.delegations.should_use_delegation(&owner, &account.address()));

    h.delegations.disable(&owner, &account.address()).await.unwrap();
    assert!(!h.delegations.should_use_delegation(&owner, &account.address()));
    assert!(h.delegation_primary.is_empty());
    assert!(h.delegations.restore(&owner, &account.address()).await.is_none());
}

fn record(owner: [u8; 20], account: [u8; 20], valid_until: chrono::DateTime<Utc>) -> DelegationRecord {
    DelegationRecord {
        id: uuid::Uuid::new_v4(),
        delegator: account,
        owner,
        session_key_address: [0x5E; 20],
        session_key: SessionKeyMaterial(SecretBytes(vec![0x42; 32])),
        delegation_hash: [0xDD; 32],
        signature: vec![0x01; 65],
        salt: 1,
        caveats: vec![Caveat::ActionLimit { max_actions: 5 }],
        created_at: valid_until - Duration::days(7),
        valid_until,
    }
}

#[tokio::test]
async fn expired_delegation_is_absent_and_removed() {
    let primary = InMemoryStore::new();
    let local = InMemoryStore::new();
    let store = SecureDelegationStore::new(Arc::new(primary.clone()), Arc::new(local.clone()));
    let (owner, account) = ([0x0A; 20], [0xAA; 20]);
    let key = DelegationRecord::storage_key(&owner, &account);

    let expired = record(owner, account, Utc::now() - Duration::seconds(1));
    store.put(&owner, &expired).await.unwrap();
    assert!(primary.contains(&key));

    assert!(store.get(&owner, &account).await.is_none());
    assert!(!primary.contains(&key));

    // Same for a record that only survived in the local fallback
    let bytes = serde_json::to_vec(&expired).unwrap();
    local.put(&key, bytes).await.unwrap();
    assert!(store.get(&owner, &account).await.is_none());
    assert!(!local.contains(&key));
}

#[tokio::test]
async fn live_delegation_survives_read() {
    let primary = InMemoryStore::new();
    let store = SecureDelegationStore::new(Arc::new(primary.clone()), Arc::new(InMemoryStore::new()));
    let (owner, account) = ([0x0A; 20], [0xAA; 20]);

    store
        .put(&owner, &record(owner, account, Utc::now() + Duration::hours(1)))
        .await
        .unwrap();
    let (found, _) = store.get(&owner, &account).await.unwrap();
    assert_eq!(found.delegator, account);
    assert_eq!(primary.len(), 1);
}
