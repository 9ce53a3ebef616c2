use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vesper_common::{format_address, Address, Result, VesperError};

use crate::record::DelegationRecord;
use crate::storage::RecordStore;

/// Where a delegation record currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLocation {
    /// Remote store, encrypted at rest.
    Primary,
    /// Local unencrypted fallback; the UI should warn the user.
    LocalFallback,
}

/// Persists delegation records, preferring the encrypted remote store and
/// falling back to local storage when it is unreachable.
///
/// Reads never fail: losing delegation state only means the user is asked to
/// delegate again.
pub struct SecureDelegationStore {
    primary: Arc<dyn RecordStore>,
    secondary: Arc<dyn RecordStore>,
}

impl SecureDelegationStore {
    /// `primary` is expected to already encrypt (see [`crate::EncryptedStore`]).
    pub fn new(primary: Arc<dyn RecordStore>, secondary: Arc<dyn RecordStore>) -> Self {
        Self { primary, secondary }
    }

    pub async fn put(&self, owner: &Address, record: &DelegationRecord) -> Result<StorageLocation> {
        if record.owner != *owner {
            return Err(VesperError::Internal(format!(
                "record owner {} does not match {}",
                format_address(&record.owner),
                format_address(owner)
            )));
        }
        let key = DelegationRecord::storage_key(owner, &record.delegator);
        let bytes = serde_json::to_vec(record)?;

        match self.primary.put(&key, bytes.clone()).await {
            Ok(()) => {
                debug!(%key, "delegation stored in primary");
                // Drop any stale local copy so it cannot shadow the new record
                if let Err(e) = self.secondary.delete(&key).await {
                    debug!(%key, %e, "could not clear local copy");
                }
                Ok(StorageLocation::Primary)
            }
            Err(e) => {
                warn!(%key, %e, "primary delegation store unavailable, storing locally");
                self.secondary.put(&key, bytes).await?;
                Ok(StorageLocation::LocalFallback)
            }
        }
    }

    /// Load the live record for (owner, account). Expired records are deleted and treated as absent.
    pub async fn get(&self, owner: &Address, account: &Address) -> Option<(DelegationRecord, StorageLocation)> {
        let key = DelegationRecord::storage_key(owner, account);

        let found = match self.read(self.primary.as_ref(), &key).await {
            Some(record) => Some((record, StorageLocation::Primary)),
            None => self
                .read(self.secondary.as_ref(), &key)
                .await
                .map(|r| (r, StorageLocation::LocalFallback)),
        };

        let (record, location) = found?;

        if !record.belongs_to(owner, account) {
            warn!(%key, "stored delegation belongs to a different account, ignoring");
            return None;
        }

        if record.is_expired(Utc::now()) {
            info!(%key, valid_until = %record.valid_until, "delegation expired, removing");
            let store = match location {
                StorageLocation::Primary => &self.primary,
                StorageLocation::LocalFallback => &self.secondary,
            };
            if let Err(e) = store.delete(&key).await {
                warn!(%key, %e, "failed to delete expired delegation");
            }
            return None;
        }

        Some((record, location))
    }

    /// Remove the record from both stores. Fails only if neither store could be cleared.
    pub async fn remove(&self, owner: &Address, account: &Address) -> Result<()> {
        let key = DelegationRecord::storage_key(owner, account);
        let primary = self.primary.delete(&key).await;
        let secondary = self.secondary.delete(&key).await;
        match (primary, secondary) {
            (Err(p), Err(s)) => Err(VesperError::StorageError(format!(
                "remove {key}: primary: {p}; local: {s}"
            ))),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                warn!(%key, %e, "delegation removed from one store only");
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn read(&self, store: &dyn RecordStore, key: &str) -> Option<DelegationRecord> {
        match store.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(%key, %e, "undecodable delegation record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(%key, %e, "delegation store read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{EncryptedStore, EncryptionService};
    use crate::record::sample_record;
    use crate::storage::{HttpStore, InMemoryStore};
    use chrono::Duration;
    use vesper_common::SecretBytes;

    const OWNER: Address = [0x0A; 20];
    const ACCOUNT: Address = [0xAA; 20];

    fn encrypted(inner: InMemoryStore) -> Arc<dyn RecordStore> {
        let enc = EncryptionService::new(SecretBytes(vec![0x42; 32])).unwrap();
        Arc::new(EncryptedStore::new(inner, enc))
    }

    #[tokio::test]
    async fn test_put_get_primary() {
        let primary = InMemoryStore::new();
        let local = InMemoryStore::new();
        let store = SecureDelegationStore::new(encrypted(primary.clone()), Arc::new(local.clone()));

        let record = sample_record(Duration::hours(1));
        let loc = store.put(&OWNER, &record).await.unwrap();
        assert_eq!(loc, StorageLocation::Primary);
        assert_eq!(primary.len(), 1);
        assert!(local.is_empty());

        let (loaded, loc) = store.get(&OWNER, &ACCOUNT).await.unwrap();
        assert_eq!(loc, StorageLocation::Primary);
        assert_eq!(loaded.id, record.id);
    }

    #[tokio::test]
    async fn test_primary_down_falls_back_to_local() {
        let local = InMemoryStore::new();
        let store = SecureDelegationStore::new(
            Arc::new(HttpStore::new("http://127.0.0.1:1")),
            Arc::new(local.clone()),
        );

        let record = sample_record(Duration::hours(1));
        assert_eq!(store.put(&OWNER, &record).await.unwrap(), StorageLocation::LocalFallback);

        let (loaded, loc) = store.get(&OWNER, &ACCOUNT).await.unwrap();
        assert_eq!(loc, StorageLocation::LocalFallback);
        assert_eq!(loaded.id, record.id);
    }

    #[tokio::test]
    async fn test_expired_record_is_absent_and_deleted() {
        let primary = InMemoryStore::new();
        let store = SecureDelegationStore::new(encrypted(primary.clone()), Arc::new(InMemoryStore::new()));

        let record = sample_record(Duration::seconds(-5));
        store.put(&OWNER, &record).await.unwrap();
        assert_eq!(primary.len(), 1);

        assert!(store.get(&OWNER, &ACCOUNT).await.is_none());
        assert!(primary.is_empty(), "expired record must be removed on read");
    }

    #[tokio::test]
    async fn test_corrupt_primary_falls_back() {
        let primary = InMemoryStore::new();
        let local = InMemoryStore::new();
        let store = SecureDelegationStore::new(encrypted(primary.clone()), Arc::new(local.clone()));

        let record = sample_record(Duration::hours(1));
        let key = DelegationRecord::storage_key(&OWNER, &ACCOUNT);
        local.put(&key, serde_json::to_vec(&record).unwrap()).await.unwrap();
        primary.put(&key, b"garbage".to_vec()).await.unwrap();

        let (loaded, loc) = store.get(&OWNER, &ACCOUNT).await.unwrap();
        assert_eq!(loc, StorageLocation::LocalFallback);
        assert_eq!(loaded.id, record.id);
    }

    #[tokio::test]
    async fn test_remove_clears_both() {
        let primary = InMemoryStore::new();
        let local = InMemoryStore::new();
        let store = SecureDelegationStore::new(encrypted(primary.clone()), Arc::new(local.clone()));

        let record = sample_record(Duration::hours(1));
        let key = DelegationRecord::storage_key(&OWNER, &ACCOUNT);
        store.put(&OWNER, &record).await.unwrap();
        local.put(&key, serde_json::to_vec(&record).unwrap()).await.unwrap();

        store.remove(&OWNER, &ACCOUNT).await.unwrap();
        assert!(primary.is_empty());
        assert!(local.is_empty());
        assert!(store.get(&OWNER, &ACCOUNT).await.is_none());
    }

    #[tokio::test]
    async fn test_owner_mismatch_rejected_on_put() {
        let store = SecureDelegationStore::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryStore::new()),
        );
        let record = sample_record(Duration::hours(1));
        assert!(store.put(&[0x0B; 20], &record).await.is_err());
    }
}
