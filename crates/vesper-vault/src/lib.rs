pub mod delegation_store;
pub mod encryption;
pub mod record;
pub mod storage;

pub use delegation_store::{SecureDelegationStore, StorageLocation};
pub use encryption::{EncryptedStore, EncryptionService};
pub use record::{Caveat, DelegationRecord, SessionKeyMaterial};
pub use storage::{FileStore, HttpStore, InMemoryStore, RecordStore};
