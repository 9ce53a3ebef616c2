use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;
use vesper_common::{format_address, hex_address, hex_bytes, hex_hash, Address, Hash32, SecretBytes};

/// Session-key private material. Serialized as hex for storage, never shown by `Debug`.
#[derive(Clone)]
pub struct SessionKeyMaterial(pub SecretBytes);

impl std::fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKeyMaterial([REDACTED])")
    }
}

impl Serialize for SessionKeyMaterial {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0.as_slice()))
    }
}

impl<'de> Deserialize<'de> for SessionKeyMaterial {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        Ok(Self(SecretBytes(bytes)))
    }
}

/// On-chain constraint attached to a delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Caveat {
    /// Total number of actions the session key may perform.
    ActionLimit { max_actions: u64 },
    /// At most `max_actions` per rolling `period_secs`.
    RateLimit { max_actions: u64, period_secs: u64 },
    /// Total native value the session key may move.
    SpendingLimit { max_wei: u128 },
}

impl Caveat {
    pub fn name(&self) -> &'static str {
        match self {
            Caveat::ActionLimit { .. } => "action_limit",
            Caveat::RateLimit { .. } => "rate_limit",
            Caveat::SpendingLimit { .. } => "spending_limit",
        }
    }
}

/// A signed authorization letting a session key act for a smart account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub id: Uuid,
    /// The smart account granting authority.
    #[serde(with = "hex_address")]
    pub delegator: Address,
    /// Owner EOA of the smart account.
    #[serde(with = "hex_address")]
    pub owner: Address,
    #[serde(with = "hex_address")]
    pub session_key_address: Address,
    pub session_key: SessionKeyMaterial,
    #[serde(with = "hex_hash")]
    pub delegation_hash: Hash32,
    /// Owner's signature over `delegation_hash`.
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub salt: u64,
    #[serde(default)]
    pub caveats: Vec<Caveat>,
    pub created_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl DelegationRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    pub fn belongs_to(&self, owner: &Address, account: &Address) -> bool {
        self.owner == *owner && self.delegator == *account
    }

    /// Storage key for a (owner, account) pair.
    pub fn storage_key(owner: &Address, account: &Address) -> String {
        format!("delegation:{}:{}", format_address(owner), format_address(account))
    }
}

#[cfg(test)]
pub(crate) fn sample_record(valid_for: chrono::Duration) -> DelegationRecord {
    let now = Utc::now();
    DelegationRecord {
        id: Uuid::new_v4(),
        delegator: [0xAA; 20],
        owner: [0x0A; 20],
        session_key_address: [0x5E; 20],
        session_key: SessionKeyMaterial(SecretBytes(vec![0x77; 32])),
        delegation_hash: [0xDD; 32],
        signature: vec![0x01; 65],
        salt: 7,
        caveats: vec![Caveat::ActionLimit { max_actions: 100 }],
        created_at: now,
        valid_until: now + valid_for,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_boundary() {
        let record = sample_record(Duration::hours(1));
        assert!(!record.is_expired(Utc::now()));
        assert!(record.is_expired(record.valid_until));
        assert!(record.is_expired(record.valid_until + Duration::seconds(1)));
    }

    #[test]
    fn test_belongs_to() {
        let record = sample_record(Duration::hours(1));
        assert!(record.belongs_to(&[0x0A; 20], &[0xAA; 20]));
        assert!(!record.belongs_to(&[0x0B; 20], &[0xAA; 20]));
        assert!(!record.belongs_to(&[0x0A; 20], &[0xAB; 20]));
    }

    #[test]
    fn test_json_roundtrip_keeps_key_material() {
        let record = sample_record(Duration::hours(1));
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"kind\":\"action_limit\""));
        let back: DelegationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_key.0.as_slice(), record.session_key.0.as_slice());
        assert_eq!(back.delegation_hash, record.delegation_hash);
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let record = sample_record(Duration::hours(1));
        let debug = format!("{record:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("7777"));
    }
}
