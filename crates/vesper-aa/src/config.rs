use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use vesper_common::{hex_address, parse_address, Address, ImplementationKind, Result, VesperError};

use crate::delegation::CaveatEnforcers;

/// ERC-4337 v0.6 entry point.
pub const DEFAULT_ENTRY_POINT: Address = [
    0x5f, 0xf1, 0x37, 0xd4, 0xb0, 0xfd, 0xcd, 0x49, 0xdc, 0xa3, 0x0c, 0x7c, 0xf5, 0x7e, 0x57, 0x8a, 0x02, 0x6d, 0x27,
    0x89,
];

/// Canonical ERC-6551 registry.
pub const DEFAULT_TBA_REGISTRY: Address = [
    0x00, 0x00, 0x00, 0x00, 0x65, 0x51, 0xc1, 0x94, 0x87, 0x81, 0x46, 0x12, 0xe5, 0x8f, 0xe0, 0x68, 0x13, 0x77, 0x57,
    0x58,
];

mod opt_hex_address {
    use serde::{Deserialize, Deserializer};
    use vesper_common::{parse_address, Address};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Address>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) if !s.is_empty() => parse_address(&s).map(Some).map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub bundler_urls: Vec<String>,
    pub paymaster_url: Option<String>,
    pub sponsorship_policy_id: Option<String>,
    #[serde(with = "hex_address")]
    pub entry_point: Address,
    #[serde(deserialize_with = "opt_hex_address::deserialize")]
    pub account_factory: Option<Address>,
    #[serde(deserialize_with = "opt_hex_address::deserialize")]
    pub account_implementation: Option<Address>,
    pub account_kind: ImplementationKind,
    pub account_salt: u64,
    #[serde(with = "hex_address")]
    pub tba_registry: Address,
    #[serde(deserialize_with = "opt_hex_address::deserialize")]
    pub tba_implementation: Option<Address>,
    /// Player-state contract; TBA creation is unavailable without it.
    #[serde(deserialize_with = "opt_hex_address::deserialize")]
    pub game_contract: Option<Address>,
    #[serde(deserialize_with = "opt_hex_address::deserialize")]
    pub action_limit_enforcer: Option<Address>,
    #[serde(deserialize_with = "opt_hex_address::deserialize")]
    pub rate_limit_enforcer: Option<Address>,
    #[serde(deserialize_with = "opt_hex_address::deserialize")]
    pub spending_limit_enforcer: Option<Address>,
    /// Remote secure store; the local directory is used alone when unset.
    pub delegation_store_url: Option<String>,
    pub delegation_store_token: Option<String>,
    /// Hex-encoded 32-byte key for the encrypted delegation store.
    pub delegation_key: Option<String>,
    pub local_store_dir: PathBuf,
    pub delegation_validity_secs: u64,
    pub account_state_ttl_secs: u64,
    /// Submit without sponsorship when the sponsor is unreachable.
    pub allow_unsponsored: bool,
    pub nonce_attempts: u32,
    pub nonce_retry_ms: u64,
    pub receipt_attempts: u32,
    pub receipt_delay_ms: u64,
    pub confirm_attempts: u32,
    pub confirm_delay_ms: u64,
    pub tba_mapping_attempts: u32,
    pub tba_mapping_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain_id: 84532,
            rpc_urls: vec![],
            bundler_urls: vec![],
            paymaster_url: None,
            sponsorship_policy_id: None,
            entry_point: DEFAULT_ENTRY_POINT,
            account_factory: None,
            account_implementation: None,
            account_kind: ImplementationKind::Hybrid,
            account_salt: 0,
            tba_registry: DEFAULT_TBA_REGISTRY,
            tba_implementation: None,
            game_contract: None,
            action_limit_enforcer: None,
            rate_limit_enforcer: None,
            spending_limit_enforcer: None,
            delegation_store_url: None,
            delegation_store_token: None,
            delegation_key: None,
            local_store_dir: PathBuf::from(".vesper"),
            delegation_validity_secs: 7 * 24 * 3600,
            account_state_ttl_secs: 7 * 24 * 3600,
            allow_unsponsored: false,
            nonce_attempts: 3,
            nonce_retry_ms: 500,
            receipt_attempts: 5,
            receipt_delay_ms: 2000,
            confirm_attempts: 3,
            confirm_delay_ms: 2000,
            tba_mapping_attempts: 3,
            tba_mapping_delay_ms: 1500,
        }
    }
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| VesperError::ConfigError(format!("{key}: not a number: {value}")))
}

fn flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(VesperError::ConfigError(format!("{key}: not a boolean: {other}"))),
    }
}

fn kind(value: &str) -> Result<ImplementationKind> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "hybrid" => Ok(ImplementationKind::Hybrid),
        "multisig" | "multi_sig" => Ok(ImplementationKind::MultiSig),
        other => Err(VesperError::ConfigError(format!("unknown account kind: {other}"))),
    }
}

fn address(key: &str, value: &str) -> Result<Address> {
    parse_address(value.trim()).map_err(|e| VesperError::ConfigError(format!("{key}: {e}")))
}

impl EngineConfig {
    /// Load from `VESPER_*` environment variables, after reading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("VESPER_CHAIN_ID") {
            cfg.chain_id = number("VESPER_CHAIN_ID", &v)?;
        }
        if let Some(v) = get("VESPER_RPC_URLS") {
            cfg.rpc_urls = list(&v);
        }
        if let Some(v) = get("VESPER_BUNDLER_URLS") {
            cfg.bundler_urls = list(&v);
        }
        cfg.paymaster_url = get("VESPER_PAYMASTER_URL");
        cfg.sponsorship_policy_id = get("VESPER_SPONSORSHIP_POLICY_ID");
        if let Some(v) = get("VESPER_ENTRY_POINT") {
            cfg.entry_point = address("VESPER_ENTRY_POINT", &v)?;
        }
        let optional = |key: &str| get(key).map(|v| address(key, &v)).transpose();
        cfg.account_factory = optional("VESPER_ACCOUNT_FACTORY")?;
        cfg.account_implementation = optional("VESPER_ACCOUNT_IMPLEMENTATION")?;
        if let Some(v) = get("VESPER_ACCOUNT_KIND") {
            cfg.account_kind = kind(&v)?;
        }
        if let Some(v) = get("VESPER_ACCOUNT_SALT") {
            cfg.account_salt = number("VESPER_ACCOUNT_SALT", &v)?;
        }
        if let Some(v) = get("VESPER_TBA_REGISTRY") {
            cfg.tba_registry = address("VESPER_TBA_REGISTRY", &v)?;
        }
        cfg.tba_implementation = optional("VESPER_TBA_IMPLEMENTATION")?;
        cfg.game_contract = optional("VESPER_GAME_CONTRACT")?;
        cfg.action_limit_enforcer = optional("VESPER_ACTION_LIMIT_ENFORCER")?;
        cfg.rate_limit_enforcer = optional("VESPER_RATE_LIMIT_ENFORCER")?;
        cfg.spending_limit_enforcer = optional("VESPER_SPENDING_LIMIT_ENFORCER")?;
        cfg.delegation_store_url = get("VESPER_DELEGATION_STORE_URL");
        cfg.delegation_store_token = get("VESPER_DELEGATION_STORE_TOKEN");
        cfg.delegation_key = get("VESPER_DELEGATION_KEY");
        if let Some(v) = get("VESPER_LOCAL_STORE_DIR") {
            cfg.local_store_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VESPER_ALLOW_UNSPONSORED") {
            cfg.allow_unsponsored = flag("VESPER_ALLOW_UNSPONSORED", &v)?;
        }

        if let Some(v) = get("VESPER_DELEGATION_VALIDITY_SECS") {
            cfg.delegation_validity_secs = number("VESPER_DELEGATION_VALIDITY_SECS", &v)?;
        }
        if let Some(v) = get("VESPER_ACCOUNT_STATE_TTL_SECS") {
            cfg.account_state_ttl_secs = number("VESPER_ACCOUNT_STATE_TTL_SECS", &v)?;
        }
        if let Some(v) = get("VESPER_NONCE_ATTEMPTS") {
            cfg.nonce_attempts = number("VESPER_NONCE_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("VESPER_NONCE_RETRY_MS") {
            cfg.nonce_retry_ms = number("VESPER_NONCE_RETRY_MS", &v)?;
        }
        if let Some(v) = get("VESPER_RECEIPT_ATTEMPTS") {
            cfg.receipt_attempts = number("VESPER_RECEIPT_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("VESPER_RECEIPT_DELAY_MS") {
            cfg.receipt_delay_ms = number("VESPER_RECEIPT_DELAY_MS", &v)?;
        }
        if let Some(v) = get("VESPER_CONFIRM_ATTEMPTS") {
            cfg.confirm_attempts = number("VESPER_CONFIRM_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("VESPER_CONFIRM_DELAY_MS") {
            cfg.confirm_delay_ms = number("VESPER_CONFIRM_DELAY_MS", &v)?;
        }
        if let Some(v) = get("VESPER_TBA_MAPPING_ATTEMPTS") {
            cfg.tba_mapping_attempts = number("VESPER_TBA_MAPPING_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("VESPER_TBA_MAPPING_DELAY_MS") {
            cfg.tba_mapping_delay_ms = number("VESPER_TBA_MAPPING_DELAY_MS", &v)?;
        }
        Ok(cfg)
    }

    pub fn enforcers(&self) -> CaveatEnforcers {
        CaveatEnforcers {
            action_limit: self.action_limit_enforcer,
            rate_limit: self.rate_limit_enforcer,
            spending_limit: self.spending_limit_enforcer,
        }
    }

    pub fn nonce_retry_delay(&self) -> Duration {
        Duration::from_millis(self.nonce_retry_ms)
    }

    pub fn receipt_delay(&self) -> Duration {
        Duration::from_millis(self.receipt_delay_ms)
    }

    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }

    pub fn tba_mapping_delay(&self) -> Duration {
        Duration::from_millis(self.tba_mapping_delay_ms)
    }

    pub fn delegation_validity(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.delegation_validity_secs as i64)
    }

    pub fn account_state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.account_state_ttl_secs as i64)
    }

    /// Decoded delegation store key. Required for any delegation storage.
    pub fn delegation_key_bytes(&self) -> Result<Vec<u8>> {
        let raw = self
            .delegation_key
            .as_deref()
            .ok_or_else(|| VesperError::ConfigError("VESPER_DELEGATION_KEY is not set".into()))?;
        let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
            .map_err(|e| VesperError::ConfigError(format!("VESPER_DELEGATION_KEY: {e}")))?;
        if bytes.len() != 32 {
            return Err(VesperError::ConfigError(format!(
                "VESPER_DELEGATION_KEY must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let cfg = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.entry_point, DEFAULT_ENTRY_POINT);
        assert_eq!(cfg.tba_registry, DEFAULT_TBA_REGISTRY);
        assert!(cfg.paymaster_url.is_none());
        assert!(!cfg.allow_unsponsored);
        assert_eq!(cfg.delegation_validity(), chrono::Duration::days(7));
    }

    #[test]
    fn test_reads_vesper_variables() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("VESPER_CHAIN_ID", "8453"),
            ("VESPER_RPC_URLS", "http://a, http://b,"),
            ("VESPER_ACCOUNT_FACTORY", "0x000000000000000000000000000000000000fa01"),
            ("VESPER_ACCOUNT_KIND", "multi-sig"),
            ("VESPER_ALLOW_UNSPONSORED", "yes"),
            ("VESPER_NONCE_ATTEMPTS", "5"),
            ("VESPER_SPENDING_LIMIT_ENFORCER", "0x00000000000000000000000000000000000000e3"),
            ("VESPER_PAYMASTER_URL", "  "),
        ]))
        .unwrap();
        assert_eq!(cfg.chain_id, 8453);
        assert_eq!(cfg.rpc_urls, vec!["http://a", "http://b"]);
        assert_eq!(cfg.account_factory.unwrap()[19], 0x01);
        assert_eq!(cfg.account_kind, ImplementationKind::MultiSig);
        assert!(cfg.allow_unsponsored);
        assert_eq!(cfg.nonce_attempts, 5);
        assert!(cfg.enforcers().spending_limit.is_some());
        assert!(cfg.enforcers().action_limit.is_none());
        assert!(cfg.paymaster_url.is_none());
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for (key, value) in [
            ("VESPER_CHAIN_ID", "base"),
            ("VESPER_GAME_CONTRACT", "0x1234"),
            ("VESPER_ALLOW_UNSPONSORED", "maybe"),
            ("VESPER_ACCOUNT_KIND", "eoa"),
        ] {
            let err = EngineConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(matches!(err, VesperError::ConfigError(_)), "{key}");
        }
    }

    #[test]
    fn test_delegation_key_validation() {
        let mut cfg = EngineConfig::default();
        assert!(cfg.delegation_key_bytes().is_err());
        cfg.delegation_key = Some(format!("0x{}", "11".repeat(32)));
        assert_eq!(cfg.delegation_key_bytes().unwrap().len(), 32);
        cfg.delegation_key = Some("abcd".into());
        assert!(cfg.delegation_key_bytes().is_err());
    }

    #[test]
    fn test_deserializes_from_json() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{"chain_id": 1, "game_contract": "0x00000000000000000000000000000000000000aa", "account_kind": "multi_sig"}"#,
        )
        .unwrap();
        assert_eq!(cfg.chain_id, 1);
        assert_eq!(cfg.game_contract.unwrap()[19], 0xaa);
        assert_eq!(cfg.account_kind, ImplementationKind::MultiSig);
        assert_eq!(cfg.entry_point, DEFAULT_ENTRY_POINT);
    }
}
