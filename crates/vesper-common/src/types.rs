use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{Result, VesperError};

/// 20-byte EVM address.
pub type Address = [u8; 20];

/// 32-byte hash (user operation hash, transaction hash, delegation hash).
pub type Hash32 = [u8; 32];

pub const ZERO_ADDRESS: Address = [0u8; 20];

/// Parse a `0x`-prefixed (or bare) hex address.
pub fn parse_address(s: &str) -> Result<Address> {
    let raw = s.trim().trim_start_matches("0x");
    let bytes = hex::decode(raw).map_err(|e| VesperError::InvalidAddress(format!("{s}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| VesperError::InvalidAddress(format!("{s}: expected 20 bytes")))
}

/// Parse a 32-byte hex value.
pub fn parse_hash(s: &str) -> Result<Hash32> {
    let raw = s.trim().trim_start_matches("0x");
    let bytes = hex::decode(raw).map_err(|e| VesperError::InvalidAddress(format!("{s}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| VesperError::InvalidAddress(format!("{s}: expected 32 bytes")))
}

pub fn format_address(addr: &Address) -> String {
    format!("0x{}", hex::encode(addr))
}

pub fn format_hash(hash: &Hash32) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Serde adapter for addresses as `0x` hex strings.
pub mod hex_address {
    use super::{format_address, parse_address, Address};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &Address, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_address(addr))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Address, D::Error> {
        let s = String::deserialize(d)?;
        parse_address(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for 32-byte hashes as `0x` hex strings.
pub mod hex_hash {
    use super::{format_hash, parse_hash, Hash32};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_hash(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Hash32, D::Error> {
        let s = String::deserialize(d)?;
        parse_hash(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for variable-length bytes as `0x` hex strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

/// Which smart-account implementation backs an owner's account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationKind {
    /// Single ECDSA owner plus optional passkeys.
    #[default]
    Hybrid,
    /// Threshold of ECDSA owners.
    MultiSig,
}

/// Sensitive bytes that auto-zero on drop
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretBytes(pub Vec<u8>);

impl SecretBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_roundtrip() {
        let addr = [0xABu8; 20];
        let s = format_address(&addr);
        assert!(s.starts_with("0x"));
        assert_eq!(parse_address(&s).unwrap(), addr);
        assert_eq!(parse_address(&s[2..]).unwrap(), addr);
    }

    #[test]
    fn test_parse_address_wrong_length() {
        assert!(matches!(
            parse_address("0x1234"),
            Err(VesperError::InvalidAddress(_))
        ));
        assert!(parse_address("0xzz").is_err());
    }

    #[test]
    fn test_secret_bytes_debug_redacted() {
        let secret = SecretBytes(vec![0x42; 32]);
        let debug = format!("{secret:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));
    }

    #[test]
    fn test_hex_address_serde() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "hex_address")]
            addr: Address,
        }
        let json = serde_json::to_string(&Wrapper { addr: [1u8; 20] }).unwrap();
        assert!(json.contains("0x0101"));
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.addr, [1u8; 20]);
    }
}
