use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use thiserror::Error;
use vesper_common::{Address, Hash32, SecretBytes};
use zeroize::Zeroize;

use crate::abi::keccak256;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("signature request rejected by user")]
    Rejected,
    #[error("no signer available: {0}")]
    Unavailable(String),
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// Anything that can produce an ECDSA signature over a 32-byte hash:
/// the owner's wallet (prompts the user) or a locally held session key (silent).
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    /// Sign `hash` as an EIP-191 personal message. Returns 65 bytes `r ‖ s ‖ v`.
    async fn sign_hash(&self, hash: &Hash32) -> Result<Vec<u8>, SignerError>;

    /// Whether signing shows a prompt to the user.
    fn is_interactive(&self) -> bool {
        false
    }
}

/// `keccak256("\x19Ethereum Signed Message:\n32" ‖ hash)`
pub fn eip191_hash(hash: &Hash32) -> Hash32 {
    let mut msg = Vec::with_capacity(28 + 32);
    msg.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    msg.extend_from_slice(hash);
    keccak256(&msg)
}

/// Address of an uncompressed secp256k1 public key.
pub fn public_key_to_address(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    addr
}

/// Recover the signer address of an EIP-191 signature produced by [`Signer::sign_hash`].
pub fn recover_signer(hash: &Hash32, signature: &[u8]) -> Result<Address, SignerError> {
    if signature.len() != 65 {
        return Err(SignerError::SigningFailed(format!(
            "expected 65-byte signature, got {}",
            signature.len()
        )));
    }
    let sig = Signature::from_slice(&signature[..64])
        .map_err(|e| SignerError::SigningFailed(e.to_string()))?;
    let v = signature[64];
    let recid = RecoveryId::from_byte(v.saturating_sub(27))
        .ok_or_else(|| SignerError::SigningFailed(format!("invalid recovery byte {v}")))?;
    let key = VerifyingKey::recover_from_prehash(&eip191_hash(hash), &sig, recid)
        .map_err(|e| SignerError::SigningFailed(e.to_string()))?;
    Ok(public_key_to_address(&key))
}

/// secp256k1 signer backed by key material held in process memory.
pub struct LocalKeySigner {
    key: SigningKey,
    address: Address,
}

impl LocalKeySigner {
    pub fn from_secret(secret: &SecretBytes) -> Result<Self, SignerError> {
        let key = SigningKey::from_slice(secret.as_slice())
            .map_err(|e| SignerError::InvalidPrivateKey(e.to_string()))?;
        let address = public_key_to_address(key.verifying_key());
        Ok(Self { key, address })
    }

    /// Fresh random key, independent of any other key in the process.
    pub fn generate() -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let address = public_key_to_address(key.verifying_key());
        Self { key, address }
    }

    pub fn secret(&self) -> SecretBytes {
        let mut bytes = self.key.to_bytes().to_vec();
        let secret = SecretBytes(bytes.clone());
        bytes.zeroize();
        secret
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &vesper_common::format_address(&self.address))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for LocalKeySigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_hash(&self, hash: &Hash32) -> Result<Vec<u8>, SignerError> {
        let digest = eip191_hash(hash);
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| SignerError::SigningFailed(e.to_string()))?;
        let mut out = sig.to_bytes().to_vec();
        out.push(27 + recid.to_byte());
        Ok(out)
    }
}
