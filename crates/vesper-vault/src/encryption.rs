use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use vesper_common::{Result, SecretBytes, VesperError};
use zeroize::Zeroize;

use crate::storage::RecordStore;

const NONCE_LEN: usize = 12;

/// AES-256-GCM encryption for records leaving the process
pub struct EncryptionService {
    master_key: SecretBytes,
}

impl EncryptionService {
    pub fn new(master_key: SecretBytes) -> Result<Self> {
        if master_key.len() < 32 {
            return Err(VesperError::EncryptionError(format!(
                "master key must be at least 32 bytes, got {}",
                master_key.len()
            )));
        }
        Ok(Self { master_key })
    }

    /// Derive a per-record data encryption key from master key + record context
    fn derive_dek(&self, context: &[u8]) -> Result<SecretBytes> {
        let hk = Hkdf::<Sha256>::new(None, self.master_key.as_slice());
        let mut dek = vec![0u8; 32];
        hk.expand(context, &mut dek)
            .map_err(|e| VesperError::EncryptionError(format!("HKDF expand failed: {e}")))?;
        Ok(SecretBytes(dek))
    }

    /// Encrypt data with a context-derived key. Returns `(ciphertext, nonce)`.
    pub fn encrypt(&self, plaintext: &[u8], context: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let dek = self.derive_dek(context)?;
        let cipher = Aes256Gcm::new_from_slice(dek.as_slice())
            .map_err(|e| VesperError::EncryptionError(format!("Cipher init failed: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| VesperError::EncryptionError(format!("Encrypt failed: {e}")))?;

        Ok((ciphertext, nonce_bytes.to_vec()))
    }

    /// Decrypt data with a context-derived key
    pub fn decrypt(&self, ciphertext: &[u8], nonce_bytes: &[u8], context: &[u8]) -> Result<SecretBytes> {
        if nonce_bytes.len() != NONCE_LEN {
            return Err(VesperError::EncryptionError("bad nonce length".into()));
        }
        let dek = self.derive_dek(context)?;
        let cipher = Aes256Gcm::new_from_slice(dek.as_slice())
            .map_err(|e| VesperError::EncryptionError(format!("Cipher init failed: {e}")))?;

        let nonce = Nonce::from_slice(nonce_bytes);
        let mut plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| VesperError::EncryptionError(format!("Decrypt failed: {e}")))?;

        let result = SecretBytes(plaintext.clone());
        plaintext.zeroize();
        Ok(result)
    }

    /// `nonce ‖ ciphertext`, bound to `context`.
    pub fn seal(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        let (ciphertext, nonce) = self.encrypt(plaintext, context)?;
        let mut out = nonce;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8], context: &[u8]) -> Result<SecretBytes> {
        if sealed.len() <= NONCE_LEN {
            return Err(VesperError::EncryptionError("sealed value too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.decrypt(ciphertext, nonce, context)
    }
}

/// Wraps a [`RecordStore`] so values are sealed before they reach it.
/// The record key is the encryption context: a value copied under another key fails to open.
pub struct EncryptedStore<S> {
    inner: S,
    encryption: EncryptionService,
}

impl<S: RecordStore> EncryptedStore<S> {
    pub fn new(inner: S, encryption: EncryptionService) -> Self {
        Self { inner, encryption }
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for EncryptedStore<S> {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let sealed = self.encryption.seal(&value, key.as_bytes())?;
        self.inner.put(key, sealed).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.inner.get(key).await? {
            Some(sealed) => {
                let plain = self.encryption.open(&sealed, key.as_bytes())?;
                Ok(Some(plain.as_slice().to_vec()))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}
