//! Symmetric file encryption.
//!
//! AES-256-GCM with an Argon2id-derived key. Operates on whole files: the cipher is
//! applied to the payload as a single unit, with no chunk-level IV scheme.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::password_hash::SaltString;
use argon2::Argon2;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{EncryptionError, Error, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const SALT_B64_LEN: usize = 24;

/// Derives and holds a 256-bit key for the lifetime of the process. One key per
/// process: there is no per-job key id or rotation path.
#[derive(Clone)]
pub struct EncryptionManager {
    key: [u8; KEY_LEN],
}

impl EncryptionManager {
    /// Derive a key from a passphrase with a fixed, persisted salt. The salt is not
    /// secret; it is stored so the same passphrase always derives the same key across
    /// process restarts.
    pub fn from_passphrase(passphrase: &str, salt: &str) -> Result<Self> {
        let salt_string = SaltString::from_b64(salt).map_err(|e| {
            Error::Encryption(EncryptionError::KeyDerivationFailed(format!(
                "invalid salt: {e}"
            )))
        })?;
        let argon2 = Argon2::default();
        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt_string.as_salt().as_str().as_bytes(), &mut key)
            .map_err(|e| {
                Error::Encryption(EncryptionError::KeyDerivationFailed(e.to_string()))
            })?;
        Ok(Self { key })
    }

    /// Generate a fresh random salt suitable for `from_passphrase`, e.g. on first run.
    pub fn generate_salt() -> String {
        SaltString::generate(&mut rand::thread_rng()).as_str().to_string()
    }

    /// Encrypt the contents of `plaintext_path`, writing `[nonce || ciphertext]` to
    /// `ciphertext_path`.
    pub async fn encrypt_file(
        &self,
        plaintext_path: &std::path::Path,
        ciphertext_path: &std::path::Path,
    ) -> Result<()> {
        let mut plaintext = Vec::new();
        tokio::fs::File::open(plaintext_path)
            .await?
            .read_to_end(&mut plaintext)
            .await?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext.as_ref()).map_err(|e| {
            Error::Encryption(EncryptionError::EncryptionFailed(e.to_string()))
        })?;

        let mut out = tokio::fs::File::create(ciphertext_path).await?;
        out.write_all(&nonce_bytes).await?;
        out.write_all(&ciphertext).await?;
        out.flush().await?;
        Ok(())
    }

    /// Decrypt `ciphertext_path` (as produced by `encrypt_file`) into `plaintext_path`.
    pub async fn decrypt_file(
        &self,
        ciphertext_path: &std::path::Path,
        plaintext_path: &std::path::Path,
    ) -> Result<()> {
        let mut data = Vec::new();
        tokio::fs::File::open(ciphertext_path)
            .await?
            .read_to_end(&mut data)
            .await?;
        let plaintext = self.decrypt_bytes(&data)?;
        tokio::fs::write(plaintext_path, plaintext).await?;
        Ok(())
    }

    /// Encrypt an in-memory buffer (used for the manifest, which is small).
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Encryption(EncryptionError::EncryptionFailed(e.to_string())))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a buffer produced by `encrypt_bytes`.
    pub fn decrypt_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::Encryption(EncryptionError::DecryptionFailed(
                "ciphertext shorter than nonce".into(),
            )));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Encryption(EncryptionError::AuthenticationFailed))
    }
}

// Silence an otherwise-unused constant when tests are compiled out.
#[allow(dead_code)]
const _: usize = SALT_B64_LEN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_bytes() {
        let salt = EncryptionManager::generate_salt();
        let manager = EncryptionManager::from_passphrase("hunter2 hunter2", &salt).unwrap();
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
        let ciphertext = manager.encrypt_bytes(&plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        let decrypted = manager.decrypt_bytes(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let salt = EncryptionManager::generate_salt();
        let manager_a = EncryptionManager::from_passphrase("password-a", &salt).unwrap();
        let manager_b = EncryptionManager::from_passphrase("password-b", &salt).unwrap();
        let ciphertext = manager_a.encrypt_bytes(b"secret").unwrap();
        let result = manager_b.decrypt_bytes(&ciphertext);
        assert!(matches!(
            result,
            Err(Error::Encryption(EncryptionError::AuthenticationFailed))
        ));
    }

    #[tokio::test]
    async fn roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let plain_in = dir.path().join("plain.txt");
        let cipher_out = dir.path().join("plain.txt.enc");
        let plain_out = dir.path().join("plain.txt.restored");
        tokio::fs::write(&plain_in, b"file contents go here").await.unwrap();

        let salt = EncryptionManager::generate_salt();
        let manager = EncryptionManager::from_passphrase("correct horse battery staple", &salt)
            .unwrap();
        manager.encrypt_file(&plain_in, &cipher_out).await.unwrap();
        manager.decrypt_file(&cipher_out, &plain_out).await.unwrap();

        let original = tokio::fs::read(&plain_in).await.unwrap();
        let restored = tokio::fs::read(&plain_out).await.unwrap();
        assert_eq!(original, restored);
    }
}
