//! Encrypted per-tenant provider credentials, decrypted only
//! into a short-lived per-request map. No plaintext is ever written into a shared or
//! global variable -- it only ever lives on call stacks and in request-scoped structures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("invalid master key: {0}")]
    InvalidKey(String),
}

/// A 32-byte process-wide symmetric key. Rotatable via `KeyVault::rotate`.
#[derive(Clone)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; 32];
        AeadOsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Loads a base64-encoded key from `path`, generating and persisting a fresh one
    /// if the file does not yet exist.
    pub async fn load_or_create(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let path = path.as_ref();
        if let Ok(raw) = tokio::fs::read_to_string(path).await {
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, raw.trim())
                .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
            return Ok(Self(bytes));
        }
        let key = Self::generate();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &key.0);
        tokio::fs::write(path, encoded).await?;
        Ok(key)
    }

    fn cipher(&self) -> Result<Aes256Gcm, VaultError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| VaultError::InvalidKey(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedEntry {
    nonce: String,
    ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct VaultFile {
    /// Keyed by `"{tenant_id}\u{1}{provider}"` to keep the on-disk shape flat JSON.
    entries: HashMap<String, EncryptedEntry>,
}

fn entry_key(tenant_id: &str, provider: &str) -> String {
    format!("{tenant_id}\u{1}{provider}")
}

pub struct KeyVault {
    master_key: RwLock<MasterKey>,
    file: RwLock<VaultFile>,
    path: PathBuf,
}

impl KeyVault {
    pub async fn open(path: impl AsRef<Path>, master_key: MasterKey) -> Result<Self, VaultError> {
        let path = path.as_ref().to_path_buf();
        let file = if let Ok(raw) = tokio::fs::read(&path).await {
            serde_json::from_slice(&raw)?
        } else {
            VaultFile::default()
        };
        Ok(Self {
            master_key: RwLock::new(master_key),
            file: RwLock::new(file),
            path,
        })
    }

    /// Encrypts `plaintext_key` under the current master key and persists it.
    pub async fn put(
        &self,
        tenant_id: &str,
        provider: &str,
        plaintext_key: &str,
    ) -> Result<(), VaultError> {
        let master_key = self.master_key.read().await;
        let cipher = master_key.cipher()?;
        let mut nonce_bytes = [0u8; 12];
        AeadOsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext_key.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;
        drop(master_key);

        let entry = EncryptedEntry {
            nonce: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, nonce_bytes),
            ciphertext: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, ciphertext),
        };
        let mut file = self.file.write().await;
        file.entries.insert(entry_key(tenant_id, provider), entry);
        self.persist(&file).await
    }

    /// Decrypts every provider key belonging to `tenant_id` into a map that the caller
    /// must use for exactly one outbound call batch and then drop.
    pub async fn materialize(&self, tenant_id: &str) -> Result<HashMap<String, String>, VaultError> {
        let file = self.file.read().await;
        let master_key = self.master_key.read().await;
        let cipher = master_key.cipher()?;
        let prefix = format!("{tenant_id}\u{1}");
        let mut out = HashMap::new();
        for (key, entry) in file.entries.iter() {
            let Some(provider) = key.strip_prefix(&prefix) else {
                continue;
            };
            let nonce_bytes =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &entry.nonce)
                    .map_err(|e| VaultError::Decryption(e.to_string()))?;
            let ciphertext =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &entry.ciphertext)
                    .map_err(|e| VaultError::Decryption(e.to_string()))?;
            let nonce = Nonce::from_slice(&nonce_bytes);
            let plaintext = cipher
                .decrypt(nonce, ciphertext.as_ref())
                .map_err(|e| VaultError::Decryption(e.to_string()))?;
            let plaintext = String::from_utf8(plaintext)
                .map_err(|e| VaultError::Decryption(e.to_string()))?;
            out.insert(provider.to_string(), plaintext);
        }
        Ok(out)
    }

    /// Re-encrypts every entry under `new_key` and swaps it in as the active master key.
    pub async fn rotate(&self, new_key: MasterKey) -> Result<(), VaultError> {
        let mut file = self.file.write().await;
        let old_key = self.master_key.read().await.clone();
        let decrypt_cipher = old_key.cipher()?;
        let encrypt_cipher = new_key.cipher()?;

        let mut rotated = HashMap::with_capacity(file.entries.len());
        for (key, entry) in file.entries.iter() {
            let nonce_bytes =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &entry.nonce)
                    .map_err(|e| VaultError::Decryption(e.to_string()))?;
            let ciphertext =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &entry.ciphertext)
                    .map_err(|e| VaultError::Decryption(e.to_string()))?;
            let plaintext = decrypt_cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
                .map_err(|e| VaultError::Decryption(e.to_string()))?;

            let mut new_nonce_bytes = [0u8; 12];
            AeadOsRng.fill_bytes(&mut new_nonce_bytes);
            let new_ciphertext = encrypt_cipher
                .encrypt(Nonce::from_slice(&new_nonce_bytes), plaintext.as_ref())
                .map_err(|e| VaultError::Encryption(e.to_string()))?;
            rotated.insert(
                key.clone(),
                EncryptedEntry {
                    nonce: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, new_nonce_bytes),
                    ciphertext: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, new_ciphertext),
                },
            );
        }
        file.entries = rotated;
        self.persist(&file).await?;
        *self.master_key.write().await = new_key;
        Ok(())
    }

    async fn persist(&self, file: &VaultFile) -> Result<(), VaultError> {
        let payload = serde_json::to_vec_pretty(file)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, payload).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn vault_at(dir: &Path) -> KeyVault {
        KeyVault::open(dir.join("vault.json"), MasterKey::generate())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_materialize_round_trips_plaintext() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = vault_at(tmp.path()).await;
        vault.put("tenant-a", "openai", "sk-secret-a").await.unwrap();
        vault.put("tenant-a", "anthropic", "sk-secret-b").await.unwrap();
        vault.put("tenant-b", "openai", "sk-secret-c").await.unwrap();

        let materialized = vault.materialize("tenant-a").await.unwrap();
        assert_eq!(materialized.len(), 2);
        assert_eq!(materialized.get("openai").unwrap(), "sk-secret-a");
        assert_eq!(materialized.get("anthropic").unwrap(), "sk-secret-b");
    }

    #[tokio::test]
    async fn tenants_are_isolated_from_each_other() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = vault_at(tmp.path()).await;
        vault.put("tenant-a", "openai", "sk-a").await.unwrap();

        let other = vault.materialize("tenant-b").await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn rotate_re_encrypts_under_a_new_key_without_losing_data() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = vault_at(tmp.path()).await;
        vault.put("tenant-a", "openai", "sk-a").await.unwrap();

        vault.rotate(MasterKey::generate()).await.unwrap();

        let materialized = vault.materialize("tenant-a").await.unwrap();
        assert_eq!(materialized.get("openai").unwrap(), "sk-a");
    }
}
