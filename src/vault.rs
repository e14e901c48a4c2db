//! Encrypted-at-rest vault for credentials referenced by sub-actions.
//!
//! Values live in a `securestore` vault file encrypted with a CSPRNG key
//! exported to a key file on first use. Entry names and update timestamps
//! are not secret and live in a plain JSON sidecar so listings never touch
//! plaintext values. Values are never logged or echoed by any
//! consumer-facing surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use securestore::KeySource;
use zeroize::Zeroize;

/// Name and last-update timestamp of a vault entry. Never carries the value.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VaultEntryInfo {
    pub name: String,
    pub updated_at: i64,
}

/// Vault storage: encrypted values plus a non-secret metadata sidecar.
pub struct VaultStore {
    vault_path: PathBuf,
    key_path: PathBuf,
    meta_path: PathBuf,
    inner: Mutex<VaultInner>,
}

struct VaultInner {
    vault: Option<securestore::SecretsManager>,
    /// name -> updated_at (unix seconds)
    meta: BTreeMap<String, i64>,
}

impl VaultStore {
    /// Open a vault rooted at `dir`. The vault file and key are created
    /// lazily on first write.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create vault directory: {}", dir.display()))?;

        let meta_path = dir.join("vault.meta.json");
        let meta = if meta_path.exists() {
            let raw = std::fs::read_to_string(&meta_path)
                .with_context(|| format!("Failed to read {}", meta_path.display()))?;
            serde_json::from_str(&raw).context("Failed to parse vault metadata")?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            vault_path: dir.join("vault.json"),
            key_path: dir.join("vault.key"),
            meta_path,
            inner: Mutex::new(VaultInner { vault: None, meta }),
        })
    }

    /// Store (or overwrite) a secret and persist to disk. Last writer wins.
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("vault lock poisoned");
        let vault = Self::ensure_vault(&self.vault_path, &self.key_path, &mut inner.vault)?;
        vault.set(name, value);
        vault.save().context("Failed to save vault")?;

        inner.meta.insert(name.to_string(), chrono::Utc::now().timestamp());
        self.persist_meta(&inner.meta)
    }

    /// Retrieve a secret, or `None` if it does not exist.
    pub fn get(&self, name: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().expect("vault lock poisoned");
        if !self.vault_path.exists() && inner.vault.is_none() {
            return Ok(None);
        }
        let vault = Self::ensure_vault(&self.vault_path, &self.key_path, &mut inner.vault)?;
        match vault.get(name) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == securestore::ErrorKind::SecretNotFound => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to read vault entry: {}", e)),
        }
    }

    /// Delete a secret and persist to disk.
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("vault lock poisoned");
        let vault = Self::ensure_vault(&self.vault_path, &self.key_path, &mut inner.vault)?;
        vault.remove(name).context("Failed to remove vault entry")?;
        vault.save().context("Failed to save vault")?;

        inner.meta.remove(name);
        self.persist_meta(&inner.meta)
    }

    /// List entry names and timestamps. Values are never included.
    pub fn list(&self) -> Vec<VaultEntryInfo> {
        let inner = self.inner.lock().expect("vault lock poisoned");
        inner
            .meta
            .iter()
            .map(|(name, updated_at)| VaultEntryInfo {
                name: name.clone(),
                updated_at: *updated_at,
            })
            .collect()
    }

    /// Overwrite a transient plaintext copy after use.
    pub fn scrub(mut value: String) {
        value.zeroize();
    }

    fn persist_meta(&self, meta: &BTreeMap<String, i64>) -> Result<()> {
        let raw = serde_json::to_string_pretty(meta)?;
        std::fs::write(&self.meta_path, raw)
            .with_context(|| format!("Failed to write {}", self.meta_path.display()))
    }

    /// Ensure the vault is loaded (or created if it doesn't exist yet).
    fn ensure_vault<'a>(
        vault_path: &Path,
        key_path: &Path,
        slot: &'a mut Option<securestore::SecretsManager>,
    ) -> Result<&'a mut securestore::SecretsManager> {
        if slot.is_none() {
            let vault = if vault_path.exists() {
                securestore::SecretsManager::load(vault_path, KeySource::from_file(key_path))
                    .context("Failed to load vault")?
            } else {
                // First run: create a brand-new vault and export its key.
                let sman = securestore::SecretsManager::new(KeySource::Csprng)
                    .context("Failed to create new vault")?;
                sman.export_key(key_path).context("Failed to export vault key")?;
                sman.save_as(vault_path).context("Failed to save new vault")?;
                securestore::SecretsManager::load(vault_path, KeySource::from_file(key_path))
                    .context("Failed to reload newly-created vault")?
            };
            *slot = Some(vault);
        }
        // SAFETY: we just ensured `slot` is `Some`.
        Ok(slot.as_mut().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let vault = VaultStore::open(temp.path()).unwrap();

        vault.set("discord_token", "hunter2").unwrap();
        assert_eq!(
            vault.get("discord_token").unwrap(),
            Some("hunter2".to_string())
        );
    }

    #[test]
    fn missing_entry_is_none() {
        let temp = TempDir::new().unwrap();
        let vault = VaultStore::open(temp.path()).unwrap();
        assert_eq!(vault.get("nope").unwrap(), None);
    }

    #[test]
    fn listing_never_contains_values() {
        let temp = TempDir::new().unwrap();
        let vault = VaultStore::open(temp.path()).unwrap();

        vault.set("api_key", "s3cret-value").unwrap();
        let listed = vault.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "api_key");

        let as_json = serde_json::to_string(&listed).unwrap();
        assert!(!as_json.contains("s3cret-value"));
    }

    #[test]
    fn delete_removes_entry_and_meta() {
        let temp = TempDir::new().unwrap();
        let vault = VaultStore::open(temp.path()).unwrap();

        vault.set("temp", "value").unwrap();
        vault.delete("temp").unwrap();
        assert_eq!(vault.get("temp").unwrap(), None);
        assert!(vault.list().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let vault = VaultStore::open(temp.path()).unwrap();
            vault.set("persistent", "value").unwrap();
        }
        let vault = VaultStore::open(temp.path()).unwrap();
        assert_eq!(vault.get("persistent").unwrap(), Some("value".to_string()));
        assert_eq!(vault.list().len(), 1);
    }
}
