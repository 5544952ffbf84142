//! Keybook: the wallet's signing keys and watch-only addresses.
//!
//! Addresses are one-time public keys ([`crate::core::ots`]); a fresh one is
//! generated for every change output and every shielded self-payment so
//! addresses never repeat. Secrets live in an encrypted file; watch-only
//! addresses carry no seed and can never sign.

pub mod crypto;

use crate::core::ots;
use crate::core::types::{short_hex, unix_now};
use crate::errors::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default keybook location: ~/.umbra/keybook.dat
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".umbra")
        .join("keybook.dat")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnedKey {
    pub seed: [u8; 32],
    pub public: [u8; 32],
    pub label: Option<String>,
    pub created_at: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeybookData {
    pub keys: Vec<OwnedKey>,
    /// Addresses we track balances for but cannot spend from.
    #[serde(default)]
    pub watch: Vec<[u8; 32]>,
}

pub struct Keybook {
    path: Option<PathBuf>,
    passphrase: Vec<u8>,
    data: KeybookData,
}

impl Keybook {
    pub fn create(path: &Path, passphrase: &[u8]) -> Result<Self> {
        if path.exists() {
            return Err(WalletError::Codec(format!(
                "keybook already exists: {}",
                path.display()
            )));
        }
        let book = Self {
            path: Some(path.to_path_buf()),
            passphrase: passphrase.to_vec(),
            data: KeybookData::default(),
        };
        book.save()?;
        Ok(book)
    }

    pub fn open(path: &Path, passphrase: &[u8]) -> Result<Self> {
        let encrypted = std::fs::read(path)?;
        let plaintext = crypto::decrypt(&encrypted, passphrase)?;
        let data: KeybookData =
            serde_json::from_slice(&plaintext).map_err(|e| WalletError::Codec(e.to_string()))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            passphrase: passphrase.to_vec(),
            data,
        })
    }

    /// A keybook that lives only in memory. Used by tests and by the daemon
    /// until a persistent keybook is configured.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            passphrase: Vec::new(),
            data: KeybookData::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let plaintext =
            serde_json::to_vec(&self.data).map_err(|e| WalletError::Codec(e.to_string()))?;
        let encrypted = crypto::encrypt(&plaintext, &self.passphrase)?;
        std::fs::write(path, encrypted)?;
        Ok(())
    }

    /// Generate a fresh one-time address. Never reuses a key.
    pub fn fresh_address(&mut self, label: Option<String>) -> Result<[u8; 32]> {
        let seed: [u8; 32] = rand::random();
        let public = ots::keygen(&seed);
        self.data.keys.push(OwnedKey {
            seed,
            public,
            label,
            created_at: unix_now(),
        });
        self.save()?;
        Ok(public)
    }

    pub fn add_watch_address(&mut self, address: [u8; 32]) -> Result<()> {
        if !self.data.watch.contains(&address) {
            self.data.watch.push(address);
            self.save()?;
        }
        Ok(())
    }

    pub fn is_ours(&self, public: &[u8; 32]) -> bool {
        self.data.keys.iter().any(|k| &k.public == public)
    }

    pub fn is_watched(&self, address: &[u8; 32]) -> bool {
        self.data.watch.contains(address)
    }

    pub fn key_for(&self, public: &[u8; 32]) -> Option<&OwnedKey> {
        self.data.keys.iter().find(|k| &k.public == public)
    }

    /// Sign `message` with the key behind `public`.
    pub fn sign(&self, public: &[u8; 32], message: &[u8; 32]) -> Result<Vec<u8>> {
        let key = self
            .key_for(public)
            .ok_or_else(|| WalletError::Codec(format!("no key for {}", short_hex(public))))?;
        Ok(ots::sig_to_bytes(&ots::sign(&key.seed, message)))
    }

    pub fn key_count(&self) -> usize {
        self.data.keys.len()
    }

    pub fn watch_addresses(&self) -> &[[u8; 32]] {
        &self.data.watch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_path_under_home() {
        let path = default_path();
        assert!(path.ends_with(".umbra/keybook.dat"));
    }

    #[test]
    fn create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.dat");
        let mut book = Keybook::create(&path, b"pass").unwrap();
        let pk = book.fresh_address(Some("test".into())).unwrap();

        let book2 = Keybook::open(&path, b"pass").unwrap();
        assert_eq!(book2.key_count(), 1);
        assert!(book2.is_ours(&pk));
    }

    #[test]
    fn wrong_passphrase_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.dat");
        Keybook::create(&path, b"right").unwrap();
        assert!(matches!(
            Keybook::open(&path, b"wrong"),
            Err(WalletError::Locked)
        ));
    }

    #[test]
    fn create_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.dat");
        Keybook::create(&path, b"p").unwrap();
        assert!(Keybook::create(&path, b"p").is_err());
    }

    #[test]
    fn fresh_addresses_never_repeat() {
        let mut book = Keybook::ephemeral();
        let a = book.fresh_address(None).unwrap();
        let b = book.fresh_address(None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sign_verifies_with_ots() {
        let mut book = Keybook::ephemeral();
        let pk = book.fresh_address(None).unwrap();
        let msg = crate::core::types::hash(b"proposal");
        let sig_bytes = book.sign(&pk, &msg).unwrap();
        let sig = ots::sig_from_bytes(&sig_bytes).unwrap();
        assert!(ots::verify(&sig, &msg, &pk));
    }

    #[test]
    fn watch_addresses_cannot_sign() {
        let mut book = Keybook::ephemeral();
        book.add_watch_address([7; 32]).unwrap();
        book.add_watch_address([7; 32]).unwrap(); // idempotent
        assert_eq!(book.watch_addresses(), &[[7u8; 32]]);
        assert!(book.is_watched(&[7; 32]));
        assert!(book.sign(&[7; 32], &[0; 32]).is_err());
    }
}
