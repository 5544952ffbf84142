//! Wallet configuration.
//!
//! Everything tunable lives in one explicit struct loaded from a JSON file;
//! engines receive the pieces they need instead of reading ambient settings.

use crate::core::denom::Denomination;
use crate::core::types::{POOL_TIMEOUT_SECS, RESERVATION_TIMEOUT_SECS};
use crate::errors::{Result, WalletError};
use crate::mix::PrivacyLevel;
use crate::shielded::mint::AutoMintConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletConfig {
    /// RPC listen port.
    pub rpc_port: u16,
    /// Default privacy level for mixing sessions.
    pub privacy_level: PrivacyLevel,
    /// Denominations kept stocked for mixing, largest first.
    pub preferred_denominations: Vec<Denomination>,
    pub auto_mint: AutoMintConfig,
    /// Default security level (anonymity set scaling) for spends, 1-100.
    pub security_level: u8,
    pub pool_timeout_secs: u64,
    pub reservation_timeout_secs: u64,
    /// Blocks between accumulator checkpoints.
    pub checkpoint_interval: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            rpc_port: 8557,
            privacy_level: PrivacyLevel::Medium,
            preferred_denominations: vec![
                Denomination::OneHundred,
                Denomination::Ten,
                Denomination::One,
            ],
            auto_mint: AutoMintConfig::default(),
            security_level: 50,
            pool_timeout_secs: POOL_TIMEOUT_SECS,
            reservation_timeout_secs: RESERVATION_TIMEOUT_SECS,
            checkpoint_interval: 10,
        }
    }
}

impl WalletConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| WalletError::Codec(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes =
            serde_json::to_vec_pretty(self).map_err(|e| WalletError::Codec(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load from `path`, writing defaults there first if absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = WalletConfig::default();
        config.security_level = 90;
        config.save(&path).unwrap();
        let loaded = WalletConfig::load(&path).unwrap();
        assert_eq!(loaded.security_level, 90);
        assert_eq!(loaded.rpc_port, config.rpc_port);
    }

    #[test]
    fn load_or_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = WalletConfig::load_or_default(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.rpc_port, WalletConfig::default().rpc_port);
    }

    #[test]
    fn rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(WalletConfig::load(&path).is_err());
    }
}
