//! Durable wallet store.
//!
//! One sled database per wallet, split into trees: the denominated coin set,
//! shielded mint/spend records keyed by serial, the spent-serial set, and a
//! write-ahead log of in-flight operations. Every record is bincode.
//!
//! WAL discipline: an operation that must survive a crash writes its record
//! *before* the externally-visible step (broadcast), and deletes it only
//! after the step is confirmed. Recovery replays whatever is left.

use crate::core::types::{CoinId, Serial, Transaction};
use crate::errors::Result;
use crate::ledger::LedgerCoin;
use crate::shielded::mint::MintRecord;
use crate::shielded::spend::SpendRecord;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An operation that was in flight when the process may have died.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum InFlightOp {
    /// A spend whose proof is constructed and persisted but whose broadcast
    /// is not confirmed. Recovery resubmits the *same* transaction; the
    /// proof is reused, never regenerated.
    SpendPrepared { serial: Serial, tx: Transaction },
    /// A mixing session with no confirmed broadcast. Recovery treats it as
    /// timed out and releases the reserved coins.
    MixPending {
        session_nonce: [u8; 32],
        reserved: Vec<CoinId>,
    },
}

impl InFlightOp {
    fn key(&self) -> [u8; 32] {
        match self {
            InFlightOp::SpendPrepared { serial, .. } => *serial,
            InFlightOp::MixPending { session_nonce, .. } => *session_nonce,
        }
    }
}

pub struct WalletStore {
    db: sled::Db,
    coins: sled::Tree,
    mints: sled::Tree,
    spends: sled::Tree,
    wal: sled::Tree,
    serials: sled::Tree,
}

impl WalletStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            coins: db.open_tree("coins")?,
            mints: db.open_tree("mints")?,
            spends: db.open_tree("spends")?,
            wal: db.open_tree("wal")?,
            serials: db.open_tree("serials")?,
            db,
        })
    }

    /// The tree backing the spent-serial set.
    pub fn serials_tree(&self) -> sled::Tree {
        self.serials.clone()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // ── Coins ───────────────────────────────────────────────────────────

    pub fn put_coin(&self, coin: &LedgerCoin) -> Result<()> {
        self.coins.insert(coin.id, bincode::serialize(coin)?)?;
        Ok(())
    }

    pub fn delete_coin(&self, id: &CoinId) -> Result<()> {
        self.coins.remove(id)?;
        Ok(())
    }

    pub fn load_coins(&self) -> Result<Vec<LedgerCoin>> {
        let mut out = Vec::new();
        for item in self.coins.iter() {
            let (_, v) = item?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    // ── Mints ───────────────────────────────────────────────────────────

    pub fn put_mint(&self, mint: &MintRecord) -> Result<()> {
        self.mints.insert(mint.serial, bincode::serialize(mint)?)?;
        self.mints.flush()?;
        Ok(())
    }

    pub fn get_mint(&self, serial: &Serial) -> Result<Option<MintRecord>> {
        match self.mints.get(serial)? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    pub fn delete_mint(&self, serial: &Serial) -> Result<()> {
        self.mints.remove(serial)?;
        Ok(())
    }

    pub fn load_mints(&self) -> Result<Vec<MintRecord>> {
        let mut out = Vec::new();
        for item in self.mints.iter() {
            let (_, v) = item?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    pub fn clear_mints(&self) -> Result<()> {
        self.mints.clear()?;
        Ok(())
    }

    // ── Spend history ───────────────────────────────────────────────────

    pub fn put_spend(&self, spend: &SpendRecord) -> Result<()> {
        self.spends.insert(spend.serial, bincode::serialize(spend)?)?;
        Ok(())
    }

    pub fn load_spends(&self) -> Result<Vec<SpendRecord>> {
        let mut out = Vec::new();
        for item in self.spends.iter() {
            let (_, v) = item?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    pub fn clear_spends(&self) -> Result<()> {
        self.spends.clear()?;
        Ok(())
    }

    // ── Write-ahead log ─────────────────────────────────────────────────

    /// Persist an in-flight operation. Flushes before returning: the record
    /// must be durable before the caller takes the externally-visible step.
    pub fn wal_put(&self, op: &InFlightOp) -> Result<()> {
        self.wal.insert(op.key(), bincode::serialize(op)?)?;
        self.wal.flush()?;
        Ok(())
    }

    pub fn wal_remove(&self, key: &[u8; 32]) -> Result<()> {
        self.wal.remove(key)?;
        self.wal.flush()?;
        Ok(())
    }

    pub fn wal_entries(&self) -> Result<Vec<InFlightOp>> {
        let mut out = Vec::new();
        for item in self.wal.iter() {
            let (_, v) = item?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::denom::Denomination;
    use crate::core::types::hash;

    fn open_store(dir: &tempfile::TempDir) -> WalletStore {
        WalletStore::open(dir.path().join("wallet-db")).unwrap()
    }

    #[test]
    fn coins_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        let coin = LedgerCoin {
            id: hash(b"c"),
            denomination: Denomination::Fifty,
            owner_pk: hash(b"owner"),
            confirmed_height: Some(3),
            reserved_until: None,
        };
        store.put_coin(&coin).unwrap();
        assert_eq!(store.load_coins().unwrap(), vec![coin.clone()]);
        store.delete_coin(&coin.id).unwrap();
        assert!(store.load_coins().unwrap().is_empty());
    }

    #[test]
    fn wal_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let op = InFlightOp::MixPending {
            session_nonce: hash(b"nonce"),
            reserved: vec![hash(b"coin")],
        };
        {
            let store = open_store(&dir);
            store.wal_put(&op).unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.wal_entries().unwrap(), vec![op.clone()]);
        store.wal_remove(&hash(b"nonce")).unwrap();
        assert!(store.wal_entries().unwrap().is_empty());
    }

    #[test]
    fn wal_replaces_same_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        let op1 = InFlightOp::MixPending { session_nonce: [1; 32], reserved: vec![] };
        let op2 = InFlightOp::MixPending {
            session_nonce: [1; 32],
            reserved: vec![hash(b"x")],
        };
        store.wal_put(&op1).unwrap();
        store.wal_put(&op2).unwrap();
        assert_eq!(store.wal_entries().unwrap(), vec![op2]);
    }
}
