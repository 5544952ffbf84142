//! Persisted spent-serial set.
//!
//! Injected into the spend engine rather than living as ambient global
//! state: the engine sees only the [`SerialSet`] trait, which gives atomic
//! check-and-set semantics under concurrency.

use crate::core::types::Serial;
use crate::errors::Result;
use std::collections::HashSet;
use std::sync::Mutex;

pub trait SerialSet: Send + Sync {
    fn contains(&self, serial: &Serial) -> Result<bool>;

    /// Insert `serial` if absent. Returns `true` if this call inserted it,
    /// `false` if it was already present. Atomic: two concurrent callers
    /// cannot both observe `true`.
    fn insert_if_absent(&self, serial: &Serial) -> Result<bool>;

    /// Remove a serial (reset/rescan only, never during normal operation).
    fn remove(&self, serial: &Serial) -> Result<()>;

    fn len(&self) -> Result<usize>;

    fn clear(&self) -> Result<()>;
}

/// sled-backed serial set. Check-and-set maps onto `compare_and_swap`.
pub struct SledSerialSet {
    tree: sled::Tree,
}

impl SledSerialSet {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }
}

impl SerialSet for SledSerialSet {
    fn contains(&self, serial: &Serial) -> Result<bool> {
        Ok(self.tree.contains_key(serial)?)
    }

    fn insert_if_absent(&self, serial: &Serial) -> Result<bool> {
        let swapped = self
            .tree
            .compare_and_swap(serial, None as Option<&[u8]>, Some(&[1u8][..]))?;
        if swapped.is_ok() {
            self.tree.flush()?;
        }
        Ok(swapped.is_ok())
    }

    fn remove(&self, serial: &Serial) -> Result<()> {
        self.tree.remove(serial)?;
        self.tree.flush()?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.tree.len())
    }

    fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        self.tree.flush()?;
        Ok(())
    }
}

/// In-memory serial set for tests.
#[derive(Default)]
pub struct MemorySerialSet {
    set: Mutex<HashSet<Serial>>,
}

impl MemorySerialSet {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SerialSet for MemorySerialSet {
    fn contains(&self, serial: &Serial) -> Result<bool> {
        Ok(self.set.lock().expect("serial set lock").contains(serial))
    }

    fn insert_if_absent(&self, serial: &Serial) -> Result<bool> {
        Ok(self.set.lock().expect("serial set lock").insert(*serial))
    }

    fn remove(&self, serial: &Serial) -> Result<()> {
        self.set.lock().expect("serial set lock").remove(serial);
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.set.lock().expect("serial set lock").len())
    }

    fn clear(&self) -> Result<()> {
        self.set.lock().expect("serial set lock").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sled_set() -> (tempfile::TempDir, SledSerialSet) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = sled::open(dir.path().join("serials")).unwrap();
        let set = SledSerialSet::new(db.open_tree("spent").unwrap());
        (dir, set)
    }

    #[test]
    fn check_and_set_is_exclusive() {
        let (_dir, set) = sled_set();
        assert!(set.insert_if_absent(&[1; 32]).unwrap());
        assert!(!set.insert_if_absent(&[1; 32]).unwrap());
        assert!(set.contains(&[1; 32]).unwrap());
        assert_eq!(set.len().unwrap(), 1);
    }

    #[test]
    fn remove_allows_reinsert() {
        let (_dir, set) = sled_set();
        set.insert_if_absent(&[2; 32]).unwrap();
        set.remove(&[2; 32]).unwrap();
        assert!(!set.contains(&[2; 32]).unwrap());
        assert!(set.insert_if_absent(&[2; 32]).unwrap());
    }

    #[test]
    fn clear_empties() {
        let (_dir, set) = sled_set();
        set.insert_if_absent(&[3; 32]).unwrap();
        set.insert_if_absent(&[4; 32]).unwrap();
        set.clear().unwrap();
        assert_eq!(set.len().unwrap(), 0);
    }

    #[test]
    fn memory_set_matches_semantics() {
        let set = MemorySerialSet::new();
        assert!(set.insert_if_absent(&[9; 32]).unwrap());
        assert!(!set.insert_if_absent(&[9; 32]).unwrap());
        set.remove(&[9; 32]).unwrap();
        assert!(!set.contains(&[9; 32]).unwrap());
    }

    #[test]
    fn concurrent_inserts_single_winner() {
        let (_dir, set) = sled_set();
        let set = std::sync::Arc::new(set);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = set.clone();
                std::thread::spawn(move || s.insert_if_absent(&[7; 32]).unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|inserted| *inserted)
            .count();
        assert_eq!(winners, 1);
    }
}
