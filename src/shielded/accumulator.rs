//! Append-only commitment accumulator with checkpoint history.
//!
//! One Merkle tree per denomination. Spend proofs are built against a
//! *snapshot* (a point-in-time clone of the leaf set) so proof
//! construction runs in parallel with live appends. A snapshot stays
//! acceptable as long as its root is inside the rolling checkpoint window
//! ([`CHECKPOINT_HISTORY`] roots); beyond that the proof is stale.

use crate::core::denom::Denomination;
use crate::core::types::{hash_concat, CHECKPOINT_HISTORY};
use crate::errors::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// A sibling on the path from a leaf to the root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathElement {
    pub hash: [u8; 32],
    pub is_right: bool,
}

/// Inclusion witness for one leaf against one root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipPath {
    pub position: u64,
    pub siblings: Vec<PathElement>,
}

/// Append-only Merkle tree over commitments.
///
/// Backed by a persistent vector: cloning for a snapshot is O(1) and the
/// clone shares structure with the live tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommitmentTree {
    leaves: im::Vector<[u8; 32]>,
}

impl CommitmentTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Append a commitment, returning its position.
    pub fn append(&mut self, commitment: [u8; 32]) -> u64 {
        self.leaves.push_back(commitment);
        (self.leaves.len() - 1) as u64
    }

    pub fn get(&self, position: u64) -> Option<[u8; 32]> {
        self.leaves.get(position as usize).copied()
    }

    /// Position of a commitment, scanning from the newest leaf.
    pub fn position_of(&self, commitment: &[u8; 32]) -> Option<u64> {
        self.leaves
            .iter()
            .rposition(|c| c == commitment)
            .map(|p| p as u64)
    }

    pub fn contains(&self, commitment: &[u8; 32]) -> bool {
        self.position_of(commitment).is_some()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.leaves.iter()
    }

    /// Root over all current leaves. An unpaired node is promoted unchanged.
    /// The empty tree has the all-zero root.
    pub fn root(&self) -> [u8; 32] {
        if self.leaves.is_empty() {
            return [0u8; 32];
        }
        let mut level: Vec<[u8; 32]> = self.leaves.iter().copied().collect();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_concat(a, b),
                    [a] => *a,
                    _ => unreachable!("chunks(2) yields 1 or 2 elements"),
                })
                .collect();
        }
        level[0]
    }

    /// Inclusion witness for the leaf at `position` against the current root.
    pub fn prove(&self, position: u64) -> Result<MembershipPath> {
        let idx = position as usize;
        if idx >= self.leaves.len() {
            return Err(WalletError::Codec(format!(
                "position {} out of range ({} leaves)",
                position,
                self.leaves.len()
            )));
        }

        let mut siblings = Vec::new();
        let mut level: Vec<[u8; 32]> = self.leaves.iter().copied().collect();
        let mut pos = idx;

        while level.len() > 1 {
            let sibling = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
            if sibling < level.len() {
                siblings.push(PathElement {
                    hash: level[sibling],
                    is_right: sibling > pos,
                });
            }
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_concat(a, b),
                    [a] => *a,
                    _ => unreachable!("chunks(2) yields 1 or 2 elements"),
                })
                .collect();
            pos /= 2;
        }

        Ok(MembershipPath { position, siblings })
    }
}

/// Verify a membership path against an expected root.
pub fn verify_path(leaf: &[u8; 32], path: &MembershipPath, expected_root: &[u8; 32]) -> bool {
    let mut current = *leaf;
    for elem in &path.siblings {
        current = if elem.is_right {
            hash_concat(&current, &elem.hash)
        } else {
            hash_concat(&elem.hash, &current)
        };
    }
    current == *expected_root
}

// ── Checkpointed accumulator set ────────────────────────────────────────────

/// A published accumulator root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub root: [u8; 32],
    pub leaf_count: u64,
    pub height: u64,
}

/// Point-in-time view a spend proof is built against.
#[derive(Clone, Debug)]
pub struct AccumulatorSnapshot {
    pub denomination: Denomination,
    pub root: [u8; 32],
    pub height: u64,
    tree: CommitmentTree,
}

impl AccumulatorSnapshot {
    pub fn leaf_count(&self) -> usize {
        self.tree.len()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.tree.leaves()
    }

    pub fn contains(&self, commitment: &[u8; 32]) -> bool {
        self.tree.contains(commitment)
    }

    pub fn witness(&self, commitment: &[u8; 32]) -> Result<MembershipPath> {
        let pos = self
            .tree
            .position_of(commitment)
            .ok_or(WalletError::AccumulatorStale)?;
        self.tree.prove(pos)
    }
}

/// All per-denomination trees plus their checkpoint windows.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccumulatorSet {
    trees: BTreeMap<Denomination, CommitmentTree>,
    checkpoints: BTreeMap<Denomination, VecDeque<Checkpoint>>,
}

impl AccumulatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a confirmed commitment. Returns its position in the tree.
    pub fn add(&mut self, denom: Denomination, commitment: [u8; 32]) -> u64 {
        self.trees.entry(denom).or_default().append(commitment)
    }

    pub fn contains(&self, denom: Denomination, commitment: &[u8; 32]) -> bool {
        self.trees.get(&denom).is_some_and(|t| t.contains(commitment))
    }

    pub fn leaf_count(&self, denom: Denomination) -> usize {
        self.trees.get(&denom).map_or(0, CommitmentTree::len)
    }

    /// Publish the current root as a checkpoint at `height`. The window keeps
    /// the newest [`CHECKPOINT_HISTORY`] checkpoints.
    pub fn checkpoint(&mut self, denom: Denomination, height: u64) -> Checkpoint {
        let tree = self.trees.entry(denom).or_default();
        let cp = Checkpoint {
            root: tree.root(),
            leaf_count: tree.len() as u64,
            height,
        };
        let window = self.checkpoints.entry(denom).or_default();
        window.push_back(cp.clone());
        while window.len() > CHECKPOINT_HISTORY {
            window.pop_front();
        }
        cp
    }

    /// True if `root` is inside the checkpoint window for `denom`.
    pub fn is_recent_root(&self, denom: Denomination, root: &[u8; 32]) -> bool {
        self.checkpoints
            .get(&denom)
            .is_some_and(|w| w.iter().any(|cp| cp.root == *root))
    }

    /// Capture a snapshot of one denomination's tree for proof construction.
    /// Cheap: leaf storage is shared with the live tree.
    pub fn snapshot(&self, denom: Denomination, height: u64) -> AccumulatorSnapshot {
        let tree = self.trees.get(&denom).cloned().unwrap_or_default();
        AccumulatorSnapshot {
            denomination: denom,
            root: tree.root(),
            height,
            tree,
        }
    }

    /// Drop every tree and checkpoint. Used by shielded-DB reset.
    pub fn clear(&mut self) {
        self.trees.clear();
        self.checkpoints.clear();
    }
}
