//! The consensus/validation layer, seen from the wallet as an oracle.
//!
//! A submitted transaction is accepted or rejected atomically; the wallet
//! never inspects blocks. [`SimChain`] is the in-process model used by the
//! daemon and the test suites; it enforces the rejection rules the real
//! network would (duplicate serials, stale snapshots, dust).

use crate::core::types::{Serial, Transaction, TxId};
use crate::errors::RejectReason;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Minimum output value the network will relay.
pub const DUST_THRESHOLD: u64 = 100;

/// Why a submission did not land.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// The validator rejected the transaction. Terminal for this attempt.
    Rejected(RejectReason),
    /// The transaction never reached the validator. Transient; safe to retry.
    Unavailable,
}

/// Opaque handle to the consensus layer.
pub trait ChainOracle: Send + Sync {
    /// Submit a finished transaction. Acceptance is atomic; a rejected
    /// transaction has no effect on chain state.
    fn submit(&self, tx: &Transaction) -> std::result::Result<TxId, SubmitError>;

    /// Current chain height.
    fn height(&self) -> u64;

    /// Confirmations accrued by a transaction, 0 if unknown or unconfirmed.
    fn confirmations(&self, txid: &TxId) -> u64;
}

// ── In-process chain model ──────────────────────────────────────────────────

#[derive(Default)]
struct SimChainInner {
    height: u64,
    /// txid -> inclusion height
    accepted: HashMap<TxId, u64>,
    spent_serials: HashSet<Serial>,
    shielded_enabled: bool,
    /// Roots the validator currently accepts spend proofs against.
    recent_roots: Vec<[u8; 32]>,
    /// Simulated transport outages: this many submissions fail `Unavailable`.
    outage_remaining: u32,
}

/// Simulated consensus oracle.
pub struct SimChain {
    inner: Mutex<SimChainInner>,
}

impl SimChain {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimChainInner {
                shielded_enabled: true,
                ..Default::default()
            }),
        }
    }

    /// A chain where the shielded subsystem is not yet activated; every
    /// mint/spend submission is rejected.
    pub fn with_shielded_disabled() -> Self {
        let chain = Self::new();
        chain.inner.lock().expect("chain lock").shielded_enabled = false;
        chain
    }

    /// Advance the chain by `n` blocks.
    pub fn advance_blocks(&self, n: u64) {
        let mut inner = self.inner.lock().expect("chain lock");
        inner.height += n;
    }

    /// Publish an accumulator root the validator will accept proofs against.
    /// Old roots fall out of the window, mirroring [`crate::core::types::CHECKPOINT_HISTORY`].
    pub fn publish_root(&self, root: [u8; 32]) {
        let mut inner = self.inner.lock().expect("chain lock");
        inner.recent_roots.push(root);
        let excess = inner
            .recent_roots
            .len()
            .saturating_sub(crate::core::types::CHECKPOINT_HISTORY);
        if excess > 0 {
            inner.recent_roots.drain(..excess);
        }
    }

    /// Make the next `n` submissions fail with a transport outage.
    pub fn induce_outage(&self, n: u32) {
        self.inner.lock().expect("chain lock").outage_remaining = n;
    }

    /// Number of transactions the chain has accepted.
    pub fn accepted_count(&self) -> usize {
        self.inner.lock().expect("chain lock").accepted.len()
    }

    /// How many accepted transactions reveal `serial`.
    pub fn spends_of_serial(&self, serial: &Serial) -> usize {
        let inner = self.inner.lock().expect("chain lock");
        usize::from(inner.spent_serials.contains(serial))
    }
}

impl Default for SimChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainOracle for SimChain {
    fn submit(&self, tx: &Transaction) -> std::result::Result<TxId, SubmitError> {
        let mut inner = self.inner.lock().expect("chain lock");

        if inner.outage_remaining > 0 {
            inner.outage_remaining -= 1;
            return Err(SubmitError::Unavailable);
        }

        // Resubmission of an already-included transaction is a no-op; the
        // original inclusion height stands. Crash recovery relies on this.
        let txid = tx.txid();
        if inner.accepted.contains_key(&txid) {
            return Ok(txid);
        }

        let reject = |r: RejectReason| Err(SubmitError::Rejected(r));
        match tx {
            Transaction::Mint { .. } if !inner.shielded_enabled => {
                return reject(RejectReason::ShieldedDisabled);
            }
            Transaction::Spend { proof, outputs, .. } => {
                if !inner.shielded_enabled {
                    return reject(RejectReason::ShieldedDisabled);
                }
                if inner.spent_serials.contains(&proof.serial) {
                    return reject(RejectReason::SerialAlreadySpent);
                }
                if !inner.recent_roots.is_empty()
                    && !inner.recent_roots.contains(&proof.checkpoint_root)
                {
                    return reject(RejectReason::StaleAccumulator);
                }
                if outputs.iter().any(|o| o.value < DUST_THRESHOLD) {
                    return reject(RejectReason::BelowDustThreshold);
                }
            }
            Transaction::Plain { outputs, .. } | Transaction::Mix { outputs, .. } => {
                if outputs.iter().any(|o| o.value < DUST_THRESHOLD) {
                    return reject(RejectReason::BelowDustThreshold);
                }
            }
            Transaction::Mint { .. } => {}
        }

        if let Some(serial) = tx.revealed_serial() {
            inner.spent_serials.insert(serial);
        }

        let height = inner.height;
        inner.accepted.insert(txid, height);
        Ok(txid)
    }

    fn height(&self) -> u64 {
        self.inner.lock().expect("chain lock").height
    }

    fn confirmations(&self, txid: &TxId) -> u64 {
        let inner = self.inner.lock().expect("chain lock");
        match inner.accepted.get(txid) {
            Some(included) => inner.height.saturating_sub(*included) + 1,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::denom::Denomination;
    use crate::core::types::{OutputData, SpendProof};

    fn spend_tx(serial: Serial, root: [u8; 32]) -> Transaction {
        Transaction::Spend {
            proof: SpendProof {
                serial,
                denomination: Denomination::Ten,
                checkpoint_root: root,
                members: vec![],
                ring: vec![],
                binding: [0; 32],
            },
            outputs: vec![OutputData {
                address: [1; 32],
                value: Denomination::Ten.amount(),
                salt: [2; 32],
            }],
            reminted: vec![],
        }
    }

    #[test]
    fn duplicate_serial_rejected() {
        let chain = SimChain::new();
        chain.submit(&spend_tx([7; 32], [0; 32])).unwrap();
        let err = chain.submit(&spend_tx([7; 32], [9; 32])).unwrap_err();
        assert_eq!(err, SubmitError::Rejected(RejectReason::SerialAlreadySpent));
    }

    #[test]
    fn stale_root_rejected() {
        let chain = SimChain::new();
        chain.publish_root([1; 32]);
        assert!(chain.submit(&spend_tx([3; 32], [1; 32])).is_ok());
        let err = chain.submit(&spend_tx([4; 32], [2; 32])).unwrap_err();
        assert_eq!(err, SubmitError::Rejected(RejectReason::StaleAccumulator));
    }

    #[test]
    fn confirmations_grow_with_height() {
        let chain = SimChain::new();
        let txid = chain.submit(&spend_tx([5; 32], [0; 32])).unwrap();
        assert_eq!(chain.confirmations(&txid), 1);
        chain.advance_blocks(10);
        assert_eq!(chain.confirmations(&txid), 11);
        assert_eq!(chain.confirmations(&[0xEE; 32]), 0);
    }

    #[test]
    fn resubmit_is_idempotent() {
        let chain = SimChain::new();
        let tx = spend_tx([6; 32], [0; 32]);
        let a = chain.submit(&tx).unwrap();
        chain.advance_blocks(2);
        // The identical transaction is a no-op; the original inclusion stands.
        let b = chain.submit(&tx).unwrap();
        assert_eq!(a, b);
        assert_eq!(chain.confirmations(&a), 3);
        assert_eq!(chain.spends_of_serial(&[6; 32]), 1);

        // A *different* spend of the same serial is a double spend.
        let err = chain.submit(&spend_tx([6; 32], [1; 32])).unwrap_err();
        assert_eq!(err, SubmitError::Rejected(RejectReason::SerialAlreadySpent));
    }

    #[test]
    fn shielded_disabled_surfaces_reason() {
        let chain = SimChain::with_shielded_disabled();
        let err = chain.submit(&spend_tx([8; 32], [0; 32])).unwrap_err();
        assert_eq!(err, SubmitError::Rejected(RejectReason::ShieldedDisabled));
    }

    #[test]
    fn dust_output_rejected() {
        let chain = SimChain::new();
        let tx = Transaction::Plain {
            inputs: vec![],
            outputs: vec![OutputData { address: [0; 32], value: 1, salt: [0; 32] }],
            signatures: vec![],
        };
        assert_eq!(
            chain.submit(&tx).unwrap_err(),
            SubmitError::Rejected(RejectReason::BelowDustThreshold)
        );
    }
}
