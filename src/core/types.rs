use super::denom::Denomination;
use serde::{Deserialize, Serialize};

/// Sub-units per whole coin. All `u64` amounts in this crate are sub-units.
pub const COIN: u64 = 100_000_000;

/// Confirmations a mint must accrue before it is spendable.
pub const MINT_MATURITY_CONFIRMATIONS: u64 = 20;

/// Number of recent accumulator checkpoints a spend proof may reference.
/// Proofs built against older roots fail with `AccumulatorStale`.
pub const CHECKPOINT_HISTORY: usize = 30;

/// Seconds a ledger reservation is held before it expires back to spendable.
pub const RESERVATION_TIMEOUT_SECS: u64 = 120;

/// Seconds a mixing client waits for the coordinator to fill a pool.
pub const POOL_TIMEOUT_SECS: u64 = 300;

/// Coordinator candidates tried before a mixing session gives up.
pub const MAX_COORDINATOR_RETRIES: usize = 3;

/// Broadcast attempts for a spend before the mint is restored to spendable.
pub const BROADCAST_MAX_ATTEMPTS: u32 = 4;

/// Smallest anonymity set a spend proof will ever be built against.
pub const MIN_ANONYMITY_SET: usize = 2;

pub type CoinId = [u8; 32];
pub type TxId = [u8; 32];
pub type Serial = [u8; 32];

/// Hash a byte slice with BLAKE3.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Concatenate two byte slices and hash them with BLAKE3.
pub fn hash_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(a);
    hasher.update(b);
    *hasher.finalize().as_bytes()
}

/// Compute a coin ID committing to address, value, and salt.
/// CoinID = BLAKE3(address || value_le_bytes || salt)
pub fn compute_coin_id(address: &[u8; 32], value: u64, salt: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(address);
    hasher.update(&value.to_le_bytes());
    hasher.update(salt);
    *hasher.finalize().as_bytes()
}

/// Compute the public commitment of a shielded coin.
///
/// commitment = BLAKE3("umbra.commit" || serial || trapdoor || denom_le)
///
/// The serial stays secret until spend time; the trapdoor never leaves the
/// wallet. Both must come from a CSPRNG; a reused serial makes double-spend
/// detection ambiguous for every coin sharing it.
pub fn compute_commitment(serial: &Serial, trapdoor: &[u8; 32], denom: Denomination) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"umbra.commit");
    hasher.update(serial);
    hasher.update(trapdoor);
    hasher.update(&denom.amount().to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Short display: first 8 hex chars + "…" + last 4 hex chars.
pub fn short_hex(bytes: &[u8; 32]) -> String {
    let h = hex::encode(bytes);
    format!("{}…{}", &h[..8], &h[60..])
}

/// Current wall-clock time, seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

// ── Value-bearing data structures ───────────────────────────────────────────

/// A cleartext output created by a transaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OutputData {
    pub address: [u8; 32],
    pub value: u64,
    pub salt: [u8; 32],
}

impl OutputData {
    pub fn coin_id(&self) -> CoinId {
        compute_coin_id(&self.address, self.value, &self.salt)
    }
}

/// One participant's contribution to a mixing transaction, as seen by the
/// coordinator and by every other participant during self-verification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MixInput {
    pub coin_id: CoinId,
    pub owner_pk: [u8; 32],
    pub value: u64,
}

/// The proof object carried by a shielded spend.
///
/// Binds a revealed serial to *some* commitment among `members`, all of which
/// must exist in the accumulator snapshot identified by `checkpoint_root`.
/// Construction and verification live in `shielded::spend`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpendProof {
    pub serial: Serial,
    pub denomination: Denomination,
    pub checkpoint_root: [u8; 32],
    /// Anonymity set: the real commitment plus decoys, in shuffled order.
    pub members: Vec<[u8; 32]>,
    /// One ring element per member.
    pub ring: Vec<[u8; 32]>,
    /// Fold of the context and every (member, ring) pair; ties the proof to
    /// this serial, snapshot, and output set.
    pub binding: [u8; 32],
}

// ── Transaction ─────────────────────────────────────────────────────────────

/// Transactions submitted to the consensus oracle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Transaction {
    /// Ordinary denominated transfer.
    Plain {
        inputs: Vec<MixInput>,
        outputs: Vec<OutputData>,
        signatures: Vec<Vec<u8>>,
    },
    /// Consumes plain coins and creates shielded commitments. Leftover value
    /// returns as ordinary change.
    Mint {
        inputs: Vec<MixInput>,
        commitments: Vec<([u8; 32], Denomination)>,
        change: Vec<OutputData>,
        signatures: Vec<Vec<u8>>,
    },
    /// Redeems a shielded commitment via a membership proof.
    Spend {
        proof: SpendProof,
        outputs: Vec<OutputData>,
        /// Change that stays shielded: commitments re-minted in this tx.
        reminted: Vec<([u8; 32], Denomination)>,
    },
    /// Joint denomination-uniform mixing transaction.
    Mix {
        inputs: Vec<MixInput>,
        outputs: Vec<OutputData>,
        signatures: Vec<Vec<u8>>,
    },
}

impl Transaction {
    /// Content-derived transaction ID.
    pub fn txid(&self) -> TxId {
        let bytes = bincode::serialize(self).unwrap_or_default();
        hash(&bytes)
    }

    /// The serial revealed by this transaction, if it is a shielded spend.
    pub fn revealed_serial(&self) -> Option<Serial> {
        match self {
            Transaction::Spend { proof, .. } => Some(proof.serial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_deterministic() {
        assert_eq!(hash(b"umbra"), hash(b"umbra"));
        assert_ne!(hash(b"umbra"), hash(b"arbmu"));
    }

    #[test]
    fn hash_concat_not_commutative() {
        assert_ne!(hash_concat(b"a", b"b"), hash_concat(b"b", b"a"));
    }

    #[test]
    fn coin_id_commits_to_all_fields() {
        let base = compute_coin_id(&[1; 32], 500, &[2; 32]);
        assert_ne!(base, compute_coin_id(&[3; 32], 500, &[2; 32]));
        assert_ne!(base, compute_coin_id(&[1; 32], 501, &[2; 32]));
        assert_ne!(base, compute_coin_id(&[1; 32], 500, &[4; 32]));
    }

    #[test]
    fn commitment_differs_per_denomination() {
        let serial = [7u8; 32];
        let trapdoor = [9u8; 32];
        assert_ne!(
            compute_commitment(&serial, &trapdoor, Denomination::Ten),
            compute_commitment(&serial, &trapdoor, Denomination::Fifty),
        );
    }

    #[test]
    fn commitment_hides_serial() {
        let c1 = compute_commitment(&[1; 32], &[2; 32], Denomination::One);
        let c2 = compute_commitment(&[3; 32], &[2; 32], Denomination::One);
        assert_ne!(c1, c2);
    }

    #[test]
    fn txid_stable() {
        let tx = Transaction::Plain {
            inputs: vec![],
            outputs: vec![],
            signatures: vec![],
        };
        assert_eq!(tx.txid(), tx.txid());
    }

    #[test]
    fn short_hex_format() {
        let s = short_hex(&[0xab; 32]);
        assert_eq!(s, "abababab…abab");
    }
}
