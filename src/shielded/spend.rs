//! Shielded spend engine.
//!
//! A spend reveals a mint's serial and proves the mint's commitment sits in
//! an accumulator snapshot without pointing at it: the proof references an
//! anonymity set of decoy commitments whose size scales with the caller's
//! security level. Bigger sets cost more compute; that is the intended
//! cost/privacy trade, controlled by the caller.
//!
//! Lifecycle invariants:
//! - the local spent-serial pre-check fails fast but is not a substitute for
//!   network-level double-spend rejection;
//! - the finished transaction hits the write-ahead log *before* broadcast,
//!   so a crash between proof construction and submission resumes with the
//!   same proof instead of regenerating it;
//! - every terminal failure leaves the mint spendable again.

use crate::chain::{ChainOracle, SubmitError};
use crate::core::denom::{decompose, Denomination};
use crate::core::types::{
    compute_commitment, hash, short_hex, unix_now, OutputData, Serial, SpendProof, Transaction,
    TxId, BROADCAST_MAX_ATTEMPTS, MIN_ANONYMITY_SET,
};
use crate::errors::{Result, WalletError};
use crate::shielded::accumulator::{AccumulatorSet, AccumulatorSnapshot};
use crate::shielded::mint::MintRecord;
use crate::shielded::serials::SerialSet;
use crate::store::{InFlightOp, WalletStore};
use crate::wallet::Keybook;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Completed spend, kept for history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpendRecord {
    pub serial: Serial,
    pub denomination: Denomination,
    pub destination: [u8; 32],
    pub txid: TxId,
    pub security_level: u8,
    pub anonymity_set_size: usize,
    pub created_at: u64,
}

/// Anonymity set size for a security level, bounded by what the accumulator
/// holds. Monotone in `level`; never below [`MIN_ANONYMITY_SET`].
pub fn anonymity_set_size(level: u8, available: usize) -> usize {
    let level = usize::from(level.clamp(1, 100));
    (10 + level).min(available).max(MIN_ANONYMITY_SET)
}

fn outputs_digest(outputs: &[OutputData], reminted: &[([u8; 32], Denomination)]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for o in outputs {
        hasher.update(&o.coin_id());
    }
    for (c, d) in reminted {
        hasher.update(c);
        hasher.update(&d.amount().to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

fn spend_context(root: &[u8; 32], serial: &Serial, denom: Denomination, digest: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"umbra.spend.ctx");
    hasher.update(root);
    hasher.update(serial);
    hasher.update(&denom.amount().to_le_bytes());
    hasher.update(digest);
    *hasher.finalize().as_bytes()
}

fn fold_binding(ctx: &[u8; 32], members: &[[u8; 32]], ring: &[[u8; 32]]) -> [u8; 32] {
    let mut acc = hash(ctx);
    for (member, elem) in members.iter().zip(ring.iter()) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&acc);
        hasher.update(member);
        hasher.update(elem);
        acc = *hasher.finalize().as_bytes();
    }
    acc
}

/// Build a one-of-many membership proof for `mint` against `snapshot`.
///
/// CPU-bound and allocation-heavy for large sets; callers run it on a
/// blocking thread. The snapshot is immutable, so live accumulator appends
/// do not invalidate a proof mid-construction.
pub fn build_proof(
    mint: &MintRecord,
    snapshot: &AccumulatorSnapshot,
    outputs: &[OutputData],
    reminted: &[([u8; 32], Denomination)],
    security_level: u8,
) -> Result<SpendProof> {
    if !snapshot.contains(&mint.commitment) {
        return Err(WalletError::AccumulatorStale);
    }
    let available = snapshot.leaf_count();
    if available < MIN_ANONYMITY_SET {
        return Err(WalletError::AnonymitySetTooSmall(available));
    }

    let set_size = anonymity_set_size(security_level, available);

    // Sample decoys: every accumulated commitment except ours is a candidate.
    let mut rng = rand::thread_rng();
    let mut decoys: Vec<[u8; 32]> = snapshot
        .leaves()
        .filter(|c| **c != mint.commitment)
        .copied()
        .collect();
    decoys.shuffle(&mut rng);
    decoys.truncate(set_size - 1);

    let mut members = decoys;
    members.push(mint.commitment);
    members.shuffle(&mut rng);
    let real_index = members
        .iter()
        .position(|c| *c == mint.commitment)
        .expect("own commitment inserted above");

    let digest = outputs_digest(outputs, reminted);
    let ctx = spend_context(&snapshot.root, &mint.serial, mint.denomination, &digest);

    let mut ring: Vec<[u8; 32]> = (0..members.len()).map(|_| rand::random()).collect();
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"umbra.spend.close");
    hasher.update(&mint.trapdoor);
    hasher.update(&ctx);
    ring[real_index] = *hasher.finalize().as_bytes();

    let binding = fold_binding(&ctx, &members, &ring);

    Ok(SpendProof {
        serial: mint.serial,
        denomination: mint.denomination,
        checkpoint_root: snapshot.root,
        members,
        ring,
        binding,
    })
}

/// Structural verification of a spend proof.
///
/// Checks everything verifiable without the secret trapdoor: the referenced
/// root is inside the checkpoint window, every member is accumulated, the
/// set is big enough and duplicate-free, and the binding ties the ring to
/// this serial, snapshot, and output set (so a proof cannot be transplanted
/// onto different outputs). The consensus layer performs its own validation
/// on top.
pub fn verify_proof(
    proof: &SpendProof,
    outputs: &[OutputData],
    reminted: &[([u8; 32], Denomination)],
    accumulator: &AccumulatorSet,
) -> Result<()> {
    if !accumulator.is_recent_root(proof.denomination, &proof.checkpoint_root) {
        return Err(WalletError::AccumulatorStale);
    }
    if proof.members.len() < MIN_ANONYMITY_SET || proof.members.len() != proof.ring.len() {
        return Err(WalletError::AnonymitySetTooSmall(proof.members.len()));
    }
    let mut seen = std::collections::HashSet::new();
    for member in &proof.members {
        if !seen.insert(member) {
            return Err(WalletError::Codec("duplicate anonymity set member".into()));
        }
        if !accumulator.contains(proof.denomination, member) {
            return Err(WalletError::AccumulatorStale);
        }
    }

    let digest = outputs_digest(outputs, reminted);
    let ctx = spend_context(&proof.checkpoint_root, &proof.serial, proof.denomination, &digest);
    if fold_binding(&ctx, &proof.members, &proof.ring) != proof.binding {
        return Err(WalletError::Codec("spend proof binding mismatch".into()));
    }
    Ok(())
}

/// What a successful spend produced.
#[derive(Clone, Debug)]
pub struct SpendOutcome {
    pub record: SpendRecord,
    /// Change re-minted as fresh shielded coins (never plain change).
    pub reminted: Vec<MintRecord>,
}

pub struct SpendEngine {
    accumulator: Arc<RwLock<AccumulatorSet>>,
    serials: Arc<dyn SerialSet>,
    keybook: Arc<RwLock<Keybook>>,
    store: Arc<WalletStore>,
    oracle: Arc<dyn ChainOracle>,
}

impl SpendEngine {
    pub fn new(
        accumulator: Arc<RwLock<AccumulatorSet>>,
        serials: Arc<dyn SerialSet>,
        keybook: Arc<RwLock<Keybook>>,
        store: Arc<WalletStore>,
        oracle: Arc<dyn ChainOracle>,
    ) -> Self {
        Self { accumulator, serials, keybook, store, oracle }
    }

    /// Spend a mature mint.
    ///
    /// `destination: None` pays a freshly generated local address, a
    /// self-payment that never reuses an address. `pay_amount` below the
    /// denomination re-mints the difference as new shielded coins.
    ///
    /// The caller must hold the per-serial lock; the engine itself only
    /// fail-fasts on the spent set.
    pub async fn spend(
        &self,
        mint: &MintRecord,
        destination: Option<[u8; 32]>,
        security_level: u8,
        pay_amount: Option<u64>,
    ) -> Result<SpendOutcome> {
        // Fail fast on a locally known spent serial.
        if mint.spent || self.serials.contains(&mint.serial)? {
            return Err(WalletError::AlreadySpent);
        }

        let pay = pay_amount.unwrap_or_else(|| mint.denomination.amount());
        if pay == 0 || pay > mint.denomination.amount() {
            return Err(WalletError::InvalidDenomination(pay));
        }

        // Self-payment to a fresh address unless an external destination is
        // given; reuse would link the spend to our other coins.
        let dest_address = match destination {
            Some(addr) => addr,
            None => self
                .keybook
                .write()
                .await
                .fresh_address(Some("shielded self-payment".into()))?,
        };

        let outputs = vec![OutputData {
            address: dest_address,
            value: pay,
            salt: rand::random(),
        }];

        // Remainder stays shielded: re-minted, never a plain change output.
        let remainder = mint.denomination.amount() - pay;
        let (remint_denoms, _dust) = decompose(remainder);
        let mut reminted_records = Vec::with_capacity(remint_denoms.len());
        let mut reminted = Vec::with_capacity(remint_denoms.len());
        for rd in remint_denoms {
            let serial: Serial = rand::random();
            let trapdoor: [u8; 32] = rand::random();
            let commitment = compute_commitment(&serial, &trapdoor, rd);
            reminted.push((commitment, rd));
            reminted_records.push(MintRecord {
                serial,
                trapdoor,
                denomination: rd,
                commitment,
                funding_txid: [0; 32], // patched once the spend txid is known
                created_at: unix_now(),
                accumulator_position: None,
                confirmed_height: None,
                spent: false,
            });
        }

        // Snapshot once; proof construction runs against the frozen view.
        let snapshot = {
            let acc = self.accumulator.read().await;
            acc.snapshot(mint.denomination, self.oracle.height())
        };

        let proof = {
            let mint = mint.clone();
            let outputs = outputs.clone();
            let reminted = reminted.clone();
            tokio::task::spawn_blocking(move || {
                build_proof(&mint, &snapshot, &outputs, &reminted, security_level)
            })
            .await
            .map_err(|e| WalletError::Codec(format!("proof task died: {}", e)))??
        };
        let set_size = proof.members.len();

        // Self-check against the live accumulator before anything durable
        // happens; a proof the validator would bounce never reaches the WAL.
        {
            let acc = self.accumulator.read().await;
            verify_proof(&proof, &outputs, &reminted, &acc)?;
        }

        let tx = Transaction::Spend {
            proof,
            outputs,
            reminted: reminted.clone(),
        };
        let planned_txid = tx.txid();
        for r in &mut reminted_records {
            r.funding_txid = planned_txid;
        }

        // Durable before visible: the re-minted records and the WAL entry go
        // down before broadcast.
        for r in &reminted_records {
            self.store.put_mint(r)?;
        }
        self.store.wal_put(&InFlightOp::SpendPrepared {
            serial: mint.serial,
            tx: tx.clone(),
        })?;

        let txid = match self.broadcast_with_backoff(&tx).await {
            Ok(txid) => txid,
            Err(e) => {
                // Terminal failure: the mint stays unspent, the speculative
                // re-mints are dropped, and the WAL entry is cleared so
                // recovery does not resubmit a rejected spend.
                for r in &reminted_records {
                    self.store.delete_mint(&r.serial)?;
                }
                self.store.wal_remove(&mint.serial)?;
                return Err(e);
            }
        };

        self.finish_spend(mint, txid, dest_address, security_level, set_size, reminted_records)
            .await
    }

    /// Resume a `SpendPrepared` WAL entry: resubmit the persisted
    /// transaction as-is. The proof is reused, never regenerated, so a crash
    /// cannot yield two distinct spend transactions for one serial.
    pub async fn resume(&self, serial: Serial, tx: Transaction) -> Result<SpendOutcome> {
        let mint = self
            .store
            .get_mint(&serial)?
            .ok_or_else(|| WalletError::Codec(format!("no mint for {}", short_hex(&serial))))?;

        let (dest_address, set_size) = match &tx {
            Transaction::Spend { proof, outputs, .. } => (
                outputs.first().map(|o| o.address).unwrap_or_default(),
                proof.members.len(),
            ),
            _ => return Err(WalletError::Codec("WAL entry is not a spend".into())),
        };

        let txid = match self.broadcast_with_backoff(&tx).await {
            Ok(txid) => txid,
            Err(e) => {
                self.store.wal_remove(&serial)?;
                return Err(e);
            }
        };

        // Re-minted records were persisted before the crash; nothing to add.
        self.finish_spend(&mint, txid, dest_address, 0, set_size, Vec::new())
            .await
    }

    async fn finish_spend(
        &self,
        mint: &MintRecord,
        txid: TxId,
        destination: [u8; 32],
        security_level: u8,
        set_size: usize,
        reminted_records: Vec<MintRecord>,
    ) -> Result<SpendOutcome> {
        // Atomic check-and-set on the local spent set. Losing the race here
        // means another path already consumed the serial.
        if !self.serials.insert_if_absent(&mint.serial)? {
            self.store.wal_remove(&mint.serial)?;
            return Err(WalletError::AlreadySpent);
        }

        let mut spent_mint = mint.clone();
        spent_mint.spent = true;
        self.store.put_mint(&spent_mint)?;

        let record = SpendRecord {
            serial: mint.serial,
            denomination: mint.denomination,
            destination,
            txid,
            security_level,
            anonymity_set_size: set_size,
            created_at: unix_now(),
        };
        self.store.put_spend(&record)?;
        self.store.wal_remove(&mint.serial)?;

        tracing::info!(
            "Spent shielded {} (serial {}, set size {})",
            mint.denomination,
            short_hex(&mint.serial),
            set_size,
        );
        Ok(SpendOutcome { record, reminted: reminted_records })
    }

    /// Broadcast with exponential backoff on transport failures. Validator
    /// rejections are terminal immediately: retrying a rejected spend could
    /// leave the wallet unsure which attempt consumed the serial.
    async fn broadcast_with_backoff(&self, tx: &Transaction) -> Result<TxId> {
        let mut delay = Duration::from_millis(250);
        for attempt in 1..=BROADCAST_MAX_ATTEMPTS {
            match self.oracle.submit(tx) {
                Ok(txid) => return Ok(txid),
                Err(SubmitError::Rejected(reason)) => {
                    return Err(WalletError::SpendRejected(reason));
                }
                Err(SubmitError::Unavailable) => {
                    if attempt == BROADCAST_MAX_ATTEMPTS {
                        break;
                    }
                    tracing::warn!(
                        "Broadcast attempt {}/{} failed, retrying in {:?}",
                        attempt,
                        BROADCAST_MAX_ATTEMPTS,
                        delay,
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(WalletError::TimedOut)
    }
}
