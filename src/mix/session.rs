//! Client-side mixing session state and proposal self-verification.
//!
//! The coordinator is an untrusted external actor: everything it returns is
//! validated before the wallet signs anything. A proposal missing our exact
//! input or output, or carrying a modified copy of either, is treated as
//! tampering and aborts the session.

use crate::core::denom::Denomination;
use crate::core::types::{unix_now, MixInput, OutputData};
use crate::errors::{Result, WalletError};
use crate::mix::coordinator::MergedProposal;
use serde::{Deserialize, Serialize};

/// User-facing privacy level, mapped to the participant count the pool must
/// reach before merging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyLevel {
    Low,
    Medium,
    High,
}

impl PrivacyLevel {
    pub fn participant_target(self) -> usize {
        match self {
            PrivacyLevel::Low => 2,
            PrivacyLevel::Medium => 8,
            PrivacyLevel::High => 16,
        }
    }
}

/// Session phases. `Failed` and `TimedOut` are reachable from every
/// non-terminal phase; both release the session's reservations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixPhase {
    Idle,
    Queued,
    Pooled,
    Signed,
    Broadcast,
    Failed(String),
    TimedOut,
}

impl MixPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MixPhase::Broadcast | MixPhase::Failed(_) | MixPhase::TimedOut)
    }
}

/// One anonymization attempt.
#[derive(Clone, Debug)]
pub struct ClientSession {
    pub denomination: Denomination,
    pub privacy: PrivacyLevel,
    /// Fresh per attempt; a retried session never reuses it, so stale
    /// coordinator replies cannot be confused with the current attempt.
    pub nonce: [u8; 32],
    /// Assigned by the coordinator once the pool request is accepted.
    pub session_id: Option<[u8; 32]>,
    pub phase: MixPhase,
    /// Pool fill reported by the last queue status.
    pub queue_have: usize,
    pub queue_need: usize,
    pub created_at: u64,
}

impl ClientSession {
    pub fn new(denomination: Denomination, privacy: PrivacyLevel) -> Self {
        Self {
            denomination,
            privacy,
            nonce: rand::random(),
            session_id: None,
            phase: MixPhase::Idle,
            queue_have: 0,
            queue_need: privacy.participant_target(),
            created_at: unix_now(),
        }
    }

    /// Start a fresh attempt: new nonce, coordinator assignment cleared.
    pub fn rearm(&mut self) {
        self.nonce = rand::random();
        self.session_id = None;
        self.phase = MixPhase::Idle;
    }

    /// Move to `next`, enforcing the legal transition graph.
    pub fn advance(&mut self, next: MixPhase) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(WalletError::Codec(format!(
                "illegal transition from terminal phase {:?}",
                self.phase
            )));
        }
        let ok = match (&self.phase, &next) {
            (_, MixPhase::Failed(_)) | (_, MixPhase::TimedOut) => true,
            (MixPhase::Idle, MixPhase::Queued)
            | (MixPhase::Queued, MixPhase::Pooled)
            | (MixPhase::Pooled, MixPhase::Signed)
            | (MixPhase::Signed, MixPhase::Broadcast) => true,
            _ => false,
        };
        if !ok {
            return Err(WalletError::Codec(format!(
                "illegal transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }
}

/// Indices of our contributions in a verified proposal's canonical input
/// order (mix inputs first, then collaterals).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnIndices {
    pub input: usize,
    pub collateral: usize,
}

/// Verify a coordinator-returned proposal before signing.
///
/// Confirms that exactly our input, collateral, and output are present and
/// byte-identical to what we submitted, that the pool is denomination-uniform
/// and duplicate-free, and that there is one output per mix input.
pub fn verify_merged(
    proposal: &MergedProposal,
    denomination: Denomination,
    own_input: &MixInput,
    own_collateral: &MixInput,
    own_output: &OutputData,
) -> Result<OwnIndices> {
    let tampered = |what: &str| Err(WalletError::ProposalTampered(what.to_string()));

    let own_count = proposal
        .inputs
        .iter()
        .filter(|i| i.coin_id == own_input.coin_id)
        .count();
    if own_count != 1 {
        return tampered("own input missing or duplicated");
    }
    let input_index = proposal
        .inputs
        .iter()
        .position(|i| i == own_input)
        .ok_or_else(|| WalletError::ProposalTampered("own input modified".into()))?;

    let collateral_pos = proposal
        .collaterals
        .iter()
        .position(|c| c == own_collateral)
        .ok_or_else(|| {
            WalletError::ProposalTampered("own collateral missing or modified".into())
        })?;

    if !proposal.outputs.contains(own_output) {
        return tampered("own output missing or modified");
    }

    // Denomination uniformity across the pool.
    if proposal
        .inputs
        .iter()
        .any(|i| i.value != denomination.amount())
    {
        return tampered("non-uniform input denomination");
    }
    if proposal
        .outputs
        .iter()
        .any(|o| o.value != denomination.amount())
    {
        return tampered("non-uniform output denomination");
    }
    if proposal.outputs.len() != proposal.inputs.len() {
        return tampered("input/output count mismatch");
    }

    // No input may appear twice anywhere in the transaction.
    let mut seen = std::collections::HashSet::new();
    for i in proposal.inputs.iter().chain(proposal.collaterals.iter()) {
        if !seen.insert(i.coin_id) {
            return tampered("duplicate input");
        }
    }

    Ok(OwnIndices {
        input: input_index,
        collateral: proposal.inputs.len() + collateral_pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::hash;

    fn input(tag: u8, value: u64) -> MixInput {
        MixInput {
            coin_id: hash(&[tag, 0]),
            owner_pk: hash(&[tag, 1]),
            value,
        }
    }

    fn output(tag: u8, value: u64) -> OutputData {
        OutputData {
            address: hash(&[tag, 2]),
            value,
            salt: hash(&[tag, 3]),
        }
    }

    fn proposal_for(denom: Denomination, me: u8, peer: u8) -> (MergedProposal, MixInput, MixInput, OutputData) {
        let own_input = input(me, denom.amount());
        let own_collateral = input(me + 100, Denomination::One.amount());
        let own_output = output(me, denom.amount());
        let proposal = MergedProposal {
            session_id: [5; 32],
            inputs: vec![own_input.clone(), input(peer, denom.amount())],
            collaterals: vec![own_collateral.clone()],
            outputs: vec![output(peer, denom.amount()), own_output.clone()],
        };
        (proposal, own_input, own_collateral, own_output)
    }

    // ── Phase transitions ───────────────────────────────────────────────

    #[test]
    fn happy_path_transitions() {
        let mut s = ClientSession::new(Denomination::Ten, PrivacyLevel::Low);
        for next in [MixPhase::Queued, MixPhase::Pooled, MixPhase::Signed, MixPhase::Broadcast] {
            s.advance(next).unwrap();
        }
        assert!(s.phase.is_terminal());
    }

    #[test]
    fn failure_reachable_from_any_non_terminal() {
        for reach in [MixPhase::Idle, MixPhase::Queued, MixPhase::Pooled, MixPhase::Signed] {
            let mut s = ClientSession::new(Denomination::Ten, PrivacyLevel::Low);
            s.phase = reach;
            s.advance(MixPhase::TimedOut).unwrap();
        }
    }

    #[test]
    fn no_skipping_phases() {
        let mut s = ClientSession::new(Denomination::Ten, PrivacyLevel::Low);
        assert!(s.advance(MixPhase::Signed).is_err());
        assert!(s.advance(MixPhase::Broadcast).is_err());
    }

    #[test]
    fn terminal_is_final() {
        let mut s = ClientSession::new(Denomination::Ten, PrivacyLevel::Low);
        s.advance(MixPhase::TimedOut).unwrap();
        assert!(s.advance(MixPhase::Queued).is_err());
        assert!(s.advance(MixPhase::Failed("x".into())).is_err());
    }

    #[test]
    fn rearm_issues_fresh_nonce() {
        let mut s = ClientSession::new(Denomination::Ten, PrivacyLevel::Low);
        let old = s.nonce;
        s.session_id = Some([1; 32]);
        s.rearm();
        assert_ne!(s.nonce, old);
        assert_eq!(s.session_id, None);
        assert_eq!(s.phase, MixPhase::Idle);
    }

    #[test]
    fn privacy_level_targets() {
        assert_eq!(PrivacyLevel::Low.participant_target(), 2);
        assert_eq!(PrivacyLevel::Medium.participant_target(), 8);
        assert_eq!(PrivacyLevel::High.participant_target(), 16);
    }

    // ── Proposal verification ───────────────────────────────────────────

    #[test]
    fn accepts_honest_proposal() {
        let (p, inp, col, out) = proposal_for(Denomination::Ten, 1, 2);
        let idx = verify_merged(&p, Denomination::Ten, &inp, &col, &out).unwrap();
        assert_eq!(idx.input, 0);
        assert_eq!(idx.collateral, 2); // after the two mix inputs
    }

    #[test]
    fn rejects_missing_own_input() {
        let (mut p, inp, col, out) = proposal_for(Denomination::Ten, 1, 2);
        p.inputs.remove(0);
        p.outputs.remove(1);
        assert!(verify_merged(&p, Denomination::Ten, &inp, &col, &out).is_err());
    }

    #[test]
    fn rejects_modified_own_input() {
        let (mut p, inp, col, out) = proposal_for(Denomination::Ten, 1, 2);
        p.inputs[0].owner_pk = hash(b"swapped key");
        let err = verify_merged(&p, Denomination::Ten, &inp, &col, &out).unwrap_err();
        assert!(matches!(err, WalletError::ProposalTampered(_)));
    }

    #[test]
    fn rejects_redirected_own_output() {
        let (mut p, inp, col, out) = proposal_for(Denomination::Ten, 1, 2);
        let pos = p.outputs.iter().position(|o| *o == out).unwrap();
        p.outputs[pos].address = hash(b"attacker");
        assert!(verify_merged(&p, Denomination::Ten, &inp, &col, &out).is_err());
    }

    #[test]
    fn rejects_non_uniform_pool() {
        let (mut p, inp, col, out) = proposal_for(Denomination::Ten, 1, 2);
        p.inputs[1].value = Denomination::Fifty.amount();
        assert!(verify_merged(&p, Denomination::Ten, &inp, &col, &out).is_err());
    }

    #[test]
    fn rejects_output_count_mismatch() {
        let (mut p, inp, col, out) = proposal_for(Denomination::Ten, 1, 2);
        p.outputs.push(output(9, Denomination::Ten.amount()));
        assert!(verify_merged(&p, Denomination::Ten, &inp, &col, &out).is_err());
    }

    #[test]
    fn rejects_duplicate_inputs() {
        let (mut p, inp, col, out) = proposal_for(Denomination::Ten, 1, 2);
        p.inputs[1] = p.inputs[0].clone();
        assert!(verify_merged(&p, Denomination::Ten, &inp, &col, &out).is_err());
    }

    #[test]
    fn rejects_missing_collateral() {
        let (mut p, inp, col, out) = proposal_for(Denomination::Ten, 1, 2);
        p.collaterals.clear();
        assert!(verify_merged(&p, Denomination::Ten, &inp, &col, &out).is_err());
    }
}
