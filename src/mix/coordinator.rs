//! Coordinator-facing message shapes, the channel transport link, the
//! coordinator directory, and an in-process coordinator model.
//!
//! The coordinator is peer-operated and never trusted: the client validates
//! every proposal independently ([`crate::mix::session::verify_merged`]).
//! The in-process model exists so the daemon and the test suites can run a
//! full pool without a network; its [`CoordinatorBehavior`] knobs simulate
//! the hostile coordinators the client must survive.

use crate::chain::ChainOracle;
use crate::core::denom::Denomination;
use crate::core::types::{short_hex, unix_now, MixInput, OutputData, Transaction};
use crate::errors::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stale sessions are garbage collected after this many seconds.
const COORD_SESSION_TIMEOUT: u64 = 300;

/// Maximum concurrent sessions one coordinator will host.
const MAX_COORD_SESSIONS: usize = 16;

// ── Wire messages ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Ask to join (or open) a pool for a denomination.
    PoolRequest {
        nonce: [u8; 32],
        denomination: Denomination,
        target_participants: usize,
        input: MixInput,
        output: OutputData,
        collateral: MixInput,
    },
    /// Signatures for our inputs, indexed into the canonical input order.
    PartialSignatures {
        session_id: [u8; 32],
        signatures: Vec<(usize, Vec<u8>)>,
    },
    /// Withdraw from a session.
    Leave { session_id: [u8; 32] },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinatorMessage {
    Accepted {
        nonce: [u8; 32],
        session_id: [u8; 32],
    },
    QueueStatus {
        session_id: [u8; 32],
        have: usize,
        need: usize,
    },
    Merged {
        session_id: [u8; 32],
        proposal: MergedProposal,
    },
    Finalized {
        session_id: [u8; 32],
        txid: [u8; 32],
    },
    Rejected {
        nonce: [u8; 32],
        reason: String,
    },
}

/// The joint unsigned transaction every participant verifies and signs.
///
/// Canonical form: mix inputs sorted by coin id, collaterals after them
/// (also sorted), outputs sorted by coin id. Everyone derives the same
/// signing digest independently.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergedProposal {
    pub session_id: [u8; 32],
    pub inputs: Vec<MixInput>,
    pub collaterals: Vec<MixInput>,
    pub outputs: Vec<OutputData>,
}

impl MergedProposal {
    /// The message each participant signs.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"umbra.mix.proposal");
        for i in self.inputs.iter().chain(self.collaterals.iter()) {
            hasher.update(&i.coin_id);
        }
        for o in &self.outputs {
            hasher.update(&o.coin_id());
        }
        *hasher.finalize().as_bytes()
    }

    /// Inputs in canonical signing order.
    pub fn canonical_inputs(&self) -> Vec<MixInput> {
        let mut all = self.inputs.clone();
        all.extend(self.collaterals.iter().cloned());
        all
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

/// A reliable point-to-point channel to one coordinator.
pub struct CoordinatorLink {
    pub tx: mpsc::UnboundedSender<ClientMessage>,
    pub rx: mpsc::UnboundedReceiver<CoordinatorMessage>,
}

/// Opens links to one coordinator endpoint.
pub trait CoordinatorConnector: Send + Sync {
    fn connect(&self) -> Result<CoordinatorLink>;
}

/// Round-robin rotation over the known coordinator endpoints.
pub struct CoordinatorDirectory {
    connectors: Vec<Arc<dyn CoordinatorConnector>>,
    cursor: AtomicUsize,
}

impl CoordinatorDirectory {
    pub fn new(connectors: Vec<Arc<dyn CoordinatorConnector>>) -> Self {
        Self { connectors, cursor: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Next candidate under rotation.
    pub fn next(&self) -> Option<Arc<dyn CoordinatorConnector>> {
        if self.connectors.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.connectors.len();
        Some(self.connectors[idx].clone())
    }
}

// ── In-process coordinator model ────────────────────────────────────────────

/// Misbehavior knobs for exercising the client's defenses.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoordinatorBehavior {
    /// Never answer anything (unresponsive peer).
    pub silent: bool,
    /// Redirect every pool output to the coordinator's own address before
    /// sending the proposal.
    pub tamper_outputs: bool,
}

type Reply = mpsc::UnboundedSender<CoordinatorMessage>;

struct PoolEntry {
    nonce: [u8; 32],
    input: MixInput,
    output: OutputData,
    collateral: MixInput,
    reply: Reply,
}

enum PoolPhase {
    Collecting,
    Signing,
    Complete,
}

struct Pool {
    denomination: Denomination,
    target: usize,
    phase: PoolPhase,
    entries: Vec<PoolEntry>,
    proposal: Option<MergedProposal>,
    signatures: HashMap<usize, Vec<u8>>,
    created_at: u64,
}

/// One coordinator instance servicing channel links.
pub struct Coordinator {
    cmd_tx: mpsc::UnboundedSender<(Reply, ClientMessage)>,
}

impl Coordinator {
    /// Spawn the coordinator event loop. The returned handle is cheap to
    /// clone into connectors.
    pub fn spawn(oracle: Arc<dyn ChainOracle>, behavior: CoordinatorBehavior) -> Arc<Self> {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<(Reply, ClientMessage)>();

        tokio::spawn(async move {
            let mut core = CoordinatorCore {
                pools: HashMap::new(),
                oracle,
                behavior,
            };
            let mut gc = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some((reply, msg)) = cmd else { break };
                        core.handle(reply, msg);
                    }
                    _ = gc.tick() => core.sweep(),
                }
            }
        });

        Arc::new(Self { cmd_tx })
    }
}

impl CoordinatorConnector for Coordinator {
    fn connect(&self) -> Result<CoordinatorLink> {
        let (to_coord_tx, mut to_coord_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<CoordinatorMessage>();
        let cmd_tx = self.cmd_tx.clone();
        if cmd_tx.is_closed() {
            return Err(WalletError::PeerUnavailable);
        }
        tokio::spawn(async move {
            while let Some(msg) = to_coord_rx.recv().await {
                if cmd_tx.send((to_client_tx.clone(), msg)).is_err() {
                    break;
                }
            }
        });
        Ok(CoordinatorLink { tx: to_coord_tx, rx: to_client_rx })
    }
}

struct CoordinatorCore {
    pools: HashMap<[u8; 32], Pool>,
    oracle: Arc<dyn ChainOracle>,
    behavior: CoordinatorBehavior,
}

impl CoordinatorCore {
    fn handle(&mut self, reply: Reply, msg: ClientMessage) {
        if self.behavior.silent {
            return;
        }
        match msg {
            ClientMessage::PoolRequest {
                nonce,
                denomination,
                target_participants,
                input,
                output,
                collateral,
            } => self.register(reply, nonce, denomination, target_participants, input, output, collateral),
            ClientMessage::PartialSignatures { session_id, signatures } => {
                self.add_signatures(session_id, signatures);
            }
            ClientMessage::Leave { session_id } => {
                if let Some(pool) = self.pools.get_mut(&session_id) {
                    if matches!(pool.phase, PoolPhase::Collecting) {
                        pool.entries.retain(|e| !e.reply.same_channel(&reply));
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        reply: Reply,
        nonce: [u8; 32],
        denomination: Denomination,
        target: usize,
        input: MixInput,
        output: OutputData,
        collateral: MixInput,
    ) {
        // Basic sanity before admitting: exact denomination on both sides,
        // smallest-bucket collateral, no duplicate coins across pools.
        if input.value != denomination.amount()
            || output.value != denomination.amount()
            || collateral.value != Denomination::smallest().amount()
        {
            let _ = reply.send(CoordinatorMessage::Rejected {
                nonce,
                reason: "denomination mismatch".into(),
            });
            return;
        }
        let duplicate = self.pools.values().any(|p| {
            p.entries
                .iter()
                .any(|e| e.input.coin_id == input.coin_id || e.collateral.coin_id == collateral.coin_id)
        });
        if duplicate {
            let _ = reply.send(CoordinatorMessage::Rejected {
                nonce,
                reason: "coin already pooled".into(),
            });
            return;
        }

        // Join an open pool for this denomination and target, or open one.
        let session_id = self
            .pools
            .iter()
            .find(|(_, p)| {
                matches!(p.phase, PoolPhase::Collecting)
                    && p.denomination == denomination
                    && p.target == target
            })
            .map(|(id, _)| *id);

        let session_id = match session_id {
            Some(id) => id,
            None => {
                if self.pools.len() >= MAX_COORD_SESSIONS {
                    let _ = reply.send(CoordinatorMessage::Rejected {
                        nonce,
                        reason: "coordinator at session capacity".into(),
                    });
                    return;
                }
                let id: [u8; 32] = rand::random();
                self.pools.insert(id, Pool {
                    denomination,
                    target: target.max(2),
                    phase: PoolPhase::Collecting,
                    entries: Vec::new(),
                    proposal: None,
                    signatures: HashMap::new(),
                    created_at: unix_now(),
                });
                id
            }
        };

        let pool = self.pools.get_mut(&session_id).expect("pool just resolved");
        pool.entries.push(PoolEntry { nonce, input, output, collateral, reply });

        for e in &pool.entries {
            let _ = e.reply.send(CoordinatorMessage::Accepted {
                nonce: e.nonce,
                session_id,
            });
            let _ = e.reply.send(CoordinatorMessage::QueueStatus {
                session_id,
                have: pool.entries.len(),
                need: pool.target,
            });
        }

        if pool.entries.len() >= pool.target {
            Self::merge(session_id, pool, self.behavior);
        }
    }

    /// Build the canonical proposal and fan it out.
    fn merge(session_id: [u8; 32], pool: &mut Pool, behavior: CoordinatorBehavior) {
        let mut inputs: Vec<MixInput> = pool.entries.iter().map(|e| e.input.clone()).collect();
        inputs.sort_by_key(|i| i.coin_id);
        let mut collaterals: Vec<MixInput> =
            pool.entries.iter().map(|e| e.collateral.clone()).collect();
        collaterals.sort_by_key(|i| i.coin_id);
        let mut outputs: Vec<OutputData> = pool.entries.iter().map(|e| e.output.clone()).collect();
        outputs.sort_by_key(OutputData::coin_id);

        if behavior.tamper_outputs {
            for o in &mut outputs {
                o.address = [0x66; 32];
            }
        }

        let proposal = MergedProposal { session_id, inputs, collaterals, outputs };
        pool.proposal = Some(proposal.clone());
        pool.phase = PoolPhase::Signing;

        for e in &pool.entries {
            let _ = e.reply.send(CoordinatorMessage::Merged {
                session_id,
                proposal: proposal.clone(),
            });
        }
    }

    fn add_signatures(&mut self, session_id: [u8; 32], signatures: Vec<(usize, Vec<u8>)>) {
        let Some(pool) = self.pools.get_mut(&session_id) else {
            return;
        };
        if !matches!(pool.phase, PoolPhase::Signing) {
            return;
        }
        let Some(proposal) = pool.proposal.clone() else {
            return;
        };
        let input_count = proposal.inputs.len() + proposal.collaterals.len();
        for (idx, sig) in signatures {
            if idx < input_count {
                pool.signatures.insert(idx, sig);
            }
        }
        if pool.signatures.len() < input_count {
            return;
        }

        // All signatures collected: assemble and broadcast.
        let ordered: Vec<Vec<u8>> = (0..input_count)
            .map(|i| pool.signatures.get(&i).cloned().expect("count checked"))
            .collect();
        let tx = Transaction::Mix {
            inputs: proposal.canonical_inputs(),
            outputs: proposal.outputs.clone(),
            signatures: ordered,
        };
        match self.oracle.submit(&tx) {
            Ok(txid) => {
                pool.phase = PoolPhase::Complete;
                for e in &pool.entries {
                    let _ = e.reply.send(CoordinatorMessage::Finalized { session_id, txid });
                }
                tracing::info!(
                    "Mix session {} broadcast as {}",
                    short_hex(&session_id),
                    short_hex(&txid),
                );
            }
            Err(e) => {
                tracing::warn!("Mix session {} broadcast failed: {:?}", short_hex(&session_id), e);
                for entry in &pool.entries {
                    let _ = entry.reply.send(CoordinatorMessage::Rejected {
                        nonce: entry.nonce,
                        reason: "broadcast failed".into(),
                    });
                }
                self.pools.remove(&session_id);
            }
        }
    }

    /// Drop stale and completed pools.
    fn sweep(&mut self) {
        let now = unix_now();
        self.pools.retain(|id, pool| {
            let age = now.saturating_sub(pool.created_at);
            let keep = match pool.phase {
                PoolPhase::Complete => age < COORD_SESSION_TIMEOUT + 30,
                _ => age < COORD_SESSION_TIMEOUT,
            };
            if !keep {
                tracing::debug!("Sweeping mix session {}", short_hex(id));
            }
            keep
        });
    }
}
