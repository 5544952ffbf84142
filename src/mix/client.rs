//! Mixing session client.
//!
//! Drives one anonymization attempt end to end: reserves the coin and the
//! collateral, queues with a coordinator, verifies the merged proposal,
//! signs only our own inputs, and waits for the broadcast confirmation.
//! Every wait is bounded; timeout, failure, and cancellation all release
//! the reservations.

use crate::core::denom::Denomination;
use crate::core::types::{
    short_hex, unix_now, CoinId, MixInput, OutputData, POOL_TIMEOUT_SECS, MAX_COORDINATOR_RETRIES,
};
use crate::errors::{Result, WalletError};
use crate::ledger::{DenominationLedger, LedgerCoin};
use crate::mix::coordinator::{
    ClientMessage, CoordinatorDirectory, CoordinatorMessage,
};
use crate::mix::session::{verify_merged, ClientSession, MixPhase, PrivacyLevel};
use crate::store::{InFlightOp, WalletStore};
use crate::wallet::Keybook;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

/// Running or finished mixing attempt.
pub struct SessionHandle {
    pub nonce: [u8; 32],
    state: Arc<RwLock<ClientSession>>,
    cancel: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    pub async fn phase(&self) -> MixPhase {
        self.state.read().await.phase.clone()
    }

    pub async fn session(&self) -> ClientSession {
        self.state.read().await.clone()
    }

    /// Ask the driving task to abort. Reserved coins are released and the
    /// session lands in `Failed`; nothing is marked spent.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    /// Wait for the attempt to reach a terminal phase.
    pub async fn join(self) -> MixPhase {
        let _ = self.task.await;
        let phase = self.state.read().await.phase.clone();
        phase
    }
}

pub struct MixClient {
    ledger: Arc<RwLock<DenominationLedger>>,
    keybook: Arc<RwLock<Keybook>>,
    directory: Arc<CoordinatorDirectory>,
    store: Arc<WalletStore>,
    pool_timeout: Duration,
}

impl MixClient {
    pub fn new(
        ledger: Arc<RwLock<DenominationLedger>>,
        keybook: Arc<RwLock<Keybook>>,
        directory: Arc<CoordinatorDirectory>,
        store: Arc<WalletStore>,
    ) -> Self {
        Self {
            ledger,
            keybook,
            directory,
            store,
            pool_timeout: Duration::from_secs(POOL_TIMEOUT_SECS),
        }
    }

    /// Override the pooling deadline (tests use short ones).
    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = timeout;
        self
    }

    /// Start a mixing session for one coin of `denomination`.
    ///
    /// Reserves the mixed coin plus one smallest-denomination collateral
    /// coin, then drives the session in a background task.
    pub async fn start_session(
        &self,
        denomination: Denomination,
        privacy: PrivacyLevel,
    ) -> Result<SessionHandle> {
        let now = unix_now();
        let (mix_coin, collateral_coin) = {
            let mut ledger = self.ledger.write().await;
            let mix = ledger.reserve_denominated(denomination, 1, now)?;
            let collateral = match ledger.reserve_denominated(Denomination::smallest(), 1, now) {
                Ok(c) => c,
                Err(e) => {
                    ledger.release(&mix);
                    return Err(e);
                }
            };
            (mix[0], collateral[0])
        };

        let session = ClientSession::new(denomination, privacy);
        let nonce = session.nonce;

        // The WAL entry is keyed by the first nonce and survives rearms; a
        // crash at any point releases both coins on restart.
        self.store.wal_put(&InFlightOp::MixPending {
            session_nonce: nonce,
            reserved: vec![mix_coin, collateral_coin],
        })?;

        let state = Arc::new(RwLock::new(session));
        let cancel = Arc::new(Notify::new());

        let driver = SessionDriver {
            ledger: self.ledger.clone(),
            keybook: self.keybook.clone(),
            directory: self.directory.clone(),
            store: self.store.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
            pool_timeout: self.pool_timeout,
            denomination,
            mix_coin,
            collateral_coin,
            wal_key: nonce,
        };
        let task = tokio::spawn(async move { driver.run().await });

        Ok(SessionHandle { nonce, state, cancel, task })
    }
}

struct SessionDriver {
    ledger: Arc<RwLock<DenominationLedger>>,
    keybook: Arc<RwLock<Keybook>>,
    directory: Arc<CoordinatorDirectory>,
    store: Arc<WalletStore>,
    state: Arc<RwLock<ClientSession>>,
    cancel: Arc<Notify>,
    pool_timeout: Duration,
    denomination: Denomination,
    mix_coin: CoinId,
    collateral_coin: CoinId,
    /// WAL key: the first attempt's nonce, stable across rearms.
    wal_key: [u8; 32],
}

enum AttemptEnd {
    /// Terminal for the whole session; reservations already handled.
    Done,
    /// This coordinator is out; re-select and retry with a fresh nonce.
    NextCoordinator,
}

impl SessionDriver {
    async fn run(&self) {
        for attempt in 0..MAX_COORDINATOR_RETRIES {
            if attempt > 0 {
                self.state.write().await.rearm();
            }
            match self.attempt().await {
                Ok(AttemptEnd::Done) => return,
                Ok(AttemptEnd::NextCoordinator) => continue,
                Err(e) => {
                    self.fail(MixPhase::Failed(e.to_string())).await;
                    return;
                }
            }
        }
        self.fail(MixPhase::Failed(WalletError::PeerUnavailable.to_string()))
            .await;
    }

    /// One attempt against one coordinator.
    async fn attempt(&self) -> Result<AttemptEnd> {
        let Some(connector) = self.directory.next() else {
            return Err(WalletError::PeerUnavailable);
        };
        let Ok(mut link) = connector.connect() else {
            return Ok(AttemptEnd::NextCoordinator);
        };

        let (own_input, own_collateral) = {
            let ledger = self.ledger.read().await;
            let mix = ledger
                .get(&self.mix_coin)
                .ok_or_else(|| WalletError::Codec("reserved coin vanished".into()))?;
            let col = ledger
                .get(&self.collateral_coin)
                .ok_or_else(|| WalletError::Codec("reserved collateral vanished".into()))?;
            (
                MixInput {
                    coin_id: mix.id,
                    owner_pk: mix.owner_pk,
                    value: mix.denomination.amount(),
                },
                MixInput {
                    coin_id: col.id,
                    owner_pk: col.owner_pk,
                    value: col.denomination.amount(),
                },
            )
        };

        // Fresh output address per attempt; never reused.
        let own_output = {
            let mut keybook = self.keybook.write().await;
            OutputData {
                address: keybook.fresh_address(Some(format!("mix {}", self.denomination)))?,
                value: self.denomination.amount(),
                salt: rand::random(),
            }
        };

        let (nonce, target) = {
            let s = self.state.read().await;
            (s.nonce, s.privacy.participant_target())
        };

        if link
            .tx
            .send(ClientMessage::PoolRequest {
                nonce,
                denomination: self.denomination,
                target_participants: target,
                input: own_input.clone(),
                output: own_output.clone(),
                collateral: own_collateral.clone(),
            })
            .is_err()
        {
            return Ok(AttemptEnd::NextCoordinator);
        }
        self.state.write().await.advance(MixPhase::Queued)?;

        let deadline = Instant::now() + self.pool_timeout;
        let mut assigned_session: Option<[u8; 32]> = None;

        loop {
            let msg = tokio::select! {
                _ = self.cancel.notified() => {
                    if let Some(sid) = assigned_session {
                        let _ = link.tx.send(ClientMessage::Leave { session_id: sid });
                    }
                    self.fail(MixPhase::Failed("cancelled by user".into())).await;
                    return Ok(AttemptEnd::Done);
                }
                recv = tokio::time::timeout_at(deadline, link.rx.recv()) => match recv {
                    Err(_) => {
                        // Pooling deadline exceeded.
                        self.fail(MixPhase::TimedOut).await;
                        return Ok(AttemptEnd::Done);
                    }
                    Ok(None) => return Ok(AttemptEnd::NextCoordinator),
                    Ok(Some(msg)) => msg,
                },
            };

            match msg {
                CoordinatorMessage::Accepted { nonce: n, session_id } => {
                    if n != nonce {
                        tracing::warn!("Dropping acceptance for stale nonce {}", short_hex(&n));
                        continue;
                    }
                    assigned_session = Some(session_id);
                    self.state.write().await.session_id = Some(session_id);
                }
                CoordinatorMessage::QueueStatus { session_id, have, need } => {
                    if assigned_session != Some(session_id) {
                        continue;
                    }
                    {
                        let mut s = self.state.write().await;
                        s.queue_have = have;
                        s.queue_need = need;
                    }
                    // Keep the reservations alive while the pool fills; the
                    // pooling wait can outlast the reservation timeout.
                    self.ledger.write().await.extend_reservations(
                        &[self.mix_coin, self.collateral_coin],
                        unix_now(),
                    );
                }
                CoordinatorMessage::Merged { session_id, proposal } => {
                    // Replies for another (stale or foreign) session id are
                    // dropped outright: a restarted or malicious coordinator
                    // cannot splice an old proposal into this attempt.
                    if assigned_session != Some(session_id) || proposal.session_id != session_id {
                        tracing::warn!(
                            "Dropping proposal for stale session {}",
                            short_hex(&session_id)
                        );
                        continue;
                    }
                    self.state.write().await.advance(MixPhase::Pooled)?;

                    let indices = match verify_merged(
                        &proposal,
                        self.denomination,
                        &own_input,
                        &own_collateral,
                        &own_output,
                    ) {
                        Ok(idx) => idx,
                        Err(e) => {
                            // Tampered merge is fatal for the session; never
                            // retried against this coordinator.
                            self.fail(MixPhase::Failed(e.to_string())).await;
                            return Ok(AttemptEnd::Done);
                        }
                    };

                    // Sign only our own inputs, nothing else.
                    let digest = proposal.digest();
                    let keybook = self.keybook.read().await;
                    let sig_input = keybook.sign(&own_input.owner_pk, &digest)?;
                    let sig_collateral = keybook.sign(&own_collateral.owner_pk, &digest)?;
                    drop(keybook);

                    if link
                        .tx
                        .send(ClientMessage::PartialSignatures {
                            session_id,
                            signatures: vec![
                                (indices.input, sig_input),
                                (indices.collateral, sig_collateral),
                            ],
                        })
                        .is_err()
                    {
                        return Ok(AttemptEnd::NextCoordinator);
                    }
                    self.state.write().await.advance(MixPhase::Signed)?;
                }
                CoordinatorMessage::Finalized { session_id, txid } => {
                    if assigned_session != Some(session_id) {
                        continue;
                    }
                    self.complete(&own_output, txid).await?;
                    return Ok(AttemptEnd::Done);
                }
                CoordinatorMessage::Rejected { nonce: n, reason } => {
                    if n != nonce {
                        continue;
                    }
                    tracing::warn!("Coordinator rejected pool request: {}", reason);
                    return Ok(AttemptEnd::NextCoordinator);
                }
            }
        }
    }

    /// Broadcast confirmed: consume the mixed coin and collateral, track the
    /// fresh output.
    async fn complete(&self, own_output: &OutputData, txid: [u8; 32]) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.advance(MixPhase::Broadcast)?;
        }
        let spent = [self.mix_coin, self.collateral_coin];
        let mut ledger = self.ledger.write().await;
        ledger.commit(&spent);
        for id in &spent {
            self.store.delete_coin(id)?;
        }
        let fresh = LedgerCoin {
            id: own_output.coin_id(),
            denomination: self.denomination,
            owner_pk: own_output.address,
            confirmed_height: None,
            reserved_until: None,
        };
        self.store.put_coin(&fresh)?;
        ledger.insert(fresh);
        drop(ledger);

        self.store.wal_remove(&self.wal_key)?;
        tracing::info!(
            "Mix complete: {} recoined via tx {}",
            self.denomination,
            short_hex(&txid),
        );
        Ok(())
    }

    /// Terminal failure or timeout: release both reservations and clear the
    /// WAL entry. The coins are observably spendable again afterwards.
    async fn fail(&self, phase: MixPhase) {
        {
            let mut ledger = self.ledger.write().await;
            ledger.release(&[self.mix_coin, self.collateral_coin]);
        }
        let mut state = self.state.write().await;
        if !state.phase.is_terminal() {
            if let Err(e) = state.advance(phase) {
                tracing::warn!("Session phase error: {}", e);
            }
        }
        drop(state);
        if let Err(e) = self.store.wal_remove(&self.wal_key) {
            tracing::warn!("Failed to clear mix WAL entry: {}", e);
        }
    }
}
