//! Shielded mint engine.
//!
//! Converts plain denominated coins into accumulator commitments. A mint is
//! not spendable until its commitment has been accumulated and the funding
//! transaction has [`MINT_MATURITY_CONFIRMATIONS`] confirmations; until
//! then it counts toward the immature balance.

use crate::chain::ChainOracle;
use crate::core::denom::{decompose, Denomination};
use crate::core::types::{
    compute_commitment, unix_now, MixInput, OutputData, Serial, Transaction, TxId,
    MINT_MATURITY_CONFIRMATIONS,
};
use crate::errors::{Result, WalletError};
use crate::ledger::{DenominationLedger, SelectionPolicy};
use crate::store::WalletStore;
use crate::wallet::Keybook;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle of a mint record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MintStatus {
    /// Funding transaction submitted, not yet confirmed.
    Pending,
    /// Confirmed and accumulated, below the maturity threshold.
    Immature,
    /// Mature: usable in a spend.
    Spendable,
    Spent,
}

/// A minted shielded coin. The serial and trapdoor are secrets; only the
/// commitment is public.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MintRecord {
    pub serial: Serial,
    pub trapdoor: [u8; 32],
    pub denomination: Denomination,
    pub commitment: [u8; 32],
    pub funding_txid: TxId,
    pub created_at: u64,
    /// Accumulator position once the commitment has been accumulated.
    pub accumulator_position: Option<u64>,
    /// Height of the funding transaction's first confirmation.
    pub confirmed_height: Option<u64>,
    pub spent: bool,
}

impl MintRecord {
    /// Status at the given chain height.
    pub fn status(&self, chain_height: u64) -> MintStatus {
        if self.spent {
            return MintStatus::Spent;
        }
        let (Some(confirmed), Some(_)) = (self.confirmed_height, self.accumulator_position) else {
            return MintStatus::Pending;
        };
        let confirmations = chain_height.saturating_sub(confirmed) + 1;
        if confirmations >= MINT_MATURITY_CONFIRMATIONS {
            MintStatus::Spendable
        } else {
            MintStatus::Immature
        }
    }
}

pub struct MintEngine {
    ledger: Arc<RwLock<DenominationLedger>>,
    keybook: Arc<RwLock<Keybook>>,
    store: Arc<WalletStore>,
    oracle: Arc<dyn ChainOracle>,
}

impl MintEngine {
    pub fn new(
        ledger: Arc<RwLock<DenominationLedger>>,
        keybook: Arc<RwLock<Keybook>>,
        store: Arc<WalletStore>,
        oracle: Arc<dyn ChainOracle>,
    ) -> Self {
        Self { ledger, keybook, store, oracle }
    }

    /// Mint a shielded coin of an exact denomination.
    ///
    /// Selects plain coins covering the face value, generates a fresh serial
    /// and trapdoor, and submits the funding transaction. Leftover input
    /// value returns as ordinary denominated change; value below one coin is
    /// absorbed as fee.
    pub async fn mint(&self, denom: Denomination) -> Result<MintRecord> {
        let now = unix_now();

        let selected = {
            let mut ledger = self.ledger.write().await;
            ledger.select_for_amount(denom.amount(), SelectionPolicy::MinimizeChange, now)?
        };

        let result = self.mint_with_inputs(denom, &selected, now).await;
        if result.is_err() {
            self.ledger.write().await.release(&selected);
        }
        result
    }

    /// Mint by raw amount; fails with `InvalidDenomination` for non-buckets.
    pub async fn mint_amount(&self, amount: u64) -> Result<MintRecord> {
        let denom =
            Denomination::from_amount(amount).ok_or(WalletError::InvalidDenomination(amount))?;
        self.mint(denom).await
    }

    async fn mint_with_inputs(
        &self,
        denom: Denomination,
        selected: &[crate::core::types::CoinId],
        now: u64,
    ) -> Result<MintRecord> {
        let (inputs, input_total) = {
            let ledger = self.ledger.read().await;
            let mut inputs = Vec::with_capacity(selected.len());
            let mut total = 0u64;
            for id in selected {
                let coin = ledger
                    .get(id)
                    .ok_or_else(|| WalletError::Codec("selected coin vanished".into()))?;
                total += coin.denomination.amount();
                inputs.push(MixInput {
                    coin_id: coin.id,
                    owner_pk: coin.owner_pk,
                    value: coin.denomination.amount(),
                });
            }
            (inputs, total)
        };

        // Serial and trapdoor must be CSPRNG output; a reused serial makes
        // double-spend detection ambiguous.
        let serial: Serial = rand::random();
        let trapdoor: [u8; 32] = rand::random();
        let commitment = compute_commitment(&serial, &trapdoor, denom);

        // Change: decompose leftover into buckets paid back to ourselves.
        let leftover = input_total - denom.amount();
        let (change_denoms, _dust) = decompose(leftover);
        let mut change = Vec::with_capacity(change_denoms.len());
        {
            let mut keybook = self.keybook.write().await;
            for cd in &change_denoms {
                let address = keybook.fresh_address(Some(format!("mint change ({})", cd)))?;
                change.push(OutputData {
                    address,
                    value: cd.amount(),
                    salt: rand::random(),
                });
            }
        }

        let tx_digest = {
            let unsigned = Transaction::Mint {
                inputs: inputs.clone(),
                commitments: vec![(commitment, denom)],
                change: change.clone(),
                signatures: vec![],
            };
            unsigned.txid()
        };

        let signatures = {
            let keybook = self.keybook.read().await;
            inputs
                .iter()
                .map(|i| keybook.sign(&i.owner_pk, &tx_digest))
                .collect::<Result<Vec<_>>>()?
        };

        let tx = Transaction::Mint {
            inputs,
            commitments: vec![(commitment, denom)],
            change: change.clone(),
            signatures,
        };

        let txid = self.oracle.submit(&tx).map_err(|e| match e {
            crate::chain::SubmitError::Rejected(reason) => WalletError::SpendRejected(reason),
            crate::chain::SubmitError::Unavailable => WalletError::PeerUnavailable,
        })?;

        // Accepted: consume the inputs, track the change as pending coins.
        {
            let mut ledger = self.ledger.write().await;
            ledger.commit(selected);
            for id in selected {
                self.store.delete_coin(id)?;
            }
            let keybook = self.keybook.read().await;
            for out in &change {
                debug_assert!(keybook.is_ours(&out.address));
                let coin = crate::ledger::LedgerCoin {
                    id: out.coin_id(),
                    denomination: Denomination::from_amount(out.value)
                        .expect("change decomposed into buckets"),
                    owner_pk: out.address,
                    confirmed_height: None,
                    reserved_until: None,
                };
                self.store.put_coin(&coin)?;
                ledger.insert(coin);
            }
        }

        let record = MintRecord {
            serial,
            trapdoor,
            denomination: denom,
            commitment,
            funding_txid: txid,
            created_at: now,
            accumulator_position: None,
            confirmed_height: None,
            spent: false,
        };
        self.store.put_mint(&record)?;

        tracing::info!(
            "Minted {} shielded ({}), funding tx {}",
            denom,
            crate::core::types::short_hex(&commitment),
            crate::core::types::short_hex(&txid),
        );
        Ok(record)
    }
}

// ── Auto-mint ───────────────────────────────────────────────────────────────

/// Explicit auto-mint configuration; never read from scattered settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoMintConfig {
    pub enabled: bool,
    /// Percentage of incoming plain funds converted, floor 10.
    pub percentage: u8,
    /// Preferred denomination for auto-minted coins.
    pub preferred: Option<Denomination>,
    /// Hold off until the budget covers one preferred-denomination coin.
    pub wait_for_preferred: bool,
}

impl Default for AutoMintConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            percentage: 10,
            preferred: None,
            wait_for_preferred: false,
        }
    }
}

/// Background policy: converts a slice of every incoming plain amount into
/// shielded denominations. Sub-bucket residue carries over to the next
/// deposit instead of being dropped.
#[derive(Clone, Debug, Default)]
pub struct AutoMinter {
    config: AutoMintConfig,
    carry: u64,
}

impl AutoMinter {
    pub fn new(config: AutoMintConfig) -> Self {
        Self { config, carry: 0 }
    }

    pub fn carry(&self) -> u64 {
        self.carry
    }

    /// Plan the denominations to mint for an incoming amount.
    pub fn plan_incoming(&mut self, incoming: u64) -> Vec<Denomination> {
        if !self.config.enabled {
            return Vec::new();
        }
        let pct = u64::from(self.config.percentage.clamp(10, 100));
        let budget = self.carry + incoming * pct / 100;

        if self.config.wait_for_preferred {
            if let Some(preferred) = self.config.preferred {
                if budget < preferred.amount() {
                    self.carry = budget;
                    return Vec::new();
                }
            }
        }

        let (parts, rem) = decompose(budget);
        self.carry = rem;
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::COIN;

    // ── MintRecord status ───────────────────────────────────────────────

    fn record() -> MintRecord {
        MintRecord {
            serial: [1; 32],
            trapdoor: [2; 32],
            denomination: Denomination::OneHundred,
            commitment: [3; 32],
            funding_txid: [4; 32],
            created_at: 0,
            accumulator_position: None,
            confirmed_height: None,
            spent: false,
        }
    }

    #[test]
    fn status_pending_until_accumulated() {
        let mut r = record();
        assert_eq!(r.status(100), MintStatus::Pending);
        r.confirmed_height = Some(10);
        // Confirmed but not accumulated: still pending.
        assert_eq!(r.status(100), MintStatus::Pending);
    }

    #[test]
    fn status_immature_below_threshold() {
        let mut r = record();
        r.confirmed_height = Some(10);
        r.accumulator_position = Some(0);
        assert_eq!(r.status(10), MintStatus::Immature);
        assert_eq!(
            r.status(10 + MINT_MATURITY_CONFIRMATIONS - 2),
            MintStatus::Immature
        );
    }

    #[test]
    fn status_spendable_at_threshold() {
        let mut r = record();
        r.confirmed_height = Some(10);
        r.accumulator_position = Some(0);
        assert_eq!(
            r.status(10 + MINT_MATURITY_CONFIRMATIONS - 1),
            MintStatus::Spendable
        );
    }

    #[test]
    fn status_spent_wins() {
        let mut r = record();
        r.confirmed_height = Some(10);
        r.accumulator_position = Some(0);
        r.spent = true;
        assert_eq!(r.status(1000), MintStatus::Spent);
    }

    // ── AutoMinter ──────────────────────────────────────────────────────

    #[test]
    fn disabled_plans_nothing() {
        let mut m = AutoMinter::new(AutoMintConfig::default());
        assert!(m.plan_incoming(1000 * COIN).is_empty());
        assert_eq!(m.carry(), 0);
    }

    #[test]
    fn percentage_floor_is_ten() {
        let mut m = AutoMinter::new(AutoMintConfig {
            enabled: true,
            percentage: 3, // below the floor; treated as 10
            preferred: None,
            wait_for_preferred: false,
        });
        let plan = m.plan_incoming(100 * COIN);
        let total: u64 = plan.iter().map(|d| d.amount()).sum();
        assert_eq!(total, 10 * COIN);
    }

    #[test]
    fn plan_decomposes_budget() {
        let mut m = AutoMinter::new(AutoMintConfig {
            enabled: true,
            percentage: 50,
            preferred: None,
            wait_for_preferred: false,
        });
        let plan = m.plan_incoming(110 * COIN);
        assert_eq!(plan, vec![Denomination::Fifty, Denomination::Five]);
        assert_eq!(m.carry(), 0);
    }

    #[test]
    fn residue_carries_over() {
        let mut m = AutoMinter::new(AutoMintConfig {
            enabled: true,
            percentage: 10,
            preferred: None,
            wait_for_preferred: false,
        });
        // 10% of 5 coins = 0.5 coin: nothing mintable, carried.
        assert!(m.plan_incoming(5 * COIN).is_empty());
        assert_eq!(m.carry(), COIN / 2);
        // Second deposit pushes the carry over one coin.
        let plan = m.plan_incoming(5 * COIN);
        assert_eq!(plan, vec![Denomination::One]);
    }

    #[test]
    fn waits_for_preferred_denomination() {
        let mut m = AutoMinter::new(AutoMintConfig {
            enabled: true,
            percentage: 100,
            preferred: Some(Denomination::Ten),
            wait_for_preferred: true,
        });
        assert!(m.plan_incoming(6 * COIN).is_empty());
        assert_eq!(m.carry(), 6 * COIN);
        let plan = m.plan_incoming(6 * COIN);
        assert_eq!(plan, vec![Denomination::Ten, Denomination::One, Denomination::One]);
    }
}
