//! Crash recovery: the write-ahead log must resume spends with the same
//! proof and fold abandoned mix sessions back into spendable coins.

use std::sync::Arc;
use tempfile::TempDir;
use umbra::chain::{ChainOracle, SimChain};
use umbra::config::WalletConfig;
use umbra::controller::WalletStateController;
use umbra::core::denom::Denomination;
use umbra::core::types::{hash, OutputData, Transaction, MINT_MATURITY_CONFIRMATIONS};
use umbra::mix::CoordinatorDirectory;
use umbra::shielded::spend::build_proof;
use umbra::store::{InFlightOp, WalletStore};
use umbra::wallet::Keybook;

// ─── Helpers ────────────────────────────────────────────────────────────────

fn open_controller(dir: &TempDir, chain: &Arc<SimChain>) -> Arc<WalletStateController> {
    let store = WalletStore::open(dir.path().join("db")).unwrap();
    Arc::new(
        WalletStateController::new(
            WalletConfig::default(),
            store,
            Keybook::ephemeral(),
            chain.clone(),
            Arc::new(CoordinatorDirectory::new(vec![])),
        )
        .unwrap(),
    )
}

async fn fund(wallet: &Arc<WalletStateController>, chain: &Arc<SimChain>, denoms: &[Denomination]) {
    for denom in denoms {
        let address = wallet.fresh_address(None).await.unwrap();
        let output = OutputData {
            address,
            value: denom.amount(),
            salt: rand::random(),
        };
        wallet.observe_incoming(&output).await.unwrap();
    }
    chain.advance_blocks(1);
    wallet.on_block(chain.height()).await.unwrap();
}

// ─── P4: spend resumes with the same proof ──────────────────────────────────

#[tokio::test]
async fn persisted_spend_resumes_without_regenerating() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(SimChain::new());

    // Phase 1: prepare a spend up to (but not including) broadcast, then
    // "crash" by dropping the wallet.
    let (serial, planned_txid) = {
        let wallet = open_controller(&dir, &chain);
        fund(&wallet, &chain, &[Denomination::Fifty, Denomination::One]).await;

        for i in 0..30u64 {
            wallet
                .observe_commitment(Denomination::Fifty, hash(&(0xA000 + i).to_le_bytes()))
                .await;
        }

        let mint = wallet.mint(Denomination::Fifty).await.unwrap();
        chain.advance_blocks(MINT_MATURITY_CONFIRMATIONS + 1);
        wallet.on_block(chain.height()).await.unwrap();

        let snapshot = wallet
            .accumulator()
            .read()
            .await
            .snapshot(Denomination::Fifty, chain.height());
        let outputs = vec![OutputData {
            address: hash(b"payout"),
            value: Denomination::Fifty.amount(),
            salt: [7; 32],
        }];
        let proof = build_proof(&mint, &snapshot, &outputs, &[], 40).unwrap();
        let tx = Transaction::Spend { proof, outputs, reminted: vec![] };
        let planned_txid = tx.txid();

        wallet
            .store()
            .wal_put(&InFlightOp::SpendPrepared { serial: mint.serial, tx })
            .unwrap();

        (mint.serial, planned_txid)
        // wallet (and its sled handles) dropped here: the crash point is
        // after the proof hit the WAL, before any broadcast.
    };
    assert_eq!(chain.spends_of_serial(&serial), 0);

    // Phase 2: restart and recover.
    let wallet = open_controller(&dir, &chain);
    wallet.recover().await.unwrap();

    // Exactly the persisted transaction was broadcast, once.
    assert_eq!(chain.spends_of_serial(&serial), 1);
    assert_eq!(chain.confirmations(&planned_txid), 1);
    assert!(wallet.store().wal_entries().unwrap().is_empty());

    let mint = wallet.store().get_mint(&serial).unwrap().unwrap();
    assert!(mint.spent);

    // Replaying recovery must not produce a second spend transaction.
    wallet.recover().await.unwrap();
    assert_eq!(chain.spends_of_serial(&serial), 1);
}

#[tokio::test]
async fn resumed_spend_rejected_leaves_mint_unspent() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(SimChain::new());

    let serial = {
        let wallet = open_controller(&dir, &chain);
        fund(&wallet, &chain, &[Denomination::Ten, Denomination::One]).await;
        for i in 0..20u64 {
            wallet
                .observe_commitment(Denomination::Ten, hash(&(0xB000 + i).to_le_bytes()))
                .await;
        }

        let mint = wallet.mint(Denomination::Ten).await.unwrap();
        chain.advance_blocks(MINT_MATURITY_CONFIRMATIONS + 1);
        wallet.on_block(chain.height()).await.unwrap();

        let snapshot = wallet
            .accumulator()
            .read()
            .await
            .snapshot(Denomination::Ten, chain.height());
        let outputs = vec![OutputData {
            address: hash(b"payout"),
            value: Denomination::Ten.amount(),
            salt: [8; 32],
        }];
        let proof = build_proof(&mint, &snapshot, &outputs, &[], 40).unwrap();
        let tx = Transaction::Spend { proof, outputs, reminted: vec![] };
        wallet
            .store()
            .wal_put(&InFlightOp::SpendPrepared { serial: mint.serial, tx })
            .unwrap();
        mint.serial
    };

    // Someone else spends the serial on chain while we are down.
    let foreign = Transaction::Spend {
        proof: umbra::core::types::SpendProof {
            serial,
            denomination: Denomination::Ten,
            checkpoint_root: [0; 32],
            members: vec![],
            ring: vec![],
            binding: [0; 32],
        },
        outputs: vec![OutputData {
            address: hash(b"thief"),
            value: Denomination::Ten.amount(),
            salt: [9; 32],
        }],
        reminted: vec![],
    };
    chain.submit(&foreign).unwrap();

    let wallet = open_controller(&dir, &chain);
    wallet.recover().await.unwrap();

    // The resubmission was rejected: WAL cleared, mint still locally
    // unspent so the user can retry with a refreshed snapshot.
    assert!(wallet.store().wal_entries().unwrap().is_empty());
    let mint = wallet.store().get_mint(&serial).unwrap().unwrap();
    assert!(!mint.spent);
}

// ─── Mix sessions with no confirmed broadcast time out on restart ───────────

#[tokio::test]
async fn unfinished_mix_session_releases_coins_on_restart() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(SimChain::new());

    let reserved = {
        let wallet = open_controller(&dir, &chain);
        fund(&wallet, &chain, &[Denomination::Ten, Denomination::One]).await;

        let coins: Vec<_> = wallet
            .store()
            .load_coins()
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        wallet
            .store()
            .wal_put(&InFlightOp::MixPending {
                session_nonce: hash(b"interrupted mix"),
                reserved: coins.clone(),
            })
            .unwrap();
        coins
    };

    let wallet = open_controller(&dir, &chain);
    wallet.recover().await.unwrap();

    assert!(wallet.store().wal_entries().unwrap().is_empty());

    // Both coins are spendable again: a fresh mixing reservation succeeds.
    let status = wallet.status().await.unwrap();
    assert_eq!(
        status.balances.available,
        Denomination::Ten.amount() + Denomination::One.amount()
    );
    assert_eq!(reserved.len(), 2);
}
