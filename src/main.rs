use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use umbra::chain::{ChainOracle, SimChain};
use umbra::config::WalletConfig;
use umbra::controller::WalletStateController;
use umbra::core::denom::Denomination;
use umbra::core::types::OutputData;
use umbra::mix::{Coordinator, CoordinatorBehavior, CoordinatorDirectory};
use umbra::rpc::RpcServer;
use umbra::store::WalletStore;
use umbra::wallet::Keybook;

#[derive(Parser)]
#[command(name = "umbra")]
#[command(about = "Privacy wallet core: denomination mixing and shielded coins", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the wallet daemon (embedded chain model and coordinator).
    Daemon {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
        #[arg(long)]
        rpc_port: Option<u16>,
        /// Seconds between simulated blocks.
        #[arg(long, default_value = "5")]
        block_secs: u64,
        /// Credit this many coins of each preferred denomination at startup.
        #[arg(long, default_value = "0")]
        faucet: usize,
        /// Persistent keybook path; omit for an in-memory keybook.
        #[arg(long)]
        keybook: Option<PathBuf>,
    },

    /// Wallet status and balances.
    Status {
        #[arg(long, default_value = "8557")]
        rpc_port: u16,
    },

    /// Generate a fresh receiving address.
    Address {
        #[arg(long, default_value = "8557")]
        rpc_port: u16,
    },

    /// Mint shielded coins.
    Mint {
        #[arg(long, default_value = "8557")]
        rpc_port: u16,
        /// Denomination in whole coins (1, 5, 10, 50, 100, 500, 1000, 5000).
        #[arg(long)]
        denom: u64,
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Spend a shielded coin.
    Spend {
        #[arg(long, default_value = "8557")]
        rpc_port: u16,
        /// Serial of the mint to spend (hex). Alternative to --denom.
        #[arg(long)]
        serial: Option<String>,
        /// Spend the oldest mature mint of this denomination.
        #[arg(long)]
        denom: Option<u64>,
        /// Pay-to address (hex); omitted pays a fresh local address.
        #[arg(long)]
        to: Option<String>,
        /// Security level 1-100 (anonymity set size).
        #[arg(long)]
        security: Option<u8>,
    },

    /// Start a mixing session.
    Mix {
        #[arg(long, default_value = "8557")]
        rpc_port: u16,
        #[arg(long)]
        denom: u64,
        /// low (2 peers), medium (8), high (16).
        #[arg(long)]
        privacy: Option<String>,
    },

    /// Query a mixing session.
    MixStatus {
        #[arg(long, default_value = "8557")]
        rpc_port: u16,
        #[arg(long)]
        session: String,
    },

    /// Reset the shielded DB: abort in-flight shielded operations, discard
    /// unconfirmed records.
    ResetShielded {
        #[arg(long, default_value = "8557")]
        rpc_port: u16,
    },

    /// Rebuild shielded bookkeeping against the accumulator.
    Rescan {
        #[arg(long, default_value = "8557")]
        rpc_port: u16,
    },

    /// Shielded spend history.
    History {
        #[arg(long, default_value = "8557")]
        rpc_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "umbra=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Daemon { data_dir, rpc_port, block_secs, faucet, keybook } => {
            run_daemon(data_dir, rpc_port, block_secs, faucet, keybook).await
        }
        Command::Status { rpc_port } => get_json(rpc_port, "status").await,
        Command::Address { rpc_port } => get_json(rpc_port, "address").await,
        Command::Mint { rpc_port, denom, count } => {
            post_json(rpc_port, "mint", json!({ "denomination": denom, "count": count })).await
        }
        Command::Spend { rpc_port, serial, denom, to, security } => {
            post_json(
                rpc_port,
                "spend",
                json!({
                    "serial": serial,
                    "denomination": denom,
                    "destination": to,
                    "security_level": security,
                }),
            )
            .await
        }
        Command::Mix { rpc_port, denom, privacy } => {
            post_json(rpc_port, "mix/start", json!({ "denomination": denom, "privacy": privacy }))
                .await
        }
        Command::MixStatus { rpc_port, session } => {
            get_json(rpc_port, &format!("mix/{}", session)).await
        }
        Command::ResetShielded { rpc_port } => {
            post_json(rpc_port, "shielded/reset", json!({})).await
        }
        Command::Rescan { rpc_port } => post_json(rpc_port, "shielded/rescan", json!({})).await,
        Command::History { rpc_port } => get_json(rpc_port, "history").await,
    }
}

// ── Daemon ──────────────────────────────────────────────────────────────────

async fn run_daemon(
    data_dir: PathBuf,
    rpc_port: Option<u16>,
    block_secs: u64,
    faucet: usize,
    keybook_path: Option<PathBuf>,
) -> Result<()> {
    std::fs::create_dir_all(&data_dir)?;
    let mut config = WalletConfig::load_or_default(&data_dir.join("config.json"))?;
    if let Some(port) = rpc_port {
        config.rpc_port = port;
    }

    let keybook = match keybook_path {
        Some(path) => {
            let passphrase = rpassword::prompt_password("Keybook passphrase: ")?;
            if path.exists() {
                Keybook::open(&path, passphrase.as_bytes())?
            } else {
                Keybook::create(&path, passphrase.as_bytes())?
            }
        }
        None => {
            tracing::warn!("No --keybook given; keys will not survive a restart");
            Keybook::ephemeral()
        }
    };

    let store = WalletStore::open(data_dir.join("db"))?;
    let chain = Arc::new(SimChain::new());
    let oracle: Arc<dyn ChainOracle> = chain.clone();

    // The daemon hosts its own coordinator; remote wallets would list peer
    // endpoints here instead.
    let coordinator = Coordinator::spawn(oracle.clone(), CoordinatorBehavior::default());
    let directory = Arc::new(CoordinatorDirectory::new(vec![coordinator]));

    let port = config.rpc_port;
    let wallet = Arc::new(WalletStateController::new(
        config, store, keybook, oracle, directory,
    )?);
    wallet.recover().await?;

    if faucet > 0 {
        seed_faucet(&wallet, faucet).await?;
    }

    // Simulated block production drives confirmations and checkpoints.
    let block_wallet = wallet.clone();
    let block_chain = chain.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(block_secs.max(1)));
        loop {
            ticker.tick().await;
            block_chain.advance_blocks(1);
            let height = block_chain.height();
            match block_wallet.on_block(height).await {
                Ok(checkpoints) => {
                    for (_, cp) in checkpoints {
                        block_chain.publish_root(cp.root);
                    }
                }
                Err(e) => tracing::warn!("Block processing failed: {}", e),
            }
        }
    });

    let metrics_wallet = wallet.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            metrics_wallet.metrics().report();
        }
    });

    RpcServer::new(port).run(wallet).await
}

/// Development faucet: credit `count` coins of each preferred denomination.
async fn seed_faucet(wallet: &Arc<WalletStateController>, count: usize) -> Result<()> {
    for denom in [Denomination::One, Denomination::Ten, Denomination::OneHundred] {
        for _ in 0..count {
            let address = wallet.fresh_address(Some("faucet".into())).await?;
            let output = OutputData {
                address,
                value: denom.amount(),
                salt: rand::random(),
            };
            wallet.observe_incoming(&output).await?;
        }
    }
    tracing::info!("Faucet credited {} coins each of 1/10/100", count);
    Ok(())
}

// ── RPC client helpers ──────────────────────────────────────────────────────

fn base_url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{}/{}", port, path)
}

async fn get_json(port: u16, path: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client.get(base_url(port, path)).send().await?;
    print_response(resp).await
}

async fn post_json(port: u16, path: &str, body: serde_json::Value) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client.post(base_url(port, path)).json(&body).send().await?;
    print_response(resp).await
}

async fn print_response(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let text = resp.text().await?;
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v)?),
        Err(_) => println!("{}", text),
    }
    if !status.is_success() {
        anyhow::bail!("request failed with status {}", status);
    }
    Ok(())
}
