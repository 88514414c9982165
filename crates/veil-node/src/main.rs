#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use veil_core::{Amount, ATOMS_PER_COIN};
use veil_node::{resolve_config, Engine, NodeArgs, ResolvedConfig, WalletId};
use veil_wallet::{build_shielding_tx, BalanceQuery, Memo, Wallet};

/// Most transactions a devnet block carries.
const MAX_BLOCK_TXS: usize = 1000;

#[derive(Parser, Debug)]
#[command(name = "veil-node", version)]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print tip height, anchor, shielded supply and nullifier count as JSON
    Status,
    /// Connect locally built blocks, each shielding value to the node wallet
    Devnet {
        /// Number of blocks to connect
        #[arg(long, default_value_t = 10)]
        blocks: u64,
        /// Atoms shielded per block
        #[arg(long, default_value_t = ATOMS_PER_COIN)]
        atoms: u64,
    },
    /// Print the node wallet balance
    Balance {
        /// Minimum confirmations
        #[arg(long, default_value_t = 1)]
        min_conf: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = resolve_config(cli.node);
    init_tracing(&cfg.log);

    match cli.command {
        Commands::Status => status(&cfg),
        Commands::Devnet { blocks, atoms } => devnet(&cfg, blocks, atoms),
        Commands::Balance { min_conf } => balance(&cfg, min_conf),
    }
}

fn init_tracing(directive: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .init();
}

fn open(cfg: &ResolvedConfig) -> Result<(Engine, WalletId)> {
    let engine = Engine::open(cfg.engine, &cfg.db_path)?;
    let wallet = Wallet::open(&cfg.wallet_db_path, cfg.engine.witness_cache_size())?;
    let id = engine.attach_wallet(wallet)?;
    Ok((engine, id))
}

fn status(cfg: &ResolvedConfig) -> Result<()> {
    let (engine, id) = open(cfg)?;
    let out = json!({
        "tip_height": engine.tip_height(),
        "anchor": engine.get_anchor().to_string(),
        "shielded_supply": engine.shielded_supply().to_string(),
        "nullifiers": engine.nullifier_count(),
        "mempool": engine.pending_txids().len(),
        "wallet_address": engine.default_address(id)?.map(|a| a.to_string()),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    engine.shutdown()?;
    Ok(())
}

fn devnet(cfg: &ResolvedConfig, blocks: u64, atoms: u64) -> Result<()> {
    let (engine, id) = open(cfg)?;
    let address = match engine.default_address(id)? {
        Some(a) => a,
        None => engine.new_address(id)?,
    };
    info!(%address, blocks, atoms, "devnet start");

    for _ in 0..blocks {
        let next = engine.tip_height().map_or(1, |h| h + 1);
        let memo = Memo::from_bytes(format!("devnet block {next}").as_bytes())?;
        let tx = build_shielding_tx(&address, Amount::from_atoms(atoms), memo)?;
        engine.submit(tx)?;
        let block = engine.assemble_block(engine.select_for_block(MAX_BLOCK_TXS), now_unix())?;
        let height = engine.connect_block(&block)?;
        if height != next {
            return Err(anyhow!("connected at height {height}, expected {next}"));
        }
        info!(
            height,
            anchor = %block.header.commitment_root,
            supply = %engine.shielded_supply(),
            "devnet block connected"
        );
    }
    engine.shutdown()?;

    let balance = engine.get_balance(id, &BalanceQuery::default())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "tip_height": engine.tip_height(),
            "anchor": engine.get_anchor().to_string(),
            "address": address.to_string(),
            "balance_atoms": balance.atoms(),
        }))?
    );
    Ok(())
}

fn balance(cfg: &ResolvedConfig, min_conf: u32) -> Result<()> {
    let (engine, id) = open(cfg)?;
    let query = BalanceQuery {
        min_confirmations: min_conf,
        ..BalanceQuery::default()
    };
    let amount = engine.get_balance(id, &query)?;
    println!("{}", amount.atoms());
    engine.shutdown()?;
    Ok(())
}

fn now_unix() -> u64 {
    time::OffsetDateTime::now_utc().unix_timestamp() as u64
}
