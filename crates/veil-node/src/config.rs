//! Node configuration: CLI flag, then `VEIL_*` environment variable, then default.
//! The log filter also falls back to `RUST_LOG` before its default.

use std::env;
use std::path::PathBuf;

use clap::Args;
use veil_core::DEFAULT_MAX_REORG_DEPTH;

/// Default mempool capacity.
pub const DEFAULT_MEMPOOL_MAX_TXS: usize = 5000;

/// Engine tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Deepest reorg the engine can undo without a wallet rescan.
    pub max_reorg_depth: u32,
    /// Mempool capacity.
    pub mempool_max_txs: usize,
}

impl EngineConfig {
    /// Per-note witness snapshots kept by wallets: one per undoable block plus the tip.
    pub fn witness_cache_size(&self) -> u32 {
        self.max_reorg_depth.saturating_add(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            mempool_max_txs: DEFAULT_MEMPOOL_MAX_TXS,
        }
    }
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Default, Clone)]
pub struct NodeArgs {
    /// Path to the chain store (sled)
    #[arg(long = "db", global = true)]
    pub db: Option<PathBuf>,
    /// Path to the node wallet (sled)
    #[arg(long = "wallet-db", global = true)]
    pub wallet_db: Option<PathBuf>,
    /// Deepest reorg handled without a rescan
    #[arg(long = "reorg-depth", global = true)]
    pub reorg_depth: Option<u32>,
    /// Mempool capacity in transactions
    #[arg(long = "mempool-max", global = true)]
    pub mempool_max: Option<usize>,
    /// Log filter, e.g. `info` or `veil_state=debug`
    #[arg(long = "log", global = true)]
    pub log: Option<String>,
}

/// Fully resolved node configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedConfig {
    /// Chain store location.
    pub db_path: PathBuf,
    /// Wallet store location.
    pub wallet_db_path: PathBuf,
    /// Log filter directive. `RUST_LOG` only applies when neither
    /// `--log` nor `VEIL_LOG` is set.
    pub log: String,
    /// Engine tuning.
    pub engine: EngineConfig,
}

/// Resolve `cli` against the process environment.
pub fn resolve_config(cli: NodeArgs) -> ResolvedConfig {
    resolve_with(cli, |key| env::var(key).ok())
}

/// Resolve `cli` against `lookup` for environment variables.
pub fn resolve_with(cli: NodeArgs, lookup: impl Fn(&str) -> Option<String>) -> ResolvedConfig {
    let db_path = cli
        .db
        .or_else(|| lookup("VEIL_DB").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("veil.chain.db"));

    let wallet_db_path = cli
        .wallet_db
        .or_else(|| lookup("VEIL_WALLET_DB").map(PathBuf::from))
        .unwrap_or_else(|| {
            let mut p = db_path.clone();
            p.set_extension("wallet.db");
            p
        });

    let max_reorg_depth = cli
        .reorg_depth
        .or_else(|| lookup("VEIL_REORG_DEPTH").and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_MAX_REORG_DEPTH);

    let mempool_max_txs = cli
        .mempool_max
        .or_else(|| lookup("VEIL_MEMPOOL_MAX").and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_MEMPOOL_MAX_TXS);

    let log = cli
        .log
        .or_else(|| lookup("VEIL_LOG"))
        .or_else(|| lookup("RUST_LOG"))
        .unwrap_or_else(|| "info".to_string());

    ResolvedConfig {
        db_path,
        wallet_db_path,
        log,
        engine: EngineConfig {
            max_reorg_depth,
            mempool_max_txs,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_flags_or_env() {
        let cfg = resolve_with(NodeArgs::default(), |_| None);
        assert_eq!(cfg.db_path, PathBuf::from("veil.chain.db"));
        assert_eq!(cfg.wallet_db_path, PathBuf::from("veil.chain.wallet.db"));
        assert_eq!(cfg.engine, EngineConfig::default());
        assert_eq!(cfg.engine.witness_cache_size(), 101);
        assert_eq!(cfg.log, "info");
    }

    #[test]
    fn cli_beats_env_beats_default() {
        let cli = NodeArgs {
            reorg_depth: Some(7),
            ..NodeArgs::default()
        };
        let cfg = resolve_with(cli, |key| match key {
            "VEIL_REORG_DEPTH" => Some("50".into()),
            "VEIL_MEMPOOL_MAX" => Some("12".into()),
            "VEIL_DB" => Some("/tmp/chain".into()),
            _ => None,
        });
        assert_eq!(cfg.engine.max_reorg_depth, 7);
        assert_eq!(cfg.engine.mempool_max_txs, 12);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/chain"));
    }

    #[test]
    fn log_flag_beats_both_env_filters() {
        let env = |key: &str| match key {
            "VEIL_LOG" => Some("warn".to_string()),
            "RUST_LOG" => Some("trace".to_string()),
            _ => None,
        };
        let cli = NodeArgs {
            log: Some("veil_state=debug".into()),
            ..NodeArgs::default()
        };
        assert_eq!(resolve_with(cli, env).log, "veil_state=debug");
        assert_eq!(resolve_with(NodeArgs::default(), env).log, "warn");

        let cfg = resolve_with(NodeArgs::default(), |key| {
            (key == "RUST_LOG").then(|| "error".to_string())
        });
        assert_eq!(cfg.log, "error");
    }

    #[test]
    fn unparsable_env_falls_back() {
        let cfg = resolve_with(NodeArgs::default(), |key| {
            (key == "VEIL_MEMPOOL_MAX").then(|| "lots".to_string())
        });
        assert_eq!(cfg.engine.mempool_max_txs, DEFAULT_MEMPOOL_MAX_TXS);
    }
}
