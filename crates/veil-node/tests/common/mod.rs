#![allow(dead_code)]

use veil_core::{Amount, Transaction};
use veil_node::{Engine, EngineConfig, WalletId};
use veil_wallet::{build_shielding_tx, BalanceQuery, Memo, PaymentAddress, Wallet};

pub fn config() -> EngineConfig {
    EngineConfig {
        max_reorg_depth: 100,
        mempool_max_txs: 64,
    }
}

pub fn wallet(engine: &Engine) -> (WalletId, PaymentAddress) {
    let id = engine
        .attach_wallet(Wallet::new(engine.config().witness_cache_size()))
        .unwrap();
    let address = engine.new_address(id).unwrap();
    (id, address)
}

pub fn shield(to: &PaymentAddress, atoms: u64) -> Transaction {
    build_shielding_tx(to, Amount::from_atoms(atoms), Memo::empty()).unwrap()
}

/// Connect a block carrying `txs` and return its height.
pub fn connect(engine: &Engine, txs: Vec<Transaction>) -> u64 {
    let next = engine.tip_height().map_or(1, |h| h + 1);
    let block = engine.assemble_block(txs, next).unwrap();
    engine.connect_block(&block).unwrap()
}

/// Connect a block carrying everything pending in the mempool.
pub fn mine(engine: &Engine) -> u64 {
    connect(engine, engine.select_for_block(1000))
}

pub fn balance(engine: &Engine, id: WalletId, address: &PaymentAddress) -> u64 {
    engine
        .get_balance(
            id,
            &BalanceQuery {
                address: Some(*address),
                ..BalanceQuery::default()
            },
        )
        .unwrap()
        .atoms()
}
