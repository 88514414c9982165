//! The engine: one context object owning the chain state, the mempool, the
//! attached wallets and (optionally) the chain store.
//!
//! Data flow for a connected block:
//! 1. sanity and header root check against a preview of the accumulator
//! 2. persist the block, then apply it to the chain state
//! 3. drop mined and conflicting mempool transactions
//! 4. advance every attached wallet
//!
//! Disconnects run the same stages in reverse. Everything runs under the
//! chain write lock, so readers never observe a half-applied block.
//!
//! Lock order: chain, then mempool, then the wallet list, then a wallet.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use veil_core::{
    block_header_hash, Amount, Anchor, Block, BlockHeader, CoreError, Hash32, Nullifier,
    SignedAmount, Transaction, TxId, PROTOCOL_VERSION,
};
use veil_state::{ChainState, DisconnectedBlock, Frontier, StateError};
use veil_wallet::{
    BalanceQuery, BlockSource, PaymentAddress, ReceivedNote, Recipient, Wallet, WalletError,
    WalletKey,
};

use crate::chain_store::ChainDb;
use crate::config::EngineConfig;
use crate::mempool::{Eviction, Mempool, SubmitError};

/// Index of an attached wallet.
pub type WalletId = usize;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Chain state rejected the operation.
    #[error(transparent)]
    State(#[from] StateError),

    /// A wallet rejected the operation.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// Malformed input.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The mempool refused a transaction.
    #[error(transparent)]
    Rejected(#[from] SubmitError),

    /// Chain store failure.
    #[error("storage: {0}")]
    Storage(String),

    /// No wallet with this id is attached.
    #[error("unknown wallet {0}")]
    UnknownWallet(WalletId),

    /// Disconnect requested with no block connected.
    #[error("no block to disconnect")]
    EmptyChain,

    /// A fatal error was observed earlier; the engine refuses to mutate.
    #[error("engine halted after a fatal error")]
    Halted,
}

impl EngineError {
    /// Whether the error means chain or wallet state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::State(e) | Self::Wallet(WalletError::State(e)) => e.is_fatal(),
            _ => false,
        }
    }
}

struct ChainInner {
    state: ChainState,
    blocks: BTreeMap<u64, Block>,
}

impl BlockSource for ChainInner {
    fn tip_height(&self) -> Option<u64> {
        self.state.tip_height()
    }

    fn block_at(&self, height: u64) -> Option<Block> {
        self.blocks.get(&height).cloned()
    }

    fn frontier_before(&self, height: u64) -> Result<Frontier, StateError> {
        self.state.frontier_before(height)
    }
}

/// Shielded pool consistency engine.
pub struct Engine {
    config: EngineConfig,
    chain: RwLock<ChainInner>,
    mempool: Mutex<Mempool>,
    wallets: RwLock<Vec<Arc<Mutex<Wallet>>>>,
    store: Option<ChainDb>,
    halted: AtomicBool,
}

impl Engine {
    /// In-memory engine at genesis: empty accumulator, no nullifiers, zero supply.
    pub fn new(config: EngineConfig) -> Self {
        let state = ChainState::with_max_reorg_depth(config.max_reorg_depth);
        Self::with_parts(config, state, BTreeMap::new(), None)
    }

    /// Engine backed by a chain store at `path`.
    ///
    /// Stored blocks are replayed through the connect path and every
    /// resulting anchor is checked against the stored anchor table.
    pub fn open(config: EngineConfig, path: &Path) -> Result<Self, EngineError> {
        let store = ChainDb::open(path).map_err(EngineError::Storage)?;
        let mut state = ChainState::with_max_reorg_depth(config.max_reorg_depth);
        let mut blocks = BTreeMap::new();

        for (height, block) in store.load_blocks().map_err(EngineError::Storage)? {
            let expected = state.next_height().unwrap_or(1);
            if height != expected {
                return Err(corruption(format!(
                    "stored block at height {height}, expected {expected}"
                )));
            }
            let delta = block.net_value_delta()?;
            let anchor = state
                .on_block_connected(height, &block.commitments(), &block.nullifiers(), delta)?
                .anchor;
            let stored = store.anchor_at(height).map_err(EngineError::Storage)?;
            if stored != Some(anchor) || block.header.commitment_root != anchor {
                return Err(corruption(format!(
                    "replayed anchor {anchor} at height {height} disagrees with stored {stored:?}"
                )));
            }
            blocks.insert(height, block);
        }
        let tip = store.tip().map_err(EngineError::Storage)?;
        if tip != state.tip_height() {
            return Err(corruption(format!(
                "stored tip {tip:?}, replay reached {:?}",
                state.tip_height()
            )));
        }
        info!(tip = ?tip, anchor = %state.root(), supply = %state.supply(), "chain state rebuilt");
        Ok(Self::with_parts(config, state, blocks, Some(store)))
    }

    fn with_parts(
        config: EngineConfig,
        state: ChainState,
        blocks: BTreeMap<u64, Block>,
        store: Option<ChainDb>,
    ) -> Self {
        Self {
            config,
            chain: RwLock::new(ChainInner { state, blocks }),
            mempool: Mutex::new(Mempool::new(config.mempool_max_txs)),
            wallets: RwLock::new(Vec::new()),
            store,
            halted: AtomicBool::new(false),
        }
    }

    /// Engine tuning.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flush the chain store and every wallet.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        let _chain = self.chain.read();
        if let Some(store) = &self.store {
            store.flush().map_err(EngineError::Storage)?;
        }
        for wallet in self.wallets.read().iter() {
            wallet.lock().flush()?;
        }
        info!("engine shut down");
        Ok(())
    }

    /// Whether a fatal error stopped the engine.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_halted() {
            Err(EngineError::Halted)
        } else {
            Ok(())
        }
    }

    /// Latch the halt flag if `err` is fatal, then hand it back.
    fn observe(&self, err: EngineError) -> EngineError {
        if err.is_fatal() && !self.halted.swap(true, Ordering::SeqCst) {
            error!(error = %err, "fatal error, engine halted");
        }
        err
    }

    /// Halt on any failure after block `height` already moved the chain:
    /// a wallet that missed the step can no longer follow it.
    fn fail_committed(&self, height: u64, err: EngineError) -> EngineError {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(height, error = %err, "wallet out of step with the chain, engine halted");
        }
        err
    }

    // ---------------------------------------------------------------------
    // Chain connector
    // ---------------------------------------------------------------------

    /// Connect `block` on top of the tip. Returns its height.
    ///
    /// A rejected block leaves chain, mempool and wallets untouched. An error
    /// from a wallet after the chain advanced halts the engine instead.
    pub fn connect_block(&self, block: &Block) -> Result<u64, EngineError> {
        self.ensure_running()?;
        block.validate_sanity().map_err(invalid)?;
        let commitments = block.commitments();
        let nullifiers = block.nullifiers();
        let delta = block.net_value_delta().map_err(invalid)?;

        let mut chain = self.chain.write();
        let height = chain.state.next_height().unwrap_or(1);
        let root = chain
            .state
            .preview_root(&commitments)
            .map_err(|e| self.observe(e.into()))?;
        if root != block.header.commitment_root {
            debug!(height, "commitment root mismatch");
            return Err(StateError::CommitmentRootMismatch.into());
        }
        let frontier_before = chain.state.tree().frontier().clone();

        if let Some(store) = &self.store {
            store
                .put_block(height, block, &block.header.commitment_root)
                .map_err(EngineError::Storage)?;
        }
        let applied = chain
            .state
            .on_block_connected(height, &commitments, &nullifiers, delta)
            .map(|undo| undo.anchor);
        if let Err(e) = applied {
            if let Some(store) = &self.store {
                if let Err(se) = store.remove_tip(height) {
                    error!(height, error = %se, "could not drop rejected block from store");
                    return Err(self.observe(corruption(se)));
                }
            }
            return Err(self.observe(e.into()));
        }
        chain.blocks.insert(height, block.clone());

        let evicted = self.mempool.lock().block_connected(&mut chain.state, block);
        let mut failure = None;
        for wallet in self.wallets.read().iter() {
            let mut w = wallet.lock();
            let scanned = w.block_connected(height, block, &frontier_before);
            for e in &evicted {
                w.release_pending(&e.txid);
            }
            let step = scanned.and_then(|_| w.flush());
            if let Err(e) = step {
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(self.fail_committed(height, e.into())),
            None => Ok(height),
        }
    }

    /// Disconnect the tip block.
    pub fn disconnect_tip(&self) -> Result<DisconnectedBlock, EngineError> {
        self.ensure_running()?;
        let mut chain = self.chain.write();
        let height = chain.state.tip_height().ok_or(EngineError::EmptyChain)?;

        if let Some(store) = &self.store {
            store.remove_tip(height).map_err(EngineError::Storage)?;
        }
        let disconnected = chain
            .state
            .on_block_disconnected(height)
            .map_err(|e| self.observe(e.into()))?;
        chain.blocks.remove(&height);

        let evicted = self.mempool.lock().evict_stale_anchors(&mut chain.state);
        let mut failure = None;
        for wallet in self.wallets.read().iter() {
            let mut w = wallet.lock();
            let unscanned = w.block_disconnected(height, disconnected.undo.tree_size_before);
            for e in &evicted {
                w.release_pending(&e.txid);
            }
            let step = unscanned.and_then(|()| w.flush());
            if let Err(e) = step {
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(self.fail_committed(height, e.into())),
            None => Ok(disconnected),
        }
    }

    /// Block template on top of the tip carrying `txs`, with the header root
    /// the accumulator will have after connecting it.
    pub fn assemble_block(
        &self,
        txs: Vec<Transaction>,
        timestamp: u64,
    ) -> Result<Block, EngineError> {
        let chain = self.chain.read();
        let commitments: Vec<_> = txs.iter().flat_map(|tx| tx.commitments().copied()).collect();
        let commitment_root = chain.state.preview_root(&commitments)?;
        let prev = match chain.blocks.last_key_value() {
            Some((_, tip)) => block_header_hash(&tip.header)?,
            None => Hash32::zero(),
        };
        Ok(Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                prev,
                commitment_root,
                timestamp,
            },
            txs,
        })
    }

    // ---------------------------------------------------------------------
    // Chain queries
    // ---------------------------------------------------------------------

    /// Current tip anchor.
    pub fn get_anchor(&self) -> Anchor {
        self.chain.read().state.root()
    }

    /// Anchor recorded at `height`.
    pub fn anchor_at(&self, height: u64) -> Option<Anchor> {
        self.chain.read().state.anchor_at(height)
    }

    /// Whether `anchor` is a root of the best chain.
    pub fn is_valid_anchor(&self, anchor: &Anchor) -> bool {
        self.chain.read().state.is_valid_anchor(anchor)
    }

    /// Whether `nf` is committed or claimed by a pending transaction.
    pub fn contains_nullifier(&self, nf: &Nullifier) -> bool {
        self.chain.read().state.contains_nullifier(nf)
    }

    /// Number of committed nullifiers.
    pub fn nullifier_count(&self) -> usize {
        self.chain.read().state.nullifiers().len()
    }

    /// Net value held in the shielded pool.
    pub fn shielded_supply(&self) -> SignedAmount {
        self.chain.read().state.supply()
    }

    /// Height of the tip, if any block is connected.
    pub fn tip_height(&self) -> Option<u64> {
        self.chain.read().state.tip_height()
    }

    // ---------------------------------------------------------------------
    // Mempool
    // ---------------------------------------------------------------------

    /// Submit a transaction to the mempool.
    pub fn submit(&self, tx: Transaction) -> Result<TxId, SubmitError> {
        if self.is_halted() {
            return Err(SubmitError::Halted);
        }
        let id = Mempool::check_standalone(&tx)?;
        let mut chain = self.chain.write();
        let admission = self
            .mempool
            .lock()
            .admit(&mut chain.state, id, tx)
            .map_err(|e| {
                debug!(txid = %id, reason = %e, "rejected transaction");
                e
            })?;
        if let Some(replaced) = admission.replaced {
            for wallet in self.wallets.read().iter() {
                wallet.lock().release_pending(&replaced.txid);
            }
        }
        Ok(admission.txid)
    }

    /// Whether `txid` is pending.
    pub fn mempool_contains(&self, txid: &TxId) -> bool {
        self.mempool.lock().contains(txid)
    }

    /// Ids of all pending transactions.
    pub fn pending_txids(&self) -> Vec<TxId> {
        self.mempool.lock().pending_txids()
    }

    /// Most recent mempool evictions, oldest first.
    pub fn eviction_log(&self) -> Vec<Eviction> {
        self.mempool.lock().eviction_log().copied().collect()
    }

    /// Up to `max` pending transactions, highest fee first.
    pub fn select_for_block(&self, max: usize) -> Vec<Transaction> {
        self.mempool.lock().select_for_block(max)
    }

    // ---------------------------------------------------------------------
    // Wallets
    // ---------------------------------------------------------------------

    /// Attach a wallet and bring it level with the tip.
    ///
    /// A wallet behind the tip is rescanned from the block after its scan
    /// height; a wallet ahead of the tip (its chain was rolled back while it
    /// was detached) drops its notes and rescans from the first block.
    pub fn attach_wallet(&self, mut wallet: Wallet) -> Result<WalletId, EngineError> {
        self.ensure_running()?;
        let chain = self.chain.read();
        let tip = chain.state.tip_height();
        let never = AtomicBool::new(false);

        let rescan_from = match (wallet.scanned_height(), tip) {
            (None, _) if wallet.addresses().is_empty() => {
                wallet.mark_synced(tip);
                None
            }
            (None, Some(_)) => Some(1),
            (Some(_), None) => {
                wallet.reset();
                None
            }
            (Some(scanned), Some(tip)) if scanned > tip => {
                wallet.reset();
                Some(1)
            }
            (Some(scanned), Some(tip)) if scanned < tip => Some(scanned + 1),
            _ => None,
        };
        if let Some(from) = rescan_from {
            wallet.rescan(from, &*chain, &never)?;
        }
        wallet.flush()?;

        let mut wallets = self.wallets.write();
        wallets.push(Arc::new(Mutex::new(wallet)));
        let id = wallets.len() - 1;
        info!(wallet = id, tip = ?tip, rescan_from = ?rescan_from, "wallet attached");
        Ok(id)
    }

    fn wallet(&self, id: WalletId) -> Result<Arc<Mutex<Wallet>>, EngineError> {
        self.wallets
            .read()
            .get(id)
            .cloned()
            .ok_or(EngineError::UnknownWallet(id))
    }

    /// Generate a new address in wallet `id`.
    pub fn new_address(&self, id: WalletId) -> Result<PaymentAddress, EngineError> {
        let _chain = self.chain.read();
        let wallet = self.wallet(id)?;
        let mut w = wallet.lock();
        let address = w.new_address()?;
        w.flush()?;
        Ok(address)
    }

    /// Default receiving address of wallet `id`.
    pub fn default_address(&self, id: WalletId) -> Result<Option<PaymentAddress>, EngineError> {
        Ok(self.wallet(id)?.lock().default_address())
    }

    /// Exported key string for `address` in wallet `id`.
    pub fn export_key(&self, id: WalletId, address: &PaymentAddress) -> Result<String, EngineError> {
        Ok(self.wallet(id)?.lock().export_key(address)?)
    }

    /// Import `key` into wallet `id`, rescanning from `rescan_from_height` if given.
    ///
    /// Connects wait until the rescan finishes. Setting `cancel` aborts the
    /// rescan and leaves the wallet as it was.
    pub fn import_key(
        &self,
        id: WalletId,
        key: WalletKey,
        rescan_from_height: Option<u64>,
        cancel: &AtomicBool,
    ) -> Result<PaymentAddress, EngineError> {
        self.ensure_running()?;
        let chain = self.chain.read();
        let wallet = self.wallet(id)?;
        let mut w = wallet.lock();
        let address = w
            .import_key(key, rescan_from_height, &*chain, cancel)
            .map_err(|e| {
                if matches!(e, WalletError::RescanInterrupted) {
                    warn!(wallet = id, "key import rescan interrupted");
                }
                self.observe(e.into())
            })?;
        Ok(address)
    }

    /// Balance of wallet `id` under `query`.
    pub fn get_balance(&self, id: WalletId, query: &BalanceQuery) -> Result<Amount, EngineError> {
        let _chain = self.chain.read();
        Ok(self.wallet(id)?.lock().get_balance(query))
    }

    /// Notes wallet `id` received at `address`.
    pub fn list_received(
        &self,
        id: WalletId,
        address: &PaymentAddress,
        min_confirmations: u32,
    ) -> Result<Vec<ReceivedNote>, EngineError> {
        let _chain = self.chain.read();
        Ok(self.wallet(id)?.lock().list_received(address, min_confirmations))
    }

    /// Build a spend from wallet `id`, anchored at the current tip.
    pub fn create_spend(
        &self,
        id: WalletId,
        from: &PaymentAddress,
        recipients: &[Recipient],
        fee: Amount,
    ) -> Result<Transaction, EngineError> {
        let chain = self.chain.read();
        let anchor = chain.state.root();
        let wallet = self.wallet(id)?;
        let tx = wallet.lock().create_spend(from, recipients, fee, anchor)?;
        Ok(tx)
    }

    /// Build a spend from wallet `id` and submit it.
    ///
    /// If the mempool refuses it, the notes it reserved are released.
    pub fn send(
        &self,
        id: WalletId,
        from: &PaymentAddress,
        recipients: &[Recipient],
        fee: Amount,
    ) -> Result<TxId, EngineError> {
        let tx = self.create_spend(id, from, recipients, fee)?;
        let pending = veil_core::txid(&tx)?;
        match self.submit(tx) {
            Ok(txid) => Ok(txid),
            Err(e) => {
                self.wallet(id)?.lock().release_pending(&pending);
                Err(e.into())
            }
        }
    }
}

fn corruption(msg: impl Into<String>) -> EngineError {
    EngineError::State(StateError::StructuralCorruption(msg.into()))
}

fn invalid(e: CoreError) -> EngineError {
    match e {
        CoreError::InvalidValue(msg) => StateError::InvalidTransaction(msg).into(),
        other => other.into(),
    }
}
