//! Shielded mempool guard.
//!
//! A transaction is admitted only if its anchor is the root of a block on the
//! best chain and none of its nullifiers is committed or already claimed by
//! another pending transaction. Claims live in the chain state's provisional
//! nullifier set and are taken under the same lock that checks them, so two
//! submissions racing for one nullifier never both get in.

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use k256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use thiserror::Error;
use tracing::{debug, info};
use veil_core::{
    sighash, to_bytes, txid, Amount, Anchor, Block, CoreError, Nullifier, Transaction, TxId,
    MAX_TX_BYTES,
};
use veil_state::{ChainState, StateError};

/// Number of evictions remembered for [`Mempool::eviction_log`].
pub const EVICTION_LOG_LEN: usize = 256;

/// What the mempool needs from the chain state.
pub trait ShieldedView {
    /// Whether `anchor` is the root of a block on the best chain.
    fn is_valid_anchor(&self, anchor: &Anchor) -> bool;

    /// Provisionally claim `nfs` for `txid`, all or nothing.
    fn claim_nullifiers(&mut self, txid: TxId, nfs: &[Nullifier]) -> Result<(), StateError>;

    /// Release the claims `txid` still holds among `nfs`.
    fn release_nullifiers(&mut self, txid: &TxId, nfs: &[Nullifier]);
}

impl ShieldedView for ChainState {
    fn is_valid_anchor(&self, anchor: &Anchor) -> bool {
        ChainState::is_valid_anchor(self, anchor)
    }

    fn claim_nullifiers(&mut self, txid: TxId, nfs: &[Nullifier]) -> Result<(), StateError> {
        ChainState::claim_nullifiers(self, txid, nfs)
    }

    fn release_nullifiers(&mut self, txid: &TxId, nfs: &[Nullifier]) {
        ChainState::release_nullifiers(self, txid, nfs)
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Structurally invalid transaction.
    #[error("invalid transaction: {0}")]
    InvalidFormat(&'static str),

    /// Already pending.
    #[error("duplicate transaction")]
    DuplicateTx,

    /// Nullifier already committed or claimed by a pending transaction.
    #[error("double spend: {0}")]
    DoubleSpend(Nullifier),

    /// Anchor is not a root of the best chain.
    #[error("stale anchor: {0}")]
    StaleAnchor(Anchor),

    /// A spend authorization signature did not verify.
    #[error("bad spend authorization signature")]
    BadSignature,

    /// Encoded transaction exceeds `MAX_TX_BYTES`.
    #[error("transaction too large")]
    TooLarge,

    /// Pool at capacity and the fee does not beat the cheapest entry.
    #[error("mempool full")]
    MempoolFull,

    /// The engine stopped after a fatal error.
    #[error("engine halted")]
    Halted,
}

/// Why a pending transaction was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// A connected block revealed one of its nullifiers.
    DoubleSpend(Nullifier),
    /// Its anchor left the best chain.
    StaleAnchor(Anchor),
    /// Replaced by a higher-fee transaction while the pool was full.
    LowFee,
}

/// One entry of the eviction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    /// Evicted transaction.
    pub txid: TxId,
    /// Reason.
    pub reason: EvictReason,
}

/// Result of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Id of the admitted transaction.
    pub txid: TxId,
    /// Entry pushed out to make room, if the pool was full.
    pub replaced: Option<Eviction>,
}

/// A pending transaction with the data eviction needs.
#[derive(Clone, Debug)]
pub struct MempoolEntry {
    /// The transaction.
    pub tx: Transaction,
    /// Its id.
    pub txid: TxId,
    /// Offered fee.
    pub fee: Amount,
    /// Nullifiers it claims.
    pub nullifiers: Vec<Nullifier>,
}

impl MempoolEntry {
    fn has_spends(&self) -> bool {
        !self.nullifiers.is_empty()
    }
}

/// Pending shielded transactions.
pub struct Mempool {
    txs: HashMap<TxId, MempoolEntry>,
    max_txs: usize,
    evictions: VecDeque<Eviction>,
}

impl Mempool {
    /// Empty pool holding at most `max_txs` transactions.
    pub fn new(max_txs: usize) -> Self {
        Self {
            txs: HashMap::new(),
            max_txs,
            evictions: VecDeque::new(),
        }
    }

    /// Checks that need no chain state: sanity, size and signatures.
    ///
    /// Returns the txid. Cheap enough to run before taking any lock.
    pub fn check_standalone(tx: &Transaction) -> Result<TxId, SubmitError> {
        let bytes = to_bytes(tx).map_err(|_| SubmitError::InvalidFormat("unencodable"))?;
        if bytes.len() > MAX_TX_BYTES {
            return Err(SubmitError::TooLarge);
        }
        tx.validate_sanity().map_err(|e| match e {
            CoreError::InvalidValue(msg) => SubmitError::InvalidFormat(msg),
            _ => SubmitError::InvalidFormat("malformed transaction"),
        })?;
        let id = txid(tx).map_err(|_| SubmitError::InvalidFormat("unencodable"))?;

        if !tx.spends.is_empty() {
            let msg = sighash(tx).map_err(|_| SubmitError::InvalidFormat("unencodable"))?;
            for spend in &tx.spends {
                let vk = VerifyingKey::from_sec1_bytes(&spend.rk)
                    .map_err(|_| SubmitError::BadSignature)?;
                let sig = Signature::from_der(&spend.spend_auth_sig)
                    .map_err(|_| SubmitError::BadSignature)?;
                vk.verify(msg.as_bytes(), &sig)
                    .map_err(|_| SubmitError::BadSignature)?;
            }
        }
        Ok(id)
    }

    /// Admit `tx`, claiming its nullifiers in `view`.
    ///
    /// Transactions without spends (shielding) carry no anchor claim and
    /// skip the anchor check.
    pub fn submit<V: ShieldedView>(
        &mut self,
        view: &mut V,
        tx: Transaction,
    ) -> Result<Admission, SubmitError> {
        let id = Self::check_standalone(&tx)?;
        self.admit(view, id, tx)
    }

    /// Chain-dependent half of [`Self::submit`], for a txid from [`Self::check_standalone`].
    pub fn admit<V: ShieldedView>(
        &mut self,
        view: &mut V,
        id: TxId,
        tx: Transaction,
    ) -> Result<Admission, SubmitError> {
        if self.txs.contains_key(&id) {
            return Err(SubmitError::DuplicateTx);
        }
        if !tx.spends.is_empty() && !view.is_valid_anchor(&tx.anchor) {
            return Err(SubmitError::StaleAnchor(tx.anchor));
        }
        let victim = if self.txs.len() >= self.max_txs {
            let lowest = self
                .lowest_fee()
                .filter(|e| tx.fee > e.fee)
                .map(|e| e.txid)
                .ok_or(SubmitError::MempoolFull)?;
            Some(lowest)
        } else {
            None
        };

        let nullifiers: Vec<Nullifier> = tx.nullifiers().copied().collect();
        view.claim_nullifiers(id, &nullifiers).map_err(|e| match e {
            StateError::DoubleSpend(nf) => SubmitError::DoubleSpend(nf),
            _ => SubmitError::InvalidFormat("nullifiers cannot be claimed"),
        })?;
        let replaced = victim.and_then(|v| self.evict(view, &v, EvictReason::LowFee));

        debug!(
            txid = %id,
            spends = nullifiers.len(),
            outputs = tx.outputs.len(),
            fee = tx.fee.atoms(),
            "admitted transaction"
        );
        self.txs.insert(
            id,
            MempoolEntry {
                fee: tx.fee,
                tx,
                txid: id,
                nullifiers,
            },
        );
        Ok(Admission {
            txid: id,
            replaced,
        })
    }

    /// Drop transactions mined in `block` and evict those it conflicts with.
    ///
    /// Must run after the block was connected to `view`: the nullifiers of
    /// mined transactions have already graduated to committed.
    pub fn block_connected<V: ShieldedView>(
        &mut self,
        view: &mut V,
        block: &Block,
    ) -> Vec<Eviction> {
        for tx in &block.txs {
            if let Ok(id) = txid(tx) {
                if let Some(entry) = self.txs.remove(&id) {
                    view.release_nullifiers(&id, &entry.nullifiers);
                    debug!(txid = %id, "transaction mined");
                }
            }
        }

        let spent: HashSet<Nullifier> = block.nullifiers().into_iter().collect();
        let conflicts: Vec<(TxId, Nullifier)> = self
            .txs
            .values()
            .filter_map(|e| {
                e.nullifiers
                    .iter()
                    .find(|nf| spent.contains(*nf))
                    .map(|nf| (e.txid, *nf))
            })
            .collect();
        conflicts
            .into_iter()
            .filter_map(|(id, nf)| self.evict(view, &id, EvictReason::DoubleSpend(nf)))
            .collect()
    }

    /// Evict every spending transaction whose anchor `view` no longer accepts.
    ///
    /// Run after each disconnect. Transactions of the disconnected block are
    /// not re-added; their submitters must resubmit.
    pub fn evict_stale_anchors<V: ShieldedView>(&mut self, view: &mut V) -> Vec<Eviction> {
        let stale: Vec<(TxId, Anchor)> = self
            .txs
            .values()
            .filter(|e| e.has_spends() && !view.is_valid_anchor(&e.tx.anchor))
            .map(|e| (e.txid, e.tx.anchor))
            .collect();
        stale
            .into_iter()
            .filter_map(|(id, anchor)| self.evict(view, &id, EvictReason::StaleAnchor(anchor)))
            .collect()
    }

    fn evict<V: ShieldedView>(
        &mut self,
        view: &mut V,
        id: &TxId,
        reason: EvictReason,
    ) -> Option<Eviction> {
        let entry = self.txs.remove(id)?;
        view.release_nullifiers(id, &entry.nullifiers);
        info!(txid = %id, reason = ?reason, "evicted transaction");
        let eviction = Eviction { txid: *id, reason };
        if self.evictions.len() == EVICTION_LOG_LEN {
            self.evictions.pop_front();
        }
        self.evictions.push_back(eviction);
        Some(eviction)
    }

    fn lowest_fee(&self) -> Option<&MempoolEntry> {
        self.txs.values().min_by_key(|e| (e.fee, e.txid))
    }

    /// Whether `txid` is pending.
    pub fn contains(&self, txid: &TxId) -> bool {
        self.txs.contains_key(txid)
    }

    /// Pending entry for `txid`.
    pub fn get(&self, txid: &TxId) -> Option<&MempoolEntry> {
        self.txs.get(txid)
    }

    /// Ids of all pending transactions, sorted.
    pub fn pending_txids(&self) -> Vec<TxId> {
        let mut ids: Vec<TxId> = self.txs.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Most recent evictions, oldest first.
    pub fn eviction_log(&self) -> impl Iterator<Item = &Eviction> + '_ {
        self.evictions.iter()
    }

    /// Up to `max` pending transactions, highest fee first.
    pub fn select_for_block(&self, max: usize) -> Vec<Transaction> {
        let mut entries: Vec<&MempoolEntry> = self.txs.values().collect();
        entries.sort_by_key(|e| (std::cmp::Reverse(e.fee), e.txid));
        entries.into_iter().take(max).map(|e| e.tx.clone()).collect()
    }

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}
