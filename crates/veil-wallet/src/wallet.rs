//! Shielded wallet: note discovery, witness maintenance and spending.
//!
//! The wallet follows the chain one block at a time. For every connected
//! block it:
//! 1. advances the witness of every tracked note by the block's commitments
//! 2. trial-decrypts each output, starting a witness for notes it owns
//! 3. marks notes whose nullifier the block reveals as spent
//!
//! Disconnects drop notes created in the block, unspend notes it spent and
//! rewind every witness. Key imports rescan a copy of the wallet and only
//! replace the live state once the rescan has completed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use k256::ecdsa::signature::Signer;
use k256::ecdsa::Signature;
use k256::{EncodedPoint, SecretKey};
use tracing::{debug, info, warn};

use borsh::{BorshDeserialize, BorshSerialize};
use veil_core::{
    derive_nullifier, sighash, txid, Amount, Anchor, Block, Commitment, Hash32, Nullifier,
    OutputDescription, SignedAmount, SpendDescription, Transaction, TxId, PROTOCOL_VERSION,
};
use veil_state::{Frontier, IncrementalWitness, StateError};

use crate::error::WalletError;
use crate::keys::{FullViewingKey, PaymentAddress, SpendingKey, WalletKey};
use crate::note::{try_decrypt_note, Memo, Note};
use crate::store::{WalletMeta, WalletStore};
use crate::tracker::{RewindOutcome, WitnessTracker};

/// Read access to connected blocks, used by rescans.
pub trait BlockSource {
    /// Height of the current tip.
    fn tip_height(&self) -> Option<u64>;

    /// Block connected at `height`.
    fn block_at(&self, height: u64) -> Option<Block>;

    /// Accumulator frontier at the start of block `height`.
    fn frontier_before(&self, height: u64) -> Result<Frontier, StateError>;
}

/// A note the wallet owns.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NoteRecord {
    /// Creating transaction.
    pub txid: TxId,
    /// Output index within the creating transaction.
    pub output_index: u32,
    /// Height of the creating block.
    pub height: u64,
    /// Position of the commitment in the tree.
    pub position: u64,
    /// Nullifier revealed when the note is spent.
    pub nullifier: Nullifier,
    /// Decrypted note.
    pub note: Note,
    /// Created by a transaction that also spent a note of the same address.
    pub change: bool,
    /// Height of the block that spent the note.
    pub spent_height: Option<u64>,
    /// Pending wallet transaction spending the note.
    pub pending_spend: Option<TxId>,
    /// Witness history; `None` once no longer needed or after a failed rewind.
    pub tracker: Option<WitnessTracker>,
}

impl NoteRecord {
    /// Commitment of the note.
    pub fn commitment(&self) -> Commitment {
        self.note.commitment()
    }
}

/// Filter for [`Wallet::get_balance`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceQuery {
    /// Only notes to this address; all addresses when `None`.
    pub address: Option<PaymentAddress>,
    /// Minimum confirmations a note needs to count.
    pub min_confirmations: u32,
    /// Count notes held by view-only keys.
    pub include_watch_only: bool,
}

impl Default for BalanceQuery {
    fn default() -> Self {
        Self {
            address: None,
            min_confirmations: 1,
            include_watch_only: false,
        }
    }
}

/// Note as reported by [`Wallet::list_received`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedNote {
    /// Creating transaction.
    pub txid: TxId,
    /// Output index within the creating transaction.
    pub output_index: u32,
    /// Receiving address.
    pub address: PaymentAddress,
    /// Value in atoms.
    pub value: Amount,
    /// Memo.
    pub memo: Memo,
    /// Height of the creating block.
    pub height: u64,
    /// Blocks on top of (and including) the creating block.
    pub confirmations: u64,
    /// Spent by a connected block.
    pub spent: bool,
    /// Change back to the sender.
    pub change: bool,
}

/// Payment to create in [`Wallet::create_spend`].
#[derive(Clone, Debug)]
pub struct Recipient {
    /// Destination.
    pub address: PaymentAddress,
    /// Value in atoms.
    pub value: Amount,
    /// Memo for the recipient.
    pub memo: Memo,
}

#[derive(Clone)]
struct KeyEntry {
    key: WalletKey,
    fvk: FullViewingKey,
    ivk: SecretKey,
}

impl KeyEntry {
    fn new(key: WalletKey) -> Result<(PaymentAddress, Self), WalletError> {
        let fvk = key.full_viewing_key();
        let ivk = fvk.ivk()?;
        let address = fvk.address()?;
        Ok((address, Self { key, fvk, ivk }))
    }
}

#[derive(Clone, Default)]
struct WalletState {
    keys: BTreeMap<PaymentAddress, KeyEntry>,
    notes: BTreeMap<u64, NoteRecord>,
    nullifiers: HashMap<Nullifier, u64>,
    scanned_height: Option<u64>,
    default_address: Option<PaymentAddress>,
}

impl WalletState {
    fn add_key(&mut self, key: WalletKey) -> Result<PaymentAddress, WalletError> {
        let (address, entry) = KeyEntry::new(key)?;
        match self.keys.get(&address) {
            // Importing a spending key upgrades a view-only entry; anything else is a no-op.
            Some(existing)
                if existing.key.is_spend_capable() || !entry.key.is_spend_capable() => {}
            _ => {
                self.keys.insert(address, entry);
            }
        }
        self.default_address.get_or_insert(address);
        Ok(address)
    }

    fn trial_decrypt(&self, output: &OutputDescription) -> Option<(Note, [u8; 32])> {
        self.keys.iter().find_map(|(addr, entry)| {
            try_decrypt_note(&entry.ivk, addr, output).map(|note| (note, *entry.fvk.nk()))
        })
    }

    /// Apply block `height` whose first commitment lands at `frontier.size()`.
    fn scan_block(
        &mut self,
        height: u64,
        block: &Block,
        frontier: &Frontier,
        cache_size: u32,
    ) -> Result<usize, WalletError> {
        let cms = block.commitments();
        for rec in self.notes.values_mut() {
            let Some(tracker) = rec.tracker.as_mut() else {
                continue;
            };
            if tracker.witness_height().map_or(true, |h| h >= height) {
                continue;
            }
            let size = tracker.current().map(IncrementalWitness::tree_size);
            if size != Some(frontier.size()) {
                return Err(StateError::StructuralCorruption(format!(
                    "witness for position {} at tree size {size:?}, block {height} starts at {}",
                    rec.position,
                    frontier.size()
                ))
                .into());
            }
            tracker.advance(height, &cms)?;
        }

        let mut frontier = frontier.clone();
        let mut fresh: Vec<u64> = Vec::new();
        let mut found = 0usize;
        for tx in &block.txs {
            let id = txid(tx)?;
            let spent_from: Vec<PaymentAddress> = tx
                .nullifiers()
                .filter_map(|nf| self.nullifiers.get(nf))
                .filter_map(|pos| self.notes.get(pos))
                .map(|rec| rec.note.address)
                .collect();

            for (index, output) in tx.outputs.iter().enumerate() {
                let position = frontier.size();
                for p in &fresh {
                    if let Some(t) = self.notes.get_mut(p).and_then(|r| r.tracker.as_mut()) {
                        t.extend(&output.cm)?;
                    }
                }
                if let Some((note, nk)) = self.trial_decrypt(output) {
                    let witness = IncrementalWitness::from_frontier(&frontier, output.cm);
                    let tracker = WitnessTracker::new(witness, height, cache_size);
                    match self.notes.get_mut(&position) {
                        Some(rec) if rec.tracker.as_ref().is_some_and(|t| !t.needs_rescan()) => {}
                        Some(rec) => {
                            debug!(position, height, "rebuilt witness");
                            rec.tracker = Some(tracker);
                            fresh.push(position);
                        }
                        None => {
                            let nullifier = derive_nullifier(&nk, &output.cm, position);
                            let change = spent_from.contains(&note.address);
                            info!(
                                position,
                                height,
                                value = note.value.atoms(),
                                "received note"
                            );
                            self.nullifiers.insert(nullifier, position);
                            self.notes.insert(
                                position,
                                NoteRecord {
                                    txid: id,
                                    output_index: index as u32,
                                    height,
                                    position,
                                    nullifier,
                                    note,
                                    change,
                                    spent_height: None,
                                    pending_spend: None,
                                    tracker: Some(tracker),
                                },
                            );
                            fresh.push(position);
                            found += 1;
                        }
                    }
                }
                frontier.append(&output.cm);
            }

            for nf in tx.nullifiers() {
                if let Some(rec) = self.nullifiers.get(nf).and_then(|p| self.notes.get_mut(p)) {
                    debug!(position = rec.position, height, "note spent");
                    rec.spent_height = Some(height);
                    rec.pending_spend = None;
                }
            }
        }

        // Spends buried deeper than any reorg we can undo no longer need a witness.
        for rec in self.notes.values_mut() {
            if let Some(spent) = rec.spent_height {
                if height.saturating_sub(spent) >= u64::from(cache_size) {
                    rec.tracker = None;
                }
            }
        }
        Ok(found)
    }

    fn unscan_block(&mut self, height: u64, tree_size_before: u64) {
        let orphaned: Vec<u64> = self
            .notes
            .range(tree_size_before..)
            .map(|(p, _)| *p)
            .collect();
        for p in orphaned {
            if let Some(rec) = self.notes.remove(&p) {
                debug!(position = p, height, "note disconnected");
                self.nullifiers.remove(&rec.nullifier);
            }
        }
        let tip = height.saturating_sub(1);
        for rec in self.notes.values_mut() {
            if rec.spent_height == Some(height) {
                rec.spent_height = None;
            }
            if let Some(t) = rec.tracker.as_mut() {
                if t.rewind(tree_size_before, tip) == RewindOutcome::NeedsRescan {
                    warn!(position = rec.position, height, "witness cache exhausted, rescan required");
                }
            }
        }
        self.scanned_height = height.checked_sub(1);
    }

    fn rescan(
        &mut self,
        from_height: u64,
        source: &dyn BlockSource,
        cancel: &AtomicBool,
        cache_size: u32,
    ) -> Result<usize, WalletError> {
        let Some(tip) = source.tip_height() else {
            return Ok(0);
        };
        if from_height > tip {
            return Ok(0);
        }
        let mut frontier = source.frontier_before(from_height)?;
        let mut found = 0usize;
        for height in from_height..=tip {
            if cancel.load(Ordering::Relaxed) {
                return Err(WalletError::RescanInterrupted);
            }
            let Some(block) = source.block_at(height) else {
                continue;
            };
            found += self.scan_block(height, &block, &frontier, cache_size)?;
            for cm in block.commitments() {
                frontier.append(&cm);
            }
        }
        self.scanned_height = Some(self.scanned_height.map_or(tip, |s| s.max(tip)));
        Ok(found)
    }

    fn confirmations(&self, rec: &NoteRecord) -> u64 {
        match self.scanned_height {
            Some(tip) if tip >= rec.height => tip - rec.height + 1,
            _ => 0,
        }
    }

    fn is_watch_only(&self, address: &PaymentAddress) -> bool {
        self.keys
            .get(address)
            .map_or(true, |e| !e.key.is_spend_capable())
    }

    fn received(&self, rec: &NoteRecord) -> ReceivedNote {
        ReceivedNote {
            txid: rec.txid,
            output_index: rec.output_index,
            address: rec.note.address,
            value: rec.note.value,
            memo: rec.note.memo.clone(),
            height: rec.height,
            confirmations: self.confirmations(rec),
            spent: rec.spent_height.is_some(),
            change: rec.change,
        }
    }
}

/// A shielded wallet, optionally backed by a sled store.
pub struct Wallet {
    state: WalletState,
    witness_cache_size: u32,
    store: Option<WalletStore>,
}

impl Wallet {
    /// Empty in-memory wallet.
    pub fn new(witness_cache_size: u32) -> Self {
        Self {
            state: WalletState::default(),
            witness_cache_size: witness_cache_size.max(1),
            store: None,
        }
    }

    /// Open (or create) a wallet persisted at `path`.
    pub fn open(path: &Path, witness_cache_size: u32) -> Result<Self, WalletError> {
        let store = WalletStore::open(path)?;
        let stored = store.load()?;
        let mut state = WalletState::default();
        for key in stored.keys {
            state.add_key(key)?;
        }
        for rec in stored.notes {
            state.nullifiers.insert(rec.nullifier, rec.position);
            state.notes.insert(rec.position, rec);
        }
        state.scanned_height = stored.meta.scanned_height;
        if stored.meta.default_address.is_some() {
            state.default_address = stored.meta.default_address;
        }
        info!(
            keys = state.keys.len(),
            notes = state.notes.len(),
            scanned_height = ?state.scanned_height,
            "wallet opened"
        );
        Ok(Self {
            state,
            witness_cache_size: witness_cache_size.max(1),
            store: Some(store),
        })
    }

    /// Write the wallet to its store, if it has one.
    pub fn flush(&self) -> Result<(), WalletError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let meta = WalletMeta {
            default_address: self.state.default_address,
            scanned_height: self.state.scanned_height,
        };
        store.save(
            self.state.keys.iter().map(|(a, e)| (a, &e.key)),
            self.state.notes.values(),
            &meta,
        )
    }

    /// Height of the last block the wallet has processed.
    pub fn scanned_height(&self) -> Option<u64> {
        self.state.scanned_height
    }

    /// Mark the wallet as caught up to `height` without scanning.
    ///
    /// Only valid for a wallet that holds no keys yet.
    pub fn mark_synced(&mut self, height: Option<u64>) {
        if self.state.keys.is_empty() {
            self.state.scanned_height = height;
        }
    }

    /// Drop every note and the scan height, keeping keys.
    ///
    /// Used when the wallet is ahead of the chain it is attached to; a full
    /// rescan rebuilds the notes afterwards.
    pub fn reset(&mut self) {
        warn!(
            notes = self.state.notes.len(),
            scanned_height = ?self.state.scanned_height,
            "wallet chain data reset"
        );
        self.state.notes.clear();
        self.state.nullifiers.clear();
        self.state.scanned_height = None;
    }

    /// Generate a new spending key and return its address.
    pub fn new_address(&mut self) -> Result<PaymentAddress, WalletError> {
        self.state
            .add_key(WalletKey::SpendCapable(SpendingKey::random()))
    }

    /// Default receiving address.
    pub fn default_address(&self) -> Option<PaymentAddress> {
        self.state.default_address
    }

    /// All addresses with whether the wallet can spend from them.
    pub fn addresses(&self) -> Vec<(PaymentAddress, bool)> {
        self.state
            .keys
            .iter()
            .map(|(a, e)| (*a, e.key.is_spend_capable()))
            .collect()
    }

    /// Exported key string for `address`.
    pub fn export_key(&self, address: &PaymentAddress) -> Result<String, WalletError> {
        self.state
            .keys
            .get(address)
            .map(|e| e.key.export().to_string())
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))
    }

    /// Process a newly connected block.
    ///
    /// Blocks the wallet has already seen are ignored; a gap is an error.
    pub fn block_connected(
        &mut self,
        height: u64,
        block: &Block,
        frontier_before: &Frontier,
    ) -> Result<usize, WalletError> {
        match self.state.scanned_height {
            Some(scanned) if height <= scanned => return Ok(0),
            Some(scanned) if height != scanned + 1 => {
                return Err(StateError::StructuralCorruption(format!(
                    "wallet at height {scanned} cannot apply block {height}"
                ))
                .into());
            }
            None if height != 1 => {
                return Err(StateError::StructuralCorruption(format!(
                    "unsynced wallet cannot apply block {height}"
                ))
                .into());
            }
            _ => {}
        }
        let found = self
            .state
            .scan_block(height, block, frontier_before, self.witness_cache_size)?;
        self.state.scanned_height = Some(height);
        Ok(found)
    }

    /// Undo block `height`, whose first commitment was at `tree_size_before`.
    pub fn block_disconnected(
        &mut self,
        height: u64,
        tree_size_before: u64,
    ) -> Result<(), WalletError> {
        match self.state.scanned_height {
            Some(scanned) if scanned == height => {
                self.state.unscan_block(height, tree_size_before);
                Ok(())
            }
            Some(scanned) if scanned > height => Err(StateError::StructuralCorruption(format!(
                "wallet at height {scanned} cannot disconnect block {height}"
            ))
            .into()),
            _ => Ok(()),
        }
    }

    /// Replay blocks from `from_height` to the tip, discovering notes and
    /// rebuilding witnesses that were lost.
    ///
    /// Runs on a copy; if cancelled the wallet is left exactly as it was.
    pub fn rescan(
        &mut self,
        from_height: u64,
        source: &dyn BlockSource,
        cancel: &AtomicBool,
    ) -> Result<usize, WalletError> {
        let mut next = self.state.clone();
        let found = next.rescan(from_height, source, cancel, self.witness_cache_size)?;
        self.state = next;
        self.flush()?;
        info!(from_height, found, "rescan complete");
        Ok(found)
    }

    /// Add a key and, if `rescan_from_height` is given, discover its past notes.
    ///
    /// Importing a key twice is harmless: known notes are not added again.
    pub fn import_key(
        &mut self,
        key: WalletKey,
        rescan_from_height: Option<u64>,
        source: &dyn BlockSource,
        cancel: &AtomicBool,
    ) -> Result<PaymentAddress, WalletError> {
        let mut next = self.state.clone();
        let address = next.add_key(key)?;
        if let Some(from) = rescan_from_height {
            next.rescan(from, source, cancel, self.witness_cache_size)?;
        } else if next.scanned_height.is_none() {
            next.scanned_height = source.tip_height();
        }
        self.state = next;
        self.flush()?;
        info!(%address, rescan_from_height = ?rescan_from_height, "key imported");
        Ok(address)
    }

    /// Sum of unspent notes matching `query`.
    ///
    /// Notes whose witness was lost to a deep reorg are left out until a
    /// rescan rebuilds it, so the total is what the wallet can spend now.
    pub fn get_balance(&self, query: &BalanceQuery) -> Amount {
        let atoms = self
            .eligible(query.address.as_ref(), query.min_confirmations)
            .filter(|rec| rec.spent_height.is_none())
            .filter(|rec| rec.tracker.as_ref().is_some_and(|t| !t.needs_rescan()))
            .filter(|rec| query.include_watch_only || !self.state.is_watch_only(&rec.note.address))
            .fold(0u64, |acc, rec| acc.saturating_add(rec.note.value.atoms()));
        Amount::from_atoms(atoms)
    }

    /// Every note received at `address` with at least `min_confirmations`.
    pub fn list_received(
        &self,
        address: &PaymentAddress,
        min_confirmations: u32,
    ) -> Vec<ReceivedNote> {
        self.eligible(Some(address), min_confirmations)
            .map(|rec| self.state.received(rec))
            .collect()
    }

    /// Unspent notes across all addresses.
    pub fn list_unspent(&self, min_confirmations: u32) -> Vec<ReceivedNote> {
        self.eligible(None, min_confirmations)
            .filter(|rec| rec.spent_height.is_none())
            .map(|rec| self.state.received(rec))
            .collect()
    }

    /// Tracked note at `position`.
    pub fn note(&self, position: u64) -> Result<&NoteRecord, WalletError> {
        self.state.notes.get(&position).ok_or(WalletError::UnknownNote)
    }

    /// Witness for the note at `position`, current to `anchor`.
    pub fn witness(
        &self,
        position: u64,
        anchor: &Anchor,
    ) -> Result<&IncrementalWitness, WalletError> {
        let rec = self.note(position)?;
        rec.tracker
            .as_ref()
            .and_then(WitnessTracker::current)
            .filter(|w| w.root() == *anchor)
            .ok_or(WalletError::NoWitness(position))
    }

    fn eligible<'a>(
        &'a self,
        address: Option<&'a PaymentAddress>,
        min_confirmations: u32,
    ) -> impl Iterator<Item = &'a NoteRecord> + 'a {
        self.state.notes.values().filter(move |rec| {
            address.map_or(true, |a| rec.note.address == *a)
                && self.state.confirmations(rec) >= u64::from(min_confirmations)
        })
    }

    /// Build and sign a transaction paying `recipients` from notes of `from`.
    ///
    /// Every selected note must have a witness current to `anchor`. Change
    /// goes back to `from`. Selected notes are reserved until the
    /// transaction is mined or [`Wallet::release_pending`] is called.
    pub fn create_spend(
        &mut self,
        from: &PaymentAddress,
        recipients: &[Recipient],
        fee: Amount,
        anchor: Anchor,
    ) -> Result<Transaction, WalletError> {
        let entry = self
            .state
            .keys
            .get(from)
            .ok_or_else(|| WalletError::UnknownAddress(from.to_string()))?;
        let sk = entry.key.spending_key()?.clone();

        let needed = recipients
            .iter()
            .try_fold(fee, |acc, r| acc.checked_add(r.value))?;

        let mut candidates: Vec<&NoteRecord> = self
            .eligible(Some(from), 1)
            .filter(|rec| rec.spent_height.is_none() && rec.pending_spend.is_none())
            .collect();
        candidates.sort_by_key(|rec| (std::cmp::Reverse(rec.note.value), rec.position));

        let mut selected: Vec<(u64, Nullifier)> = Vec::new();
        let mut total = Amount::zero();
        let mut missing_witness = None;
        for rec in candidates {
            if total >= needed {
                break;
            }
            let current = rec
                .tracker
                .as_ref()
                .and_then(WitnessTracker::anchor)
                .is_some_and(|a| a == anchor);
            if !current {
                missing_witness.get_or_insert(rec.position);
                continue;
            }
            total = total.checked_add(rec.note.value)?;
            selected.push((rec.position, rec.nullifier));
        }
        if total < needed {
            if let Some(position) = missing_witness {
                return Err(WalletError::NoWitness(position));
            }
            return Err(WalletError::InsufficientFunds {
                needed: needed.atoms(),
                available: total.atoms(),
            });
        }

        let mut outputs = Vec::with_capacity(recipients.len() + 1);
        for r in recipients {
            outputs.push(Note::new(r.address, r.value, r.memo.clone()).to_output()?);
        }
        let change = total.checked_sub(needed)?;
        if change > Amount::zero() {
            outputs.push(Note::new(*from, change, Memo::empty()).to_output()?);
        }

        let ask = sk.spend_authorizing_key()?;
        let rk = EncodedPoint::from(ask.verifying_key()).as_bytes().to_vec();
        let mut tx = Transaction {
            version: PROTOCOL_VERSION,
            anchor,
            spends: selected
                .iter()
                .map(|(_, nf)| SpendDescription {
                    nullifier: *nf,
                    rk: rk.clone(),
                    spend_auth_sig: Vec::new(),
                })
                .collect(),
            outputs,
            value_balance: SignedAmount::try_from(fee)?,
            fee,
            proof: Vec::new(),
        };
        let msg = sighash(&tx)?;
        let sig: Signature = ask.sign(msg.as_bytes());
        let der = sig.to_der().as_bytes().to_vec();
        for spend in &mut tx.spends {
            spend.spend_auth_sig = der.clone();
        }
        tx.validate_sanity()?;

        let id = txid(&tx)?;
        for (position, _) in &selected {
            if let Some(rec) = self.state.notes.get_mut(position) {
                rec.pending_spend = Some(id);
            }
        }
        debug!(txid = %id, spends = selected.len(), "built spend");
        Ok(tx)
    }

    /// Forget that `txid` reserved notes, e.g. after it was evicted from the mempool.
    pub fn release_pending(&mut self, txid: &TxId) {
        for rec in self.state.notes.values_mut() {
            if rec.pending_spend.as_ref() == Some(txid) {
                rec.pending_spend = None;
            }
        }
    }
}

/// Transaction moving `value` from the transparent side into a new note for `to`.
pub fn build_shielding_tx(
    to: &PaymentAddress,
    value: Amount,
    memo: Memo,
) -> Result<Transaction, WalletError> {
    if value == Amount::zero() || !value.is_valid_money() {
        return Err(veil_core::CoreError::InvalidValue("shielding value out of range").into());
    }
    let output = Note::new(*to, value, memo).to_output()?;
    let tx = Transaction {
        version: PROTOCOL_VERSION,
        anchor: Hash32::zero(),
        spends: Vec::new(),
        outputs: vec![output],
        value_balance: SignedAmount::try_from(value)?.checked_neg()?,
        fee: Amount::zero(),
        proof: Vec::new(),
    };
    tx.validate_sanity()?;
    Ok(tx)
}
