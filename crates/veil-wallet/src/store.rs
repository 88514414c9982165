//! Sled persistence for wallets.
//!
//! Trees:
//! - `keys`: address bytes -> exported key string
//! - `notes`: position (big endian) -> borsh `NoteRecord`
//! - `meta`: scan height and default address

use std::path::Path;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::WalletError;
use crate::keys::{PaymentAddress, WalletKey};
use crate::wallet::NoteRecord;

const TREE_KEYS: &str = "keys";
const TREE_NOTES: &str = "notes";
const TREE_META: &str = "meta";
const KEY_META: &[u8] = b"meta";

#[derive(BorshSerialize, BorshDeserialize, Default, Clone, Debug, PartialEq, Eq)]
pub(crate) struct WalletMeta {
    pub default_address: Option<PaymentAddress>,
    pub scanned_height: Option<u64>,
}

pub(crate) struct StoredWallet {
    pub keys: Vec<WalletKey>,
    pub notes: Vec<NoteRecord>,
    pub meta: WalletMeta,
}

/// On-disk wallet database.
pub struct WalletStore {
    db: sled::Db,
    keys: sled::Tree,
    notes: sled::Tree,
    meta: sled::Tree,
}

impl WalletStore {
    /// Open (or create) a wallet database at `path`.
    pub fn open(path: &Path) -> Result<Self, WalletError> {
        let db = sled::open(path)?;
        let keys = db.open_tree(TREE_KEYS)?;
        let notes = db.open_tree(TREE_NOTES)?;
        let meta = db.open_tree(TREE_META)?;
        Ok(Self {
            db,
            keys,
            notes,
            meta,
        })
    }

    pub(crate) fn load(&self) -> Result<StoredWallet, WalletError> {
        let mut keys = Vec::new();
        for item in self.keys.iter() {
            let (_, v) = item?;
            let s = std::str::from_utf8(&v)
                .map_err(|_| WalletError::Storage("key record is not utf-8".into()))?;
            keys.push(WalletKey::import(s)?);
        }
        let mut notes = Vec::new();
        for item in self.notes.iter() {
            let (_, v) = item?;
            notes.push(NoteRecord::try_from_slice(&v)?);
        }
        let meta = match self.meta.get(KEY_META)? {
            Some(bytes) => WalletMeta::try_from_slice(&bytes)?,
            None => WalletMeta::default(),
        };
        Ok(StoredWallet { keys, notes, meta })
    }

    pub(crate) fn save<'a>(
        &self,
        keys: impl IntoIterator<Item = (&'a PaymentAddress, &'a WalletKey)>,
        notes: impl IntoIterator<Item = &'a NoteRecord>,
        meta: &WalletMeta,
    ) -> Result<(), WalletError> {
        let mut key_batch = sled::Batch::default();
        for (addr, key) in keys {
            key_batch.insert(addr.0.to_vec(), key.export().as_bytes().to_vec());
        }
        self.keys.apply_batch(key_batch)?;

        let mut live = hashbrown::HashSet::new();
        let mut note_batch = sled::Batch::default();
        for rec in notes {
            let k = rec.position.to_be_bytes().to_vec();
            live.insert(k.clone());
            note_batch.insert(k, borsh::to_vec(rec)?);
        }
        for k in self.notes.iter().keys() {
            let k = k?;
            if !live.contains(&k[..]) {
                note_batch.remove(k);
            }
        }
        self.notes.apply_batch(note_batch)?;

        self.meta.insert(KEY_META, borsh::to_vec(meta)?)?;
        self.db.flush()?;
        Ok(())
    }
}
