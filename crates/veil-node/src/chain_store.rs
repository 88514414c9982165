//! Sled-backed block and anchor storage.
//!
//! Only connected blocks are stored, keyed by big-endian height so iteration
//! order is chain order. The chain state itself is never written: it is
//! rebuilt on open by replaying the blocks and then checked against the
//! stored anchor table.

use std::path::Path;

use borsh::{to_vec, BorshDeserialize};
use sled::transaction::{Transactional, TransactionResult};
use sled::Error as SledError;
use veil_core::{Anchor, Block, Hash32};

const TREE_BLOCKS: &str = "blocks";
const TREE_ANCHORS: &str = "anchors";
const TREE_META: &str = "meta";
const KEY_TIP: &[u8] = b"tip";

/// Persistent store for connected blocks and their anchors.
pub struct ChainDb {
    db: sled::Db,
    blocks: sled::Tree,
    anchors: sled::Tree,
    meta: sled::Tree,
}

impl ChainDb {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, String> {
        let db = sled::open(path).map_err(|e| e.to_string())?;
        let blocks = db.open_tree(TREE_BLOCKS).map_err(|e| e.to_string())?;
        let anchors = db.open_tree(TREE_ANCHORS).map_err(|e| e.to_string())?;
        let meta = db.open_tree(TREE_META).map_err(|e| e.to_string())?;
        Ok(Self {
            db,
            blocks,
            anchors,
            meta,
        })
    }

    /// Height of the stored tip.
    pub fn tip(&self) -> Result<Option<u64>, String> {
        match self.meta.get(KEY_TIP).map_err(|e| e.to_string())? {
            Some(bytes) => Ok(Some(decode_height(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store block `height` with the anchor it produced and make it the tip.
    pub fn put_block(&self, height: u64, block: &Block, anchor: &Anchor) -> Result<(), String> {
        let key = height.to_be_bytes();
        let blk_bytes = to_vec(block).map_err(|e| e.to_string())?;
        let anchor_bytes = anchor.as_bytes().to_vec();

        let res: TransactionResult<(), SledError> =
            (&self.blocks, &self.anchors, &self.meta).transaction(|(blocks, anchors, meta)| {
                blocks.insert(&key[..], blk_bytes.clone())?;
                anchors.insert(&key[..], anchor_bytes.clone())?;
                meta.insert(KEY_TIP, key.to_vec())?;
                Ok(())
            });
        res.map_err(|e| e.to_string())
    }

    /// Remove the tip block `height`; the tip moves to `height - 1`.
    pub fn remove_tip(&self, height: u64) -> Result<(), String> {
        let key = height.to_be_bytes();
        let new_tip = height.checked_sub(1).filter(|h| *h > 0).map(u64::to_be_bytes);

        let res: TransactionResult<(), SledError> =
            (&self.blocks, &self.anchors, &self.meta).transaction(|(blocks, anchors, meta)| {
                blocks.remove(&key[..])?;
                anchors.remove(&key[..])?;
                match &new_tip {
                    Some(tip) => meta.insert(KEY_TIP, tip.to_vec())?,
                    None => meta.remove(KEY_TIP)?,
                };
                Ok(())
            });
        res.map_err(|e| e.to_string())
    }

    /// Every stored block in height order.
    pub fn load_blocks(&self) -> Result<Vec<(u64, Block)>, String> {
        let mut out = Vec::new();
        for item in self.blocks.iter() {
            let (k, v) = item.map_err(|e| e.to_string())?;
            let blk = Block::try_from_slice(&v).map_err(|e| e.to_string())?;
            out.push((decode_height(&k)?, blk));
        }
        Ok(out)
    }

    /// Anchor stored for `height`.
    pub fn anchor_at(&self, height: u64) -> Result<Option<Anchor>, String> {
        match self
            .anchors
            .get(height.to_be_bytes())
            .map_err(|e| e.to_string())?
        {
            Some(bytes) => {
                let arr: [u8; 32] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| "anchor record has wrong length".to_string())?;
                Ok(Some(Hash32(arr)))
            }
            None => Ok(None),
        }
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), String> {
        self.db.flush().map(|_| ()).map_err(|e| e.to_string())
    }
}

fn decode_height(bytes: &[u8]) -> Result<u64, String> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| "height key has wrong length".to_string())?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::{BlockHeader, PROTOCOL_VERSION};

    fn block(ts: u64) -> Block {
        Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                prev: Hash32::zero(),
                commitment_root: Hash32([ts as u8; 32]),
                timestamp: ts,
            },
            txs: vec![],
        }
    }

    #[test]
    fn blocks_come_back_in_height_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path()).unwrap();
        for h in [1u64, 2, 256, 257] {
            db.put_block(h, &block(h), &Hash32([h as u8; 32])).unwrap();
        }
        let heights: Vec<u64> = db.load_blocks().unwrap().iter().map(|(h, _)| *h).collect();
        assert_eq!(heights, vec![1, 2, 256, 257]);
        assert_eq!(db.tip().unwrap(), Some(257));
        assert_eq!(db.anchor_at(256).unwrap(), Some(Hash32([0; 32])));
    }

    #[test]
    fn remove_tip_moves_tip_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path()).unwrap();
        db.put_block(1, &block(1), &Hash32([1; 32])).unwrap();
        db.put_block(2, &block(2), &Hash32([2; 32])).unwrap();
        db.remove_tip(2).unwrap();
        assert_eq!(db.tip().unwrap(), Some(1));
        assert_eq!(db.anchor_at(2).unwrap(), None);
        db.remove_tip(1).unwrap();
        assert_eq!(db.tip().unwrap(), None);
        assert!(db.load_blocks().unwrap().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = ChainDb::open(dir.path()).unwrap();
            db.put_block(1, &block(1), &Hash32([1; 32])).unwrap();
            db.flush().unwrap();
        }
        let db = ChainDb::open(dir.path()).unwrap();
        assert_eq!(db.load_blocks().unwrap(), vec![(1, block(1))]);
    }
}
