//! The block-tree database: per-block metadata, file bookkeeping and the
//! optional transaction index.

use crate::db::Database;
use crate::interrupt::Interrupt;
use crate::keys::{DbKey, DB_BLOCK_INDEX};
use crate::{Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, Target, TxMerkleNode, Txid};
use parking_lot::RwLock;
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

bitflags::bitflags! {
    /// Validation progress and data availability of one block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockStatus: u32 {
        const VALID_HEADER = 1;
        const VALID_TREE = 1 << 1;
        const VALID_CHAIN = 1 << 2;
        const VALID_SCRIPTS = 1 << 3;
        const HAVE_DATA = 1 << 4;
        const HAVE_UNDO = 1 << 5;
        const FAILED_VALID = 1 << 6;
        const FAILED_CHILD = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Proof-of-stake bookkeeping flags carried by each block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StakeFlags: u32 {
        const PROOF_OF_STAKE = 1;
        const STAKE_ENTROPY = 1 << 1;
        const STAKE_MODIFIER = 1 << 2;
    }
}

/// Per-block metadata as stored on disk, keyed by block hash.
///
/// Created once per observed header, then mutated in place as validation
/// advances; never deleted. `status` and `stake_flags` hold the raw bits of
/// [`BlockStatus`] and [`StakeFlags`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndexRecord {
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub height: u32,
    pub file: u32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub version: i32,
    pub merkle_root: TxMerkleNode,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub status: u32,
    pub tx_count: u32,
    /// Root of the shielded commitment tree after this block.
    pub shielded_root: [u8; 32],
    /// Accumulator checkpoint committed to by this block.
    pub accumulator_checkpoint: [u8; 32],
    pub stake_modifier: Vec<u8>,
    pub stake_flags: u32,
}

/// File bookkeeping for one append-only block data file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFileInfo {
    /// Number of blocks stored in the file.
    pub blocks: u32,
    /// Bytes used by block data.
    pub size: u32,
    /// Bytes used by undo data.
    pub undo_size: u32,
    pub height_first: u32,
    pub height_last: u32,
    pub time_first: u64,
    pub time_last: u64,
}

/// Location of one transaction within the block files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPosition {
    pub file: u32,
    /// Offset of the containing block within the file.
    pub data_pos: u32,
    /// Offset of the transaction within the block.
    pub tx_offset: u32,
}

/// Shared handle to an in-memory block tree node.
pub type NodeHandle = Arc<RwLock<BlockIndexNode>>;

/// In-memory node of the block tree, linked to its predecessor.
#[derive(Debug)]
pub struct BlockIndexNode {
    pub hash: BlockHash,
    pub prev: Option<NodeHandle>,
    pub height: u32,
    pub file: u32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub version: i32,
    pub merkle_root: TxMerkleNode,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub status: BlockStatus,
    pub tx_count: u32,
    pub shielded_root: [u8; 32],
    pub accumulator_checkpoint: [u8; 32],
    pub stake_modifier: Vec<u8>,
    pub stake_flags: StakeFlags,
}

impl BlockIndexNode {
    /// A blank node for `hash`, filled in by the bulk load.
    pub fn new(hash: BlockHash) -> Self {
        Self {
            hash,
            prev: None,
            height: 0,
            file: 0,
            data_pos: 0,
            undo_pos: 0,
            version: 0,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: 0,
            nonce: 0,
            status: BlockStatus::empty(),
            tx_count: 0,
            shielded_root: [0; 32],
            accumulator_checkpoint: [0; 32],
            stake_modifier: Vec::new(),
            stake_flags: StakeFlags::empty(),
        }
    }
}

/// Persistent block metadata store.
pub struct BlockTreeDb {
    db: Database,
}

impl BlockTreeDb {
    /// Opens (or creates) the block-tree database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    /// Upserts one block-index record.
    pub fn write_block_index(&self, record: &BlockIndexRecord) -> Result<()> {
        self.db.put(
            &DbKey::BlockIndex(record.hash).encode(),
            &bincode::serialize(record)?,
        )
    }

    pub fn read_block_index(&self, hash: &BlockHash) -> Result<Option<BlockIndexRecord>> {
        match self.db.get(&DbKey::BlockIndex(*hash).encode())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes file bookkeeping, the last-file counter and a set of
    /// block-index records in one synced atomic batch.
    ///
    /// Grouping them keeps the file bookkeeping and the index entries from
    /// ever being observed inconsistently after block data was appended.
    pub fn write_batch_sync(
        &self,
        file_infos: &[(u32, BlockFileInfo)],
        last_file: u32,
        blocks: &[BlockIndexRecord],
    ) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (file, info) in file_infos {
            batch.put(DbKey::BlockFile(*file).encode(), bincode::serialize(info)?);
        }
        batch.put(DbKey::LastBlockFile.encode(), last_file.to_le_bytes());
        for record in blocks {
            batch.put(
                DbKey::BlockIndex(record.hash).encode(),
                bincode::serialize(record)?,
            );
        }
        self.db.write_sync(batch)
    }

    pub fn read_block_file_info(&self, file: u32) -> Result<Option<BlockFileInfo>> {
        match self.db.get(&DbKey::BlockFile(file).encode())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn read_last_block_file(&self) -> Result<Option<u32>> {
        match self.db.get(&DbKey::LastBlockFile.encode())? {
            Some(bytes) => {
                let array: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corruption("malformed last-block-file counter"))?;
                Ok(Some(u32::from_le_bytes(array)))
            }
            None => Ok(None),
        }
    }

    /// Records whether a reindex is in progress, as presence of the marker.
    pub fn write_reindexing(&self, reindexing: bool) -> Result<()> {
        if reindexing {
            self.db.put(&DbKey::Reindexing.encode(), b"1")
        } else {
            self.db.delete(&DbKey::Reindexing.encode())
        }
    }

    pub fn read_reindexing(&self) -> Result<bool> {
        self.db.exists(&DbKey::Reindexing.encode())
    }

    pub fn read_tx_index(&self, txid: &Txid) -> Result<Option<TxPosition>> {
        match self.db.get(&DbKey::TxIndex(*txid).encode())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes a set of transaction-index entries in one atomic batch.
    pub fn write_tx_index(&self, positions: &[(Txid, TxPosition)]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (txid, position) in positions {
            batch.put(DbKey::TxIndex(*txid).encode(), bincode::serialize(position)?);
        }
        self.db.write(batch)
    }

    pub fn write_flag(&self, name: &str, value: bool) -> Result<()> {
        self.db.put(
            &DbKey::Flag(name.to_owned()).encode(),
            if value { b"1" } else { b"0" },
        )
    }

    pub fn read_flag(&self, name: &str) -> Result<Option<bool>> {
        match self.db.get(&DbKey::Flag(name.to_owned()).encode())? {
            Some(bytes) => Ok(Some(bytes.as_slice() == b"1")),
            None => Ok(None),
        }
    }

    pub fn write_int(&self, name: &str, value: i64) -> Result<()> {
        self.db
            .put(&DbKey::Int(name.to_owned()).encode(), &value.to_le_bytes())
    }

    pub fn read_int(&self, name: &str) -> Result<Option<i64>> {
        match self.db.get(&DbKey::Int(name.to_owned()).encode())? {
            Some(bytes) => {
                let array: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corruption(format!("malformed integer record {name}")))?;
                Ok(Some(i64::from_le_bytes(array)))
            }
            None => Ok(None),
        }
    }

    /// Reconstructs the in-memory block tree from every stored record, in
    /// block-hash key order. Runs once at startup, before new blocks are
    /// accepted.
    ///
    /// `resolve` obtains or creates the node for a hash and must be
    /// idempotent: the same hash always yields the same node. Each record's
    /// node gets its predecessor link and scalar fields populated. Genesis
    /// records (all-zero `prev_hash`) keep `prev = None`.
    ///
    /// Until `pos_active` reports the proof-of-stake activation at a record's
    /// height, the stored header's proof of work is re-verified; a failure is
    /// fatal and means the index must be rebuilt from primary block data.
    pub fn load_block_index_guts(
        &self,
        interrupt: &Interrupt,
        pos_active: impl Fn(u32) -> bool,
        mut resolve: impl FnMut(BlockHash) -> NodeHandle,
    ) -> Result<()> {
        let mut iter = self.db.raw_iterator();
        iter.seek([DB_BLOCK_INDEX]);

        let mut loaded = 0u64;
        while iter.valid() {
            if interrupt.is_triggered() {
                return Err(Error::Interrupted);
            }
            let Some(key) = iter.key() else { break };
            if key.first() != Some(&DB_BLOCK_INDEX) {
                break;
            }
            let hash = DbKey::decode_block_index(key)
                .ok_or_else(|| Error::corruption("malformed block index key"))?;
            let value = iter
                .value()
                .ok_or_else(|| Error::corruption(format!("missing block index value for {hash}")))?;
            let record: BlockIndexRecord = bincode::deserialize(value)?;
            if record.hash != hash {
                return Err(Error::corruption(format!(
                    "block index key {hash} does not match record hash {}",
                    record.hash
                )));
            }

            if !pos_active(record.height) {
                let target = Target::from_compact(CompactTarget::from_consensus(record.bits));
                if !target.is_met_by(hash) {
                    return Err(Error::corruption(format!(
                        "proof of work check failed for block {hash} at height {}",
                        record.height
                    )));
                }
            }

            let node = resolve(hash);
            let prev = (record.prev_hash != BlockHash::all_zeros())
                .then(|| resolve(record.prev_hash));
            let mut node = node.write();
            node.prev = prev;
            node.height = record.height;
            node.file = record.file;
            node.data_pos = record.data_pos;
            node.undo_pos = record.undo_pos;
            node.version = record.version;
            node.merkle_root = record.merkle_root;
            node.time = record.time;
            node.bits = record.bits;
            node.nonce = record.nonce;
            node.status = BlockStatus::from_bits_retain(record.status);
            node.tx_count = record.tx_count;
            node.shielded_root = record.shielded_root;
            node.accumulator_checkpoint = record.accumulator_checkpoint;
            node.stake_modifier = record.stake_modifier.clone();
            node.stake_flags = StakeFlags::from_bits_retain(record.stake_flags);
            drop(node);

            loaded += 1;
            iter.next();
        }

        tracing::info!("Loaded {loaded} block index entries");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, BlockTreeDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = BlockTreeDb::open(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn test_flag_and_int_roundtrip() {
        let (_dir, db) = open_temp();
        assert_eq!(db.read_flag("txindex").unwrap(), None);
        db.write_flag("txindex", true).unwrap();
        assert_eq!(db.read_flag("txindex").unwrap(), Some(true));
        db.write_flag("txindex", false).unwrap();
        assert_eq!(db.read_flag("txindex").unwrap(), Some(false));

        assert_eq!(db.read_int("version").unwrap(), None);
        db.write_int("version", -42).unwrap();
        assert_eq!(db.read_int("version").unwrap(), Some(-42));
    }

    #[test]
    fn test_reindexing_is_presence_of_marker() {
        let (_dir, db) = open_temp();
        assert!(!db.read_reindexing().unwrap());
        db.write_reindexing(true).unwrap();
        assert!(db.read_reindexing().unwrap());
        db.write_reindexing(false).unwrap();
        assert!(!db.read_reindexing().unwrap());
    }

    #[test]
    fn test_tx_index_roundtrip() {
        let (_dir, db) = open_temp();
        let txid = Txid::from_byte_array([7; 32]);
        let position = TxPosition {
            file: 3,
            data_pos: 1024,
            tx_offset: 81,
        };
        db.write_tx_index(&[(txid, position)]).unwrap();
        assert_eq!(db.read_tx_index(&txid).unwrap(), Some(position));
        assert_eq!(
            db.read_tx_index(&Txid::from_byte_array([8; 32])).unwrap(),
            None
        );
    }

    #[test]
    fn test_file_info_and_last_file() {
        let (_dir, db) = open_temp();
        let info = BlockFileInfo {
            blocks: 12,
            size: 4096,
            undo_size: 512,
            height_first: 100,
            height_last: 111,
            time_first: 1_600_000_000,
            time_last: 1_600_001_000,
        };
        db.write_batch_sync(&[(0, info)], 0, &[]).unwrap();
        assert_eq!(db.read_block_file_info(0).unwrap(), Some(info));
        assert_eq!(db.read_block_file_info(1).unwrap(), None);
        assert_eq!(db.read_last_block_file().unwrap(), Some(0));
    }
}
