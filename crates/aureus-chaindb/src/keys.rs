//! The tagged key spaces of the chain databases.
//!
//! Every record key starts with a single tag byte. The byte values are fixed
//! by databases already in the field and must be preserved bit for bit.
//! Iteration order over a tag's domain is the order of the encoded bytes.

use aureus_primitives::varint::{read_varint, write_varint};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};

/// Per-output coin record.
pub const DB_COIN: u8 = b'C';
/// Legacy per-transaction coin record.
pub const DB_COINS: u8 = b'c';
/// Block-file-info record.
pub const DB_BLOCK_FILES: u8 = b'f';
/// Transaction-index record.
pub const DB_TXINDEX: u8 = b't';
/// Block-index record.
pub const DB_BLOCK_INDEX: u8 = b'b';
/// Best-block pointer (singleton).
pub const DB_BEST_BLOCK: u8 = b'B';
/// Head-blocks transition marker (singleton).
pub const DB_HEAD_BLOCKS: u8 = b'H';
/// Generic named boolean flag.
pub const DB_FLAG: u8 = b'F';
/// Reindex-in-progress marker (singleton).
pub const DB_REINDEX_FLAG: u8 = b'R';
/// Last-block-file counter (singleton).
pub const DB_LAST_BLOCK: u8 = b'l';
/// Generic named integer.
pub const DB_INT: u8 = b'I';
/// Accumulator spend record (accumulator namespace).
pub const DB_ACC_SPEND: u8 = b's';
/// Accumulator checkpoint record (accumulator namespace).
pub const DB_ACC_CHECKPOINT: u8 = b'A';

/// A fully-specified record key in the coin or block-tree database.
///
/// The encoding is deterministic, so prefix filtering and iteration order
/// fall out of the byte representation rather than convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbKey {
    /// Per-output coin record: `'C' ‖ txid ‖ varint(vout)`.
    Coin(OutPoint),
    /// Legacy per-transaction coin record: `'c' ‖ txid`.
    LegacyCoins(Txid),
    /// Block data file bookkeeping: `'f' ‖ file id (be)`.
    BlockFile(u32),
    /// Transaction index entry: `'t' ‖ txid`.
    TxIndex(Txid),
    /// Block index record: `'b' ‖ block hash`.
    BlockIndex(BlockHash),
    /// Best-block pointer.
    BestBlock,
    /// In-progress coin-set transition marker.
    HeadBlocks,
    /// Named boolean flag: `'F' ‖ name`.
    Flag(String),
    /// Reindex-in-progress marker.
    Reindexing,
    /// Last block file counter.
    LastBlockFile,
    /// Named integer: `'I' ‖ name`.
    Int(String),
}

impl DbKey {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Coin(outpoint) => {
                let mut key = Vec::with_capacity(38);
                key.push(DB_COIN);
                key.extend_from_slice(&outpoint.txid.to_byte_array());
                write_varint(&mut key, u64::from(outpoint.vout))
                    .expect("writing to a Vec cannot fail");
                key
            }
            Self::LegacyCoins(txid) => prefixed(DB_COINS, &txid.to_byte_array()),
            Self::BlockFile(file) => prefixed(DB_BLOCK_FILES, &file.to_be_bytes()),
            Self::TxIndex(txid) => prefixed(DB_TXINDEX, &txid.to_byte_array()),
            Self::BlockIndex(hash) => prefixed(DB_BLOCK_INDEX, &hash.to_byte_array()),
            Self::BestBlock => vec![DB_BEST_BLOCK],
            Self::HeadBlocks => vec![DB_HEAD_BLOCKS],
            Self::Flag(name) => prefixed(DB_FLAG, name.as_bytes()),
            Self::Reindexing => vec![DB_REINDEX_FLAG],
            Self::LastBlockFile => vec![DB_LAST_BLOCK],
            Self::Int(name) => prefixed(DB_INT, name.as_bytes()),
        }
    }

    /// Decodes a coin key back into its outpoint.
    ///
    /// Returns `None` if `bytes` is not a well-formed coin key.
    pub fn decode_coin(bytes: &[u8]) -> Option<OutPoint> {
        let rest = bytes.strip_prefix(&[DB_COIN])?;
        if rest.len() < 32 {
            return None;
        }
        let (hash, vout_bytes) = rest.split_at(32);
        let txid = Txid::from_byte_array(hash.try_into().ok()?);
        let mut reader = vout_bytes;
        let vout = read_varint(&mut reader).ok()?;
        if !reader.is_empty() {
            return None;
        }
        Some(OutPoint {
            txid,
            vout: u32::try_from(vout).ok()?,
        })
    }

    /// Txid of a legacy per-transaction record key.
    pub fn decode_legacy_coins(bytes: &[u8]) -> Option<Txid> {
        let rest = bytes.strip_prefix(&[DB_COINS])?;
        Some(Txid::from_byte_array(rest.try_into().ok()?))
    }

    /// Block hash of a block index key.
    pub fn decode_block_index(bytes: &[u8]) -> Option<BlockHash> {
        let rest = bytes.strip_prefix(&[DB_BLOCK_INDEX])?;
        Some(BlockHash::from_byte_array(rest.try_into().ok()?))
    }
}

pub(crate) fn prefixed(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + body.len());
    key.push(tag);
    key.extend_from_slice(body);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([byte; 32]),
            vout,
        }
    }

    #[test]
    fn test_coin_key_roundtrip() {
        for vout in [0, 1, 127, 128, 300, u32::MAX] {
            let op = outpoint(0xAB, vout);
            let key = DbKey::Coin(op).encode();
            assert_eq!(key[0], DB_COIN);
            assert_eq!(DbKey::decode_coin(&key), Some(op));
        }
    }

    #[test]
    fn test_coin_keys_order_by_txid_then_vout() {
        let a = DbKey::Coin(outpoint(0x01, 5)).encode();
        let b = DbKey::Coin(outpoint(0x02, 0)).encode();
        let c = DbKey::Coin(outpoint(0x02, 1)).encode();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_singleton_keys_are_single_bytes() {
        assert_eq!(DbKey::BestBlock.encode(), vec![b'B']);
        assert_eq!(DbKey::HeadBlocks.encode(), vec![b'H']);
        assert_eq!(DbKey::Reindexing.encode(), vec![b'R']);
        assert_eq!(DbKey::LastBlockFile.encode(), vec![b'l']);
    }

    #[test]
    fn test_decode_rejects_foreign_prefixes() {
        let key = DbKey::LegacyCoins(Txid::from_byte_array([9; 32])).encode();
        assert_eq!(key.len(), 33);
        assert!(DbKey::decode_coin(&key).is_none());
        assert!(DbKey::decode_legacy_coins(&key).is_some());
    }
}
