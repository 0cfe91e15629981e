//! The coin database: the authoritative UTXO set and the best-block pointer.

use crate::db::Database;
use crate::keys::{DbKey, DB_COIN};
use crate::{Error, Result};
use aureus_primitives::Coin;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint};
use rocksdb::WriteBatch;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Default upper bound on one batch write, in estimated serialized bytes.
pub const DEFAULT_BATCH_SIZE: usize = 1 << 24;

/// Fault-injection point for crash testing.
///
/// Invoked after every intermediate batch flush during a commit; returning
/// true makes the commit abort as if the process had died at that point.
pub type CrashHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Tuning knobs for [`CoinsDb`].
#[derive(Clone)]
pub struct CoinsDbOptions {
    /// Flush the pending batch once its estimated size exceeds this.
    pub batch_size: usize,
    /// Test-only crash injection, see [`CrashHook`].
    pub crash_hook: Option<CrashHook>,
}

impl Default for CoinsDbOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            crash_hook: None,
        }
    }
}

/// One entry of an in-memory coin diff.
///
/// `coin: None` marks the output as spent. Entries not flagged dirty carry no
/// change and are skipped by [`CoinsDb::commit`].
#[derive(Debug, Clone)]
pub struct CoinCacheEntry {
    pub coin: Option<Coin>,
    pub dirty: bool,
}

impl CoinCacheEntry {
    /// A created or modified coin.
    pub fn updated(coin: Coin) -> Self {
        Self {
            coin: Some(coin),
            dirty: true,
        }
    }

    /// A spent coin, to be erased.
    pub fn spent() -> Self {
        Self {
            coin: None,
            dirty: true,
        }
    }
}

/// Per-block diff of the coin set, keyed by outpoint.
pub type CoinsDiff = HashMap<OutPoint, CoinCacheEntry>;

/// Persistent UTXO set, advanced one block at a time by [`commit`].
///
/// Single writer: callers serialize `commit` and the upgrade pass behind the
/// chain-state lock. Reads may run concurrently with each other.
///
/// [`commit`]: Self::commit
pub struct CoinsDb {
    pub(crate) db: Database,
    pub(crate) options: CoinsDbOptions,
}

impl CoinsDb {
    /// Opens (or creates) the coin database at `path`.
    pub fn open(path: &Path, options: CoinsDbOptions) -> Result<Self> {
        Ok(Self {
            db: Database::open(path)?,
            options,
        })
    }

    /// Looks up an unspent output.
    pub fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        match self.db.get(&DbKey::Coin(*outpoint).encode())? {
            Some(bytes) => Coin::decode(&bytes)
                .map(Some)
                .map_err(|e| Error::corruption(format!("undecodable coin record: {e}"))),
            None => Ok(None),
        }
    }

    /// Existence check, without deserializing the coin.
    pub fn have_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        self.db.exists(&DbKey::Coin(*outpoint).encode())
    }

    /// Hash of the block whose effects are fully reflected in the coin set.
    ///
    /// `None` when the store is empty or a transition is in progress.
    pub fn best_block(&self) -> Result<Option<BlockHash>> {
        match self.db.get(&DbKey::BestBlock.encode())? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// The `(new_tip, old_tip)` transition marker.
    ///
    /// Present only while a commit is underway; observing it after a restart
    /// means the previous commit was interrupted. A zero `old_tip` means the
    /// interrupted transition started from an empty store.
    pub fn head_blocks(&self) -> Result<Option<(BlockHash, BlockHash)>> {
        match self.db.get(&DbKey::HeadBlocks.encode())? {
            Some(bytes) if bytes.len() == 64 => {
                let new_tip = decode_hash(&bytes[..32])?;
                let old_tip = decode_hash(&bytes[32..])?;
                Ok(Some((new_tip, old_tip)))
            }
            Some(_) => Err(Error::corruption("malformed head-blocks marker")),
            None => Ok(None),
        }
    }

    /// Advances the coin set to `new_tip`, applying `diff` atomically as one
    /// logical step that may span several physical batch writes.
    ///
    /// The first batch erases the best-block pointer and writes the
    /// head-blocks marker; batches apply in order, so once any coin write is
    /// durable the marker is too. The final batch erases the marker and
    /// publishes `new_tip`. If the process dies in between, re-running the
    /// commit with the identical diff converges to the same coin set.
    ///
    /// A failed batch write is fatal and surfaces to the caller; there is no
    /// safe partial-failure mode past a durability error.
    pub fn commit(&self, diff: CoinsDiff, new_tip: BlockHash) -> Result<()> {
        let mut old_tip = self.best_block()?;
        if old_tip.is_none() {
            // We may be resuming after a crash mid-transition.
            if let Some((marker_new, marker_old)) = self.head_blocks()? {
                if marker_new != new_tip {
                    return Err(Error::corruption(format!(
                        "interrupted transition targets {marker_new}, cannot commit {new_tip}"
                    )));
                }
                old_tip = Some(marker_old);
            }
        }

        let mut batch = WriteBatch::default();

        // Mark the database as being in the middle of a transition from
        // old_tip to new_tip.
        batch.delete(DbKey::BestBlock.encode());
        batch.put(
            DbKey::HeadBlocks.encode(),
            encode_head_blocks(new_tip, old_tip.unwrap_or_else(BlockHash::all_zeros)),
        );

        let mut count = 0usize;
        let mut changed = 0usize;
        for (outpoint, entry) in diff {
            count += 1;
            if !entry.dirty {
                continue;
            }
            changed += 1;
            let key = DbKey::Coin(outpoint).encode();
            match entry.coin {
                Some(coin) => batch.put(key, coin.encode()),
                None => batch.delete(key),
            }
            if batch.size_in_bytes() > self.options.batch_size {
                tracing::debug!(
                    "Writing partial batch of {:.2} MiB",
                    batch.size_in_bytes() as f64 / 1048576.0
                );
                self.db.write(std::mem::take(&mut batch))?;
                if let Some(crash_hook) = &self.options.crash_hook {
                    if crash_hook() {
                        tracing::warn!("Simulating a crash after a partial batch write");
                        return Err(Error::CrashSimulated);
                    }
                }
            }
        }

        // The final batch removes the marker and publishes the new tip.
        batch.delete(DbKey::HeadBlocks.encode());
        batch.put(DbKey::BestBlock.encode(), new_tip.to_byte_array());
        tracing::debug!(
            "Writing final batch of {:.2} MiB",
            batch.size_in_bytes() as f64 / 1048576.0
        );
        self.db.write(batch)?;
        tracing::debug!("Committed {changed} changed transaction outputs (out of {count}) to coin database");
        Ok(())
    }

    /// Approximate number of coin records. For cache-sizing heuristics only;
    /// the estimate is not authoritative.
    pub fn estimate_size(&self) -> Result<u64> {
        self.db.estimate_num_keys()
    }

    /// Forward-only, single-use cursor over the coin records in key order.
    ///
    /// Must not be used concurrently with [`commit`](Self::commit).
    pub fn cursor(&self) -> CoinsCursor<'_> {
        CoinsCursor::new(&self.db)
    }
}

fn encode_head_blocks(new_tip: BlockHash, old_tip: BlockHash) -> Vec<u8> {
    let mut value = Vec::with_capacity(64);
    value.extend_from_slice(&new_tip.to_byte_array());
    value.extend_from_slice(&old_tip.to_byte_array());
    value
}

fn decode_hash(bytes: &[u8]) -> Result<BlockHash> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::corruption("malformed block hash record"))?;
    Ok(BlockHash::from_byte_array(array))
}

/// Ordered cursor over the coin records, positioned at the first coin key.
///
/// Becomes invalid once iteration passes the end of the coin domain.
pub struct CoinsCursor<'a> {
    iter: rocksdb::DBRawIterator<'a>,
}

impl<'a> CoinsCursor<'a> {
    fn new(db: &'a Database) -> Self {
        let mut iter = db.raw_iterator();
        iter.seek([DB_COIN]);
        Self { iter }
    }

    pub fn valid(&self) -> bool {
        self.iter.valid()
            && self
                .iter
                .key()
                .is_some_and(|key| key.first() == Some(&DB_COIN))
    }

    /// Outpoint under the cursor, `None` once invalid.
    pub fn key(&self) -> Option<OutPoint> {
        if !self.valid() {
            return None;
        }
        DbKey::decode_coin(self.iter.key()?)
    }

    /// Coin under the cursor. Only meaningful while [`valid`](Self::valid).
    pub fn value(&self) -> Result<Coin> {
        let bytes = self
            .iter
            .value()
            .ok_or_else(|| Error::corruption("cursor has no value"))?;
        Coin::decode(bytes).map_err(|e| Error::corruption(format!("undecodable coin record: {e}")))
    }

    pub fn next(&mut self) {
        self.iter.next();
    }
}

impl Iterator for CoinsCursor<'_> {
    type Item = Result<(OutPoint, Coin)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.valid() {
            return None;
        }
        let item = match self.key() {
            Some(outpoint) => self.value().map(|coin| (outpoint, coin)),
            None => Err(Error::corruption("undecodable coin key")),
        };
        self.iter.next();
        Some(item)
    }
}
