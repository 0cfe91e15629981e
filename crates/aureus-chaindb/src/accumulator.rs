//! The accumulator database: zerocoin spend records and per-denomination
//! checkpoint values, with a write-back cache in front of the checkpoints.

use crate::db::Database;
use crate::interrupt::Interrupt;
use crate::keys::{prefixed, DB_ACC_CHECKPOINT, DB_ACC_SPEND};
use crate::{Error, Result};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::Txid;
use rocksdb::WriteBatch;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// The fixed zerocoin denominations, in whole coins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Denomination {
    One = 1,
    Five = 5,
    Ten = 10,
    Fifty = 50,
    OneHundred = 100,
    FiveHundred = 500,
    OneThousand = 1000,
    FiveThousand = 5000,
}

impl Denomination {
    pub const ALL: [Self; 8] = [
        Self::One,
        Self::Five,
        Self::Ten,
        Self::Fifty,
        Self::OneHundred,
        Self::FiveHundred,
        Self::OneThousand,
        Self::FiveThousand,
    ];

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|d| *d as u32 == value)
    }
}

fn checkpoint_key(checksum: u32, denomination: Denomination) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(DB_ACC_CHECKPOINT);
    key.extend_from_slice(&checksum.to_be_bytes());
    key.extend_from_slice(&(denomination as u32).to_be_bytes());
    key
}

fn spend_key(serial: &[u8]) -> Vec<u8> {
    prefixed(
        DB_ACC_SPEND,
        sha256d::Hash::hash(serial).as_byte_array(),
    )
}

/// Persistent store for accumulator checkpoints and spent serials.
pub struct AccumulatorDb {
    db: Database,
}

impl AccumulatorDb {
    /// Opens (or creates) the accumulator database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    /// Records the block height at which `(checksum, denomination)` first
    /// appeared.
    pub fn write_checkpoint(
        &self,
        checksum: u32,
        denomination: Denomination,
        height: u32,
    ) -> Result<()> {
        self.db
            .put(&checkpoint_key(checksum, denomination), &height.to_le_bytes())
    }

    pub fn read_checkpoint(
        &self,
        checksum: u32,
        denomination: Denomination,
    ) -> Result<Option<u32>> {
        match self.db.get(&checkpoint_key(checksum, denomination))? {
            Some(bytes) => {
                let array: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corruption("malformed checkpoint height"))?;
                Ok(Some(u32::from_le_bytes(array)))
            }
            None => Ok(None),
        }
    }

    pub fn erase_checkpoint(&self, checksum: u32, denomination: Denomination) -> Result<()> {
        self.db.delete(&checkpoint_key(checksum, denomination))
    }

    /// Marks a batch of serials as spent, each linked to its spending
    /// transaction. Serials are keyed by their double-SHA256.
    pub fn write_spend_batch(&self, spends: &[(Vec<u8>, Txid)]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (serial, txid) in spends {
            batch.put(spend_key(serial), txid.to_byte_array());
        }
        tracing::debug!("Recording {} zerocoin spends", spends.len());
        self.db.write(batch)
    }

    /// Transaction that spent `serial`, if any.
    pub fn read_spend(&self, serial: &[u8]) -> Result<Option<Txid>> {
        match self.db.get(&spend_key(serial))? {
            Some(bytes) => {
                let array: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corruption("malformed spend record"))?;
                Ok(Some(Txid::from_byte_array(array)))
            }
            None => Ok(None),
        }
    }

    pub fn erase_spend(&self, serial: &[u8]) -> Result<()> {
        self.db.delete(&spend_key(serial))
    }

    /// Loads every stored checkpoint, keyed by `(checksum, denomination)`.
    pub fn read_all_checkpoints(
        &self,
        interrupt: &Interrupt,
    ) -> Result<HashMap<(u32, Denomination), u32>> {
        let mut checkpoints = HashMap::new();
        let mut iter = self.db.raw_iterator();
        iter.seek([DB_ACC_CHECKPOINT]);
        while iter.valid() {
            if interrupt.is_triggered() {
                return Err(Error::Interrupted);
            }
            let Some(key) = iter.key() else { break };
            if key.first() != Some(&DB_ACC_CHECKPOINT) || key.len() != 9 {
                break;
            }
            let checksum = u32::from_be_bytes(
                key[1..5]
                    .try_into()
                    .map_err(|_| Error::corruption("malformed checkpoint key"))?,
            );
            let denomination = u32::from_be_bytes(
                key[5..9]
                    .try_into()
                    .map_err(|_| Error::corruption("malformed checkpoint key"))?,
            );
            let denomination = Denomination::from_u32(denomination).ok_or_else(|| {
                Error::corruption(format!("unknown checkpoint denomination {denomination}"))
            })?;
            let value = iter
                .value()
                .ok_or_else(|| Error::corruption("missing checkpoint value"))?;
            let height: [u8; 4] = value
                .try_into()
                .map_err(|_| Error::corruption("malformed checkpoint height"))?;
            checkpoints.insert((checksum, denomination), u32::from_le_bytes(height));
            iter.next();
        }
        Ok(checkpoints)
    }

    /// Deletes every stored checkpoint in one batch.
    pub fn wipe_checkpoints(&self, interrupt: &Interrupt) -> Result<()> {
        let mut keys = Vec::new();
        let mut iter = self.db.raw_iterator();
        iter.seek([DB_ACC_CHECKPOINT]);
        while iter.valid() {
            if interrupt.is_triggered() {
                return Err(Error::Interrupted);
            }
            let Some(key) = iter.key() else { break };
            if key.first() != Some(&DB_ACC_CHECKPOINT) {
                break;
            }
            keys.push(key.to_vec());
            iter.next();
        }
        tracing::info!("Wiping {} accumulator checkpoints", keys.len());
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete(key);
        }
        self.db.write(batch)
    }
}

/// Write-back cache over the checkpoint table.
///
/// Lookups fall through to disk and promote the hit into memory; writes stay
/// in memory until [`flush`](Self::flush). `erase` removes from both layers
/// immediately so a dropped cache cannot resurrect a deleted checkpoint.
pub struct AccumulatorCache {
    db: Arc<AccumulatorDb>,
    checkpoints: HashMap<(u32, Denomination), u32>,
}

impl AccumulatorCache {
    pub fn new(db: Arc<AccumulatorDb>) -> Self {
        Self {
            db,
            checkpoints: HashMap::new(),
        }
    }

    /// Height for `(checksum, denomination)`, consulting memory first.
    pub fn get(&mut self, checksum: u32, denomination: Denomination) -> Result<Option<u32>> {
        if let Some(height) = self.checkpoints.get(&(checksum, denomination)) {
            return Ok(Some(*height));
        }
        match self.db.read_checkpoint(checksum, denomination)? {
            Some(height) => {
                self.checkpoints.insert((checksum, denomination), height);
                Ok(Some(height))
            }
            None => Ok(None),
        }
    }

    /// Sets the height in memory only; [`flush`](Self::flush) persists it.
    pub fn set(&mut self, checksum: u32, denomination: Denomination, height: u32) {
        self.checkpoints.insert((checksum, denomination), height);
    }

    /// Removes the checkpoint from memory and disk.
    pub fn erase(&mut self, checksum: u32, denomination: Denomination) -> Result<()> {
        self.checkpoints.remove(&(checksum, denomination));
        self.db.erase_checkpoint(checksum, denomination)
    }

    /// Persists every cached checkpoint.
    pub fn flush(&self) -> Result<()> {
        for ((checksum, denomination), height) in &self.checkpoints {
            self.db.write_checkpoint(*checksum, *denomination, *height)?;
        }
        Ok(())
    }

    /// Drops the cache and every stored checkpoint, for a rebuild from
    /// scratch.
    pub fn wipe(&mut self, interrupt: &Interrupt) -> Result<()> {
        self.checkpoints.clear();
        self.db.wipe_checkpoints(interrupt)
    }
}
