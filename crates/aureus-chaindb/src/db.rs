//! Thin wrapper over one rocksdb instance.
//!
//! Each store owns its own instance and key space; batches are the only
//! multi-key durability primitive, applied atomically by rocksdb.

use crate::Result;
use rocksdb::{properties, DBRawIterator, Options, WriteBatch, WriteOptions, DB};
use std::path::Path;

pub(crate) struct Database {
    db: DB,
}

impl Database {
    /// Opens (or creates) the database at `path`.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    /// Existence check without materializing the value.
    pub(crate) fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.db.get_pinned(key)?.is_some())
    }

    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put(key, value)?)
    }

    pub(crate) fn delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.db.delete(key)?)
    }

    /// Applies `batch` atomically: all keys become durable together or not at
    /// all.
    pub(crate) fn write(&self, batch: WriteBatch) -> Result<()> {
        Ok(self.db.write(batch)?)
    }

    /// Like [`write`](Self::write), but fsyncs before returning.
    pub(crate) fn write_sync(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        Ok(self.db.write_opt(batch, &opts)?)
    }

    pub(crate) fn raw_iterator(&self) -> DBRawIterator<'_> {
        self.db.raw_iterator()
    }

    /// Approximate number of keys in the instance. Cheap, not exact.
    pub(crate) fn estimate_num_keys(&self) -> Result<u64> {
        Ok(self
            .db
            .property_int_value(properties::ESTIMATE_NUM_KEYS)?
            .unwrap_or(0))
    }
}
