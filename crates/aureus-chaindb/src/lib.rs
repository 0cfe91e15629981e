//! Durable chain-state storage for the Aureus node.
//!
//! Three rocksdb-backed stores make up the persistence layer:
//!
//! - [`CoinsDb`]: the authoritative UTXO set plus the best-block pointer,
//!   advanced one block at a time through a crash-recoverable multi-batch
//!   commit protocol.
//! - [`BlockTreeDb`]: per-block metadata, block-file bookkeeping and the
//!   optional transaction index, bulk-loaded into an in-memory tree at
//!   startup.
//! - [`AccumulatorDb`]: the legacy accumulator subsystem's namespace, fronted
//!   by the write-back [`AccumulatorCache`].
//!
//! All stores are single-writer: the caller serializes mutations behind its
//! own lock. Reads may run concurrently with each other but not with a
//! commit, a bulk load or the legacy upgrade.

mod accumulator;
mod block_index;
mod coins;
mod db;
mod error;
mod interrupt;
pub mod keys;
mod upgrade;

pub use accumulator::{AccumulatorCache, AccumulatorDb, Denomination};
pub use block_index::{
    BlockFileInfo, BlockIndexNode, BlockIndexRecord, BlockStatus, BlockTreeDb, NodeHandle,
    StakeFlags, TxPosition,
};
pub use coins::{
    CoinCacheEntry, CoinsCursor, CoinsDb, CoinsDbOptions, CoinsDiff, CrashHook,
    DEFAULT_BATCH_SIZE,
};
pub use error::{Error, Result};
pub use interrupt::Interrupt;
pub use upgrade::LegacyCoins;
