//! One-shot migration of per-transaction coin records to the per-output
//! format.
//!
//! Old databases store one record per transaction with unspent outputs,
//! keyed `'c' ‖ txid`. The pass below rewrites each of them into individual
//! per-output records and deletes the original, batching the writes so a
//! mid-migration crash leaves the store scannable and the pass restartable.

use crate::coins::CoinsDb;
use crate::interrupt::Interrupt;
use crate::keys::{DbKey, DB_COINS};
use crate::{Error, Result};
use aureus_primitives::varint::read_varint;
use aureus_primitives::{compress, is_unspendable, Coin};
use bitcoin::OutPoint;
use rocksdb::WriteBatch;
use std::io::{self, Read};

/// Decoded legacy per-transaction coin record.
///
/// `outputs[i]` is `None` for an output already spent when the record was
/// written. Trailing spent outputs were truncated by the legacy encoder, so
/// `outputs.len()` is the index of the last unspent output plus one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyCoins {
    pub is_coinbase: bool,
    pub is_coinstake: bool,
    pub outputs: Vec<Option<(u64, bitcoin::ScriptBuf)>>,
    pub height: u32,
}

impl LegacyCoins {
    /// Decodes the legacy record layout:
    ///
    /// ```text
    /// varint(version) ‖ varint(code) ‖ mask bytes ‖ compressed txouts ‖ varint(height)
    /// ```
    ///
    /// `code` packs the coinbase flag (bit 0), the coinstake flag (bit 1) and
    /// the presence of the first two outputs (bits 2 and 3); the remaining
    /// bits count the non-zero mask bytes that describe outputs two onward.
    /// A zero mask byte extends the presence vector without being counted,
    /// which lets the count stay small for sparse records.
    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut reader = bytes;

        // Serialization version, unused since the format was introduced.
        let _version = read_varint(&mut reader)?;
        let code = read_varint(&mut reader)?;
        let is_coinbase = code & 1 != 0;
        let is_coinstake = code & 2 != 0;

        let mut available = vec![code & 4 != 0, code & 8 != 0];
        let mut nonzero_mask_bytes = code / 16 + u64::from(code & 12 == 0);
        while nonzero_mask_bytes > 0 {
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte)?;
            for bit in 0..8 {
                available.push(byte[0] & (1 << bit) != 0);
            }
            if byte[0] != 0 {
                nonzero_mask_bytes -= 1;
            }
        }

        let mut outputs = Vec::with_capacity(available.len());
        for present in available {
            if present {
                outputs.push(Some(compress::read_compressed_txout(&mut reader)?));
            } else {
                outputs.push(None);
            }
        }
        // Drop spent outputs past the last unspent one; the encoder never
        // wrote mask bits for them, only the byte padding above did.
        while outputs.last() == Some(&None) {
            outputs.pop();
        }

        let height = read_varint(&mut reader)?;
        let height = u32::try_from(height)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "height out of range"))?;

        Ok(Self {
            is_coinbase,
            is_coinstake,
            outputs,
            height,
        })
    }
}

impl CoinsDb {
    /// Migrates every legacy per-transaction record into per-output records.
    ///
    /// Idempotent and restartable: each batch deletes the legacy records it
    /// rewrote, so a rerun only sees what is left. Provably unspendable
    /// outputs are dropped rather than migrated. Returns without touching
    /// anything when no legacy records exist.
    pub fn upgrade(&self, interrupt: &Interrupt) -> Result<()> {
        let mut iter = self.db.raw_iterator();
        iter.seek([DB_COINS]);
        if !iter.valid() || iter.key().and_then(|k| k.first()) != Some(&DB_COINS) {
            return Ok(());
        }

        tracing::info!("Upgrading coin database to per-output records, this may take a while");

        let mut batch = WriteBatch::default();
        let mut migrated = 0u64;
        while iter.valid() {
            if interrupt.is_triggered() {
                return Err(Error::Interrupted);
            }
            let Some(key) = iter.key() else { break };
            if key.first() != Some(&DB_COINS) {
                break;
            }
            let txid = DbKey::decode_legacy_coins(key)
                .ok_or_else(|| Error::corruption("malformed legacy coin key"))?;
            let value = iter
                .value()
                .ok_or_else(|| Error::corruption(format!("missing legacy record for {txid}")))?;
            let legacy = LegacyCoins::decode(value)
                .map_err(|e| Error::corruption(format!("undecodable legacy record {txid}: {e}")))?;

            for (vout, output) in legacy.outputs.iter().enumerate() {
                let Some((amount, script_pubkey)) = output else {
                    continue;
                };
                if is_unspendable(script_pubkey) {
                    continue;
                }
                let coin = Coin {
                    amount: *amount,
                    script_pubkey: script_pubkey.clone(),
                    height: legacy.height,
                    is_coinbase: legacy.is_coinbase,
                    is_coinstake: legacy.is_coinstake,
                };
                let outpoint = OutPoint {
                    txid,
                    vout: vout as u32,
                };
                batch.put(DbKey::Coin(outpoint).encode(), coin.encode());
            }
            batch.delete(key);
            migrated += 1;

            if batch.size_in_bytes() > self.options.batch_size {
                tracing::debug!(
                    "Writing partial migration batch of {:.2} MiB",
                    batch.size_in_bytes() as f64 / 1048576.0
                );
                self.db.write(std::mem::take(&mut batch))?;
            }
            iter.next();
        }

        self.db.write(batch)?;
        tracing::info!("Migrated {migrated} legacy coin records");
        Ok(())
    }
}
