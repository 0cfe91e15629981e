//! Shared value types and on-disk codecs for the Aureus node.
//!
//! The coin record and its compressed serialization live here because both the
//! chain database and the validation layer need them; the codecs reproduce the
//! byte formats already present in deployed databases and must not change.

pub mod compress;
pub mod varint;

use bitcoin::{Script, ScriptBuf};
use std::io;

/// 1 AUR in its smallest unit.
pub const COIN: u64 = 100_000_000;

/// Upper bound on the money supply, in the smallest unit.
pub const MAX_MONEY: u64 = 21_000_000_000 * COIN;

/// Scripts above this size are unspendable by consensus.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Returns true if the script can provably never be spent.
///
/// Such outputs are pruned from the coin set instead of being stored.
pub fn is_unspendable(script: &Script) -> bool {
    script.is_op_return() || script.len() > MAX_SCRIPT_SIZE
}

/// Unspent transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    /// Transfer value in the smallest unit.
    pub amount: u64,
    /// Spending condition of the output.
    pub script_pubkey: ScriptBuf,
    /// Block height at which the containing transaction was included.
    pub height: u32,
    /// Whether the coin is from a coinbase transaction.
    pub is_coinbase: bool,
    /// Whether the coin is from a coinstake transaction.
    pub is_coinstake: bool,
}

impl Coin {
    /// Storage encoding: a varint code packing height and flags, followed by
    /// the compressed txout.
    ///
    /// `code = height << 2 | is_coinstake << 1 | is_coinbase`
    pub fn encode(&self) -> Vec<u8> {
        let code = u64::from(self.height) << 2
            | u64::from(self.is_coinstake) << 1
            | u64::from(self.is_coinbase);

        let mut data = Vec::with_capacity(16 + self.script_pubkey.len());
        varint::write_varint(&mut data, code).expect("writing to a Vec cannot fail");
        compress::write_compressed_txout(&mut data, self.amount, &self.script_pubkey)
            .expect("writing to a Vec cannot fail");
        data
    }

    /// Decodes a coin from its storage encoding.
    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut reader = bytes;
        let code = varint::read_varint(&mut reader)?;
        let height = u32::try_from(code >> 2)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "coin height out of range"))?;
        let (amount, script_pubkey) = compress::read_compressed_txout(&mut reader)?;

        Ok(Self {
            amount,
            script_pubkey,
            height,
            is_coinbase: code & 1 != 0,
            is_coinstake: code & 2 != 0,
        })
    }
}
