//! Compressed transaction-output codec.
//!
//! This is the format Bitcoin Core introduced for per-output coin records and
//! which Aureus inherited: amounts go through a decimal-exponent compression
//! and the common script templates (P2PKH, P2SH, P2PK) collapse to 21 or 33
//! bytes. Existing databases hold these bytes, so both directions must match
//! the reference implementation exactly.

use crate::varint::{read_varint, write_varint};
use crate::MAX_SCRIPT_SIZE;
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::{opcodes, PubkeyHash, PublicKey, Script, ScriptBuf, ScriptHash};
use std::io::{self, Read, Write};

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_EQUAL: u8 = 0x87;

/// Script encodings below this marker are the special templates.
const NUM_SPECIAL_SCRIPTS: u64 = 6;

// https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/compressor.cpp#L140
pub fn compress_amount(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut n = n;
    let mut e = 0u64;
    while n % 10 == 0 && e < 9 {
        n /= 10;
        e += 1;
    }
    if e < 9 {
        let d = n % 10;
        debug_assert!((1..=9).contains(&d));
        n /= 10;
        1 + (n * 9 + d - 1) * 10 + e
    } else {
        1 + (n - 1) * 10 + 9
    }
}

pub fn decompress_amount(x: u64) -> u64 {
    if x == 0 {
        return 0;
    }
    let mut x = x - 1;
    let e = x % 10;
    x /= 10;
    let mut n = if e < 9 {
        let d = x % 9 + 1;
        x /= 9;
        x * 10 + d
    } else {
        x + 1
    };
    for _ in 0..e {
        n *= 10;
    }
    n
}

fn to_key_id(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        Some(hash)
    } else {
        None
    }
}

fn to_script_id(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        Some(hash)
    } else {
        None
    }
}

enum PubKey {
    Compressed([u8; 33]),
    Uncompressed([u8; 65]),
}

fn to_pub_key(script: &[u8]) -> Option<PubKey> {
    if script.len() == 35
        && script[0] == 33
        && script[34] == OP_CHECKSIG
        && (script[1] == 0x02 || script[1] == 0x03)
    {
        let mut pubkey = [0u8; 33];
        pubkey.copy_from_slice(&script[1..34]);
        Some(PubKey::Compressed(pubkey))
    } else if script.len() == 67
        && script[0] == 65
        && script[66] == OP_CHECKSIG
        && script[1] == 0x04
    {
        // A point not on the curve is not compressible.
        let is_fully_valid = Script::from_bytes(script).p2pk_public_key().is_some();
        if is_fully_valid {
            let mut pubkey = [0u8; 65];
            pubkey.copy_from_slice(&script[1..66]);
            Some(PubKey::Uncompressed(pubkey))
        } else {
            None
        }
    } else {
        None
    }
}

fn compress_script(script: &[u8]) -> Option<Vec<u8>> {
    if let Some(hash) = to_key_id(script) {
        let mut out = Vec::with_capacity(21);
        out.push(0x00);
        out.extend(hash);
        return Some(out);
    }
    if let Some(hash) = to_script_id(script) {
        let mut out = Vec::with_capacity(21);
        out.push(0x01);
        out.extend(hash);
        return Some(out);
    }
    if let Some(pubkey) = to_pub_key(script) {
        let mut out = Vec::with_capacity(33);
        match pubkey {
            PubKey::Compressed(compressed) => {
                out.push(compressed[0]);
                out.extend_from_slice(&compressed[1..33]);
            }
            PubKey::Uncompressed(uncompressed) => {
                out.push(0x04 | uncompressed[64] & 0x01);
                out.extend_from_slice(&uncompressed[1..33]);
            }
        }
        return Some(out);
    }
    None
}

/// Writes a script in compressed form.
pub fn write_compressed_script<W: Write>(writer: &mut W, script: &Script) -> io::Result<()> {
    if let Some(compressed) = compress_script(script.as_bytes()) {
        writer.write_all(&compressed)?;
    } else {
        write_varint(writer, script.len() as u64 + NUM_SPECIAL_SCRIPTS)?;
        writer.write_all(script.as_bytes())?;
    }
    Ok(())
}

/// Reads a compressed script back into its full form.
///
/// Scripts that were too large to be valid come back as a minimal unspendable
/// script, matching the reference decoder.
pub fn read_compressed_script<R: Read>(reader: &mut R) -> io::Result<ScriptBuf> {
    let invalid = |msg| io::Error::new(io::ErrorKind::InvalidData, msg);

    let size = read_varint(reader)?;
    match size {
        0x00 => {
            // P2PKH
            let mut bytes = [0u8; 20];
            reader.read_exact(&mut bytes)?;
            let pubkey_hash =
                PubkeyHash::from_slice(&bytes).map_err(|_| invalid("bad hash160"))?;
            Ok(ScriptBuf::new_p2pkh(&pubkey_hash))
        }
        0x01 => {
            // P2SH
            let mut bytes = [0u8; 20];
            reader.read_exact(&mut bytes)?;
            let script_hash =
                ScriptHash::from_slice(&bytes).map_err(|_| invalid("bad hash160"))?;
            Ok(ScriptBuf::new_p2sh(&script_hash))
        }
        0x02 | 0x03 => {
            // P2PK, compressed key
            let mut bytes = [0u8; 32];
            reader.read_exact(&mut bytes)?;

            let mut script_bytes = Vec::with_capacity(35);
            script_bytes.push(opcodes::all::OP_PUSHBYTES_33.to_u8());
            script_bytes.push(size as u8);
            script_bytes.extend_from_slice(&bytes);
            script_bytes.push(opcodes::all::OP_CHECKSIG.to_u8());
            Ok(ScriptBuf::from_bytes(script_bytes))
        }
        0x04 | 0x05 => {
            // P2PK, uncompressed key stored compressed
            let mut bytes = [0u8; 32];
            reader.read_exact(&mut bytes)?;

            let mut compressed = Vec::with_capacity(33);
            compressed.push((size - 2) as u8);
            compressed.extend_from_slice(&bytes);

            let pubkey = PublicKey::from_slice(&compressed)
                .map_err(|_| invalid("compressed pubkey not on curve"))?;
            let uncompressed = pubkey.inner.serialize_uncompressed();

            let mut script_bytes = Vec::with_capacity(67);
            script_bytes.push(opcodes::all::OP_PUSHBYTES_65.to_u8());
            script_bytes.extend_from_slice(&uncompressed);
            script_bytes.push(opcodes::all::OP_CHECKSIG.to_u8());
            Ok(ScriptBuf::from_bytes(script_bytes))
        }
        _ => {
            let size = (size - NUM_SPECIAL_SCRIPTS) as usize;
            if size > MAX_SCRIPT_SIZE {
                // Oversized scripts are unspendable; discard the payload.
                let mut bytes = vec![0u8; size];
                reader.read_exact(&mut bytes)?;
                let script = Builder::new()
                    .push_opcode(opcodes::all::OP_RETURN)
                    .into_script();
                Ok(script)
            } else {
                let mut bytes = vec![0u8; size];
                reader.read_exact(&mut bytes)?;
                Ok(ScriptBuf::from_bytes(bytes))
            }
        }
    }
}

/// Writes a full txout (amount + script) in compressed form.
pub fn write_compressed_txout<W: Write>(
    writer: &mut W,
    amount: u64,
    script: &Script,
) -> io::Result<()> {
    write_varint(writer, compress_amount(amount))?;
    write_compressed_script(writer, script)
}

/// Reads a compressed txout.
pub fn read_compressed_txout<R: Read>(reader: &mut R) -> io::Result<(u64, ScriptBuf)> {
    let amount = decompress_amount(read_varint(reader)?);
    let script = read_compressed_script(reader)?;
    Ok((amount, script))
}
