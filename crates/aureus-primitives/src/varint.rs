//! Bitcoin-Core-style variable-length integers.
//!
//! This is the MSB-first base-128 format from Core's serialize.h, not the
//! CompactSize used on the P2P wire: every continuation step subtracts one, so
//! each value has exactly one encoding. Database keys embed these bytes
//! directly, so iteration order over keys is the encoded byte order.
//!
//! https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/serialize.h#L370

use std::io::{self, Read, Write};

/// Writes `n` in Core's varint format.
pub fn write_varint<W: Write>(writer: &mut W, mut n: u64) -> io::Result<()> {
    // 10 bytes cover the full u64 range at 7 bits per byte.
    let mut tmp = [0u8; 10];
    let mut len = 0;
    loop {
        tmp[len] = (n & 0x7F) as u8 | if len > 0 { 0x80 } else { 0x00 };
        if n <= 0x7F {
            break;
        }
        n = (n >> 7) - 1;
        len += 1;
    }
    // Bytes were produced least significant first.
    for i in (0..=len).rev() {
        writer.write_all(&[tmp[i]])?;
    }
    Ok(())
}

/// Reads a Core-format varint, rejecting encodings that overflow u64.
pub fn read_varint<R: Read>(reader: &mut R) -> io::Result<u64> {
    let overflow = || io::Error::new(io::ErrorKind::InvalidData, "varint overflows u64");

    let mut n: u64 = 0;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        let b = byte[0];

        if n > u64::MAX >> 7 {
            return Err(overflow());
        }
        n = n << 7 | u64::from(b & 0x7F);

        if b & 0x80 != 0 {
            n = n.checked_add(1).ok_or_else(overflow)?;
        } else {
            return Ok(n);
        }
    }
}
