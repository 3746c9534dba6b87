//! Radix64 Codec
//!
//! Maps 6-bit values onto 64 printable ASCII symbols so register data can
//! travel over a characteristic that only carries printable text.
//!
//! ```text
//! value:   0..9   10..35   36..61   62   63
//! symbol:  0..9   a..z     A..Z     +    -
//! ```
//!
//! Multi-symbol values are written most significant symbol first:
//!
//! | width   | symbols | spare bits in the leading symbol |
//! |---------|---------|----------------------------------|
//! | 8 bits  | 2       | 4 (return code)                  |
//! | 12 bits | 2       | 0                                |
//! | 16 bits | 3       | 2 (return code)                  |
//! | 32 bits | 6       | 4 (return code)                  |

use crate::error::{ParseError, ProtocolError};

/// Symbol for each 6-bit value
pub const ALPHABET: &[u8; 64] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ+-";

const DECODE_TABLE: [u8; 256] = build_decode_table();

const fn build_decode_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < ALPHABET.len() {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
}

/// Widths a value can be packed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitWidth {
    Bits8,
    Bits12,
    Bits16,
    Bits32,
}

impl BitWidth {
    pub fn from_bits(bits: u32) -> Result<Self, ProtocolError> {
        match bits {
            8 => Ok(Self::Bits8),
            12 => Ok(Self::Bits12),
            16 => Ok(Self::Bits16),
            32 => Ok(Self::Bits32),
            other => Err(ProtocolError::UnsupportedBits(other)),
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits8 => 8,
            Self::Bits12 => 12,
            Self::Bits16 => 16,
            Self::Bits32 => 32,
        }
    }

    /// Number of symbols a value of this width occupies
    pub const fn symbols(self) -> usize {
        match self {
            Self::Bits8 | Self::Bits12 => 2,
            Self::Bits16 => 3,
            Self::Bits32 => 6,
        }
    }

    pub const fn max_value(self) -> u32 {
        match self {
            Self::Bits32 => u32::MAX,
            other => (1 << other.bits()) - 1,
        }
    }

    /// Spare bits above the most significant symbol's payload
    pub const fn code_bits(self) -> u32 {
        match self {
            Self::Bits8 | Self::Bits32 => 4,
            Self::Bits12 => 0,
            Self::Bits16 => 2,
        }
    }
}

/// A decoded value together with the spare bits that preceded it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub value: u32,
    pub extra: u8,
}

/// Symbol for the low 6 bits of `value`
pub fn to_symbol(value: u8) -> u8 {
    ALPHABET[(value & 0x3F) as usize]
}

/// 6-bit value of a symbol. Bytes outside the alphabet map to 0.
pub fn from_symbol(byte: u8) -> u8 {
    DECODE_TABLE[byte as usize]
}

pub fn is_symbol(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'+' || byte == b'-'
}

/// Encode `value` as `width.symbols()` symbols. Bits above the width are dropped.
pub fn encode(width: BitWidth, value: u32) -> String {
    let mut out = String::with_capacity(width.symbols());
    push_value(&mut out, width, value, 0);
    out
}

/// Encode `value` with a return code in the leading symbol's spare bits.
///
/// This is the device-side form used in read responses. Width 12 has no
/// spare bits and ignores `code`.
pub fn encode_with_code(width: BitWidth, value: u32, code: u8) -> String {
    let mut out = String::with_capacity(width.symbols());
    push_value(&mut out, width, value, code);
    out
}

/// Append the symbols for `value` to `out`
pub fn push_value(out: &mut String, width: BitWidth, value: u32, code: u8) {
    let [b0, b1, b2, b3] = value.to_le_bytes();
    let symbols: [u8; 6] = match width {
        BitWidth::Bits8 => [(b0 >> 6) | ((code & 0xF) << 2), b0 & 0x3F, 0, 0, 0, 0],
        BitWidth::Bits12 => [((b1 & 0xF) << 2) | (b0 >> 6), b0 & 0x3F, 0, 0, 0, 0],
        BitWidth::Bits16 => [
            (b1 >> 4) | ((code & 0x3) << 4),
            ((b1 & 0xF) << 2) | (b0 >> 6),
            b0 & 0x3F,
            0,
            0,
            0,
        ],
        BitWidth::Bits32 => [
            (b3 >> 6) | ((code & 0xF) << 2),
            b3 & 0x3F,
            b2 >> 2,
            (b1 >> 4) | ((b2 & 0x3) << 4),
            ((b1 & 0xF) << 2) | (b0 >> 6),
            b0 & 0x3F,
        ],
    };
    out.extend(
        symbols[..width.symbols()]
            .iter()
            .map(|&s| to_symbol(s) as char),
    );
}

/// Append the single symbol for a 6-bit value
pub fn push_symbol(out: &mut String, value: u8) {
    out.push(to_symbol(value) as char);
}

/// Decode one value starting at `*pos`, advancing `pos` past it.
///
/// `bytes` holds raw symbols. Anything outside the alphabet decodes as 0; the
/// checksum is what catches that. Running off the end is `Truncated`.
pub fn decode(width: BitWidth, bytes: &[u8], pos: &mut usize) -> Result<Decoded, ParseError> {
    let start = *pos;
    let end = start + width.symbols();
    let raw = bytes
        .get(start..end)
        .ok_or(ParseError::Truncated { at: bytes.len() })?;

    let mut s = [0u8; 6];
    for (slot, &byte) in s.iter_mut().zip(raw) {
        *slot = from_symbol(byte);
    }

    // Shifts on u8 drop the bits that belong to the neighbouring byte.
    let decoded = match width {
        BitWidth::Bits8 => Decoded {
            value: u32::from(s[1] | (s[0] << 6)),
            extra: s[0] >> 2,
        },
        BitWidth::Bits12 => Decoded {
            value: u32::from(s[1] | (s[0] << 6)) | (u32::from(s[0] >> 2) << 8),
            extra: 0,
        },
        BitWidth::Bits16 => Decoded {
            value: u32::from(s[2] | (s[1] << 6)) | (u32::from((s[1] >> 2) | (s[0] << 4)) << 8),
            extra: s[0] >> 4,
        },
        BitWidth::Bits32 => {
            let b0 = s[5] | (s[4] << 6);
            let b1 = (s[4] >> 2) | (s[3] << 4);
            let b2 = (s[3] >> 4) | (s[2] << 2);
            let b3 = s[1] | (s[0] << 6);
            Decoded {
                value: u32::from_le_bytes([b0, b1, b2, b3]),
                extra: s[0] >> 2,
            }
        }
    };

    *pos = end;
    Ok(decoded)
}

/// Low 6 bits of the byte sum
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
    (sum & 0x3F) as u8
}

pub fn checksum_symbol(bytes: &[u8]) -> u8 {
    to_symbol(checksum(bytes))
}

/// Check `symbol` against the checksum of `bytes`.
///
/// A 6-bit sum catches most single-symbol corruption on the link; it is not
/// an integrity guarantee against deliberate tampering.
pub fn verify_checksum(bytes: &[u8], symbol: u8) -> bool {
    is_symbol(symbol) && checksum(bytes) == from_symbol(symbol)
}
