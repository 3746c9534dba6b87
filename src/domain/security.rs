//! Security Handshake
//!
//! Challenge/response helpers shared with the rangefinder firmware. Both
//! sides compute the same CRC-32 based values, so nothing here may change
//! without a matching firmware change.
//!
//! The token transform in [`decrypt_token`] is an XOR obfuscation. It keeps
//! the access token off the air in clear during pairing with a device that is
//! physically next to the user; it is not meant to resist a determined
//! attacker.

use crate::error::SecurityError;
use crc32fast::Hasher;
use std::ops::RangeInclusive;
use uuid::Uuid;

/// Letters the device can show on its display, indexed by nibble
pub const ALPHA_LOOKUP: &[u8; 9] = b"ACEFHLPSU";

/// Codes shown on the device display are always three digits
pub const PASSWORD_RANGE: RangeInclusive<u32> = 100..=999;

/// Register holding the pairing challenge (read) and the password response (write)
pub const ACCESS_CODE_REGISTER: u16 = 1000;

/// Register holding the authorization challenge (read) and its response (write)
pub const CHALLENGE_REGISTER: u16 = 1003;

const PASSWORD_ROUNDS: usize = 10;
const KEY_ROTATIONS: usize = 8;
const KEY_LEN: usize = 16;

/// Handshake registers and attempt limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityConfig {
    pub access_code_register: Option<u16>,
    pub challenge_register: Option<u16>,
    pub max_attempts: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            access_code_register: Some(ACCESS_CODE_REGISTER),
            challenge_register: Some(CHALLENGE_REGISTER),
            max_attempts: 3,
        }
    }
}

/// How a 32-bit response is rendered when it has to travel as text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Decimal,
    Hex,
}

/// Combine a device challenge with the stored access token.
///
/// The token is laid out the way the firmware stores it (first three fields
/// little-endian) and copied eight times into a 128-byte buffer. Copy `i`
/// starts at the offset given by nibble `i` of the challenge, lowest nibble
/// first. The response is the CRC-32 of that buffer.
pub fn encrypt_challenge(challenge: u32, key: &Uuid) -> u32 {
    let key_bytes = key.to_bytes_le();
    let mut buffer = [0u8; KEY_LEN * KEY_ROTATIONS];

    let mut nibbles = challenge;
    for rotation in buffer.chunks_exact_mut(KEY_LEN) {
        let offset = (nibbles & 0xF) as usize;
        for (j, byte) in rotation.iter_mut().enumerate() {
            *byte = key_bytes[(offset + j) % KEY_LEN];
        }
        nibbles >>= 4;
    }

    crc32fast::hash(&buffer)
}

/// Combine the 3-digit display code with the salt read from the device.
///
/// Streams the ASCII digits followed by the little-endian salt ten times
/// (70 bytes) through CRC-32.
pub fn encrypt_password(password: u32, salt: u32) -> Result<u32, SecurityError> {
    if !PASSWORD_RANGE.contains(&password) {
        return Err(SecurityError::InvalidPassword(password));
    }

    let digits = password.to_string();
    let salt = salt.to_le_bytes();

    let mut hasher = Hasher::new();
    for _ in 0..PASSWORD_ROUNDS {
        hasher.update(digits.as_bytes());
        hasher.update(&salt);
    }
    Ok(hasher.finalize())
}

/// Two-letter code for the low byte of `code`, high nibble first
pub fn alpha_code(code: u32) -> Result<String, SecurityError> {
    let letter = |nibble: u32| {
        ALPHA_LOOKUP
            .get(nibble as usize)
            .map(|&b| b as char)
            .ok_or(SecurityError::UnmappedNibble(nibble))
    };

    Ok([letter((code >> 4) & 0xF)?, letter(code & 0xF)?]
        .iter()
        .collect())
}

/// Recover the access token the device sent during pairing.
///
/// Byte `i` is XORed with `(password * (i + 1)) & 0xFF`. The transform is its
/// own inverse, which is how the device produces the encoded token.
pub fn decrypt_token(encoded: &Uuid, password: u32) -> Uuid {
    let mut bytes = encoded.to_bytes_le();
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte ^= (password.wrapping_mul(i as u32 + 1) & 0xFF) as u8;
    }
    Uuid::from_bytes_le(bytes)
}

pub fn format_response(value: u32, format: ResponseFormat) -> String {
    match format {
        ResponseFormat::Decimal => value.to_string(),
        ResponseFormat::Hex => format!("{:08X}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIRING_CHALLENGE: u32 = 0x1122_3367;
    const ENCODED_TOKEN: &str = "e872f47a-e462-d05a-5ac4-42c832b43aa0";
    const STORED_TOKEN: &str = "04030201-0605-0807-090a-0b0c0d0e0f10";

    #[test]
    fn test_alpha_code() {
        // high nibble 6 -> P, low nibble 7 -> S
        assert_eq!(alpha_code(PAIRING_CHALLENGE).unwrap(), "PS");
        assert_eq!(alpha_code(0x00).unwrap(), "AA");
        assert_eq!(alpha_code(0x88).unwrap(), "UU");
        assert_eq!(alpha_code(0x9F), Err(SecurityError::UnmappedNibble(9)));
        assert_eq!(alpha_code(0x1F), Err(SecurityError::UnmappedNibble(0xF)));
    }

    #[test]
    fn test_encrypt_password_is_deterministic() {
        let first = encrypt_password(123, PAIRING_CHALLENGE).unwrap();
        assert_eq!(first, 0x3846_69B6);
        assert_eq!(encrypt_password(123, PAIRING_CHALLENGE).unwrap(), first);
        assert_ne!(encrypt_password(124, PAIRING_CHALLENGE).unwrap(), first);
        assert_eq!(encrypt_password(999, 0).unwrap(), 0x6D81_B0DC);
    }

    #[test]
    fn test_encrypt_password_rejects_non_three_digit_codes() {
        assert_eq!(
            encrypt_password(99, 1),
            Err(SecurityError::InvalidPassword(99))
        );
        assert_eq!(
            encrypt_password(1000, 1),
            Err(SecurityError::InvalidPassword(1000))
        );
    }

    #[test]
    fn test_decrypt_token() {
        let encoded = Uuid::parse_str(ENCODED_TOKEN).unwrap();
        let token = decrypt_token(&encoded, 123);
        assert_eq!(token, Uuid::parse_str(STORED_TOKEN).unwrap());

        // the device encodes with the same transform
        assert_eq!(decrypt_token(&token, 123), encoded);
    }

    #[test]
    fn test_encrypt_challenge() {
        let token = Uuid::parse_str(STORED_TOKEN).unwrap();
        assert_eq!(encrypt_challenge(12_345_678, &token), 0x454E_2904);
        assert_eq!(encrypt_challenge(PAIRING_CHALLENGE, &token), 0x241C_A47C);
        assert_eq!(encrypt_challenge(0, &Uuid::nil()), 0xC2A8_FA9D);
    }

    #[test]
    fn test_format_response() {
        assert_eq!(format_response(0x454E_2904, ResponseFormat::Hex), "454E2904");
        assert_eq!(
            format_response(0x454E_2904, ResponseFormat::Decimal),
            "1162750212"
        );
    }
}
