//! Rangefinder Register Protocol
//!
//! Frame layout, with every field after the header written as Radix64
//! symbols:
//!
//! ```text
//! request:   $ <op> <width> <seq> <count> <payload> <checksum> ?
//! response:  $ <op> <width> = <seq> <count> <payload> <checksum>
//! token:     $ K = <uuid>
//! ```
//!
//! `op` is `R` or `W`, `width` is `1`, `2` or `4` bytes. The checksum
//! covers the sequence symbol up to the byte before the checksum.
//!
//! | frame          | payload per register                         |
//! |----------------|----------------------------------------------|
//! | read request   | 12-bit address                               |
//! | write request  | 12-bit address, value at `width`             |
//! | read response  | value at `width`, return code in spare bits  |
//! | write response | one symbol return code                       |

use crate::domain::models::MAX_REGISTER;
use crate::error::{FrameError, ParseError, ProtocolError};
use crate::infrastructure::bluetooth::radix64::{self, BitWidth};
use tracing::trace;
use uuid::Uuid;

/// Rangefinder register service (0000fcf9-0000-1000-8000-00805f9b34fb)
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fcf9_0000_1000_8000_00805f9b34fb);

/// Characteristic the device notifies responses on
pub const READ_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fcfa_0000_1000_8000_00805f9b34fb);

/// Characteristic requests are written to
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fcfb_0000_1000_8000_00805f9b34fb);

/// The count field is a single symbol
pub const MAX_REGISTERS: usize = 63;

const FRAME_START: u8 = b'$';
const RESPONSE_MARKER: u8 = b'=';
const REQUEST_TERMINATOR: u8 = b'?';
const TOKEN_PREFIX: &str = "$K=";

/// Smallest frame of either direction: header, seq, count, checksum
const MIN_FRAME_LEN: usize = 7;

const REQUEST_BODY_START: usize = 3;
const RESPONSE_BODY_START: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

impl Op {
    pub const fn code(self) -> u8 {
        match self {
            Self::Read => b'R',
            Self::Write => b'W',
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            b'R' => Ok(Self::Read),
            b'W' => Ok(Self::Write),
            other => Err(ProtocolError::UnsupportedOp(other as char)),
        }
    }
}

/// Value width declared in the frame header, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameWidth {
    One,
    Two,
    #[default]
    Four,
}

impl FrameWidth {
    pub const fn code(self) -> u8 {
        match self {
            Self::One => b'1',
            Self::Two => b'2',
            Self::Four => b'4',
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            b'1' => Ok(Self::One),
            b'2' => Ok(Self::Two),
            b'4' => Ok(Self::Four),
            other => Err(ProtocolError::UnsupportedWidth(other as char)),
        }
    }

    pub const fn bit_width(self) -> BitWidth {
        match self {
            Self::One => BitWidth::Bits8,
            Self::Two => BitWidth::Bits16,
            Self::Four => BitWidth::Bits32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub sequence: u8,
    pub width: FrameWidth,
    pub registers: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub sequence: u8,
    pub width: FrameWidth,
    pub registers: Vec<u16>,
    pub values: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub sequence: u8,
    pub width: FrameWidth,
    pub values: Vec<u32>,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    pub sequence: u8,
    pub width: FrameWidth,
    pub return_codes: Vec<u8>,
}

/// Any frame the device sends back on the read characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Read(ReadResponse),
    Write(WriteResponse),
}

impl Response {
    pub fn sequence(&self) -> u8 {
        match self {
            Self::Read(r) => r.sequence,
            Self::Write(w) => w.sequence,
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Build a read request for `registers`. Reads always declare width 4.
pub fn assemble_read_request(sequence: u8, registers: &[u16]) -> Result<String, ProtocolError> {
    check_registers(registers)?;

    let mut frame = start_frame(Op::Read, FrameWidth::Four, false);
    radix64::push_symbol(&mut frame, sequence);
    radix64::push_symbol(&mut frame, registers.len() as u8);
    for &register in registers {
        radix64::push_value(&mut frame, BitWidth::Bits12, u32::from(register), 0);
    }
    Ok(finish_request(frame))
}

/// Build a write request storing `values[i]` into `registers[i]`
pub fn assemble_write_request(
    sequence: u8,
    registers: &[u16],
    values: &[u32],
    width: FrameWidth,
) -> Result<String, ProtocolError> {
    if registers.len() != values.len() {
        return Err(ProtocolError::CountMismatch {
            registers: registers.len(),
            values: values.len(),
        });
    }
    check_registers(registers)?;
    let bit_width = width.bit_width();
    if let Some(&value) = values.iter().find(|&&v| v > bit_width.max_value()) {
        return Err(ProtocolError::ValueOutOfRange {
            value,
            bits: bit_width.bits(),
        });
    }

    let mut frame = start_frame(Op::Write, width, false);
    radix64::push_symbol(&mut frame, sequence);
    radix64::push_symbol(&mut frame, registers.len() as u8);
    for (&register, &value) in registers.iter().zip(values) {
        radix64::push_value(&mut frame, BitWidth::Bits12, u32::from(register), 0);
        radix64::push_value(&mut frame, bit_width, value, 0);
    }
    Ok(finish_request(frame))
}

pub fn parse_read_response(frame: &[u8]) -> Result<ReadResponse, FrameError> {
    let (width, sequence, count) = check_response(frame, Op::Read)?;
    let bit_width = width.bit_width();
    expect_len(frame, RESPONSE_BODY_START + 2 + count * bit_width.symbols() + 1)?;

    let mut pos = RESPONSE_BODY_START + 2;
    let mut values = Vec::with_capacity(count);
    let mut return_codes = Vec::with_capacity(count);
    for _ in 0..count {
        let decoded = radix64::decode(bit_width, frame, &mut pos)?;
        values.push(decoded.value);
        return_codes.push(decoded.extra);
    }

    trace!("Parsed read response seq={} count={}", sequence, count);
    Ok(ReadResponse {
        sequence,
        width,
        values,
        return_codes,
    })
}

pub fn parse_write_response(frame: &[u8]) -> Result<WriteResponse, FrameError> {
    let (width, sequence, count) = check_response(frame, Op::Write)?;
    expect_len(frame, RESPONSE_BODY_START + 2 + count + 1)?;

    let start = RESPONSE_BODY_START + 2;
    let return_codes = frame[start..start + count]
        .iter()
        .map(|&b| radix64::from_symbol(b))
        .collect();

    trace!("Parsed write response seq={} count={}", sequence, count);
    Ok(WriteResponse {
        sequence,
        width,
        return_codes,
    })
}

/// Parse a response frame of either op
pub fn parse_response(frame: &[u8]) -> Result<Response, FrameError> {
    match frame {
        [FRAME_START, op, ..] => match Op::from_code(*op)? {
            Op::Read => parse_read_response(frame).map(Response::Read),
            Op::Write => parse_write_response(frame).map(Response::Write),
        },
        _ if frame.len() < 2 => Err(ParseError::TooShort {
            need: MIN_FRAME_LEN,
            got: frame.len(),
        }
        .into()),
        _ => Err(ParseError::BadHeader.into()),
    }
}

pub fn is_token_notification(frame: &[u8]) -> bool {
    frame.starts_with(TOKEN_PREFIX.as_bytes())
}

/// Parse the `$K=<uuid>` frame the device sends once pairing succeeds
pub fn parse_token_notification(frame: &[u8]) -> Result<Uuid, ParseError> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| ParseError::InvalidToken("frame is not ASCII".to_string()))?;
    let token = text
        .strip_prefix(TOKEN_PREFIX)
        .ok_or(ParseError::BadHeader)?;
    Uuid::parse_str(token.trim()).map_err(|e| ParseError::InvalidToken(e.to_string()))
}

// ---------------------------------------------------------------------------
// Device side
// ---------------------------------------------------------------------------

/// Build the device's answer to a read request
pub fn assemble_read_response(
    sequence: u8,
    width: FrameWidth,
    values: &[u32],
    return_codes: &[u8],
) -> Result<String, ProtocolError> {
    if values.len() != return_codes.len() {
        return Err(ProtocolError::CountMismatch {
            registers: return_codes.len(),
            values: values.len(),
        });
    }
    if values.len() > MAX_REGISTERS {
        return Err(ProtocolError::TooManyRegisters(values.len()));
    }

    let bit_width = width.bit_width();
    let mut frame = start_frame(Op::Read, width, true);
    radix64::push_symbol(&mut frame, sequence);
    radix64::push_symbol(&mut frame, values.len() as u8);
    for (&value, &code) in values.iter().zip(return_codes) {
        radix64::push_value(&mut frame, bit_width, value, code);
    }
    Ok(finish_response(frame))
}

/// Build the device's answer to a write request
pub fn assemble_write_response(
    sequence: u8,
    width: FrameWidth,
    return_codes: &[u8],
) -> Result<String, ProtocolError> {
    if return_codes.len() > MAX_REGISTERS {
        return Err(ProtocolError::TooManyRegisters(return_codes.len()));
    }

    let mut frame = start_frame(Op::Write, width, true);
    radix64::push_symbol(&mut frame, sequence);
    radix64::push_symbol(&mut frame, return_codes.len() as u8);
    for &code in return_codes {
        radix64::push_symbol(&mut frame, code);
    }
    Ok(finish_response(frame))
}

pub fn parse_read_request(frame: &[u8]) -> Result<ReadRequest, FrameError> {
    let (width, sequence, count) = check_request(frame, Op::Read)?;
    expect_len(frame, REQUEST_BODY_START + 2 + count * 2 + 2)?;

    let mut pos = REQUEST_BODY_START + 2;
    let mut registers = Vec::with_capacity(count);
    for _ in 0..count {
        registers.push(radix64::decode(BitWidth::Bits12, frame, &mut pos)?.value as u16);
    }

    Ok(ReadRequest {
        sequence,
        width,
        registers,
    })
}

pub fn parse_write_request(frame: &[u8]) -> Result<WriteRequest, FrameError> {
    let (width, sequence, count) = check_request(frame, Op::Write)?;
    let bit_width = width.bit_width();
    expect_len(
        frame,
        REQUEST_BODY_START + 2 + count * (2 + bit_width.symbols()) + 2,
    )?;

    let mut pos = REQUEST_BODY_START + 2;
    let mut registers = Vec::with_capacity(count);
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        registers.push(radix64::decode(BitWidth::Bits12, frame, &mut pos)?.value as u16);
        values.push(radix64::decode(bit_width, frame, &mut pos)?.value);
    }

    Ok(WriteRequest {
        sequence,
        width,
        registers,
        values,
    })
}

/// Build the `$K=<uuid>` frame
pub fn assemble_token_notification(token: &Uuid) -> String {
    format!("{}{}", TOKEN_PREFIX, token.hyphenated())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn check_registers(registers: &[u16]) -> Result<(), ProtocolError> {
    if registers.len() > MAX_REGISTERS {
        return Err(ProtocolError::TooManyRegisters(registers.len()));
    }
    match registers.iter().find(|&&r| r > MAX_REGISTER) {
        Some(&register) => Err(ProtocolError::RegisterOutOfRange(register)),
        None => Ok(()),
    }
}

fn start_frame(op: Op, width: FrameWidth, response: bool) -> String {
    let mut frame = String::with_capacity(16);
    frame.push(FRAME_START as char);
    frame.push(op.code() as char);
    frame.push(width.code() as char);
    if response {
        frame.push(RESPONSE_MARKER as char);
    }
    frame
}

fn finish_request(mut frame: String) -> String {
    let checksum = radix64::checksum_symbol(&frame.as_bytes()[REQUEST_BODY_START..]);
    frame.push(checksum as char);
    frame.push(REQUEST_TERMINATOR as char);
    frame
}

fn finish_response(mut frame: String) -> String {
    let checksum = radix64::checksum_symbol(&frame.as_bytes()[RESPONSE_BODY_START..]);
    frame.push(checksum as char);
    frame
}

fn check_len(frame: &[u8]) -> Result<(), ParseError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(ParseError::TooShort {
            need: MIN_FRAME_LEN,
            got: frame.len(),
        });
    }
    Ok(())
}

fn expect_len(frame: &[u8], expected: usize) -> Result<(), ParseError> {
    if frame.len() != expected {
        return Err(ParseError::LengthMismatch {
            expected,
            got: frame.len(),
        });
    }
    Ok(())
}

fn check_op(frame: &[u8], expected: Op) -> Result<(), FrameError> {
    let op = Op::from_code(frame[1])?;
    if op != expected {
        return Err(ProtocolError::UnexpectedOp {
            expected: expected.code() as char,
            got: op.code() as char,
        }
        .into());
    }
    Ok(())
}

fn check_checksum(body: &[u8], symbol: u8) -> Result<(), ParseError> {
    if !radix64::verify_checksum(body, symbol) {
        return Err(ParseError::ChecksumMismatch {
            computed: radix64::checksum(body),
            received: radix64::from_symbol(symbol),
        });
    }
    Ok(())
}

/// Validate a response header and checksum, returning width, sequence and count
fn check_response(frame: &[u8], op: Op) -> Result<(FrameWidth, u8, usize), FrameError> {
    check_len(frame)?;
    if frame[0] != FRAME_START || frame[3] != RESPONSE_MARKER {
        return Err(ParseError::BadHeader.into());
    }
    check_op(frame, op)?;

    let last = frame.len() - 1;
    check_checksum(&frame[RESPONSE_BODY_START..last], frame[last])?;

    let width = FrameWidth::from_code(frame[2])?;
    let sequence = radix64::from_symbol(frame[RESPONSE_BODY_START]);
    let count = radix64::from_symbol(frame[RESPONSE_BODY_START + 1]) as usize;
    Ok((width, sequence, count))
}

/// Validate a request header, terminator and checksum
fn check_request(frame: &[u8], op: Op) -> Result<(FrameWidth, u8, usize), FrameError> {
    check_len(frame)?;
    let last = frame.len() - 1;
    if frame[0] != FRAME_START || frame[last] != REQUEST_TERMINATOR {
        return Err(ParseError::BadHeader.into());
    }
    check_op(frame, op)?;
    check_checksum(&frame[REQUEST_BODY_START..last - 1], frame[last - 1])?;

    let width = FrameWidth::from_code(frame[2])?;
    let sequence = radix64::from_symbol(frame[REQUEST_BODY_START]);
    let count = radix64::from_symbol(frame[REQUEST_BODY_START + 1]) as usize;
    Ok((width, sequence, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_request() {
        let frame = assemble_read_request(0, &[1, 3, 5, 7, 9]).unwrap();
        assert_eq!(frame, "$R4050103050709u?");
        assert_eq!(assemble_read_request(5, &[1000]).unwrap(), "$R451fEh?");

        let parsed = parse_read_request(frame.as_bytes()).unwrap();
        assert_eq!(parsed.sequence, 0);
        assert_eq!(parsed.width, FrameWidth::Four);
        assert_eq!(parsed.registers, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_empty_register_list() {
        let frame = assemble_read_request(0, &[]).unwrap();
        assert_eq!(frame, "$R400w?");
        assert!(parse_read_request(frame.as_bytes())
            .unwrap()
            .registers
            .is_empty());
    }

    #[test]
    fn test_write_request_widths() {
        assert_eq!(
            assemble_write_request(1, &[10, 11, 12, 13], &[1, 2, 20, 200], FrameWidth::One)
                .unwrap(),
            "$W1140a010b020c0k0d38U?"
        );
        assert_eq!(
            assemble_write_request(2, &[6, 7, 8, 9], &[0, 1000, 10000, 20000], FrameWidth::Two)
                .unwrap(),
            "$W22406000070fE082sg094UwX?"
        );

        let frame = assemble_write_request(
            3,
            &[1, 2, 3, 4, 5],
            &[0, 1000, 100_000, 10_000_000, 1],
            FrameWidth::Four,
        )
        .unwrap();
        assert_eq!(frame, "$W43501000000020000fE03000oqw0400C9q005000001D?");

        let parsed = parse_write_request(frame.as_bytes()).unwrap();
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.registers, vec![1, 2, 3, 4, 5]);
        assert_eq!(parsed.values, vec![0, 1000, 100_000, 10_000_000, 1]);
    }

    #[test]
    fn test_read_response() {
        let values = [0, 100, 1000, 100_000, 10_000_000];
        let codes = [0, 2, 0, 10, 0];
        let frame = assemble_read_response(0, FrameWidth::Four, &values, &codes).unwrap();
        assert_eq!(frame, "$R4=0500000080001A0000fEE00oqw00C9q0z");

        let parsed = parse_read_response(frame.as_bytes()).unwrap();
        assert_eq!(parsed.sequence, 0);
        assert_eq!(parsed.values, values);
        assert_eq!(parsed.return_codes, codes);
    }

    #[test]
    fn test_read_response_narrow_widths() {
        let parsed = parse_read_response(b"$R1=7300--chL").unwrap();
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.values, vec![0, 255, 17]);
        assert_eq!(parsed.return_codes, vec![0, 15, 3]);

        let parsed = parse_read_response(b"$R2=93000---gjiZ").unwrap();
        assert_eq!(parsed.sequence, 9);
        assert_eq!(parsed.width, FrameWidth::Two);
        assert_eq!(parsed.values, vec![0, 65535, 1234]);
        assert_eq!(parsed.return_codes, vec![0, 3, 1]);
    }

    #[test]
    fn test_write_response() {
        let frame = assemble_write_response(1, FrameWidth::One, &[0, 0, 1, 0]).unwrap();
        assert_eq!(frame, "$W1=140010C");
        let parsed = parse_write_response(frame.as_bytes()).unwrap();
        assert_eq!(parsed.sequence, 1);
        assert_eq!(parsed.return_codes, vec![0, 0, 1, 0]);

        let parsed = parse_write_response(b"$W4=3500102r").unwrap();
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.return_codes, vec![0, 0, 1, 0, 2]);
    }

    #[test]
    fn test_parse_response_dispatch() {
        match parse_response(b"$W1=140010C").unwrap() {
            Response::Write(w) => assert_eq!(w.return_codes.len(), 4),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_response(b"$R1=7300--chL").unwrap().sequence(), 7);
        assert_eq!(
            parse_response(b"$X1=7300--chL"),
            Err(ProtocolError::UnsupportedOp('X').into())
        );
        assert_eq!(parse_response(b"R1=7300"), Err(ParseError::BadHeader.into()));
    }

    #[test]
    fn test_corrupted_symbol_fails_checksum() {
        let mut frame = b"$R4=0500000080001A0000fEE00oqw00C9q0z".to_vec();
        frame[10] = b'9';
        assert!(matches!(
            parse_read_response(&frame),
            Err(FrameError::Parse(ParseError::ChecksumMismatch { .. }))
        ));

        // bytes outside the alphabet are caught by the checksum too
        let mut frame = b"$W1=140010C".to_vec();
        frame[7] = b'!';
        assert!(matches!(
            parse_write_response(&frame),
            Err(FrameError::Parse(ParseError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_checksum_misses_flips_by_64() {
        // '0' (48) and 'p' (112) have the same 6-bit sum contribution
        let mut frame = READ_RESPONSE.to_vec();
        assert_eq!(frame[4], b'0');
        frame[4] = b'p';
        let parsed = parse_read_response(&frame).unwrap();
        assert_ne!(parsed.sequence, 0);
    }

    const READ_RESPONSE: &[u8] = b"$R4=0500000080001A0000fEE00oqw00C9q0z";

    proptest! {
        #[test]
        fn prop_single_symbol_flip(pos in 4usize..READ_RESPONSE.len() - 1, symbol in 0usize..64) {
            let original = READ_RESPONSE[pos];
            let replacement = radix64::ALPHABET[symbol];
            prop_assume!(replacement != original);

            let mut frame = READ_RESPONSE.to_vec();
            frame[pos] = replacement;
            let caught = matches!(
                parse_read_response(&frame),
                Err(FrameError::Parse(ParseError::ChecksumMismatch { .. }))
            );
            let same_sum = (replacement as i32 - original as i32) % 64 == 0;
            prop_assert_eq!(caught, !same_sum);
        }
    }

    #[test]
    fn test_short_and_malformed_frames() {
        assert_eq!(
            parse_write_response(b"$W1=0"),
            Err(ParseError::TooShort { need: 7, got: 5 }.into())
        );
        assert_eq!(
            parse_write_response(b"$W1-140010C"),
            Err(ParseError::BadHeader.into())
        );
        assert_eq!(
            parse_read_response(b"$W1=140010C"),
            Err(ProtocolError::UnexpectedOp {
                expected: 'R',
                got: 'W'
            }
            .into())
        );
    }

    #[test]
    fn test_truncated_payload_is_length_mismatch() {
        // count says 5 registers but only four codes follow; fix up the checksum
        let mut frame = b"$W4=350010".to_vec();
        let checksum = radix64::checksum_symbol(&frame[4..]);
        frame.push(checksum);
        assert_eq!(
            parse_write_response(&frame),
            Err(ParseError::LengthMismatch {
                expected: 12,
                got: 11
            }
            .into())
        );
    }

    #[test]
    fn test_unknown_width_fails_closed() {
        let mut frame = b"$W3=140010".to_vec();
        let checksum = radix64::checksum_symbol(&frame[4..]);
        frame.push(checksum);
        assert_eq!(
            parse_write_response(&frame),
            Err(ProtocolError::UnsupportedWidth('3').into())
        );
    }

    #[test]
    fn test_sequence_is_masked() {
        assert_eq!(
            assemble_read_request(64, &[1]).unwrap(),
            assemble_read_request(0, &[1]).unwrap()
        );
    }

    #[test]
    fn test_rejects_unframeable_requests() {
        assert_eq!(
            assemble_read_request(0, &[4096]),
            Err(ProtocolError::RegisterOutOfRange(4096))
        );
        assert_eq!(
            assemble_read_request(0, &[1; 64]),
            Err(ProtocolError::TooManyRegisters(64))
        );
        assert_eq!(
            assemble_write_request(0, &[1, 2], &[1], FrameWidth::Four),
            Err(ProtocolError::CountMismatch {
                registers: 2,
                values: 1
            })
        );
        assert_eq!(
            assemble_write_request(0, &[1], &[256], FrameWidth::One),
            Err(ProtocolError::ValueOutOfRange {
                value: 256,
                bits: 8
            })
        );
    }

    #[test]
    fn test_token_notification() {
        let frame = b"$K=e872f47a-e462-d05a-5ac4-42c832b43aa0";
        assert!(is_token_notification(frame));
        let token = parse_token_notification(frame).unwrap();
        assert_eq!(
            assemble_token_notification(&token).as_bytes(),
            frame.as_slice()
        );

        assert!(!is_token_notification(b"$W1=140010C"));
        assert!(matches!(
            parse_token_notification(b"$K=not-a-uuid"),
            Err(ParseError::InvalidToken(_))
        ));
    }
}
