//! Wire encoding for record headers, control payloads and the file header.
//!
//! Record header layout:
//!
//! ```text
//! [0]  control byte: bits 0-1 = entry len - 1
//!                    bits 2-3 = payload size len - 1
//!                    bits 4-6 = timestamp len - 1
//! [..] entry id      (1-4 bytes, little endian)
//! [..] payload size  (1-4 bytes, little endian)
//! [..] timestamp     (1-8 bytes, little endian)
//! ```
//!
//! The integer widths live in the control byte, so the integers themselves
//! are plain truncated little-endian values.

use crate::{HEADER_STRING, HEADER_VERSION};

pub const MAX_ONE_BYTE: u64 = 256u64;
pub const MAX_TWO_BYTES: u64 = 256u64.pow(2);
pub const MAX_THREE_BYTES: u64 = 256u64.pow(3);
pub const MAX_FOUR_BYTES: u64 = 256u64.pow(4);
pub const MAX_FIVE_BYTES: u64 = 256u64.pow(5);
pub const MAX_SIX_BYTES: u64 = 256u64.pow(6);
pub const MAX_SEVEN_BYTES: u64 = 256u64.pow(7);

/// Largest possible record header: 1 + 4 + 4 + 8.
pub const RECORD_MAX_HEADER_SIZE: usize = 17;
/// Smallest possible record header: one byte for each field.
pub const RECORD_MIN_HEADER_SIZE: usize = 4;
/// Magic, version and extra header length.
pub const FILE_HEADER_SIZE: usize = 12;

pub const CONTROL_START: u8 = 0;
pub const CONTROL_FINISH: u8 = 1;
pub const CONTROL_SET_METADATA: u8 = 2;

/// Tag + entry id + three length-prefixed strings.
pub const START_PAYLOAD_MIN_SIZE: usize = 17;
pub const FINISH_PAYLOAD_SIZE: usize = 5;
pub const SET_METADATA_PAYLOAD_MIN_SIZE: usize = 9;

/// Number of bytes needed to hold `num`, between 1 and 8.
#[must_use]
pub fn int_width(num: u64) -> usize {
    match num {
        0..MAX_ONE_BYTE => 1,
        MAX_ONE_BYTE..MAX_TWO_BYTES => 2,
        MAX_TWO_BYTES..MAX_THREE_BYTES => 3,
        MAX_THREE_BYTES..MAX_FOUR_BYTES => 4,
        MAX_FOUR_BYTES..MAX_FIVE_BYTES => 5,
        MAX_FIVE_BYTES..MAX_SIX_BYTES => 6,
        MAX_SIX_BYTES..MAX_SEVEN_BYTES => 7,
        _ => 8,
    }
}

/// Writes the minimal little-endian form of `num` to the front of `out`
/// and returns the number of bytes written.
///
/// Preconditions: `out.len() >= int_width(num)`
pub fn encode_int(num: u64, out: &mut [u8]) -> usize {
    let width = int_width(num);
    out[..width].copy_from_slice(&num.to_le_bytes()[..width]);
    width
}

/// Preconditions: `bytes.len() <= 8`
#[must_use]
pub fn decode_int(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8, "Invalid variable int length {}", bytes.len());

    let mut buf = [0; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Packs the three field widths into a record control byte.
#[must_use]
pub fn control_byte(entry_len: usize, size_len: usize, timestamp_len: usize) -> u8 {
    debug_assert!((1..=4).contains(&entry_len));
    debug_assert!((1..=4).contains(&size_len));
    debug_assert!((1..=8).contains(&timestamp_len));

    ((entry_len - 1) | ((size_len - 1) << 2) | ((timestamp_len - 1) << 4)) as u8
}

/// Unpacks `(entry_len, size_len, timestamp_len)` from a record control byte.
#[must_use]
pub fn field_widths(control: u8) -> (usize, usize, usize) {
    let entry_len = usize::from(control & 0x3) + 1;
    let size_len = usize::from((control >> 2) & 0x3) + 1;
    let timestamp_len = usize::from((control >> 4) & 0x7) + 1;
    (entry_len, size_len, timestamp_len)
}

/// Writes a complete record header and returns its length.
///
/// The timestamp is written as given; substituting the current time for a
/// zero timestamp is the caller's job since only the caller owns a clock.
pub fn write_record_header(
    out: &mut [u8; RECORD_MAX_HEADER_SIZE],
    entry: u32,
    timestamp: u64,
    payload_size: u32,
) -> usize {
    let mut pos = 1;
    let entry_len = encode_int(u64::from(entry), &mut out[pos..]);
    pos += entry_len;
    let size_len = encode_int(u64::from(payload_size), &mut out[pos..]);
    pos += size_len;
    let timestamp_len = encode_int(timestamp, &mut out[pos..]);
    pos += timestamp_len;

    out[0] = control_byte(entry_len, size_len, timestamp_len);
    pos
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub entry: u32,
    pub payload_size: u32,
    pub timestamp: u64,
    /// Encoded length of the header itself.
    pub len: usize,
}

/// Parses a record header from the front of `buf`.
///
/// Returns `None` if `buf` is too short to hold the header the control byte
/// describes. The payload is not checked.
#[must_use]
pub fn read_record_header(buf: &[u8]) -> Option<RecordHeader> {
    if buf.len() < RECORD_MIN_HEADER_SIZE {
        return None;
    }

    let (entry_len, size_len, timestamp_len) = field_widths(buf[0]);
    let len = 1 + entry_len + size_len + timestamp_len;
    if buf.len() < len {
        return None;
    }

    let mut pos = 1;
    // at most 4 bytes each, so these fit
    let entry = decode_int(&buf[pos..pos + entry_len]) as u32;
    pos += entry_len;
    let payload_size = decode_int(&buf[pos..pos + size_len]) as u32;
    pos += size_len;
    let timestamp = decode_int(&buf[pos..pos + timestamp_len]);

    Some(RecordHeader {
        entry,
        payload_size,
        timestamp,
        len,
    })
}

/// Builds the file header: magic, version and the length-prefixed extra header.
#[must_use]
pub fn file_header(extra_header: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FILE_HEADER_SIZE + extra_header.len());
    out.extend_from_slice(HEADER_STRING);
    out.extend_from_slice(&HEADER_VERSION.to_le_bytes());
    put_string(&mut out, extra_header);
    out
}

fn put_string(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s);
}

#[must_use]
pub fn start_payload_size(name: &str, r#type: &str, metadata: &str) -> usize {
    START_PAYLOAD_MIN_SIZE + name.len() + r#type.len() + metadata.len()
}

#[must_use]
pub fn encode_start_payload(entry: i32, name: &str, r#type: &str, metadata: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(start_payload_size(name, r#type, metadata));
    out.push(CONTROL_START);
    out.extend_from_slice(&entry.to_le_bytes());
    put_string(&mut out, name.as_bytes());
    put_string(&mut out, r#type.as_bytes());
    put_string(&mut out, metadata.as_bytes());
    out
}

#[must_use]
pub fn encode_finish_payload(entry: i32) -> [u8; FINISH_PAYLOAD_SIZE] {
    let id = entry.to_le_bytes();
    [CONTROL_FINISH, id[0], id[1], id[2], id[3]]
}

#[must_use]
pub fn encode_set_metadata_payload(entry: i32, metadata: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(SET_METADATA_PAYLOAD_MIN_SIZE + metadata.len());
    out.push(CONTROL_SET_METADATA);
    out.extend_from_slice(&entry.to_le_bytes());
    put_string(&mut out, metadata.as_bytes());
    out
}

/// Payload size of a string array: a count plus a length prefix per string.
#[must_use]
pub fn string_array_payload_size<S: AsRef<str>>(values: &[S]) -> usize {
    4 + values.iter().map(|s| 4 + s.as_ref().len()).sum::<usize>()
}

/// Reads a little-endian `u32` from the front of `buf`.
#[must_use]
pub fn read_u32(buf: &[u8]) -> Option<u32> {
    let bytes = buf.get(..4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Splits a length-prefixed string off the front of `buf`.
pub fn read_string<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = read_u32(buf)? as usize;
    let rest = &buf[4..];
    if len > rest.len() {
        return None;
    }
    let (value, rest) = rest.split_at(len);
    *buf = rest;
    Some(value)
}
