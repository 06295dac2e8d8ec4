//! eStargz footer parsing and encoding.
//!
//! Every eStargz blob ends with a fixed-size gzip member whose "extra" field
//! encodes the absolute offset of the TOC section as 16 hex digits followed
//! by the ASCII marker `STARGZ`. Two layouts exist:
//!
//! | Variant | Footer bytes | Extra field layout |
//! |---|---:|---|
//! | Modern | 51 | `SG` + LE u16 length (22) + 16 hex digits + `STARGZ` |
//! | Legacy | 47 | 16 hex digits + `STARGZ` |
//!
//! [`parse_footer`] tries the modern layout first and falls back to the
//! legacy one against the tail of the buffer. The encoders produce the
//! byte-exact members (empty payload, stored deflate block) that the
//! reference writer emits.

use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::{Result, StargzError};

/// Size in bytes of the modern footer gzip member.
pub const FOOTER_SIZE: u64 = 51;

/// Size in bytes of the legacy footer gzip member.
pub const LEGACY_FOOTER_SIZE: u64 = 47;

const MARKER: &[u8] = b"STARGZ";

/// Extract the TOC offset from the tail of a blob.
///
/// `tail` holds the last bytes of the blob (at least 47, at most whatever the
/// caller fetched; only the final 51/47 bytes are examined). Returns the
/// absolute TOC offset and the footer size that matched.
pub fn parse_footer(tail: &[u8]) -> Result<(u64, u64)> {
    if tail.len() as u64 >= FOOTER_SIZE {
        let start = tail.len() - FOOTER_SIZE as usize;
        if let Some(offset) = parse_member(&tail[start..], false) {
            return Ok((offset, FOOTER_SIZE));
        }
    }

    if tail.len() as u64 >= LEGACY_FOOTER_SIZE {
        let start = tail.len() - LEGACY_FOOTER_SIZE as usize;
        if let Some(offset) = parse_member(&tail[start..], true) {
            return Ok((offset, LEGACY_FOOTER_SIZE));
        }
    }

    Err(StargzError::InvalidFooter)
}

fn parse_member(member: &[u8], legacy: bool) -> Option<u64> {
    let mut decoder = GzDecoder::new(member);
    let mut sink = Vec::new();
    decoder.read_to_end(&mut sink).ok()?;

    let extra = decoder.header()?.extra()?;

    let payload = if legacy {
        if extra.len() != 16 + MARKER.len() {
            return None;
        }
        extra
    } else {
        if extra.len() < 4 || &extra[..2] != b"SG" {
            return None;
        }
        let length = u16::from_le_bytes([extra[2], extra[3]]) as usize;
        if length != 16 + MARKER.len() || extra.len() < 4 + length {
            return None;
        }
        &extra[4..4 + length]
    };

    if &payload[16..] != MARKER {
        return None;
    }

    let hex = std::str::from_utf8(&payload[..16]).ok()?;
    u64::from_str_radix(hex, 16).ok()
}

/// Encode a modern 51-byte footer pointing at `toc_offset`.
pub fn footer_bytes(toc_offset: u64) -> Vec<u8> {
    let mut extra = Vec::with_capacity(4 + 16 + MARKER.len());
    extra.extend_from_slice(b"SG");
    extra.extend_from_slice(&((16 + MARKER.len()) as u16).to_le_bytes());
    extra.extend_from_slice(format!("{toc_offset:016x}").as_bytes());
    extra.extend_from_slice(MARKER);
    empty_gzip_member(&extra)
}

/// Encode a legacy 47-byte footer pointing at `toc_offset`.
pub fn legacy_footer_bytes(toc_offset: u64) -> Vec<u8> {
    let mut extra = Vec::with_capacity(16 + MARKER.len());
    extra.extend_from_slice(format!("{toc_offset:016x}").as_bytes());
    extra.extend_from_slice(MARKER);
    empty_gzip_member(&extra)
}

/// A gzip member with an empty payload and the given extra field.
///
/// Layout per RFC 1952: header with FEXTRA set, the extra field, one final
/// stored deflate block of length zero, then CRC32 and ISIZE of the empty
/// payload.
fn empty_gzip_member(extra: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + 2 + extra.len() + 5 + 8);
    out.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
    out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
    out.extend_from_slice(extra);
    out.extend_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
    out.extend_from_slice(&[0u8; 8]);
    out
}
