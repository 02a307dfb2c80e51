//! Endianness and fixed-length string helpers shared by every wire record.
//!
//! USB/IP puts every multi-byte integer on the wire in network (big-endian)
//! byte order and every textual field in a fixed-width, NUL-padded buffer.
//! This module is the single place that knows that.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StringCodecError {
    #[error("string is too long to fit in a {len}-byte field including its terminating NUL")]
    TooLong { len: usize },
    #[error("field did not contain valid UTF-8")]
    InvalidUtf8,
}

/// Host -> network byte order.
pub fn to_network_u16(v: u16) -> u16 {
    v.to_be()
}

/// Host -> network byte order.
pub fn to_network_u32(v: u32) -> u32 {
    v.to_be()
}

/// Network -> host byte order.
pub fn from_network_u16(v: u16) -> u16 {
    u16::from_be(v)
}

/// Network -> host byte order.
pub fn from_network_u32(v: u32) -> u32 {
    u32::from_be(v)
}

/// Encodes `s` into exactly `len` bytes, NUL-padded. Fails if `s`'s UTF-8
/// encoding does not leave room for the terminating NUL.
pub fn encode_fixed_string(s: &str, len: usize) -> Result<Vec<u8>, StringCodecError> {
    let bytes = s.as_bytes();

    if bytes.len() >= len {
        return Err(StringCodecError::TooLong { len });
    }

    let mut out = vec![0u8; len];
    out[..bytes.len()].copy_from_slice(bytes);

    Ok(out)
}

/// Reads up to `len` bytes from `buf` starting at `offset`, truncating at the
/// first NUL byte, and decodes the result as UTF-8.
pub fn decode_fixed_string(
    buf: &[u8],
    offset: usize,
    len: usize,
) -> Result<String, StringCodecError> {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());

    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| StringCodecError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trips() {
        assert_eq!(from_network_u16(to_network_u16(0x1234)), 0x1234);
        assert_eq!(from_network_u32(to_network_u32(0xdead_beef)), 0xdead_beef);
    }

    #[test]
    fn fixed_string_round_trips_when_it_fits() {
        let encoded = encode_fixed_string("1-1", 32).unwrap();
        assert_eq!(encoded.len(), 32);
        assert_eq!(decode_fixed_string(&encoded, 0, 32).unwrap(), "1-1");
    }

    #[test]
    fn fixed_string_rejects_strings_with_no_room_for_nul() {
        let exact = "a".repeat(32);
        assert_eq!(
            encode_fixed_string(&exact, 32),
            Err(StringCodecError::TooLong { len: 32 })
        );
    }

    #[test]
    fn fixed_string_truncates_at_first_nul() {
        let mut buf = vec![b'x'; 32];
        buf[3] = 0;
        assert_eq!(decode_fixed_string(&buf, 0, 32).unwrap(), "xxx");
    }
}
