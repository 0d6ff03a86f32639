//! The length-prefixed name-value pair format of PARAMS and GET_VALUES.
//!
//! Each pair is `nameLen valueLen nameBytes valueBytes`. A length is either a
//! single byte (high bit clear) or four big-endian bytes with the high bit of
//! the first byte set and masked off, bounding lengths to 31 bits. Encoders
//! must use the short form whenever a length fits into 7 bits.

use super::{wire, Error as ProtocolError};


/// The bit of the first length byte selecting the 4-byte encoding.
const LONG_BIT: u8 = 1 << 7;

/// The largest length the name-value encoding can express.
pub const MAX_LEN: usize = (1 << 31) - 1;

/// Decodes one length prefix, returning it and the remaining input.
///
/// # Errors
/// Returns [`ProtocolError::SegmentViolation`] if the buffer ends inside the
/// prefix.
fn decode_len(buf: &[u8]) -> Result<(usize, &[u8]), ProtocolError> {
    match *buf {
        [first, ref rest @ ..] if first & LONG_BIT == 0 => Ok((first.into(), rest)),
        [_, _, _, _, ..] => {
            let len = wire::get_u32(buf) & !(u32::from(LONG_BIT) << 24);
            Ok((len as usize, &buf[4..]))
        },
        _ => Err(ProtocolError::SegmentViolation { missing: 4 - buf.len() }),
    }
}

/// Decodes a complete buffer of name-value pairs.
///
/// The visitor is invoked once per pair, in input order. Decoding is
/// all-or-nothing: if any pair is truncated, an error is returned and the
/// caller must treat the whole buffer as invalid. Pair data already passed
/// to the visitor must be discarded in that case.
///
/// # Errors
/// Returns [`ProtocolError::SegmentViolation`] if a declared name or value
/// length exceeds the remaining buffer.
pub fn decode_pairs<'a>(
    mut buf: &'a [u8],
    mut visit: impl FnMut(&'a [u8], &'a [u8]),
) -> Result<(), ProtocolError> {
    while !buf.is_empty() {
        let (name_len, rest) = decode_len(buf)?;
        let (value_len, rest) = decode_len(rest)?;
        let Some(total) = name_len.checked_add(value_len) else {
            return Err(ProtocolError::OversizedLength);
        };
        if total > rest.len() {
            return Err(ProtocolError::SegmentViolation { missing: total - rest.len() });
        }

        let (name, rest) = rest.split_at(name_len);
        let (value, rest) = rest.split_at(value_len);
        visit(name, value);
        buf = rest;
    }
    Ok(())
}

/// Returns the number of bytes `write_pair` will emit for these lengths.
#[inline]
#[must_use]
pub fn encoded_len(name_len: usize, value_len: usize) -> usize {
    let prefix = |l: usize| if l <= 0x7f { 1 } else { 4 };
    prefix(name_len) + prefix(value_len) + name_len + value_len
}

fn write_len(len: usize, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    if len <= 0x7f {
        #[allow(clippy::cast_possible_truncation)]
        out.push(len as u8);
    } else if len <= MAX_LEN {
        let mut enc = [0; 4];
        wire::put_u32(&mut enc, len as u32);
        enc[0] |= LONG_BIT;
        out.extend_from_slice(&enc);
    } else {
        return Err(ProtocolError::OversizedLength);
    }
    Ok(())
}

/// Appends one encoded name-value pair to `out`.
///
/// # Errors
/// Returns [`ProtocolError::OversizedLength`] if either part exceeds
/// [`MAX_LEN`]. `out` is unmodified in that case.
pub fn write_pair(name: &[u8], value: &[u8], out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    if name.len() > MAX_LEN || value.len() > MAX_LEN {
        return Err(ProtocolError::OversizedLength);
    }
    out.reserve(encoded_len(name.len(), value.len()));
    write_len(name.len(), out)?;
    write_len(value.len(), out)?;
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(buf: &[u8]) -> Result<Vec<(&[u8], &[u8])>, ProtocolError> {
        let mut pairs = Vec::new();
        decode_pairs(buf, |n, v| pairs.push((n, v)))?;
        Ok(pairs)
    }

    #[test]
    fn decode_spec() {
        // The Params payload from a minimal responder request
        let pairs = decode_all(b"\x0b\x02SERVER_PORT80").unwrap();
        assert_eq!(pairs, [(b"SERVER_PORT".as_slice(), b"80".as_slice())]);

        let pairs = decode_all(b"\x11\x07GATEWAY_INTERFACECGI/1.1").unwrap();
        assert_eq!(pairs, [(b"GATEWAY_INTERFACE".as_slice(), b"CGI/1.1".as_slice())]);
    }

    #[test]
    fn decode_long_form() {
        let name: Vec<u8> = std::iter::repeat_with(|| fastrand::u8(..)).take(0x9b).collect();
        let mut buf = vec![0x80, 0x00, 0x00, 0x9b, 0x03];
        buf.extend_from_slice(&name);
        buf.extend_from_slice(b"abc");

        let pairs = decode_all(&buf).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, name);
        assert_eq!(pairs[0].1, b"abc");
    }

    #[test]
    fn roundtrip() {
        let long_name = "x".repeat(300);
        let cases: &[(&[u8], &[u8])] = &[
            (b"FCGI_MPXS_CONNS", b"1"),
            (b"FCGI_MAX_CONNS", b""),
            (b"", b"value-without-name"),
            (b"CONTENT_LENGTH", b"8382142"),
            (long_name.as_bytes(), b"short"),
            (b"k", &[0xfe; 200]),
        ];

        let mut buf = Vec::new();
        for &(n, v) in cases {
            let before = buf.len();
            write_pair(n, v, &mut buf).unwrap();
            assert_eq!(buf.len() - before, encoded_len(n.len(), v.len()));
        }
        assert_eq!(decode_all(&buf).unwrap(), cases);
    }

    #[test]
    fn short_form_is_mandatory() {
        for len in [0usize, 1, 27, 127] {
            let mut buf = Vec::new();
            write_pair(&vec![b'n'; len], b"", &mut buf).unwrap();
            assert_eq!(buf[0] as usize, len, "length {len} must use the 1-byte form");
            assert_eq!(buf.len(), len + 2);
        }

        let mut buf = Vec::new();
        write_pair(&[b'n'; 128], b"", &mut buf).unwrap();
        assert_eq!(&buf[..4], [0x80, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn truncated_value_rejected() {
        // Declares an 0x20-byte value but supplies 3 bytes
        let buf = b"\x04\x20nameval";
        assert!(matches!(
            decode_all(buf),
            Err(ProtocolError::SegmentViolation { missing: 29 }),
        ));
    }

    #[test]
    fn truncated_prefix_rejected() {
        // Long-form length cut off after two bytes
        let buf = [0x80, 0x00];
        assert!(matches!(
            decode_all(&buf),
            Err(ProtocolError::SegmentViolation { missing: 2 }),
        ));
    }

    #[test]
    fn no_partial_commit_on_error() {
        let mut buf = Vec::new();
        write_pair(b"GOOD", b"pair", &mut buf).unwrap();
        buf.extend_from_slice(b"\x7f\x7f??");

        let mut seen = Vec::new();
        let res = decode_pairs(&buf, |n, v| seen.push((n.to_vec(), v.to_vec())));
        assert!(res.is_err());
        // The caller discards pairs seen before the error
    }

    #[test]
    fn oversized_rejected() {
        let mut out = Vec::new();
        // Fake a slice with a length beyond MAX_LEN without allocating it
        let res = write_len(MAX_LEN + 1, &mut out);
        assert!(matches!(res, Err(ProtocolError::OversizedLength)));
        assert!(out.is_empty());
    }
}
