//! Git packet-line framing.
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet (end of a list)
//! - `0004`..`ffff` -- data packet carrying `len - 4` payload bytes
//!
//! Lengths `0001`..`0003` are rejected; the gateway speaks protocol v0/v1
//! framing only and never needs the v2 delimiter packets.

use thiserror::Error;

/// Largest total frame length representable by the 4-hex-digit prefix.
pub const MAX_PKT_LEN: usize = 0xFFFF;

/// Size of the length prefix.
pub const PKT_HEADER_LEN: usize = 4;

/// The literal flush marker.
pub const FLUSH_PKT: &[u8; 4] = b"0000";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while framing or unframing packet lines.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The 4-byte length header is missing or is not hexadecimal.
    #[error("invalid packet-line length header {header:?}")]
    Length { header: Vec<u8> },

    /// A declared length below the 4-byte header size.
    #[error("packet-line length {declared} is shorter than its own header")]
    Undersized { declared: usize },

    /// Fewer bytes are available than the header declares.
    #[error("truncated packet-line: declared {declared} bytes, {available} available")]
    Truncated { declared: usize, available: usize },

    /// The payload does not fit in a single frame.
    #[error("packet-line payload too large ({total} bytes including header, max {MAX_PKT_LEN})")]
    Overflow { total: usize },

    /// A reference line did not split into exactly `<oid> <ref>`.
    #[error("malformed reference line {line:?}")]
    Reference { line: String },
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single decoded packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketLine {
    /// Flush packet (`0000`); carries no payload.
    Flush,
    /// Data packet whose declared length is `4 + payload.len()`.
    Data(Vec<u8>),
}

impl PacketLine {
    /// Payload bytes; empty for a flush packet.
    pub fn payload(&self) -> &[u8] {
        match self {
            PacketLine::Flush => &[],
            PacketLine::Data(data) => data,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode `payload` as a data packet: 4 lowercase hex digits of
/// `payload.len() + 4` followed by the payload.
///
/// Callers are responsible for including any trailing newline.  Payloads that
/// would exceed [`MAX_PKT_LEN`] are refused rather than truncated.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = payload.len() + PKT_HEADER_LEN;
    if total > MAX_PKT_LEN {
        return Err(FrameError::Overflow { total });
    }
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(format!("{total:04x}").as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Parse a 4-byte hex length header.
///
/// Exactly four ASCII hex digits, either case; no sign and no `0x` prefix.
pub fn parse_length(header: &[u8]) -> Result<usize, FrameError> {
    if header.len() < PKT_HEADER_LEN {
        return Err(FrameError::Length {
            header: header.to_vec(),
        });
    }
    let header = &header[..PKT_HEADER_LEN];
    header.iter().try_fold(0usize, |acc, &b| {
        let digit = (b as char).to_digit(16).ok_or_else(|| FrameError::Length {
            header: header.to_vec(),
        })?;
        Ok(acc * 16 + digit as usize)
    })
}

/// Decode one packet line starting at `offset`.
///
/// Returns the packet together with the number of bytes it occupied.
pub fn decode(buf: &[u8], offset: usize) -> Result<(PacketLine, usize), FrameError> {
    let rest = buf.get(offset..).unwrap_or_default();
    let declared = parse_length(rest)?;

    if declared == 0 {
        return Ok((PacketLine::Flush, PKT_HEADER_LEN));
    }
    if declared < PKT_HEADER_LEN {
        return Err(FrameError::Undersized { declared });
    }
    if rest.len() < declared {
        return Err(FrameError::Truncated {
            declared,
            available: rest.len(),
        });
    }

    let payload = rest[PKT_HEADER_LEN..declared].to_vec();
    Ok((PacketLine::Data(payload), declared))
}

/// Decode every complete packet in `buf`, stopping at the first error.
pub fn decode_all(buf: &[u8]) -> Result<Vec<PacketLine>, FrameError> {
    let mut packets = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (pkt, used) = decode(buf, pos)?;
        packets.push(pkt);
        pos += used;
    }
    Ok(packets)
}

// ---------------------------------------------------------------------------
// Reference lines
// ---------------------------------------------------------------------------

/// Split a ref advertisement payload into `(object_id, ref_name)`.
///
/// Everything after the first NUL (the capability list on the first line) is
/// discarded before splitting on whitespace.
pub fn parse_reference(line: &[u8]) -> Result<(String, String), FrameError> {
    let head = strip_capabilities(line);
    let text = String::from_utf8_lossy(head);
    let mut tokens = text.split_whitespace();

    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(oid), Some(name), None) => Ok((oid.to_string(), name.to_string())),
        _ => Err(FrameError::Reference {
            line: text.into_owned(),
        }),
    }
}

/// The part of a payload before the first NUL byte.
pub fn strip_capabilities(line: &[u8]) -> &[u8] {
    match line.iter().position(|&b| b == 0) {
        Some(nul) => &line[..nul],
        None => line,
    }
}

/// The capability list following the first NUL byte, if any.
pub fn capabilities(line: &[u8]) -> Option<&[u8]> {
    line.iter().position(|&b| b == 0).map(|nul| &line[nul + 1..])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const REF_LINE: &[u8] = b"003f7217a7c7e582c46cec22a130adf4b9d7d950fba0 refs/heads/master\n";

    #[test]
    fn decode_data_packet() {
        let (pkt, used) = decode(REF_LINE, 0).unwrap();
        assert_eq!(used, 63);
        assert_eq!(
            pkt.payload(),
            b"7217a7c7e582c46cec22a130adf4b9d7d950fba0 refs/heads/master\n"
        );
    }

    #[test]
    fn decode_flush() {
        let (pkt, used) = decode(b"0000", 0).unwrap();
        assert_eq!(pkt, PacketLine::Flush);
        assert_eq!(used, 4);
    }

    #[test]
    fn decode_at_offset() {
        let mut wire = b"0000".to_vec();
        wire.extend_from_slice(b"0009hello");
        let (pkt, used) = decode(&wire, 4).unwrap();
        assert_eq!(pkt, PacketLine::Data(b"hello".to_vec()));
        assert_eq!(used, 9);
    }

    #[test]
    fn decode_uppercase_hex() {
        let mut wire = b"000A".to_vec();
        wire.extend_from_slice(b"hello\n");
        let (pkt, used) = decode(&wire, 0).unwrap();
        assert_eq!(pkt.payload(), b"hello\n");
        assert_eq!(used, 10);
    }

    #[test]
    fn decode_empty_data_packet() {
        let (pkt, used) = decode(b"0004", 0).unwrap();
        assert_eq!(pkt, PacketLine::Data(Vec::new()));
        assert_eq!(used, 4);
    }

    #[test]
    fn decode_short_header_fails() {
        assert!(matches!(decode(b"00", 0), Err(FrameError::Length { .. })));
        assert!(matches!(decode(b"", 0), Err(FrameError::Length { .. })));
    }

    #[test]
    fn decode_non_hex_header_fails() {
        assert!(matches!(decode(b"zzzz", 0), Err(FrameError::Length { .. })));
        assert!(matches!(decode(b"+fff", 0), Err(FrameError::Length { .. })));
        assert!(matches!(decode(b"0x10", 0), Err(FrameError::Length { .. })));
    }

    #[test]
    fn decode_undersized_length_fails() {
        assert_eq!(
            decode(b"0003", 0),
            Err(FrameError::Undersized { declared: 3 })
        );
        assert_eq!(
            decode(b"0001", 0),
            Err(FrameError::Undersized { declared: 1 })
        );
    }

    #[test]
    fn decode_truncated_fails() {
        assert_eq!(
            decode(b"0009hel", 0),
            Err(FrameError::Truncated {
                declared: 9,
                available: 7
            })
        );
    }

    #[test]
    fn encode_hello() {
        assert_eq!(encode(b"hello").unwrap(), b"0009hello");
    }

    #[test]
    fn encode_uses_lowercase_hex() {
        assert_eq!(encode(b"hello\n").unwrap(), b"000ahello\n");
    }

    #[test]
    fn encode_at_maximum_size() {
        let payload = vec![b'x'; MAX_PKT_LEN - PKT_HEADER_LEN];
        let encoded = encode(&payload).unwrap();
        assert_eq!(encoded.len(), MAX_PKT_LEN);
        assert_eq!(&encoded[..4], b"ffff");
    }

    #[test]
    fn encode_over_maximum_fails() {
        let payload = vec![b'x'; MAX_PKT_LEN - PKT_HEADER_LEN + 1];
        assert_eq!(
            encode(&payload),
            Err(FrameError::Overflow {
                total: MAX_PKT_LEN + 1
            })
        );
    }

    #[test]
    fn decode_returns_encoded_payload() {
        for payload in [&b""[..], &b"a"[..], &b"version 1\n"[..], &[0u8, 1, 2, 255][..]] {
            let wire = encode(payload).unwrap();
            let (pkt, used) = decode(&wire, 0).unwrap();
            assert_eq!(pkt.payload(), payload);
            assert_eq!(used, wire.len());
        }
    }

    #[test]
    fn decode_all_stops_on_garbage() {
        let mut wire = encode(b"one\n").unwrap();
        wire.extend_from_slice(FLUSH_PKT);
        assert_eq!(
            decode_all(&wire).unwrap(),
            vec![PacketLine::Data(b"one\n".to_vec()), PacketLine::Flush]
        );

        wire.extend_from_slice(b"nope");
        assert!(decode_all(&wire).is_err());
    }

    #[test]
    fn parse_reference_plain() {
        let (oid, name) =
            parse_reference(b"525128480b96c89e6418b1e40909bf6c5b2d580f refs/tags/v1.0").unwrap();
        assert_eq!(oid, "525128480b96c89e6418b1e40909bf6c5b2d580f");
        assert_eq!(name, "refs/tags/v1.0");
    }

    #[test]
    fn parse_reference_strips_capabilities() {
        let line = b"7217a7c7e582c46cec22a130adf4b9d7d950fba0 HEAD\0multi_ack thin-pack side-band\n";
        let (oid, name) = parse_reference(line).unwrap();
        assert_eq!(oid, "7217a7c7e582c46cec22a130adf4b9d7d950fba0");
        assert_eq!(name, "HEAD");
    }

    #[test]
    fn parse_reference_trailing_newline() {
        let (_, name) =
            parse_reference(b"7217a7c7e582c46cec22a130adf4b9d7d950fba0 refs/heads/main\n").unwrap();
        assert_eq!(name, "refs/heads/main");
    }

    #[test]
    fn parse_reference_wrong_token_count() {
        assert!(parse_reference(b"onlyone").is_err());
        assert!(parse_reference(b"a b c").is_err());
        assert!(parse_reference(b"").is_err());
    }

    #[test]
    fn capabilities_after_nul() {
        assert_eq!(capabilities(b"x HEAD\0report-status"), Some(&b"report-status"[..]));
        assert_eq!(capabilities(b"x HEAD"), None);
    }
}
