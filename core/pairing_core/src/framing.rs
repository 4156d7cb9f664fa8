//! Frame codec for the relayed transport
//!
//! Every relayed message travels on stream 0 as one frame:
//!
//! ```text
//! +--------+--------+--------+--------+--------+-----------------+
//! | Kind   | Length (4 bytes, big-endian)      | Payload         |
//! +--------+--------+--------+--------+--------+-----------------+
//!
//! Kind 0x01 = text (UTF-8), 0x02 = binary
//! ```
//!
//! Text frames starting with the control prefix are control messages
//! (see `control`), everything else is opaque payload.

use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Frame kind for UTF-8 text payloads
pub const FRAME_TEXT: u8 = 0x01;

/// Frame kind for binary payloads
pub const FRAME_BINARY: u8 = 0x02;

/// Kind byte + 4-byte length
pub const FRAME_HEADER_LEN: usize = 5;

/// Maximum payload size of a single frame (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1 << 20;

// ============================================================================
// Payload
// ============================================================================

/// An application or control payload carried by either channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Binary(_) => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Binary(b)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Frame decode/encode errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Need more bytes (value = bytes still needed)
    Incomplete(usize),
    /// Payload exceeds MAX_FRAME_SIZE
    TooLarge(usize),
    /// Unknown kind byte
    InvalidKind(u8),
    /// Text frame is not valid UTF-8
    InvalidUtf8,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Incomplete(n) => write!(f, "incomplete frame: {} more bytes needed", n),
            FrameError::TooLarge(n) => write!(f, "frame too large: {} bytes", n),
            FrameError::InvalidKind(k) => write!(f, "invalid frame kind 0x{:02x}", k),
            FrameError::InvalidUtf8 => write!(f, "text frame is not valid UTF-8"),
        }
    }
}

impl std::error::Error for FrameError {}

// ============================================================================
// Encoding/Decoding
// ============================================================================

/// Encode a payload as a frame
pub fn encode_frame(payload: &Payload) -> Result<Vec<u8>, FrameError> {
    let (kind, body) = match payload {
        Payload::Text(s) => (FRAME_TEXT, s.as_bytes()),
        Payload::Binary(b) => (FRAME_BINARY, b.as_slice()),
    };

    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.push(kind);
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);

    Ok(buf)
}

/// Decode one frame from the front of `buf`.
/// Returns (payload, bytes_consumed) or error
pub fn decode_frame(buf: &[u8]) -> Result<(Payload, usize), FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Incomplete(FRAME_HEADER_LEN - buf.len()));
    }

    let kind = buf[0];
    if kind != FRAME_TEXT && kind != FRAME_BINARY {
        return Err(FrameError::InvalidKind(kind));
    }

    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(length));
    }

    let total = FRAME_HEADER_LEN + length;
    if buf.len() < total {
        return Err(FrameError::Incomplete(total - buf.len()));
    }

    let body = &buf[FRAME_HEADER_LEN..total];
    let payload = if kind == FRAME_TEXT {
        let text = std::str::from_utf8(body).map_err(|_| FrameError::InvalidUtf8)?;
        Payload::Text(text.to_string())
    } else {
        Payload::Binary(body.to_vec())
    };

    Ok((payload, total))
}

/// Decode every complete frame in `buf` into `out`, leaving any trailing
/// partial frame in place for the next read.
///
/// On a malformed frame, the frames decoded before it are still in `out`
/// and the bad bytes stay at the front of `buf`.
pub fn decode_frames(buf: &mut Vec<u8>, out: &mut Vec<Payload>) -> Result<(), FrameError> {
    let mut offset = 0;

    let result = loop {
        match decode_frame(&buf[offset..]) {
            Ok((payload, consumed)) => {
                out.push(payload);
                offset += consumed;
            }
            Err(FrameError::Incomplete(_)) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    buf.drain(..offset);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_frame_layout() {
        let frame = encode_frame(&Payload::Binary(vec![7, 8, 9])).unwrap();
        assert_eq!(frame, vec![FRAME_BINARY, 0, 0, 0, 3, 7, 8, 9]);
    }

    #[test]
    fn test_text_frame_keeps_multibyte_prefix() {
        let frame = encode_frame(&Payload::Text("§{}".to_string())).unwrap();
        // '§' is two bytes in UTF-8
        assert_eq!(&frame[1..5], &4u32.to_be_bytes());
        let (payload, consumed) = decode_frame(&frame).unwrap();
        assert_eq!(payload, Payload::Text("§{}".to_string()));
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = encode_frame(&Payload::Text("hello".to_string())).unwrap();
        assert_eq!(decode_frame(&frame[..3]), Err(FrameError::Incomplete(2)));
        assert_eq!(decode_frame(&frame[..7]), Err(FrameError::Incomplete(3)));
    }

    #[test]
    fn test_decode_rejects_bad_kind_and_size() {
        assert_eq!(
            decode_frame(&[0x09, 0, 0, 0, 0]),
            Err(FrameError::InvalidKind(0x09))
        );

        let too_large = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let buf = [FRAME_BINARY, too_large[0], too_large[1], too_large[2], too_large[3]];
        assert_eq!(
            decode_frame(&buf),
            Err(FrameError::TooLarge(MAX_FRAME_SIZE + 1))
        );
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let buf = [FRAME_TEXT, 0, 0, 0, 2, 0xff, 0xfe];
        assert_eq!(decode_frame(&buf), Err(FrameError::InvalidUtf8));
    }

    #[test]
    fn test_decode_frames_keeps_partial_tail() {
        let mut buf = encode_frame(&Payload::Text("one".to_string())).unwrap();
        buf.extend(encode_frame(&Payload::Binary(vec![1, 2])).unwrap());
        let third = encode_frame(&Payload::Text("three".to_string())).unwrap();
        buf.extend_from_slice(&third[..4]);

        let mut payloads = Vec::new();
        decode_frames(&mut buf, &mut payloads).unwrap();
        assert_eq!(
            payloads,
            vec![Payload::Text("one".to_string()), Payload::Binary(vec![1, 2])]
        );
        assert_eq!(buf, third[..4].to_vec());

        buf.extend_from_slice(&third[4..]);
        let mut payloads = Vec::new();
        decode_frames(&mut buf, &mut payloads).unwrap();
        assert_eq!(payloads, vec![Payload::Text("three".to_string())]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_frames_keeps_frames_before_bad_one() {
        let mut buf = encode_frame(&Payload::Text("first".to_string())).unwrap();
        buf.extend(encode_frame(&Payload::Binary(vec![4, 5])).unwrap());
        buf.extend_from_slice(&[0x09, 0, 0, 0, 0]);

        let mut payloads = Vec::new();
        assert_eq!(
            decode_frames(&mut buf, &mut payloads),
            Err(FrameError::InvalidKind(0x09))
        );
        assert_eq!(
            payloads,
            vec![Payload::Text("first".to_string()), Payload::Binary(vec![4, 5])]
        );
        assert_eq!(buf, vec![0x09, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = Payload::Binary(vec![0u8; MAX_FRAME_SIZE + 1]);
        assert_eq!(
            encode_frame(&payload),
            Err(FrameError::TooLarge(MAX_FRAME_SIZE + 1))
        );
    }
}
