//! Framed codec for client communication.
//!
//! Frames are a `Content-Length` header block followed by a JSON body, the
//! same convention the Language Server Protocol uses:
//!
//! ```text
//! Content-Length: 42\r\n
//! \r\n
//! {"seq":0,"type":"event","event":"initialized"}
//! ```
//!
//! Works over any AsyncRead/AsyncWrite (sockets, stdio, in-memory pipes).

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::Message;

/// Header blocks are a handful of bytes; anything bigger is garbage.
const MAX_HEADER_LEN: usize = 8 * 1024;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// Malformed or truncated wire data. Always fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("header block exceeds {MAX_HEADER_LEN} bytes")]
    HeaderTooLarge,
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("stream ended mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("invalid message body: {0}")]
    InvalidMessage(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Body(usize),
}

/// Codec that frames messages with a `Content-Length` header and serializes
/// them with JSON.
#[derive(Debug)]
pub struct DapCodec {
    max_frame_len: usize,
    state: DecodeState,
}

impl Default for DapCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl DapCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            state: DecodeState::Head,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn decode_head(&self, src: &mut BytesMut) -> Result<Option<usize>, FramingError> {
        // Tolerate stray line breaks between frames.
        let leading = src.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
        src.advance(leading);

        let Some((head_len, sep_len)) = find_header_end(src) else {
            if src.len() > MAX_HEADER_LEN {
                return Err(FramingError::HeaderTooLarge);
            }
            return Ok(None);
        };
        if head_len > MAX_HEADER_LEN {
            return Err(FramingError::HeaderTooLarge);
        }

        let head = src.split_to(head_len + sep_len);
        let text = std::str::from_utf8(&head[..head_len])
            .map_err(|_| FramingError::MalformedHeader("<non-UTF-8 header>".to_string()))?;

        let mut content_length = None;
        for line in text.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FramingError::MalformedHeader(line.to_string()))?;
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let value = value.trim();
                let len = value
                    .parse::<usize>()
                    .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?;
                content_length = Some(len);
            } else {
                tracing::trace!(header = %name.trim(), "Ignoring header");
            }
        }

        let len = content_length.ok_or(FramingError::MissingContentLength)?;
        if len > self.max_frame_len {
            return Err(FramingError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(Some(len))
    }
}

/// Position of the blank line ending the header block: (header length, separator length).
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

impl Decoder for DapCodec {
    type Item = Message;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.state {
            DecodeState::Body(len) => len,
            DecodeState::Head => match self.decode_head(src)? {
                Some(len) => {
                    self.state = DecodeState::Body(len);
                    len
                }
                None => return Ok(None),
            },
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let body = src.split_to(len);
        self.state = DecodeState::Head;
        let message = serde_json::from_slice(&body).map_err(FramingError::InvalidMessage)?;
        Ok(Some(message))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() && self.state == DecodeState::Head => Ok(None),
            None => Err(FramingError::Truncated {
                buffered: buf.len(),
            }),
        }
    }
}

impl Encoder<Message> for DapCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(FramingError::Encode)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, seq = item.seq(), "Encoding frame");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }

        let header = format!("{CONTENT_LENGTH}: {json_len}\r\n\r\n");
        dst.reserve(header.len() + json_len);
        dst.put_slice(header.as_bytes());
        dst.put_slice(&json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Event, Request};

    fn frame(body: &str) -> BytesMut {
        BytesMut::from(format!("Content-Length: {}\r\n\r\n{}", body.len(), body).as_bytes())
    }

    #[test]
    fn encodes_content_length_header() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::new();
        let msg = Message::Event(Event {
            seq: 0,
            event: "initialized".to_string(),
            body: None,
        });
        codec.encode(msg, &mut buf).unwrap();

        let body = r#"{"type":"event","seq":0,"event":"initialized"}"#;
        assert_eq!(
            std::str::from_utf8(&buf).unwrap(),
            format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
        );
    }

    #[test]
    fn decodes_request_frame() {
        let mut codec = DapCodec::new();
        let mut buf =
            frame(r#"{"seq":1,"type":"request","command":"initialize","arguments":{"adapterID":"spam"}}"#);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Request(Request { seq, command, .. }) => {
                assert_eq!(seq, 1);
                assert_eq!(command, "initialize");
            }
            other => panic!("expected request, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_header_and_body() {
        let mut codec = DapCodec::new();
        let full = frame(r#"{"seq":1,"type":"request","command":"configurationDone"}"#);

        let mut buf = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[10..30]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[30..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = DapCodec::new();
        let mut buf = frame(r#"{"seq":1,"type":"request","command":"a"}"#);
        buf.extend_from_slice(&frame(r#"{"seq":2,"type":"request","command":"b"}"#));

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().seq(), 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().seq(), 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn accepts_lowercase_header_extra_headers_and_bare_newlines() {
        let mut codec = DapCodec::new();
        let body = r#"{"seq":5,"type":"event","event":"x"}"#;
        let mut buf = BytesMut::from(
            format!(
                "content-length: {}\nContent-Type: application/json\n\n{}",
                body.len(),
                body
            )
            .as_bytes(),
        );
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().seq(), 5);
    }

    #[test]
    fn rejects_missing_content_length() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::from(&b"Content-Type: json\r\n\r\n{}"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::MissingContentLength)
        ));
    }

    #[test]
    fn rejects_non_numeric_content_length() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: ten\r\n\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::InvalidContentLength(v)) if v == "ten"
        ));
    }

    #[test]
    fn rejects_header_line_without_colon() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::from(&b"garbage\r\n\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::MalformedHeader(_))
        ));
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = DapCodec::with_max_frame_len(16);
        let mut buf = BytesMut::from(&b"Content-Length: 17\r\n\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::FrameTooLarge { len: 17, max: 16 })
        ));
    }

    #[test]
    fn rejects_unterminated_oversized_header() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::from(vec![b'a'; MAX_HEADER_LEN + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::HeaderTooLarge)
        ));
    }

    #[test]
    fn rejects_invalid_json_body() {
        let mut codec = DapCodec::new();
        let mut buf = frame("{not json}");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::InvalidMessage(_))
        ));
    }

    #[test]
    fn eof_mid_body_is_truncation() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: 50\r\n\r\n{\"seq\":1"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FramingError::Truncated { buffered: 8 })
        ));
    }

    #[test]
    fn eof_at_frame_boundary_is_clean() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::from(&b"\r\n"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
