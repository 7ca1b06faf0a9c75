//! Newline-delimited JSON framing.
//!
//! Frames may arrive split across reads or several to a read. The decoder
//! buffers until it sees the separator; a frame that fails to parse is logged
//! and dropped and decoding carries on with the rest of the buffer.

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::envelope::{Envelope, MessageType};

pub const FRAME_SEPARATOR: u8 = b'\n';
const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no frame separator within {max} bytes")]
    FrameTooLong { max: usize },
    #[error("encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Serialize one message into a self-delimited frame.
pub fn encode(
    msg_type: MessageType,
    sender_id: &str,
    content: Value,
    to: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    let env = Envelope {
        msg_type,
        sender_id: sender_id.to_string(),
        to: to.to_string(),
        content,
    };
    let mut out = serde_json::to_vec(&env)?;
    out.push(FRAME_SEPARATOR);
    Ok(out)
}

/// Parse one frame, with or without its trailing separator.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(bytes)?;
    Ok(serde_json::from_str(text.trim_end())?)
}

/// `tokio_util` codec producing one [`Envelope`] per line.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_frame_len: usize,
    // Bytes already scanned for a separator, so partial reads are not rescanned.
    next_index: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            next_index: 0,
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_logged(frame: &[u8]) -> Option<Envelope> {
    match decode(frame) {
        Ok(env) => Some(env),
        Err(e) => {
            warn!("dropping undecodable frame ({} bytes): {e}", frame.len());
            None
        }
    }
}

fn is_blank(frame: &[u8]) -> bool {
    frame.iter().all(u8::is_ascii_whitespace)
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        loop {
            let start = self.next_index.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == FRAME_SEPARATOR) else {
                if src.len() > self.max_frame_len {
                    return Err(CodecError::FrameTooLong {
                        max: self.max_frame_len,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let line = src.split_to(start + offset + 1);
            self.next_index = 0;
            let frame = &line[..line.len() - 1];
            if is_blank(frame) {
                continue;
            }
            if let Some(env) = decode_logged(frame) {
                return Ok(Some(env));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        if let Some(env) = self.decode(src)? {
            return Ok(Some(env));
        }
        // Trailing bytes without a separator: last chance to parse them.
        let rest = src.split();
        self.next_index = 0;
        if is_blank(&rest) {
            return Ok(None);
        }
        Ok(decode_logged(&rest))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), CodecError> {
        let data = serde_json::to_vec(&item).map_err(CodecError::Encode)?;
        dst.reserve(data.len() + 1);
        dst.put_slice(&data);
        dst.put_u8(FRAME_SEPARATOR);
        Ok(())
    }
}
