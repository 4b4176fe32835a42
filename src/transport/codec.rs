//! NDJSON codec for message serialization
//!
//! This module provides the encoding/decoding logic for the line-delimited
//! JSON protocol: every frame is one JSON document followed by a single `\n`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on a single frame, excluding the delimiter
pub const DEFAULT_MAX_FRAME_LEN: usize = 32767;

const DELIMITER: u8 = b'\n';

/// Codec error types
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame exceeds the {max} byte limit")]
    FrameTooLarge { max: usize },
    #[error("Frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Codec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Line-delimited JSON codec for messages of type `M`
#[derive(Debug)]
pub struct JsonLineCodec<M> {
    max_frame_len: usize,
    // Bytes already scanned for a delimiter on the previous call
    next_index: usize,
    _message: PhantomData<fn() -> M>,
}

impl<M> JsonLineCodec<M> {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            next_index: 0,
            _message: PhantomData,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl<M> Default for JsonLineCodec<M> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl<M> Clone for JsonLineCodec<M> {
    fn clone(&self) -> Self {
        Self::new(self.max_frame_len)
    }
}

/// Encode a message into a single NDJSON frame (JSON + newline)
pub fn encode_frame<M: Serialize>(message: &M, max_frame_len: usize) -> Result<Bytes, CodecError> {
    let mut json = serde_json::to_vec(message)?;
    if json.len() > max_frame_len {
        return Err(CodecError::FrameTooLarge { max: max_frame_len });
    }
    json.push(DELIMITER);
    Ok(Bytes::from(json))
}

/// Decode one frame body (without its delimiter) into a message
pub fn decode_frame<M: DeserializeOwned>(frame: &[u8]) -> Result<M, CodecError> {
    let text = std::str::from_utf8(frame)?;
    let message = serde_json::from_str(text.trim_end_matches('\r'))?;
    Ok(message)
}

impl<M: DeserializeOwned> Decoder for JsonLineCodec<M> {
    type Item = M;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<M>, CodecError> {
        // A frame body of exactly `max_frame_len` bytes puts the delimiter at that index
        let read_to = src.len().min(self.max_frame_len.saturating_add(1));

        match src[self.next_index..read_to]
            .iter()
            .position(|b| *b == DELIMITER)
        {
            Some(offset) => {
                let delimiter_index = self.next_index + offset;
                self.next_index = 0;
                let frame = src.split_to(delimiter_index + 1);
                decode_frame(&frame[..delimiter_index]).map(Some)
            }
            None if src.len() > self.max_frame_len => {
                self.next_index = 0;
                Err(CodecError::FrameTooLarge {
                    max: self.max_frame_len,
                })
            }
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<M>, CodecError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => {
                if !src.is_empty() {
                    log::debug!("Discarding {} bytes of unterminated frame at EOF", src.len());
                    src.clear();
                    self.next_index = 0;
                }
                Ok(None)
            }
        }
    }
}

impl<M: Serialize> Encoder<M> for JsonLineCodec<M> {
    type Error = CodecError;

    fn encode(&mut self, message: M, dst: &mut BytesMut) -> Result<(), CodecError> {
        let frame = encode_frame(&message, self.max_frame_len)?;
        dst.reserve(frame.len());
        dst.put(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::{Value, json};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Greeting {
        id: u32,
        text: String,
    }

    #[test]
    fn test_encode_frame_appends_single_newline() {
        let frame = encode_frame(&json!({"id": 1}), DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(&frame[..], b"{\"id\":1}\n");
    }

    #[test]
    fn test_encode_escapes_embedded_newlines() {
        let message = Greeting {
            id: 7,
            text: "two\nlines".to_string(),
        };
        let frame = encode_frame(&message, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(frame.last(), Some(&b'\n'));
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let message = json!({"text": "x".repeat(64)});
        let err = encode_frame(&message, 16).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 16 }));
    }

    #[test]
    fn test_decode_split_across_reads() {
        let mut codec = JsonLineCodec::<Greeting>::default();
        let mut buf = BytesMut::from(&b"{\"id\":3,\"te"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"xt\":\"hi\"}\n{\"id\":4");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            first,
            Greeting {
                id: 3,
                text: "hi".to_string()
            }
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"id\":4");
    }

    #[test]
    fn test_decode_multiple_frames_in_order() {
        let mut codec = JsonLineCodec::<Value>::default();
        let mut buf = BytesMut::from(&b"{\"id\":1}\n{\"id\":2}\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"id": 1})));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"id": 2})));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_frame_at_exact_limit() {
        let mut codec = JsonLineCodec::<Value>::new(8);
        let mut buf = BytesMut::from(&b"\"123456\"\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!("123456")));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut codec = JsonLineCodec::<Value>::new(8);
        let mut buf = BytesMut::from(&b"\"1234567\"\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 8 }));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let mut codec = JsonLineCodec::<Value>::default();
        let mut buf = BytesMut::from(&b"\"\xff\xfe\"\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_decode_malformed_json() {
        let mut codec = JsonLineCodec::<Greeting>::default();
        let mut buf = BytesMut::from(&b"{\"id\":\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Serialization(_))
        ));
    }

    #[test]
    fn test_decode_eof_discards_partial_frame() {
        let mut codec = JsonLineCodec::<Value>::default();
        let mut buf = BytesMut::from(&b"{\"id\":1}\n{\"id\""[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(json!({"id": 1})));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encoder_matches_encode_frame() {
        let mut codec = JsonLineCodec::<Greeting>::default();
        let mut dst = BytesMut::new();
        let message = Greeting {
            id: 9,
            text: "ok".to_string(),
        };
        let expected = encode_frame(&message, DEFAULT_MAX_FRAME_LEN).unwrap();
        codec.encode(message, &mut dst).unwrap();
        assert_eq!(&dst[..], &expected[..]);
    }
}
