//! Stream framing for MessagePack values
//!
//! MessagePack values are self-delimiting, so a frame is exactly one encoded
//! value. The decoder accumulates bytes until a complete value is available
//! and leaves any remainder in the buffer for the next call.
//!
//! A complete frame whose content is ill-typed is consumed and yielded as
//! [`Frame::Malformed`], so one bad message does not end the stream. Only
//! oversized input and bytes with no recognisable frame boundary are fatal.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::rpc::codec;
use crate::rpc::error::{CodecError, DecodeError};
use crate::rpc::message::Message;
use crate::rpc::value::Value;

/// Maximum bytes buffered for a single incomplete message
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// One decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Value(Value),
    /// A well-delimited frame whose content failed to decode
    Malformed {
        error: DecodeError,
        /// Set when the frame is recognisably a response
        request_id: Option<u64>,
    },
}

/// Codec turning a byte stream into a stream of values and back
#[derive(Debug, Default, Clone, Copy)]
pub struct ValueCodec;

impl ValueCodec {
    pub fn new() -> Self {
        Self
    }
}

impl ValueCodec {
    fn incomplete(src: &BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: src.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        trace!("ValueCodec: Incomplete frame ({} bytes buffered)", src.len());
        Ok(None)
    }
}

impl Decoder for ValueCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match codec::decode_prefix(&src[..]) {
            Ok((value, used)) => {
                src.advance(used);
                trace!("ValueCodec: Decoded frame ({} bytes)", used);
                Ok(Some(Frame::Value(value)))
            }
            Err(DecodeError::Truncated) => Self::incomplete(src),
            Err(error) => match codec::skip_prefix(&src[..]) {
                Ok(used) => {
                    let request_id = Message::response_id(&src[..used]);
                    src.advance(used);
                    warn!("ValueCodec: Skipped malformed frame ({} bytes): {}", used, error);
                    Ok(Some(Frame::Malformed { error, request_id }))
                }
                Err(DecodeError::Truncated) => Self::incomplete(src),
                Err(fatal) => Err(CodecError::Decode(fatal)),
            },
        }
    }
}

impl Encoder<Value> for ValueCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = codec::encode(&item)?;
        trace!("ValueCodec: Encoding frame ({} bytes)", bytes.len());
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(message: Message) -> Vec<u8> {
        codec::encode(&message.into_value()).unwrap()
    }

    fn message(frame: Frame) -> Message {
        match frame {
            Frame::Value(value) => Message::from_value(value).unwrap(),
            other => panic!("Expected a value frame, got: {other:?}"),
        }
    }

    #[test]
    fn test_decode_partial_frame() {
        let bytes = encoded(Message::Notification {
            method: "redraw".to_string(),
            params: vec![Value::from("flush")],
        });
        let mut codec = ValueCodec::new();
        let mut buf = BytesMut::from(&bytes[..5]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5, "incomplete bytes stay buffered");

        buf.extend_from_slice(&bytes[5..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message(frame).method(), Some("redraw"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut bytes = encoded(Message::Request {
            id: 1,
            method: "nvim_get_mode".to_string(),
            params: vec![],
        });
        bytes.extend(encoded(Message::Request {
            id: 2,
            method: "nvim_get_current_buf".to_string(),
            params: vec![],
        }));

        let mut codec = ValueCodec::new();
        let mut buf = BytesMut::from(&bytes[..]);
        let first = message(codec.decode(&mut buf).unwrap().unwrap());
        let second = message(codec.decode(&mut buf).unwrap().unwrap());

        assert_eq!(first.method(), Some("nvim_get_mode"));
        assert_eq!(second.method(), Some("nvim_get_current_buf"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_malformed_frame() {
        let mut codec = ValueCodec::new();
        let mut buf = BytesMut::from(&[0xc1u8][..]);
        match codec.decode(&mut buf) {
            Err(CodecError::Decode(DecodeError::ReservedMarker(0xc1))) => {}
            other => panic!("Expected ReservedMarker error, got: {other:?}"),
        }
    }

    #[test]
    fn test_ill_typed_frame_is_skipped() {
        let mut codec = ValueCodec::new();
        // [2, "ev", ["\xff"]] then a valid notification
        let mut buf = BytesMut::from(&[0x93u8, 0x02, 0xa2, b'e', b'v', 0x91, 0xa1, 0xff][..]);
        buf.extend_from_slice(&encoded(Message::Notification {
            method: "after".to_string(),
            params: vec![],
        }));

        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Malformed {
                error: DecodeError::InvalidUtf8(_),
                request_id: None,
            }) => {}
            other => panic!("Expected a malformed frame, got: {other:?}"),
        }
        let next = message(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(next.method(), Some("after"));
    }

    #[test]
    fn test_malformed_response_keeps_its_id() {
        let mut codec = ValueCodec::new();
        // [1, 7, nil, uint64::MAX]
        let mut buf = BytesMut::from(
            &[0x94u8, 0x01, 0x07, 0xc0, 0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff][..],
        );
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Malformed {
                error: DecodeError::IntegerOverflow(_),
                request_id: Some(7),
            }) => {}
            other => panic!("Expected a malformed response, got: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_ill_typed_frame_waits_for_more() {
        let mut codec = ValueCodec::new();
        // Bad string inside an array still missing its second element
        let mut buf = BytesMut::from(&[0x92u8, 0xa1, 0xff][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&[0xc0]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Malformed { .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_message_too_large() {
        let mut codec = ValueCodec::new();
        // str32 header claiming far more bytes than will ever arrive
        let mut buf = BytesMut::from(&[0xdbu8, 0xff, 0xff, 0xff, 0xff][..]);
        buf.resize(MAX_MESSAGE_SIZE + 8, b'a');
        match codec.decode(&mut buf) {
            Err(CodecError::MessageTooLarge { max, .. }) => assert_eq!(max, MAX_MESSAGE_SIZE),
            other => panic!("Expected MessageTooLarge error, got: {other:?}"),
        }
    }

    #[test]
    fn test_encode_frame() {
        let mut codec = ValueCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Value::from(true), &mut buf).unwrap();
        codec.encode(Value::Nil, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0xc3, 0xc0]);
    }
}
