//! Backend message framing for tokio-util.

use bytes::BytesMut;
use postgres_protocol::message::backend::Message;
use tokio_util::codec::Decoder;

use crate::error::CodecError;

/// Default upper bound on a single backend message (1 GiB, the server's own
/// limit for a field value plus framing slack).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 30;

/// Splits a byte stream into backend messages.
///
/// Framing is delegated to [`Message::parse`]; this type adds a size ceiling
/// so a corrupt length prefix cannot make the reader buffer without bound.
#[derive(Debug, Clone)]
pub struct BackendCodec {
    max_message_size: usize,
}

impl BackendCodec {
    /// Create a codec with the default size ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Set a custom maximum message size.
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

impl Default for BackendCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BackendCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Header is a one-byte tag plus a four-byte length that counts itself.
        if src.len() >= 5 {
            let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
            if len > self.max_message_size {
                return Err(CodecError::Protocol(format!(
                    "message of {len} bytes exceeds limit of {}",
                    self.max_message_size
                )));
            }
        }

        Message::parse(src).map_err(|e| CodecError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn ready_for_query(status: u8) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Z');
        buf.put_u32(5);
        buf.put_u8(status);
        buf
    }

    #[test]
    fn test_decode_complete_message() {
        let mut codec = BackendCodec::new();
        let mut buf = ready_for_query(b'I');

        match codec.decode(&mut buf).unwrap() {
            Some(Message::ReadyForQuery(body)) => assert_eq!(body.status(), b'I'),
            _ => panic!("expected ReadyForQuery"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_message() {
        let mut codec = BackendCodec::new();
        let full = ready_for_query(b'T');
        let mut buf = BytesMut::from(&full[..3]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[3..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut codec = BackendCodec::new().with_max_message_size(16);
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(1024);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_tag_is_protocol_error() {
        let mut codec = BackendCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(b'!');
        buf.put_u32(4);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Protocol(_))
        ));
    }
}
