//! RPC message envelope and its flat wire encoding.
//!
//! ```text
//! [u8 version][u8 type][u64 BE id][u32 BE op_len][op UTF-8][u32 BE payload_len][payload]
//! ```

use crate::{Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const WIRE_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 1 + 8 + 4;

/// Kind of message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    Response,
    Exception,
    /// Control signal sent by an agent that has finished draining.
    Shutdown,
}

impl MessageType {
    fn as_u8(self) -> u8 {
        match self {
            MessageType::Request => 0,
            MessageType::Response => 1,
            MessageType::Exception => 2,
            MessageType::Shutdown => 3,
        }
    }

    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::Exception),
            3 => Some(MessageType::Shutdown),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Request => write!(f, "REQUEST"),
            MessageType::Response => write!(f, "RESPONSE"),
            MessageType::Exception => write!(f, "EXCEPTION"),
            MessageType::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// An immutable RPC envelope.
///
/// Replies reuse the id of the request they answer. The payload is opaque to
/// this crate; for an Exception it holds the UTF-8 error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u64,
    kind: MessageType,
    operation: String,
    payload: Bytes,
}

impl Message {
    pub fn request(id: u64, operation: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind: MessageType::Request,
            operation: operation.into(),
            payload: payload.into(),
        }
    }

    pub fn response(id: u64, operation: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind: MessageType::Response,
            operation: operation.into(),
            payload: payload.into(),
        }
    }

    pub fn exception(id: u64, operation: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            kind: MessageType::Exception,
            operation: operation.into(),
            payload: Bytes::from(error.into()),
        }
    }

    pub fn shutdown() -> Self {
        Self {
            id: 0,
            kind: MessageType::Shutdown,
            operation: String::new(),
            payload: Bytes::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Error text of an Exception, `None` for any other kind.
    pub fn exception_text(&self) -> Option<String> {
        (self.kind == MessageType::Exception)
            .then(|| String::from_utf8_lossy(&self.payload).into_owned())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(HEADER_LEN + self.operation.len() + 4 + self.payload.len());
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.kind.as_u8());
        buf.put_u64(self.id);
        buf.put_u32(self.operation.len() as u32);
        buf.put_slice(self.operation.as_bytes());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut buf = frame;
        if buf.remaining() < HEADER_LEN {
            return Err(RpcError::codec(format!(
                "frame of {} bytes is shorter than the {} byte header",
                frame.len(),
                HEADER_LEN
            )));
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(RpcError::codec(format!(
                "unsupported wire version {}",
                version
            )));
        }
        let tag = buf.get_u8();
        let kind = MessageType::from_u8(tag)
            .ok_or_else(|| RpcError::codec(format!("unknown message type tag {}", tag)))?;
        let id = buf.get_u64();

        let op_len = buf.get_u32() as usize;
        if buf.remaining() < op_len {
            return Err(RpcError::codec("operation name truncated"));
        }
        let operation = std::str::from_utf8(&buf[..op_len])
            .map_err(|e| RpcError::codec(format!("operation name is not UTF-8: {}", e)))?
            .to_string();
        buf.advance(op_len);

        if buf.remaining() < 4 {
            return Err(RpcError::codec("payload length truncated"));
        }
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() < payload_len {
            return Err(RpcError::codec("payload truncated"));
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);

        if buf.has_remaining() {
            return Err(RpcError::codec(format!(
                "{} trailing bytes after payload",
                buf.remaining()
            )));
        }
        if kind == MessageType::Shutdown && !payload.is_empty() {
            return Err(RpcError::codec("shutdown message carries a payload"));
        }

        Ok(Self {
            id,
            kind,
            operation,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_every_kind() {
        let messages = [
            Message::request(7, "add", Bytes::from_static(b"[2,3]")),
            Message::response(7, "add", Bytes::from_static(b"5")),
            Message::exception(7, "add", "malformed payload"),
            Message::shutdown(),
        ];
        for message in messages {
            let decoded = Message::decode(&message.encode()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_roundtrip_empty_fields() {
        let message = Message::request(u64::MAX, "", Bytes::new());
        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.id(), u64::MAX);
        assert_eq!(decoded.operation(), "");
        assert!(decoded.payload().is_empty());
    }

    #[test]
    fn test_roundtrip_binary_payload() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let message = Message::response(3, "bytes", payload.clone());
        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.payload().as_ref(), payload.as_slice());
    }

    #[test]
    fn test_exception_text() {
        let message = Message::exception(1, "div", "division by zero");
        assert_eq!(message.exception_text().as_deref(), Some("division by zero"));
        assert!(Message::response(1, "div", "1").exception_text().is_none());
    }

    #[test]
    fn test_decode_rejects_truncated_frames() {
        let encoded = Message::request(1, "echo", "hello").encode();
        for cut in [0, 5, HEADER_LEN, encoded.len() - 1] {
            let result = Message::decode(&encoded[..cut]);
            assert!(
                matches!(result, Err(RpcError::Codec { .. })),
                "cut at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut encoded = Message::request(1, "echo", "hello").encode().to_vec();
        encoded.push(0);
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_tag_and_version() {
        let mut encoded = Message::request(1, "echo", "").encode().to_vec();
        encoded[1] = 9;
        assert!(Message::decode(&encoded).is_err());

        let mut encoded = Message::request(1, "echo", "").encode().to_vec();
        encoded[0] = 2;
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_shutdown_payload() {
        let mut forged = Message::response(0, "", "x").encode().to_vec();
        forged[1] = MessageType::Shutdown.as_u8();
        assert!(Message::decode(&forged).is_err());
    }

    #[test]
    fn test_decode_rejects_invalid_utf8_operation() {
        let mut encoded = Message::request(1, "ab", "").encode().to_vec();
        encoded[HEADER_LEN] = 0xff;
        assert!(Message::decode(&encoded).is_err());
    }
}
