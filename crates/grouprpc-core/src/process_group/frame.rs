//! Length-prefixed framing for the TCP process group.
//!
//! ```text
//! [u32 BE: len][kind: u8][body of len - 1 bytes]
//! ```
//!
//! Kinds: `HELLO` (body: u32 BE rank of the connecting side), `DATA` (body:
//! an encoded message), `BARRIER` (body: u64 BE epoch).

use crate::config::GroupConfig;
use crate::{Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One frame of the TCP group protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupFrame {
    Hello { rank: u32 },
    Data(Bytes),
    Barrier { epoch: u64 },
}

const KIND_HELLO: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_BARRIER: u8 = 2;

impl GroupFrame {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            GroupFrame::Hello { rank } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8(KIND_HELLO);
                buf.put_u32(*rank);
                buf.freeze()
            }
            GroupFrame::Data(data) => {
                let mut buf = BytesMut::with_capacity(1 + data.len());
                buf.put_u8(KIND_DATA);
                buf.put_slice(data);
                buf.freeze()
            }
            GroupFrame::Barrier { epoch } => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u8(KIND_BARRIER);
                buf.put_u64(*epoch);
                buf.freeze()
            }
        }
    }

    pub fn parse(mut raw: Bytes) -> Result<Self> {
        if raw.is_empty() {
            return Err(RpcError::codec("empty group frame"));
        }
        let kind = raw.get_u8();
        match kind {
            KIND_HELLO if raw.len() == 4 => Ok(GroupFrame::Hello {
                rank: raw.get_u32(),
            }),
            KIND_DATA => Ok(GroupFrame::Data(raw)),
            KIND_BARRIER if raw.len() == 8 => Ok(GroupFrame::Barrier {
                epoch: raw.get_u64(),
            }),
            _ => Err(RpcError::codec(format!(
                "malformed group frame (kind {}, {} body bytes)",
                kind,
                raw.len()
            ))),
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > GroupConfig::MAX_FRAME_SIZE {
        return Err(RpcError::codec(format!(
            "group frame size {} exceeds maximum {}",
            len,
            GroupConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Bytes::from(payload)))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > GroupConfig::MAX_FRAME_SIZE {
        return Err(RpcError::codec(format!(
            "group frame size {} exceeds maximum {}",
            payload.len(),
            GroupConfig::MAX_FRAME_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_frame_kinds_parse_back() {
        for frame in [
            GroupFrame::Hello { rank: 3 },
            GroupFrame::Data(Bytes::from_static(b"payload")),
            GroupFrame::Data(Bytes::new()),
            GroupFrame::Barrier { epoch: 42 },
        ] {
            assert_eq!(GroupFrame::parse(frame.to_bytes()).unwrap(), frame);
        }
    }

    #[test]
    fn test_group_frame_rejects_malformed() {
        assert!(GroupFrame::parse(Bytes::new()).is_err());
        assert!(GroupFrame::parse(Bytes::from_static(&[KIND_HELLO, 1])).is_err());
        assert!(GroupFrame::parse(Bytes::from_static(&[9, 0, 0])).is_err());
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back.as_deref(), Some(&payload[..]));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (GroupConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
