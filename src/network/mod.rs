//! Network Module
//!
//! Handles TCP communication between nodes: a server exposing the local
//! `InternalApi`, and a client that is itself an `InternalApi`.

pub mod protocol;
mod server;
mod client;

pub use protocol::{ErrorCode, FrameHeader, Message, Request, Response};
pub use server::NetworkServer;
pub use client::RemoteClient;

use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);
    if header.length > protocol::MAX_FRAME_SIZE {
        return Err(Error::Network(format!("Frame of {} bytes exceeds limit", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_through_buffer() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Message::Chunk(b"payload".to_vec())).await.unwrap();

        let mut reader = buffer.as_slice();
        match read_message(&mut reader).await.unwrap() {
            Message::Chunk(data) => assert_eq!(data, b"payload"),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Message::EndOfStream).await.unwrap();
        let last = buffer.len() - 1;
        buffer[last] ^= 0xff;

        let mut reader = buffer.as_slice();
        assert!(matches!(read_message(&mut reader).await, Err(Error::Network(_))));
    }
}
