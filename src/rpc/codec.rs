//! Length-prefixed JSON framing
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON.
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MeshError, Result};

pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(MeshError::Transport(format!("Failed to read length prefix: {}", e))),
    }

    let frame_len = u32::from_be_bytes(len_bytes) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(MeshError::Transport(format!(
            "Frame too large: {} bytes",
            frame_len
        )));
    }

    let mut buf = vec![0u8; frame_len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| MeshError::Transport(format!("Failed to read frame data: {}", e)))?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(MeshError::Transport(format!(
            "Frame too large: {} bytes",
            data.len()
        )));
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"{\"a\":1}").await.unwrap();
        write_frame(&mut client, b"[]").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"[]");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &len)
            .await
            .unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(MeshError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &10u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"abc")
            .await
            .unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }
}
