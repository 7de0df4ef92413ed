// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Length-prefixed framing for envelopes on a TCP stream
//!
//! Two bytes of big-endian unsigned length, then exactly that many bytes
//! of envelope. No magic, no version, no trailing data. Both the prefix
//! and the body are read with exact-length reads; a peer that closes
//! mid-frame is an I/O error, never a truncated frame.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Largest body a 16-bit length prefix can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Write one framed envelope.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Encode(format!(
            "frame body of {} bytes exceeds {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    stream.write_all(&(body.len() as u16).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed envelope.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    let len = u16::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);

        let body = vec![0xA5u8; 1200];
        write_frame(&mut tx, &body).await.unwrap();

        let received = read_frame(&mut rx).await.unwrap();
        assert_eq!(received, body);
    }

    #[tokio::test]
    async fn empty_frame_round_trip() {
        let (mut tx, mut rx) = tokio::io::duplex(64);

        write_frame(&mut tx, &[]).await.unwrap();
        let received = read_frame(&mut rx).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let (mut tx, _rx) = tokio::io::duplex(64);

        let body = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = write_frame(&mut tx, &body).await.unwrap_err();
        assert!(matches!(err, Error::Encode(_)));
    }

    #[tokio::test]
    async fn truncated_body_is_an_io_error() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);

        tx.write_all(&100u16.to_be_bytes()).await.unwrap();
        tx.write_all(&[0u8; 10]).await.unwrap();
        drop(tx);

        let err = read_frame(&mut rx).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
