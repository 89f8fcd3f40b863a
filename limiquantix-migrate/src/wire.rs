//! Handshake channel: a minimal framed protocol over an already-connected
//! bidirectional byte stream.
//!
//! ```text
//! frame := len:u16_be payload[len]
//! len == 0  => Success
//! len  > 0  => Error(utf8 payload)
//! ```
//!
//! No versioning, no heartbeats -- signalling deliberately bypasses the
//! cluster database so the two hosts never contend for the locks they
//! must already hold for migration.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MigrationError, Result};

/// A single handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Success,
    Error(String),
}

/// Send a `Success` frame.
pub async fn send_success<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    send(w, &Handshake::Success).await
}

/// Send an `Error(msg)` frame.
pub async fn send_error<W: AsyncWrite + Unpin>(w: &mut W, msg: impl Into<String>) -> Result<()> {
    send(w, &Handshake::Error(msg.into())).await
}

async fn send<W: AsyncWrite + Unpin>(w: &mut W, frame: &Handshake) -> Result<()> {
    let payload: &[u8] = match frame {
        Handshake::Success => &[],
        Handshake::Error(msg) => msg.as_bytes(),
    };

    if payload.len() > u16::MAX as usize {
        return Err(MigrationError::RemoteFailed(
            "handshake payload exceeds u16 length prefix".to_string(),
        ));
    }

    let len = (payload.len() as u16).to_be_bytes();
    w.write_all(&len)
        .await
        .map_err(|e| MigrationError::RemoteFailed(format!("short write (length): {e}")))?;
    if !payload.is_empty() {
        w.write_all(payload)
            .await
            .map_err(|e| MigrationError::RemoteFailed(format!("short write (payload): {e}")))?;
    }
    w.flush()
        .await
        .map_err(|e| MigrationError::RemoteFailed(format!("flush failed: {e}")))?;

    Ok(())
}

/// Receive a single frame, returning either `Handshake::Success` or
/// `Handshake::Error` to the caller. Use [`recv_success`] when an `Error`
/// frame should simply fail the operation.
pub async fn recv<R: AsyncRead + Unpin>(r: &mut R) -> Result<Handshake> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)
        .await
        .map_err(|e| MigrationError::RemoteFailed(format!("short read (length): {e}")))?;
    let len = u16::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Ok(Handshake::Success);
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| MigrationError::RemoteFailed(format!("short read (payload): {e}")))?;

    let msg = String::from_utf8(payload)
        .map_err(|e| MigrationError::RemoteFailed(format!("non-utf8 error payload: {e}")))?;

    Ok(Handshake::Error(msg))
}

/// `recv` that raises `MigrationError::RemoteFailed` on `Error`.
pub async fn recv_success<R: AsyncRead + Unpin>(r: &mut R) -> Result<()> {
    match recv(r).await? {
        Handshake::Success => Ok(()),
        Handshake::Error(msg) => Err(MigrationError::RemoteFailed(msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_success() {
        let (mut a, mut b) = duplex(64);
        send_success(&mut a).await.unwrap();
        assert_eq!(recv(&mut b).await.unwrap(), Handshake::Success);
    }

    #[tokio::test]
    async fn round_trips_error() {
        let (mut a, mut b) = duplex(64);
        send_error(&mut a, "disk attach failed").await.unwrap();
        assert_eq!(
            recv(&mut b).await.unwrap(),
            Handshake::Error("disk attach failed".to_string())
        );
    }

    #[tokio::test]
    async fn recv_success_raises_on_error_frame() {
        let (mut a, mut b) = duplex(64);
        send_error(&mut a, "boom").await.unwrap();
        let err = recv_success(&mut b).await.unwrap_err();
        match err {
            MigrationError::RemoteFailed(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_read_fails_with_remote_failed() {
        let (mut a, mut b) = duplex(64);
        // Write a length prefix declaring a payload that will never come,
        // then drop the writer -- the peer must see a framing failure.
        AsyncWriteExt::write_all(&mut a, &5u16.to_be_bytes())
            .await
            .unwrap();
        drop(a);
        let err = recv(&mut b).await.unwrap_err();
        assert!(matches!(err, MigrationError::RemoteFailed(_)));
    }
}
