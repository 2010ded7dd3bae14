//! Length-prefixed framing for the stream transport.
//!
//! ```text
//! [ASCII decimal payload length]['\n'][payload bytes]
//! ```
//!
//! The newline ends the header, so payloads that start with digits (module
//! text, signature tokens) stay unambiguous. End of stream anywhere inside a
//! frame means the peer closed the connection.

use crate::config::StreamConfig;
use crate::error::{OffloadError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame of at most `max_len` payload bytes.
///
/// Returns `None` when the peer closed the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len: usize = 0;
    let mut digits = 0;
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if is_disconnect(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match byte {
            b'\n' if digits > 0 => break,
            b'0'..=b'9' if digits < StreamConfig::MAX_LENGTH_DIGITS => {
                digits += 1;
                len = len
                    .saturating_mul(10)
                    .saturating_add((byte - b'0') as usize);
            }
            other => {
                return Err(OffloadError::protocol(format!(
                    "invalid frame header byte '{}'",
                    other.escape_ascii()
                )))
            }
        }
    }

    if len > max_len {
        return Err(OffloadError::MessageTooLarge { size: len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if is_disconnect(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write one frame: the length header, then the payload.
///
/// A peer that already went away surfaces as `PeerClosed`.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let header = format!("{}\n", payload.len());
    let written = async {
        writer.write_all(header.as_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    };
    match written.await {
        Ok(()) => Ok(()),
        Err(e) if is_disconnect(&e) => Err(OffloadError::PeerClosed),
        Err(e) => Err(e.into()),
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"5;32:add:5;32:5;32").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();
        assert!(buf.starts_with(b"18\n5;32"));

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(
            read_frame(&mut cursor, 64).await.unwrap(),
            Some(b"5;32:add:5;32:5;32".to_vec())
        );
        assert_eq!(read_frame(&mut cursor, 64).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut cursor, 64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_truncated_payload_is_peer_closed() {
        let mut cursor = std::io::Cursor::new(b"10\nabc".to_vec());
        assert!(read_frame(&mut cursor, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_is_peer_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut client = client;
        assert!(matches!(
            write_frame(&mut client, b"add:1:2").await.unwrap_err(),
            OffloadError::PeerClosed
        ));
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let mut cursor = std::io::Cursor::new(b"65\nabc".to_vec());
        let err = read_frame(&mut cursor, 64).await.unwrap_err();
        assert!(matches!(err, OffloadError::MessageTooLarge { size: 65, max: 64 }));
    }

    #[tokio::test]
    async fn test_frame_bad_header_returns_error() {
        for bad in [&b"\nabc"[..], b"1x\na", b"-1\na", b"123456789012345678901\n"] {
            let mut cursor = std::io::Cursor::new(bad.to_vec());
            assert!(read_frame(&mut cursor, 64).await.is_err(), "{:?}", bad);
        }
    }
}
