//! Multipart frame codec.
//!
//! Wire form: `u32` part count, then for each part a `u32` length followed
//! by the raw bytes (all little-endian). Publications are two parts
//! `[key, payload]`, request/reply traffic is four parts
//! `[address, uuid, topic, payload]`, subscription control is a single part
//! whose first byte is `0x01` (subscribe) or `0x00` (unsubscribe) followed
//! by the key.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bounds enforced while decoding. Any frame exceeding them is a
/// protocol violation, not a legitimate payload.
pub const MAX_PARTS: u32 = 8;
pub const MAX_PART_LEN: u32 = 16 * 1024 * 1024;

pub const SUBSCRIBE_CTL: u8 = 0x01;
pub const UNSUBSCRIBE_CTL: u8 = 0x00;

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, parts: &[&[u8]]) -> io::Result<()> {
    writer.write_u32_le(parts.len() as u32).await?;
    for part in parts {
        writer.write_u32_le(part.len() as u32).await?;
        writer.write_all(part).await?;
    }
    writer.flush().await
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<Vec<u8>>> {
    let count = reader.read_u32_le().await?;
    if count == 0 || count > MAX_PARTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame part count {count}"),
        ));
    }
    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32_le().await?;
        if len > MAX_PART_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame part of {len} bytes exceeds limit"),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        parts.push(buf);
    }
    Ok(parts)
}

/// Lossy UTF-8 view of a frame part; payloads are JSON text by contract.
pub fn part_str(part: &[u8]) -> String {
    String::from_utf8_lossy(part).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_multipart() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[b"db/m/imu/liveall", b"{\"x\":1}"])
            .await
            .unwrap();
        let parts = read_frame(&mut b).await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], b"db/m/imu/liveall");
        assert_eq!(part_str(&parts[1]), "{\"x\":1}");
    }

    #[tokio::test]
    async fn empty_parts_are_preserved() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[b"db/c", b"ab12cd34", b"ping", b""])
            .await
            .unwrap();
        let parts = read_frame(&mut b).await.unwrap();
        assert_eq!(parts.len(), 4);
        assert!(parts[3].is_empty());
    }

    #[tokio::test]
    async fn oversized_count_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32_le(1000).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn consecutive_frames_do_not_bleed() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[b"k1", b"v1"]).await.unwrap();
        write_frame(&mut a, &[b"k2", b"v2"]).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap()[0], b"k1");
        assert_eq!(read_frame(&mut b).await.unwrap()[1], b"v2");
    }
}
