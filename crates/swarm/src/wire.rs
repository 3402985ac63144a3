//! Varint-delimited multi-frame I/O.
//!
//! An envelope on the stream is a varint frame count followed by each frame
//! as varint length plus bytes.  Oversized counts and frames are rejected
//! before allocation.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MAX_VARINT_BYTES: usize = 5;
/// Frames per envelope: tag + payloads + signature; generous headroom.
const MAX_FRAMES: u32 = 16;

pub async fn write_frames<W>(writer: &mut W, frames: &[Vec<u8>]) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut buf = Vec::new();
    write_varint(frames.len() as u32, &mut buf);
    for frame in frames {
        write_varint(frame.len() as u32, &mut buf);
        buf.extend_from_slice(frame);
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}

pub async fn read_frames<R>(reader: &mut R, max_frame: usize) -> io::Result<Vec<Vec<u8>>>
where
    R: AsyncReadExt + Unpin,
{
    let count = read_varint(reader).await?;
    if count == 0 || count > MAX_FRAMES {
        return Err(invalid(format!("envelope frame count {count} out of range")));
    }
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_varint(reader).await? as usize;
        if len > max_frame {
            return Err(invalid(format!("frame of {len} bytes exceeds limit")));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(frames)
}

async fn read_varint<R>(reader: &mut R) -> io::Result<u32>
where
    R: AsyncReadExt + Unpin,
{
    let mut result: u32 = 0;
    let mut shift = 0;
    for _ in 0..MAX_VARINT_BYTES {
        let byte = reader.read_u8().await?;
        result |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
    Err(invalid("varint runs past five bytes".to_string()))
}

fn write_varint(value: u32, buf: &mut Vec<u8>) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if val == 0 {
            break;
        }
    }
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_frames() {
        let (mut client, mut server) = duplex(256);
        let frames = vec![vec![1u8], vec![0xde, 0xad, 0xbe, 0xef], Vec::new()];
        write_frames(&mut client, &frames).await.expect("write");
        let decoded = read_frames(&mut server, 1024).await.expect("read");
        assert_eq!(decoded, frames);
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut client, mut server) = duplex(256);
        write_frames(&mut client, &[vec![0u8; 64]])
            .await
            .expect("write");
        let err = read_frames(&mut server, 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_empty_envelope() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0u8]).await.expect("count");
        let err = read_frames(&mut server, 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
