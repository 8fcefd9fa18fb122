//! Wire codec
//!
//! Little-endian framed encoding of [`Envelope`]s: a fixed header
//! followed by `payload_len` opaque bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Envelope, Header, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::common::error::{ProxyError, Result};

fn encode_header(header: &Header) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    let mut cursor = &mut buf[..];
    cursor.put_u16_le(header.msg_type);
    cursor.put_i32_le(header.src_id);
    cursor.put_i32_le(header.dest_id);
    cursor.put_i32_le(header.src_rank);
    cursor.put_i32_le(header.dest_rank);
    cursor.put_u32_le(header.payload_len);
    buf
}

fn decode_header(buf: &[u8; HEADER_LEN]) -> Header {
    let mut cursor = &buf[..];
    Header {
        msg_type: cursor.get_u16_le(),
        src_id: cursor.get_i32_le(),
        dest_id: cursor.get_i32_le(),
        src_rank: cursor.get_i32_le(),
        dest_rank: cursor.get_i32_le(),
        payload_len: cursor.get_u32_le(),
    }
}

/// Send one message
///
/// Writes the header and payload and flushes the stream.
pub async fn send_message<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert_eq!(envelope.header.payload_len as usize, envelope.payload.len());

    writer
        .write_all(&encode_header(&envelope.header))
        .await
        .map_err(ProxyError::Io)?;

    if !envelope.payload.is_empty() {
        writer
            .write_all(&envelope.payload)
            .await
            .map_err(ProxyError::Io)?;
    }

    writer.flush().await.map_err(ProxyError::Io)?;
    Ok(())
}

/// Receive one message
///
/// Reads exactly one header and its payload. A connection closed
/// cleanly between messages surfaces as an `UnexpectedEof` IO error.
/// A frame claiming more than [`MAX_PAYLOAD_LEN`] bytes is rejected
/// without allocation.
pub async fn recv_message<R>(reader: &mut R) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header_buf)
        .await
        .map_err(ProxyError::Io)?;

    let header = decode_header(&header_buf);

    if header.payload_len > MAX_PAYLOAD_LEN {
        return Err(ProxyError::Protocol(format!(
            "Payload length {} exceeds limit {}",
            header.payload_len, MAX_PAYLOAD_LEN
        )));
    }

    let payload = if header.payload_len > 0 {
        let mut buf = BytesMut::zeroed(header.payload_len as usize);
        reader.read_exact(&mut buf).await.map_err(ProxyError::Io)?;
        buf.freeze()
    } else {
        Bytes::new()
    };

    Ok(Envelope { header, payload })
}
