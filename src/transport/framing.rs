//! Length-prefixed frames on top of a [`Transport`].
//!
//! Each frame is a big-endian `u32` length followed by the payload, sent as a
//! single message. Readers pull the header, then the payload in chunks the
//! transport can queue.

use super::Transport;
use bytes::{Buf, Bytes, BytesMut};
use std::io;

/// The length of the length header in bytes (u32 = 4 bytes).
pub const HEADER_LEN: usize = 4;

/// Default maximum message size (1 MiB).
/// This limits the size of the payload, excluding the header.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Largest single read issued while collecting a payload.
const READ_CHUNK: usize = 64 * 1024;

/// Validates that the frame length does not exceed the maximum allowed size.
pub fn validate_frame_len(len: usize, max_len: usize) -> io::Result<()> {
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message length {} exceeds maximum allowed size {}", len, max_len),
        ));
    }
    Ok(())
}

/// Send `payload` as one frame.
pub async fn write_frame<T: Transport + ?Sized>(transport: &T, payload: Bytes, max_len: usize) -> io::Result<()> {
    validate_frame_len(payload.len(), max_len)?;
    let header = Bytes::copy_from_slice(&(payload.len() as u32).to_be_bytes());
    if payload.is_empty() {
        return transport.send(header).await;
    }
    transport.send_vectored(&[header, payload]).await
}

/// Receive the next frame's payload.
pub async fn read_frame<T: Transport + ?Sized>(transport: &T, max_len: usize) -> io::Result<Bytes> {
    let mut header = transport.recv(HEADER_LEN).await?;
    let len = header.get_u32() as usize;
    validate_frame_len(len, max_len)?;
    if len <= READ_CHUNK {
        return transport.recv(len).await;
    }

    let mut payload = BytesMut::with_capacity(len);
    while payload.len() < len {
        let chunk = (len - payload.len()).min(READ_CHUNK);
        payload.extend_from_slice(&transport.recv(chunk).await?);
    }
    Ok(payload.freeze())
}
