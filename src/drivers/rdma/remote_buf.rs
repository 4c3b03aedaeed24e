use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of an encoded [`BufferDescriptor`].
pub const BUFFER_DESCRIPTOR_SIZE: usize = 16;

/// Steering descriptor for a registered buffer.
///
/// Holds the remote address, length and token (remote key) the peer needs to
/// read or write the registration directly. Exchanged over the ordinary
/// send/receive channel as 16 little-endian bytes: offset:u64, token:u32,
/// length:u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    offset: u64,
    token: u32,
    length: u32,
}

impl BufferDescriptor {
    pub fn new(offset: u64, token: u32, length: u32) -> Self {
        Self { offset, token, length }
    }

    /// Remote address of the first byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_valid(&self) -> bool {
        self.offset != 0 && self.length > 0
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(BUFFER_DESCRIPTOR_SIZE);
        dst.put_u64_le(self.offset);
        dst.put_u32_le(self.token);
        dst.put_u32_le(self.length);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BUFFER_DESCRIPTOR_SIZE);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Option<Self> {
        if src.len() < BUFFER_DESCRIPTOR_SIZE {
            return None;
        }
        Some(Self {
            offset: src.get_u64_le(),
            token: src.get_u32_le(),
            length: src.get_u32_le(),
        })
    }
}
