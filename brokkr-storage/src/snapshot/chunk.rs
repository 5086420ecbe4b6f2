//! On-disk chunk record codec.
//!
//! Record layout (little-endian):
//!
//! ```text
//! length:   i32   total bytes of this record, header included
//! id:       i64   globally monotonic chunk id
//! checksum: u32   CRC32/IEEE of data
//! flag:     u8    0 = normal, 1 = deleted, 2 = expired
//! data:     [u8]  entity-serialized bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;

/// Size of the fixed chunk header: 4 + 8 + 4 + 1.
pub(crate) const CHUNK_HEADER_LEN: usize = 17;

/// Byte offset of the flag within a chunk record, for in-place rewrites.
pub(crate) const FLAG_OFFSET: u64 = 16;

/// Lifecycle flag of a chunk, rewritten in place on delete/expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ChunkFlag {
    Normal = 0,
    Deleted = 1,
    Expired = 2,
}

impl ChunkFlag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Deleted),
            2 => Some(Self::Expired),
            _ => None,
        }
    }
}

/// One record of a segment's data file, kept in memory after the segment is
/// opened. `offset` is the record's position inside the data file.
#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    pub id: i64,
    pub checksum: u32,
    pub flag: ChunkFlag,
    pub data: Bytes,
    pub offset: u64,
}

impl Chunk {
    /// Create a normal chunk for freshly saved payload bytes.
    pub fn new(id: i64, data: Bytes) -> Self {
        let checksum = compute_checksum(&data);
        Self { id, checksum, flag: ChunkFlag::Normal, data, offset: 0 }
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_LEN + self.data.len()
    }

    /// Append the encoded record to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.encoded_len() as i32);
        buf.put_i64_le(self.id);
        buf.put_u32_le(self.checksum);
        buf.put_u8(self.flag as u8);
        buf.put_slice(&self.data);
    }

    /// Decode one record starting at `offset` within `buf`.
    ///
    /// The returned chunk borrows its data from `buf` (zero-copy slice).
    /// Errors carry a human-readable reason; the caller decides whether to
    /// truncate the file at `offset`.
    pub fn decode_at(buf: &Bytes, offset: usize) -> Result<Self, String> {
        let remaining = buf.len() - offset;
        if remaining < CHUNK_HEADER_LEN {
            return Err(format!(
                "short header: {} bytes remaining, need {}",
                remaining, CHUNK_HEADER_LEN
            ));
        }

        let mut header = &buf[offset..offset + CHUNK_HEADER_LEN];
        let length = header.get_i32_le();
        if length < CHUNK_HEADER_LEN as i32 {
            return Err(format!("invalid record length {}", length));
        }
        let length = length as usize;
        if offset + length > buf.len() {
            return Err(format!(
                "record length {} exceeds file tail of {} bytes",
                length, remaining
            ));
        }

        let id = header.get_i64_le();
        let checksum = header.get_u32_le();
        let flag_byte = header.get_u8();
        let flag = ChunkFlag::from_u8(flag_byte)
            .ok_or_else(|| format!("invalid chunk flag {}", flag_byte))?;

        let data = buf.slice(offset + CHUNK_HEADER_LEN..offset + length);
        if compute_checksum(&data) != checksum {
            return Err(format!("checksum mismatch for chunk {}", id));
        }

        Ok(Self { id, checksum, flag, data, offset: offset as u64 })
    }
}

fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
