//! Purpose: On-disk layout of the block file: fixed file header plus block headers.
//! Exports: `FileHeader`, `BlockHeader`, `BlockKind`, layout constants.
//! Role: Pure encode/decode/validate helpers used by `block_store` and checkpoints.
//! Invariants: All integers are little-endian; handles encode as i32 with -1 = none.
//! Invariants: Block `i` starts at `HEADER_SIZE + i * block_size`.
use sha2::{Digest, Sha256};

use crate::core::config::MIN_BLOCK_SIZE;
use crate::core::error::{Error, ErrorKind};
use crate::core::handle::Handle;

pub const MAGIC: [u8; 4] = *b"QSBK";
pub const VERSION: u32 = 1;
const ENDIANNESS_LE: u8 = 1;
pub const HEADER_SIZE: usize = 4096;
pub const BLOCK_HEADER_LEN: usize = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileHeader {
    pub store_id: u64,
    pub block_size: u32,
    pub block_count: u32,
    pub max_blocks: u32,
    pub free_head: Option<Handle>,
    pub free_count: u32,
    pub first: Option<Handle>,
    pub last: Option<Handle>,
    pub record_count: u32,
    /// Last journal commit folded into the file by a checkpoint.
    pub commit_seq: u64,
}

impl FileHeader {
    pub fn new(store_id: u64, block_size: u32, max_blocks: u32) -> Self {
        Self {
            store_id,
            block_size,
            block_count: 0,
            max_blocks,
            free_head: None,
            free_count: 0,
            first: None,
            last: None,
            record_count: 0,
            commit_seq: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        write_u32(&mut buf, 4, VERSION);
        buf[8] = ENDIANNESS_LE;

        write_u64(&mut buf, 16, self.store_id);
        write_u32(&mut buf, 24, self.block_size);
        write_u32(&mut buf, 28, self.block_count);
        write_u32(&mut buf, 32, self.max_blocks);
        write_i32(&mut buf, 36, Handle::to_raw(self.free_head));
        write_u32(&mut buf, 40, self.free_count);
        write_i32(&mut buf, 44, Handle::to_raw(self.first));
        write_i32(&mut buf, 48, Handle::to_raw(self.last));
        write_u32(&mut buf, 52, self.record_count);
        write_u64(&mut buf, 56, self.commit_seq);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let version = read_u32(buf, 4);
        if version != VERSION {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("unsupported block file version {version}")));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }

        Ok(Self {
            store_id: read_u64(buf, 16),
            block_size: read_u32(buf, 24),
            block_count: read_u32(buf, 28),
            max_blocks: read_u32(buf, 32),
            free_head: Handle::from_raw(read_i32(buf, 36)),
            free_count: read_u32(buf, 40),
            first: Handle::from_raw(read_i32(buf, 44)),
            last: Handle::from_raw(read_i32(buf, 48)),
            record_count: read_u32(buf, 52),
            commit_seq: read_u64(buf, 56),
        })
    }

    pub fn validate(&self, actual_file_size: u64) -> Result<(), Error> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("block size too small"));
        }
        if self.block_count > self.max_blocks {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("block count exceeds max blocks"));
        }
        if self.file_len() > actual_file_size {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("file shorter than header block count"));
        }
        if self.free_count + self.record_count > self.block_count {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("free and record counts exceed block count"));
        }
        for handle in [self.free_head, self.first, self.last].into_iter().flatten() {
            if handle.index() >= self.block_count {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("header handle out of range")
                    .with_handle(handle));
            }
        }
        if self.first.is_none() != (self.record_count == 0) {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("record count disagrees with list head"));
        }
        Ok(())
    }

    pub fn file_len(&self) -> u64 {
        block_offset(self.block_size, self.block_count) as u64
    }

    pub fn payload_capacity(&self) -> usize {
        self.block_size as usize - BLOCK_HEADER_LEN
    }

    /// Blocks needed to hold `len` payload bytes (an empty payload still takes one).
    pub fn blocks_for(&self, len: usize) -> usize {
        len.div_ceil(self.payload_capacity()).max(1)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockKind {
    Free = 0,
    Head = 1,
    Continuation = 2,
}

impl BlockKind {
    fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(BlockKind::Free),
            1 => Ok(BlockKind::Head),
            2 => Ok(BlockKind::Continuation),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid block kind")),
        }
    }
}

/// Per-block header.
///
/// * `Head`: `prev`/`next` link records, `chain` names the first continuation
///   block, `length` is the full record payload length.
/// * `Continuation`: `prev` names the owning head, `chain` the next
///   continuation, `length` the bytes held in this block.
/// * `Free`: `next` is the next free block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub prev: Option<Handle>,
    pub next: Option<Handle>,
    pub chain: Option<Handle>,
    pub length: u32,
    pub kind: BlockKind,
}

impl BlockHeader {
    pub fn free(next: Option<Handle>) -> Self {
        Self {
            prev: None,
            next,
            chain: None,
            length: 0,
            kind: BlockKind::Free,
        }
    }

    pub fn encode(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut buf = [0u8; BLOCK_HEADER_LEN];
        write_i32(&mut buf, 0, Handle::to_raw(self.prev));
        write_i32(&mut buf, 4, Handle::to_raw(self.next));
        write_i32(&mut buf, 8, Handle::to_raw(self.chain));
        write_u32(&mut buf, 12, self.length);
        buf[16] = self.kind as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < BLOCK_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("block header too small"));
        }
        Ok(Self {
            prev: Handle::from_raw(read_i32(buf, 0)),
            next: Handle::from_raw(read_i32(buf, 4)),
            chain: Handle::from_raw(read_i32(buf, 8)),
            length: read_u32(buf, 12),
            kind: BlockKind::from_u8(buf[16])?,
        })
    }
}

pub fn block_offset(block_size: u32, index: u32) -> usize {
    HEADER_SIZE + block_size as usize * index as usize
}

pub fn store_id_for(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(out)
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(read_4(buf, offset))
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_4(buf, offset))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
