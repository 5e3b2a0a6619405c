//! Purpose: Checkpoint images of the dirty-block set, written aside before the block file.
//! Exports: `CheckpointImage`, `write_checkpoint`, `read_checkpoint`, `apply_checkpoint`.
//! Role: Makes folding the journal into the block file restartable after a crash.
//! Invariants: A complete image can be re-applied any number of times; a torn one reads as absent.
//! Invariants: The image header carries the journal commit it covers.
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::block::{FileHeader, HEADER_SIZE, block_offset};
use crate::core::block_store::map_file;
use crate::core::error::{Error, ErrorKind};

const CHECKPOINT_MAGIC: [u8; 4] = *b"QSCK";
const CHECKPOINT_VERSION: u32 = 1;
const PREAMBLE_LEN: usize = 16;
const DIGEST_LEN: usize = 32;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckpointImage {
    pub header: Vec<u8>,
    pub block_size: u32,
    pub blocks: Vec<(u32, Vec<u8>)>,
}

/// Streams `header` plus `blocks` into `path` and fsyncs it.
pub fn write_checkpoint<'a>(
    path: &Path,
    header: &[u8; HEADER_SIZE],
    block_size: u32,
    blocks: impl Iterator<Item = (u32, &'a [u8])>,
) -> Result<usize, Error> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .map_err(|err| Error::io(path, err))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();
    let blocks: Vec<(u32, &[u8])> = blocks.collect();

    let mut preamble = [0u8; PREAMBLE_LEN];
    preamble[0..4].copy_from_slice(&CHECKPOINT_MAGIC);
    preamble[4..8].copy_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    preamble[8..12].copy_from_slice(&block_size.to_le_bytes());
    preamble[12..16].copy_from_slice(&(blocks.len() as u32).to_le_bytes());

    let mut emit = |bytes: &[u8]| -> Result<(), Error> {
        hasher.update(bytes);
        writer.write_all(bytes).map_err(|err| Error::io(path, err))
    };
    emit(&preamble)?;
    emit(header)?;
    for (index, image) in &blocks {
        if image.len() != block_size as usize {
            return Err(Error::new(ErrorKind::Internal).with_message("block image size mismatch"));
        }
        emit(&index.to_le_bytes())?;
        emit(image)?;
    }
    let digest = hasher.finalize();
    writer.write_all(&digest).map_err(|err| Error::io(path, err))?;
    let file = writer
        .into_inner()
        .map_err(|err| Error::io(path, err.into_error()))?;
    file.sync_all().map_err(|err| Error::io(path, err))?;
    Ok(blocks.len())
}

/// `Ok(None)` when the file is missing or was torn while being written.
pub fn read_checkpoint(path: &Path) -> Result<Option<CheckpointImage>, Error> {
    let mut buf = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut buf).map_err(|err| Error::io(path, err))?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::io(path, err)),
    }
    Ok(decode_checkpoint(&buf))
}

fn decode_checkpoint(buf: &[u8]) -> Option<CheckpointImage> {
    if buf.len() < PREAMBLE_LEN + HEADER_SIZE + DIGEST_LEN || buf[0..4] != CHECKPOINT_MAGIC {
        return None;
    }
    let body_len = buf.len() - DIGEST_LEN;
    if Sha256::digest(&buf[..body_len])[..] != buf[body_len..] {
        return None;
    }
    let word = |offset: usize| u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
    if word(4) != CHECKPOINT_VERSION {
        return None;
    }
    let block_size = word(8) as usize;
    let count = word(12) as usize;
    let mut offset = PREAMBLE_LEN + HEADER_SIZE;
    if body_len != offset + count * (4 + block_size) {
        return None;
    }
    let header = buf[PREAMBLE_LEN..offset].to_vec();
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let index = word(offset);
        offset += 4;
        blocks.push((index, buf[offset..offset + block_size].to_vec()));
        offset += block_size;
    }
    Some(CheckpointImage {
        header,
        block_size: block_size as u32,
        blocks,
    })
}

/// Writes the image into the block file and syncs it.
pub fn apply_checkpoint(blocks_path: &Path, image: &CheckpointImage) -> Result<(), Error> {
    let header = FileHeader::decode(&image.header)?;
    if header.block_size != image.block_size {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("checkpoint block size disagrees with its header")
            .with_path(blocks_path));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(blocks_path)
        .map_err(|err| Error::io(blocks_path, err))?;
    let current = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::io(blocks_path, err))?;
    if current < header.file_len() {
        file.set_len(header.file_len())
            .map_err(|err| Error::io(blocks_path, err))?;
    }
    let mut mmap = map_file(&file, blocks_path)?;
    for (index, bytes) in &image.blocks {
        if *index >= header.block_count {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("checkpoint block beyond block count")
                .with_path(blocks_path));
        }
        let start = block_offset(image.block_size, *index);
        mmap[start..start + bytes.len()].copy_from_slice(bytes);
    }
    mmap[0..HEADER_SIZE].copy_from_slice(&image.header);
    mmap.flush().map_err(|err| Error::io(blocks_path, err))
}

#[cfg(test)]
mod tests {
    use super::{apply_checkpoint, read_checkpoint, write_checkpoint};
    use crate::core::block::{FileHeader, HEADER_SIZE};
    use std::io::Write;

    #[test]
    fn torn_checkpoint_reads_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("q.ckpt");
        let mut header = FileHeader::new(1, 64, 8);
        header.block_count = 2;
        let blocks = [(0u32, vec![1u8; 64]), (1u32, vec![2u8; 64])];
        write_checkpoint(
            &path,
            &header.encode(),
            64,
            blocks.iter().map(|(index, image)| (*index, image.as_slice())),
        )
        .expect("write");

        let image = read_checkpoint(&path).expect("read").expect("complete");
        assert_eq!(image.blocks.len(), 2);
        assert_eq!(image.blocks[1].1, vec![2u8; 64]);

        let bytes = std::fs::read(&path).expect("read");
        std::fs::write(&path, &bytes[..bytes.len() - 10]).expect("truncate");
        assert!(read_checkpoint(&path).expect("read").is_none());
        assert!(read_checkpoint(&dir.path().join("absent.ckpt")).expect("read").is_none());
    }

    #[test]
    fn apply_extends_and_writes_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocks_path = dir.path().join("q.blk");
        let mut file = std::fs::File::create(&blocks_path).expect("create");
        file.write_all(&[0u8; HEADER_SIZE]).expect("write");
        drop(file);

        let ckpt = dir.path().join("q.ckpt");
        let mut header = FileHeader::new(1, 64, 8);
        header.block_count = 3;
        let blocks = [(2u32, vec![9u8; 64])];
        write_checkpoint(
            &ckpt,
            &header.encode(),
            64,
            blocks.iter().map(|(index, image)| (*index, image.as_slice())),
        )
        .expect("write");
        let image = read_checkpoint(&ckpt).expect("read").expect("complete");
        apply_checkpoint(&blocks_path, &image).expect("apply");
        apply_checkpoint(&blocks_path, &image).expect("apply twice");

        let bytes = std::fs::read(&blocks_path).expect("read");
        assert_eq!(bytes.len() as u64, header.file_len());
        assert_eq!(FileHeader::decode(&bytes).expect("header"), header);
        assert_eq!(&bytes[HEADER_SIZE + 128..HEADER_SIZE + 192], &[9u8; 64][..]);
    }
}
