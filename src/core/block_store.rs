//! Purpose: Fixed-size-block record file with a LIFO free list and auto-extension.
//! Exports: `BlockStore`.
//! Role: Persistent `LinkedStore` backend; the journaling store wraps it for crash safety.
//! Invariants: Live records form one doubly linked list of head blocks (`first`..`last`).
//! Invariants: Mutations land in the dirty-block cache; only `flush` writes the file.
//! Invariants: Every block image written is fully zero-filled past its payload.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use fs2::FileExt;
use memmap2::MmapMut;
use tracing::{debug, info};

use crate::core::barrier::SyncBarrier;
use crate::core::block::{
    BLOCK_HEADER_LEN, BlockHeader, BlockKind, FileHeader, HEADER_SIZE, block_offset, store_id_for,
};
use crate::core::config::{StoreConfig, StorePaths};
use crate::core::error::{Error, ErrorKind, lock_error_kind};
use crate::core::handle::Handle;
use crate::core::linked::{LinkedStore, LockTable, usage_percent};

pub struct BlockStore {
    paths: StorePaths,
    file: Option<File>,
    mmap: Option<MmapMut>,
    mapped_blocks: u32,
    header: FileHeader,
    header_dirty: bool,
    dirty: BTreeMap<u32, Box<[u8]>>,
    extend_blocks: u32,
    locks: LockTable,
    failed: bool,
}

impl BlockStore {
    /// Creates (or truncates) the block file with `initial_blocks` free blocks.
    pub fn create(config: &StoreConfig, name: &str) -> Result<Self, Error> {
        config.validate()?;
        let paths = config.paths(name)?;
        fs::create_dir_all(&config.data_dir).map_err(|err| Error::io(&config.data_dir, err))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&paths.blocks)
            .map_err(|err| Error::io(&paths.blocks, err))?;
        lock_file(&file, &paths.blocks)?;
        file.set_len(0).map_err(|err| Error::io(&paths.blocks, err))?;

        let header = FileHeader::new(store_id_for(name), config.block_size, config.max_blocks);
        let mut store = Self {
            paths,
            file: Some(file),
            mmap: None,
            mapped_blocks: 0,
            header,
            header_dirty: true,
            dirty: BTreeMap::new(),
            extend_blocks: config.extend_blocks.max(1),
            locks: LockTable::new(),
            failed: false,
        };
        store.extend(config.initial_blocks.min(config.max_blocks))?;
        store.flush()?;
        info!(
            store = %store.paths.name,
            block_size = config.block_size,
            blocks = store.header.block_count,
            "created block store"
        );
        Ok(store)
    }

    /// Opens an existing block file; geometry comes from its header, not `config`.
    pub fn open(config: &StoreConfig, name: &str) -> Result<Self, Error> {
        config.validate()?;
        let paths = config.paths(name)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&paths.blocks)
            .map_err(|err| {
                let kind = if err.kind() == std::io::ErrorKind::NotFound {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::Io
                };
                Error::new(kind).with_path(&paths.blocks).with_source(err)
            })?;
        lock_file(&file, &paths.blocks)?;

        let actual_size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::io(&paths.blocks, err))?;
        let header = read_header(&mut file, &paths.blocks)?;
        header
            .validate(actual_size)
            .map_err(|err| err.with_path(&paths.blocks))?;
        if header.store_id != store_id_for(name) {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("store identifier mismatch")
                .with_path(&paths.blocks));
        }

        let mmap = map_file(&file, &paths.blocks)?;
        info!(
            store = %paths.name,
            records = header.record_count,
            blocks = header.block_count,
            "opened block store"
        );
        Ok(Self {
            paths,
            file: Some(file),
            mmap: Some(mmap),
            mapped_blocks: header.block_count,
            header,
            header_dirty: false,
            dirty: BTreeMap::new(),
            extend_blocks: config.extend_blocks.max(1),
            locks: LockTable::new(),
            failed: false,
        })
    }

    pub fn open_or_create(config: &StoreConfig, name: &str) -> Result<Self, Error> {
        let paths = config.paths(name)?;
        if paths.blocks.exists() {
            Self::open(config, name)
        } else {
            Self::create(config, name)
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn header(&self) -> FileHeader {
        self.header
    }

    pub fn store_id(&self) -> u64 {
        self.header.store_id
    }

    /// Stamps the journal commit the next flush will cover.
    pub(crate) fn set_commit_seq(&mut self, seq: u64) {
        if self.header.commit_seq != seq {
            self.header.commit_seq = seq;
            self.header_dirty = true;
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        self.header_dirty || !self.dirty.is_empty()
    }

    /// Block images not yet written to the file, in index order.
    pub(crate) fn dirty_blocks(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.dirty.iter().map(|(index, image)| (*index, &image[..]))
    }

    pub(crate) fn header_image(&self) -> [u8; HEADER_SIZE] {
        self.header.encode()
    }

    /// Writes the dirty cache and header into the file and syncs it.
    /// A failure leaves the store unusable until reopened.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        if !self.has_pending_writes() {
            return Ok(());
        }
        let result = self.flush_inner();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn flush_inner(&mut self) -> Result<(), Error> {
        let path = self.paths.blocks.clone();
        let Some(file) = self.file.as_ref() else {
            return Err(closed_error());
        };
        if self.header.block_count > self.mapped_blocks || self.mmap.is_none() {
            self.mmap = None;
            file.set_len(self.header.file_len())
                .map_err(|err| Error::io(&path, err))?;
            self.mmap = Some(map_file(file, &path)?);
            self.mapped_blocks = self.header.block_count;
        }
        let Some(mmap) = self.mmap.as_mut() else {
            return Err(closed_error());
        };
        let block_size = self.header.block_size;
        for (index, image) in &self.dirty {
            let start = block_offset(block_size, *index);
            mmap[start..start + image.len()].copy_from_slice(image);
        }
        mmap[0..HEADER_SIZE].copy_from_slice(&self.header.encode());
        mmap.flush().map_err(|err| Error::io(&path, err))?;
        self.dirty.clear();
        self.header_dirty = false;
        Ok(())
    }

    /// Drops the dirty cache unwritten, unmaps, and releases the file lock.
    /// The block file keeps whatever the last flush left in it.
    pub(crate) fn abandon(&mut self) {
        self.mmap = None;
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
        self.dirty.clear();
        self.header_dirty = false;
        self.locks.clear();
    }

    /// Full structural scan: list links, chains, and free list must agree with the header.
    pub fn verify(&self) -> Result<(), Error> {
        self.ensure_open()?;
        let limit = self.header.block_count as usize;
        let mut seen = vec![false; limit];
        let mut records = 0u32;
        let mut prev = None;
        let mut cursor = self.header.first;
        while let Some(handle) = cursor {
            let head = self.head(handle)?;
            if head.prev != prev {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("back link mismatch")
                    .with_handle(handle));
            }
            for block in self.chain_of(handle, &head)? {
                if std::mem::replace(&mut seen[block as usize], true) {
                    return Err(Error::new(ErrorKind::Corrupt)
                        .with_message("block reachable twice")
                        .with_handle(handle));
                }
            }
            records += 1;
            prev = Some(handle);
            cursor = head.next;
        }
        if prev != self.header.last || records != self.header.record_count {
            return Err(Error::new(ErrorKind::Corrupt).with_message("record list disagrees with header"));
        }

        let mut free = 0u32;
        let mut cursor = self.header.free_head;
        while let Some(handle) = cursor {
            let index = handle.as_usize();
            if index >= limit || std::mem::replace(&mut seen[index], true) {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("free list revisits a block")
                    .with_handle(handle));
            }
            let header = self.block_header(handle.index())?;
            if header.kind != BlockKind::Free {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("free list names a used block")
                    .with_handle(handle));
            }
            free += 1;
            cursor = header.next;
        }
        if free != self.header.free_count {
            return Err(Error::new(ErrorKind::Corrupt).with_message("free count disagrees with free list"));
        }
        if seen.iter().any(|reached| !reached) {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unreachable blocks"));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.failed {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("block store failed; reopen required")
                .with_path(&self.paths.blocks));
        }
        if self.file.is_none() {
            return Err(closed_error().with_path(&self.paths.blocks));
        }
        Ok(())
    }

    fn block_bytes(&self, index: u32) -> Result<&[u8], Error> {
        if let Some(image) = self.dirty.get(&index) {
            return Ok(&image[..]);
        }
        if index >= self.mapped_blocks {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("block beyond mapped file")
                .with_handle(Handle::new(index)));
        }
        let Some(mmap) = self.mmap.as_ref() else {
            return Err(closed_error());
        };
        let start = block_offset(self.header.block_size, index);
        Ok(&mmap[start..start + self.header.block_size as usize])
    }

    fn block_header(&self, index: u32) -> Result<BlockHeader, Error> {
        BlockHeader::decode(&self.block_bytes(index)?[..BLOCK_HEADER_LEN])
            .map_err(|err| err.with_handle(Handle::new(index)))
    }

    fn write_block(&mut self, index: u32, header: &BlockHeader, payload: &[u8]) {
        let mut image = vec![0u8; self.header.block_size as usize].into_boxed_slice();
        image[..BLOCK_HEADER_LEN].copy_from_slice(&header.encode());
        image[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + payload.len()].copy_from_slice(payload);
        self.dirty.insert(index, image);
    }

    fn write_block_header(&mut self, index: u32, header: &BlockHeader) -> Result<(), Error> {
        if !self.dirty.contains_key(&index) {
            let image = self.block_bytes(index)?.to_vec().into_boxed_slice();
            self.dirty.insert(index, image);
        }
        if let Some(image) = self.dirty.get_mut(&index) {
            image[..BLOCK_HEADER_LEN].copy_from_slice(&header.encode());
        }
        Ok(())
    }

    /// Header of a live record, or `InvalidHandle`.
    fn head(&self, handle: Handle) -> Result<BlockHeader, Error> {
        if handle.index() >= self.header.block_count {
            return Err(Error::invalid_handle(handle));
        }
        let header = self.block_header(handle.index())?;
        if header.kind != BlockKind::Head {
            return Err(Error::invalid_handle(handle));
        }
        Ok(header)
    }

    /// All blocks of a record, head first.
    fn chain_of(&self, handle: Handle, head: &BlockHeader) -> Result<Vec<u32>, Error> {
        let mut blocks = vec![handle.index()];
        let mut cursor = head.chain;
        while let Some(block) = cursor {
            if blocks.len() > self.header.block_count as usize || block.index() >= self.header.block_count {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("continuation chain out of range")
                    .with_handle(handle));
            }
            let header = self.block_header(block.index())?;
            if header.kind != BlockKind::Continuation || header.prev != Some(handle) {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("continuation block does not belong to record")
                    .with_handle(handle));
            }
            blocks.push(block.index());
            cursor = header.chain;
        }
        Ok(blocks)
    }

    fn read_payload(&self, handle: Handle, limit: usize) -> Result<Vec<u8>, Error> {
        self.ensure_open()?;
        let head = self.head(handle)?;
        let total = head.length as usize;
        let wanted = total.min(limit);
        let capacity = self.header.payload_capacity();
        let mut out = Vec::with_capacity(wanted);
        for block in self.chain_of(handle, &head)? {
            if out.len() >= wanted {
                break;
            }
            let take = (wanted - out.len()).min(capacity);
            let bytes = self.block_bytes(block)?;
            out.extend_from_slice(&bytes[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + take]);
        }
        if out.len() != wanted {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("record chain shorter than its length")
                .with_handle(handle));
        }
        Ok(out)
    }

    fn extend(&mut self, count: u32) -> Result<(), Error> {
        let start = self.header.block_count;
        let count = count.min(self.header.max_blocks - start);
        if count == 0 {
            return Ok(());
        }
        let end = start + count;
        for index in start..end {
            let next = if index + 1 < end {
                Some(Handle::new(index + 1))
            } else {
                self.header.free_head
            };
            self.write_block(index, &BlockHeader::free(next), &[]);
        }
        self.header.block_count = end;
        self.header.free_head = Some(Handle::new(start));
        self.header.free_count += count;
        self.header_dirty = true;
        debug!(store = %self.paths.name, from = start, to = end, "extended block store");
        Ok(())
    }

    /// Pops `count` free blocks, extending the file if needed; `None` when the max is reached.
    fn allocate(&mut self, count: usize) -> Result<Option<Vec<u32>>, Error> {
        let count = u32::try_from(count).map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("payload needs too many blocks")
        })?;
        // A refused allocation must leave the free list and geometry untouched.
        let available = u64::from(self.header.free_count)
            + u64::from(self.header.max_blocks - self.header.block_count);
        if available < u64::from(count) {
            return Ok(None);
        }
        while self.header.free_count < count {
            let room = self.header.max_blocks - self.header.block_count;
            if room == 0 {
                return Ok(None);
            }
            let missing = count - self.header.free_count;
            self.extend(missing.max(self.extend_blocks).min(room))?;
        }
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Some(handle) = self.header.free_head else {
                return Err(Error::new(ErrorKind::Corrupt).with_message("free list shorter than free count"));
            };
            let header = self.block_header(handle.index())?;
            if header.kind != BlockKind::Free {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("free list names a used block")
                    .with_handle(handle));
            }
            self.header.free_head = header.next;
            self.header.free_count -= 1;
            blocks.push(handle.index());
        }
        self.header_dirty = true;
        Ok(Some(blocks))
    }

    fn release(&mut self, blocks: &[u32]) {
        // Head goes back last so it is the first block handed out again.
        for index in blocks.iter().rev() {
            self.write_block(*index, &BlockHeader::free(self.header.free_head), &[]);
            self.header.free_head = Some(Handle::new(*index));
            self.header.free_count += 1;
        }
        self.header_dirty = true;
    }

    /// Writes a record into `blocks` (head first) with the given list links.
    fn write_record(
        &mut self,
        blocks: &[u32],
        payload: &[u8],
        prev: Option<Handle>,
        next: Option<Handle>,
    ) {
        let capacity = self.header.payload_capacity();
        let head = Handle::new(blocks[0]);
        let mut chunks = payload.chunks(capacity);
        for (position, index) in blocks.iter().enumerate() {
            let chunk = chunks.next().unwrap_or(&[]);
            let chain = blocks.get(position + 1).map(|block| Handle::new(*block));
            let header = if position == 0 {
                BlockHeader {
                    prev,
                    next,
                    chain,
                    length: payload.len() as u32,
                    kind: BlockKind::Head,
                }
            } else {
                BlockHeader {
                    prev: Some(head),
                    next: None,
                    chain,
                    length: chunk.len() as u32,
                    kind: BlockKind::Continuation,
                }
            };
            self.write_block(*index, &header, chunk);
        }
    }

    /// Points the neighbours of a record (or the list ends) at `target`.
    fn relink_neighbours(
        &mut self,
        prev: Option<Handle>,
        next: Option<Handle>,
        target_for_prev: Option<Handle>,
        target_for_next: Option<Handle>,
    ) -> Result<(), Error> {
        match prev {
            Some(handle) => {
                let mut header = self.head(handle)?;
                header.next = target_for_prev;
                self.write_block_header(handle.index(), &header)?;
            }
            None => self.header.first = target_for_prev,
        }
        match next {
            Some(handle) => {
                let mut header = self.head(handle)?;
                header.prev = target_for_next;
                self.write_block_header(handle.index(), &header)?;
            }
            None => self.header.last = target_for_next,
        }
        self.header_dirty = true;
        Ok(())
    }

    fn check_payload_len(payload: &[u8]) -> Result<(), Error> {
        if u32::try_from(payload.len()).is_err() {
            return Err(Error::new(ErrorKind::Usage).with_message("payload too large"));
        }
        Ok(())
    }
}

impl LinkedStore for BlockStore {
    fn first(&self) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        Ok(self.header.first)
    }

    fn next(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        Ok(self.head(handle)?.next)
    }

    fn previous(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        Ok(self.head(handle)?.prev)
    }

    fn store(&mut self, payload: &[u8], after: Option<Handle>) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        Self::check_payload_len(payload)?;
        let next = match after {
            Some(handle) => self.head(handle)?.next,
            None => self.header.first,
        };
        let Some(blocks) = self.allocate(self.header.blocks_for(payload.len()))? else {
            return Ok(None);
        };
        let handle = Handle::new(blocks[0]);
        self.write_record(&blocks, payload, after, next);
        self.relink_neighbours(after, next, Some(handle), Some(handle))?;
        self.header.record_count += 1;
        Ok(Some(handle))
    }

    fn replace(&mut self, handle: Handle, payload: &[u8]) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        Self::check_payload_len(payload)?;
        let head = self.head(handle)?;
        let old_blocks = self.chain_of(handle, &head)?;
        let needed = self.header.blocks_for(payload.len());
        if needed == old_blocks.len() {
            self.write_record(&old_blocks, payload, head.prev, head.next);
            return Ok(Some(handle));
        }

        let Some(blocks) = self.allocate(needed)? else {
            return Ok(None);
        };
        let moved = Handle::new(blocks[0]);
        self.write_record(&blocks, payload, head.prev, head.next);
        self.relink_neighbours(head.prev, head.next, Some(moved), Some(moved))?;
        self.release(&old_blocks);
        if self.locks.is_locked(handle) {
            self.locks.unlock(handle);
            self.locks.lock(moved);
        }
        Ok(Some(moved))
    }

    fn delete(&mut self, handle: Handle) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        let head = self.head(handle)?;
        let blocks = self.chain_of(handle, &head)?;
        self.relink_neighbours(head.prev, head.next, head.next, head.prev)?;
        self.release(&blocks);
        self.header.record_count -= 1;
        self.locks.unlock(handle);
        Ok(head.prev)
    }

    fn retrieve(&self, handle: Handle) -> Result<Vec<u8>, Error> {
        self.read_payload(handle, usize::MAX)
    }

    fn retrieve_header(&self, handle: Handle, len: usize) -> Result<Vec<u8>, Error> {
        self.read_payload(handle, len)
    }

    fn lock(&self, handle: Handle) -> Result<bool, Error> {
        self.ensure_open()?;
        self.head(handle)?;
        Ok(self.locks.lock(handle))
    }

    fn unlock(&self, handle: Handle) -> Result<(), Error> {
        self.ensure_open()?;
        self.head(handle)?;
        self.locks.unlock(handle);
        Ok(())
    }

    fn is_locked(&self, handle: Handle) -> bool {
        self.locks.is_locked(handle)
    }

    fn size(&self) -> usize {
        self.header.record_count as usize
    }

    fn store_usage(&self) -> u8 {
        let used = self.header.block_count - self.header.free_count;
        usage_percent(used as u64, self.header.block_count as u64)
    }

    fn absolute_store_usage(&self) -> u8 {
        let used = self.header.block_count - self.header.free_count;
        usage_percent(used as u64, self.header.max_blocks as u64)
    }

    fn commit_changes(&mut self) -> Result<(), Error> {
        self.flush()
    }

    fn commit_changes_async(&mut self, barrier: &SyncBarrier) -> Result<(), Error> {
        barrier.arm();
        let result = self.flush();
        barrier.signal(result.as_ref().map(|_| ()));
        result
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.file.is_none() {
            return Ok(());
        }
        let result = if self.failed { Ok(()) } else { self.flush() };
        self.abandon();
        result
    }

    fn destroy(&mut self) -> Result<(), Error> {
        self.abandon();
        remove_if_exists(&self.paths.blocks)
    }

    fn is_fail_safe(&self) -> bool {
        true
    }
}

fn closed_error() -> Error {
    Error::new(ErrorKind::Closed).with_message("store is closed")
}

fn lock_file(file: &File, path: &Path) -> Result<(), Error> {
    file.try_lock_exclusive().map_err(|err| {
        Error::new(lock_error_kind(&err))
            .with_message("block file is locked by another process")
            .with_path(path)
            .with_source(err)
    })
}

pub(crate) fn map_file(file: &File, path: &Path) -> Result<MmapMut, Error> {
    unsafe { MmapMut::map_mut(file).map_err(|err| Error::io(path, err)) }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::io(path, err)),
    }
}

fn read_header(file: &mut File, path: &Path) -> Result<FileHeader, Error> {
    let mut buf = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0)).map_err(|err| Error::io(path, err))?;
    file.read_exact(&mut buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::new(ErrorKind::Corrupt)
                .with_message("block file shorter than header")
                .with_path(path)
        } else {
            Error::io(path, err)
        }
    })?;
    FileHeader::decode(&buf).map_err(|err| err.with_path(path))
}
