//! Purpose: Write-ahead journaling wrapper around `BlockStore` with replay on open.
//! Exports: `JournalingStore`, `RecoveryReport`.
//! Role: Fail-safe persistent backend; the only store that survives a crash mid-batch.
//! Invariants: The block file only ever holds checkpoint images; journal records cover the rest.
//! Invariants: A journal write or flush failure poisons the store (`JournalFailed`) for good.
//! Invariants: Checkpoints run only when every journaled record is committed and synced.
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::core::barrier::SyncBarrier;
use crate::core::block::FileHeader;
use crate::core::block_store::{BlockStore, remove_if_exists};
use crate::core::checkpoint::{apply_checkpoint, read_checkpoint, write_checkpoint};
use crate::core::config::{StoreConfig, StorePaths};
use crate::core::error::{Error, ErrorKind};
use crate::core::handle::Handle;
use crate::core::journal::{JournalRecord, JournalScan, JournalWriter, scan_journal};
use crate::core::linked::LinkedStore;
use crate::core::tasks::{AsyncTaskManager, FlushRequest, Flushable, Task};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    pub from_checkpoint: bool,
    pub batches: usize,
    pub records: usize,
    pub discarded_bytes: u64,
    pub discarded_records: usize,
}

struct JournalShared {
    writer: Mutex<JournalWriter>,
    failed: AtomicBool,
}

impl JournalShared {
    fn writer(&self) -> MutexGuard<'_, JournalWriter> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn guard<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if result.is_err() {
            self.failed.store(true, Ordering::SeqCst);
        }
        result
    }

    fn append(&self, record: &JournalRecord) -> Result<u64, Error> {
        let mut writer = self.writer();
        let result = writer.append(record).map(|_| writer.len());
        self.guard(result)
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

impl Flushable for JournalShared {
    fn flush(&self) -> Result<(), Error> {
        if self.is_failed() {
            return Err(journal_failed());
        }
        let result = self.writer().sync();
        self.guard(result)
    }
}

pub struct JournalingStore {
    inner: BlockStore,
    journal: Arc<JournalShared>,
    tasks: Option<Arc<AsyncTaskManager>>,
    paths: StorePaths,
    checkpoint_bytes: u64,
    commit_seq: u64,
    report: RecoveryReport,
    closed: bool,
}

impl JournalingStore {
    /// Opens (or creates) the store and replays any committed journal batches.
    /// Without a task manager, async commits complete synchronously.
    pub fn open(
        config: &StoreConfig,
        name: &str,
        tasks: Option<Arc<AsyncTaskManager>>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let paths = config.paths(name)?;
        fs::create_dir_all(&config.data_dir).map_err(|err| Error::io(&config.data_dir, err))?;
        let mut report = RecoveryReport::default();

        let mut scan = JournalScan::default();
        if !paths.blocks.exists() {
            if paths.journal.exists() {
                warn!(store = %paths.name, "removing journal left without a block file");
            }
            remove_if_exists(&paths.journal)?;
            remove_if_exists(&paths.checkpoint)?;
        } else {
            scan = scan_journal(&paths.journal)?;
            match read_checkpoint(&paths.checkpoint)? {
                Some(image) => {
                    let image_seq = FileHeader::decode(&image.header)?.commit_seq;
                    if scan.last_commit_seq <= image_seq {
                        apply_checkpoint(&paths.blocks, &image)?;
                        JournalWriter::open(&paths.journal, 0)?.truncate()?;
                        scan = JournalScan::default();
                        report.from_checkpoint = true;
                        info!(store = %paths.name, blocks = image.blocks.len(), "re-applied checkpoint");
                    } else {
                        // Commits after the image mean it was already folded in.
                        warn!(
                            store = %paths.name,
                            image_seq,
                            journal_seq = scan.last_commit_seq,
                            "discarding stale checkpoint"
                        );
                    }
                    remove_if_exists(&paths.checkpoint)?;
                }
                None if paths.checkpoint.exists() => {
                    warn!(store = %paths.name, "discarding incomplete checkpoint");
                    remove_if_exists(&paths.checkpoint)?;
                }
                None => {}
            }
        }

        let mut inner = BlockStore::open_or_create(config, name)?;
        for batch in &scan.batches {
            for record in batch {
                replay_record(&mut inner, record)?;
            }
        }
        report.batches = scan.batches.len();
        report.records = scan.record_count();
        report.discarded_bytes = scan.discarded_bytes();
        report.discarded_records = scan.uncommitted_records;
        if report.discarded_bytes > 0 {
            warn!(
                store = %paths.name,
                discarded_bytes = report.discarded_bytes,
                discarded_records = report.discarded_records,
                "discarding torn journal tail"
            );
        }
        if config.keep_journal && scan.total_len > 0 {
            fs::copy(&paths.journal, paths.replayed_journal())
                .map_err(|err| Error::io(paths.replayed_journal(), err))?;
        }

        let writer = JournalWriter::open(&paths.journal, scan.committed_len)?;
        let inner_seq = inner.header().commit_seq;
        let mut store = Self {
            inner,
            journal: Arc::new(JournalShared {
                writer: Mutex::new(writer),
                failed: AtomicBool::new(false),
            }),
            tasks,
            paths,
            checkpoint_bytes: config.checkpoint_bytes,
            commit_seq: scan.last_commit_seq.max(inner_seq),
            report,
            closed: false,
        };
        if scan.total_len > 0 {
            store.checkpoint()?;
        }
        if report.batches > 0 {
            info!(
                store = %store.paths.name,
                batches = report.batches,
                records = report.records,
                size = store.inner.size(),
                "replayed journal"
            );
        }
        Ok(store)
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.report
    }

    pub fn journal_len(&self) -> u64 {
        self.journal.writer().len()
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.inner
    }

    fn ensure_usable(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("store is closed")
                .with_path(&self.paths.journal));
        }
        if self.journal.is_failed() {
            return Err(journal_failed().with_path(&self.paths.journal));
        }
        Ok(())
    }

    fn append_commit(&mut self) -> Result<u64, Error> {
        self.commit_seq += 1;
        self.journal.append(&JournalRecord::Commit {
            seq: self.commit_seq,
        })
    }

    /// Folds the dirty-block cache into the block file and empties the journal.
    /// Failing to remove the image afterwards poisons the store.
    fn checkpoint(&mut self) -> Result<(), Error> {
        self.inner.set_commit_seq(self.commit_seq);
        if self.inner.has_pending_writes() {
            let header = self.inner.header_image();
            let block_size = self.inner.header().block_size;
            let blocks = write_checkpoint(
                &self.paths.checkpoint,
                &header,
                block_size,
                self.inner.dirty_blocks(),
            )?;
            self.inner.flush()?;
            info!(store = %self.paths.name, blocks, "checkpoint written");
        }
        let result = self.journal.writer().truncate();
        self.journal.guard(result)?;
        self.journal.guard(remove_if_exists(&self.paths.checkpoint))
    }

    fn commit_sync(&mut self) -> Result<(), Error> {
        let len = self.append_commit()?;
        self.journal.flush()?;
        if len >= self.checkpoint_bytes {
            self.checkpoint()?;
        }
        Ok(())
    }
}

fn replay_record(inner: &mut BlockStore, record: &JournalRecord) -> Result<(), Error> {
    let diverged = |handle: Handle| {
        Error::new(ErrorKind::Corrupt)
            .with_message("journal replay diverged from block file")
            .with_handle(handle)
    };
    let as_corrupt = |err: Error| {
        if err.kind() == ErrorKind::InvalidHandle {
            Error::new(ErrorKind::Corrupt)
                .with_message("journal names a record the block file does not have")
                .with_source(err)
        } else {
            err
        }
    };
    match record {
        JournalRecord::Store {
            handle,
            after,
            payload,
        } => {
            let stored = inner.store(payload, *after).map_err(as_corrupt)?;
            if stored != Some(*handle) {
                return Err(diverged(*handle));
            }
        }
        JournalRecord::Delete { handle } => {
            inner.delete(*handle).map_err(as_corrupt)?;
        }
        JournalRecord::Replace {
            handle,
            result,
            payload,
        } => {
            let replaced = inner.replace(*handle, payload).map_err(as_corrupt)?;
            if replaced != Some(*result) {
                return Err(diverged(*handle));
            }
        }
        JournalRecord::Commit { .. } => {}
    }
    Ok(())
}

fn journal_failed() -> Error {
    Error::new(ErrorKind::JournalFailed).with_message("journal is unusable after a write failure")
}

impl LinkedStore for JournalingStore {
    fn first(&self) -> Result<Option<Handle>, Error> {
        self.inner.first()
    }

    fn next(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        self.inner.next(handle)
    }

    fn previous(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        self.inner.previous(handle)
    }

    fn store(&mut self, payload: &[u8], after: Option<Handle>) -> Result<Option<Handle>, Error> {
        self.ensure_usable()?;
        let Some(handle) = self.inner.store(payload, after)? else {
            return Ok(None);
        };
        self.journal.append(&JournalRecord::Store {
            handle,
            after,
            payload: payload.to_vec(),
        })?;
        Ok(Some(handle))
    }

    fn replace(&mut self, handle: Handle, payload: &[u8]) -> Result<Option<Handle>, Error> {
        self.ensure_usable()?;
        let Some(result) = self.inner.replace(handle, payload)? else {
            return Ok(None);
        };
        self.journal.append(&JournalRecord::Replace {
            handle,
            result,
            payload: payload.to_vec(),
        })?;
        Ok(Some(result))
    }

    fn delete(&mut self, handle: Handle) -> Result<Option<Handle>, Error> {
        self.ensure_usable()?;
        let prev = self.inner.delete(handle)?;
        self.journal.append(&JournalRecord::Delete { handle })?;
        Ok(prev)
    }

    fn retrieve(&self, handle: Handle) -> Result<Vec<u8>, Error> {
        self.inner.retrieve(handle)
    }

    fn retrieve_header(&self, handle: Handle, len: usize) -> Result<Vec<u8>, Error> {
        self.inner.retrieve_header(handle, len)
    }

    fn lock(&self, handle: Handle) -> Result<bool, Error> {
        self.inner.lock(handle)
    }

    fn unlock(&self, handle: Handle) -> Result<(), Error> {
        self.inner.unlock(handle)
    }

    fn is_locked(&self, handle: Handle) -> bool {
        self.inner.is_locked(handle)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn store_usage(&self) -> u8 {
        self.inner.store_usage()
    }

    fn absolute_store_usage(&self) -> u8 {
        self.inner.absolute_store_usage()
    }

    fn commit_changes(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        self.commit_sync()
    }

    fn commit_changes_async(&mut self, barrier: &SyncBarrier) -> Result<(), Error> {
        barrier.arm();
        let result = self.submit_async(barrier);
        if let Err(err) = &result {
            barrier.signal(Err(err));
        }
        result
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        let result = if self.journal.is_failed() {
            Err(journal_failed().with_path(&self.paths.journal))
        } else {
            self.commit_sync().and_then(|_| self.checkpoint())
        };
        self.closed = true;
        match result {
            Ok(()) => self.inner.close(),
            Err(err) => {
                // Uncheckpointed blocks stay out of the file; the journal still covers them.
                self.inner.abandon();
                Err(err)
            }
        }
    }

    fn destroy(&mut self) -> Result<(), Error> {
        self.closed = true;
        self.inner.destroy()?;
        remove_if_exists(&self.paths.journal)?;
        remove_if_exists(&self.paths.checkpoint)?;
        remove_if_exists(&self.paths.replayed_journal())
    }

    fn is_fail_safe(&self) -> bool {
        true
    }
}

impl JournalingStore {
    /// Armed barrier is signaled by the flush task, or here when the commit runs inline.
    fn submit_async(&mut self, barrier: &SyncBarrier) -> Result<(), Error> {
        self.ensure_usable()?;
        let Some(tasks) = self.tasks.clone() else {
            self.commit_sync()?;
            barrier.signal(Ok(()));
            return Ok(());
        };
        let len = self.append_commit()?;
        if len >= self.checkpoint_bytes {
            self.journal.flush()?;
            self.checkpoint()?;
            barrier.signal(Ok(()));
            return Ok(());
        }
        let target: Arc<dyn Flushable> = self.journal.clone();
        tasks.execute(Task::Flush(FlushRequest::new(
            self.inner.store_id(),
            target,
            barrier.clone(),
        )))
    }
}
