//! Purpose: The handle contract shared by every store variant.
//! Exports: `LinkedStore`, `LockTable`, `usage_percent`.
//! Role: Seam between the message store and its block, journaled, or volatile backend.
//! Invariants: Mutation takes `&mut self`; the owning queue is the single writer.
//! Invariants: `Ok(None)` from `store`/`replace` means "no space", never an I/O failure.
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::core::barrier::SyncBarrier;
use crate::core::error::Error;
use crate::core::handle::Handle;

pub trait LinkedStore: Send {
    fn first(&self) -> Result<Option<Handle>, Error>;
    fn next(&self, handle: Handle) -> Result<Option<Handle>, Error>;
    fn previous(&self, handle: Handle) -> Result<Option<Handle>, Error>;

    /// Links a new record directly after `after`, or at the front when `after` is `None`.
    fn store(&mut self, payload: &[u8], after: Option<Handle>) -> Result<Option<Handle>, Error>;
    /// May return a different handle when the record has to be reallocated.
    fn replace(&mut self, handle: Handle, payload: &[u8]) -> Result<Option<Handle>, Error>;
    /// Returns the predecessor of the removed record.
    fn delete(&mut self, handle: Handle) -> Result<Option<Handle>, Error>;

    fn retrieve(&self, handle: Handle) -> Result<Vec<u8>, Error>;
    /// Reads at most `len` leading payload bytes.
    fn retrieve_header(&self, handle: Handle, len: usize) -> Result<Vec<u8>, Error>;

    /// Returns `false` if the record was already locked.
    fn lock(&self, handle: Handle) -> Result<bool, Error>;
    fn unlock(&self, handle: Handle) -> Result<(), Error>;
    fn is_locked(&self, handle: Handle) -> bool;

    fn size(&self) -> usize;
    fn store_usage(&self) -> u8;
    fn absolute_store_usage(&self) -> u8;

    fn commit_changes(&mut self) -> Result<(), Error>;
    /// Arms `barrier` once; it is signaled when everything before this call is durable.
    fn commit_changes_async(&mut self, barrier: &SyncBarrier) -> Result<(), Error>;

    fn close(&mut self) -> Result<(), Error>;
    /// Closes the store and removes its backing files.
    fn destroy(&mut self) -> Result<(), Error>;
    fn is_fail_safe(&self) -> bool;
}

impl<S: LinkedStore + ?Sized> LinkedStore for Box<S> {
    fn first(&self) -> Result<Option<Handle>, Error> {
        (**self).first()
    }

    fn next(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        (**self).next(handle)
    }

    fn previous(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        (**self).previous(handle)
    }

    fn store(&mut self, payload: &[u8], after: Option<Handle>) -> Result<Option<Handle>, Error> {
        (**self).store(payload, after)
    }

    fn replace(&mut self, handle: Handle, payload: &[u8]) -> Result<Option<Handle>, Error> {
        (**self).replace(handle, payload)
    }

    fn delete(&mut self, handle: Handle) -> Result<Option<Handle>, Error> {
        (**self).delete(handle)
    }

    fn retrieve(&self, handle: Handle) -> Result<Vec<u8>, Error> {
        (**self).retrieve(handle)
    }

    fn retrieve_header(&self, handle: Handle, len: usize) -> Result<Vec<u8>, Error> {
        (**self).retrieve_header(handle, len)
    }

    fn lock(&self, handle: Handle) -> Result<bool, Error> {
        (**self).lock(handle)
    }

    fn unlock(&self, handle: Handle) -> Result<(), Error> {
        (**self).unlock(handle)
    }

    fn is_locked(&self, handle: Handle) -> bool {
        (**self).is_locked(handle)
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn store_usage(&self) -> u8 {
        (**self).store_usage()
    }

    fn absolute_store_usage(&self) -> u8 {
        (**self).absolute_store_usage()
    }

    fn commit_changes(&mut self) -> Result<(), Error> {
        (**self).commit_changes()
    }

    fn commit_changes_async(&mut self, barrier: &SyncBarrier) -> Result<(), Error> {
        (**self).commit_changes_async(barrier)
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }

    fn destroy(&mut self) -> Result<(), Error> {
        (**self).destroy()
    }

    fn is_fail_safe(&self) -> bool {
        (**self).is_fail_safe()
    }
}

/// Advisory in-flight markers; in-process only, never persisted.
#[derive(Debug, Default)]
pub struct LockTable {
    locked: Mutex<HashSet<Handle>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, handle: Handle) -> bool {
        self.guard().insert(handle)
    }

    pub fn unlock(&self, handle: Handle) {
        self.guard().remove(&handle);
    }

    pub fn is_locked(&self, handle: Handle) -> bool {
        self.guard().contains(&handle)
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    fn guard(&self) -> MutexGuard<'_, HashSet<Handle>> {
        self.locked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `used / total` as a percentage clamped to `0..=100`; an empty total reads as 0.
pub fn usage_percent(used: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = used.min(total).saturating_mul(100) / total;
    pct as u8
}
