//! Purpose: Volatile in-memory store with the same handle contract as the block store.
//! Exports: `MemoryStore`.
//! Role: Backend for non-persistent queues; nothing survives a close.
//! Invariants: Handles are slot indices; freed slots are reused most-recent-first.
//! Invariants: Never holds more than `max_messages` records; a full store answers `Ok(None)`.
use crate::core::barrier::SyncBarrier;
use crate::core::error::{Error, ErrorKind};
use crate::core::handle::Handle;
use crate::core::linked::{LinkedStore, LockTable, usage_percent};

struct Slot {
    prev: Option<Handle>,
    next: Option<Handle>,
    payload: Vec<u8>,
}

pub struct MemoryStore {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    first: Option<Handle>,
    last: Option<Handle>,
    len: usize,
    max_messages: usize,
    locks: LockTable,
    closed: bool,
}

impl MemoryStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            first: None,
            last: None,
            len: 0,
            max_messages,
            locks: LockTable::new(),
            closed: false,
        }
    }

    pub fn last(&self) -> Option<Handle> {
        self.last
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::Closed).with_message("store is closed"));
        }
        Ok(())
    }

    fn slot(&self, handle: Handle) -> Result<&Slot, Error> {
        self.ensure_open()?;
        self.slots
            .get(handle.as_usize())
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::invalid_handle(handle))
    }

    fn slot_mut(&mut self, handle: Handle) -> Result<&mut Slot, Error> {
        self.slots
            .get_mut(handle.as_usize())
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::invalid_handle(handle))
    }

    fn set_next(&mut self, at: Option<Handle>, next: Option<Handle>) -> Result<(), Error> {
        match at {
            Some(handle) => self.slot_mut(handle)?.next = next,
            None => self.first = next,
        }
        Ok(())
    }

    fn set_prev(&mut self, at: Option<Handle>, prev: Option<Handle>) -> Result<(), Error> {
        match at {
            Some(handle) => self.slot_mut(handle)?.prev = prev,
            None => self.last = prev,
        }
        Ok(())
    }

    fn allocate(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        if self.slots.len() >= self.max_messages {
            return None;
        }
        self.slots.push(None);
        u32::try_from(self.slots.len() - 1).ok()
    }
}

impl LinkedStore for MemoryStore {
    fn first(&self) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        Ok(self.first)
    }

    fn next(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        Ok(self.slot(handle)?.next)
    }

    fn previous(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        Ok(self.slot(handle)?.prev)
    }

    fn store(&mut self, payload: &[u8], after: Option<Handle>) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        let next = match after {
            Some(handle) => self.slot(handle)?.next,
            None => self.first,
        };
        let Some(index) = self.allocate() else {
            return Ok(None);
        };
        let handle = Handle::new(index);
        self.slots[handle.as_usize()] = Some(Slot {
            prev: after,
            next,
            payload: payload.to_vec(),
        });
        self.set_next(after, Some(handle))?;
        self.set_prev(next, Some(handle))?;
        self.len += 1;
        Ok(Some(handle))
    }

    fn replace(&mut self, handle: Handle, payload: &[u8]) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        let slot = self.slot_mut(handle)?;
        slot.payload.clear();
        slot.payload.extend_from_slice(payload);
        Ok(Some(handle))
    }

    fn delete(&mut self, handle: Handle) -> Result<Option<Handle>, Error> {
        self.ensure_open()?;
        let (prev, next) = {
            let slot = self.slot(handle)?;
            (slot.prev, slot.next)
        };
        self.set_next(prev, next)?;
        self.set_prev(next, prev)?;
        self.slots[handle.as_usize()] = None;
        self.free.push(handle.index());
        self.len -= 1;
        self.locks.unlock(handle);
        Ok(prev)
    }

    fn retrieve(&self, handle: Handle) -> Result<Vec<u8>, Error> {
        Ok(self.slot(handle)?.payload.clone())
    }

    fn retrieve_header(&self, handle: Handle, len: usize) -> Result<Vec<u8>, Error> {
        let payload = &self.slot(handle)?.payload;
        Ok(payload[..len.min(payload.len())].to_vec())
    }

    fn lock(&self, handle: Handle) -> Result<bool, Error> {
        self.slot(handle)?;
        Ok(self.locks.lock(handle))
    }

    fn unlock(&self, handle: Handle) -> Result<(), Error> {
        self.slot(handle)?;
        self.locks.unlock(handle);
        Ok(())
    }

    fn is_locked(&self, handle: Handle) -> bool {
        self.locks.is_locked(handle)
    }

    fn size(&self) -> usize {
        self.len
    }

    fn store_usage(&self) -> u8 {
        usage_percent(self.len as u64, self.slots.len() as u64)
    }

    fn absolute_store_usage(&self) -> u8 {
        usage_percent(self.len as u64, self.max_messages as u64)
    }

    fn commit_changes(&mut self) -> Result<(), Error> {
        self.ensure_open()
    }

    fn commit_changes_async(&mut self, barrier: &SyncBarrier) -> Result<(), Error> {
        self.ensure_open()?;
        barrier.arm();
        barrier.signal(Ok(()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.closed = true;
        self.slots.clear();
        self.free.clear();
        self.first = None;
        self.last = None;
        self.len = 0;
        self.locks.clear();
        Ok(())
    }

    /// Nothing backs a volatile store, so there is nothing to remove.
    fn destroy(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn is_fail_safe(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::core::barrier::SyncBarrier;
    use crate::core::error::ErrorKind;
    use crate::core::handle::Handle;
    use crate::core::linked::LinkedStore;

    fn walk(store: &MemoryStore) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut cursor = store.first().expect("first");
        while let Some(handle) = cursor {
            out.push(store.retrieve(handle).expect("retrieve"));
            cursor = store.next(handle).expect("next");
        }
        out
    }

    #[test]
    fn store_links_front_and_after() {
        let mut store = MemoryStore::new(8);
        let b = store.store(b"b", None).expect("store").expect("space");
        let a = store.store(b"a", None).expect("store").expect("space");
        let c = store.store(b"c", Some(b)).expect("store").expect("space");
        assert_eq!(walk(&store), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(store.previous(a).expect("prev"), None);
        assert_eq!(store.previous(c).expect("prev"), Some(b));
        assert_eq!(store.last(), Some(c));
    }

    #[test]
    fn delete_returns_predecessor_and_reuses_slot() {
        let mut store = MemoryStore::new(8);
        let a = store.store(b"a", None).expect("store").expect("space");
        let b = store.store(b"b", Some(a)).expect("store").expect("space");
        assert_eq!(store.delete(b).expect("delete"), Some(a));
        assert_eq!(store.delete(a).expect("delete"), None);
        assert_eq!(store.size(), 0);
        assert_eq!(store.first().expect("first"), None);
        let again = store.store(b"x", None).expect("store").expect("space");
        assert_eq!(again, a);
        assert_eq!(
            store.retrieve(b).expect_err("stale").kind(),
            ErrorKind::InvalidHandle
        );
    }

    #[test]
    fn full_store_reports_no_space() {
        let mut store = MemoryStore::new(2);
        let mut after = None;
        for _ in 0..2 {
            after = store.store(b"x", after).expect("store");
        }
        assert_eq!(store.store(b"y", after).expect("store"), None);
        assert_eq!(store.absolute_store_usage(), 100);
        store.delete(Handle::new(0)).expect("delete");
        assert_eq!(store.store_usage(), 50);
        assert_eq!(store.absolute_store_usage(), 50);
    }

    #[test]
    fn replace_keeps_handle_and_header_reads_prefix() {
        let mut store = MemoryStore::new(4);
        let a = store.store(b"short", None).expect("store").expect("space");
        let replaced = store.replace(a, b"much longer payload").expect("replace");
        assert_eq!(replaced, Some(a));
        assert_eq!(store.retrieve_header(a, 4).expect("header"), b"much".to_vec());
        assert_eq!(store.retrieve_header(a, 100).expect("header").len(), 19);
    }

    #[test]
    fn locks_and_async_commit() {
        let mut store = MemoryStore::new(4);
        let a = store.store(b"a", None).expect("store").expect("space");
        assert!(store.lock(a).expect("lock"));
        assert!(!store.lock(a).expect("relock"));
        assert!(store.is_locked(a));
        store.unlock(a).expect("unlock");
        assert!(!store.is_locked(a));

        let barrier = SyncBarrier::new();
        store.commit_changes_async(&barrier).expect("commit");
        assert!(barrier.is_complete());
        assert!(!store.is_fail_safe());
    }

    #[test]
    fn close_discards_everything() {
        let mut store = MemoryStore::new(4);
        store.store(b"a", None).expect("store");
        store.close().expect("close");
        assert_eq!(store.size(), 0);
        assert_eq!(store.first().expect_err("closed").kind(), ErrorKind::Closed);
    }

    #[test]
    fn destroy_leaves_records_in_place() {
        let mut store = MemoryStore::new(4);
        let a = store.store(b"a", None).expect("store").expect("space");
        store.store(b"b", Some(a)).expect("store").expect("space");
        store.destroy().expect("destroy");
        assert_eq!(store.size(), 2);
        assert_eq!(store.retrieve(a).expect("retrieve"), b"a".to_vec());
        store.store(b"c", None).expect("store").expect("space");
        assert_eq!(store.size(), 3);
    }
}
