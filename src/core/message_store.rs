//! Purpose: Priority-ordered message store layered over any `LinkedStore`.
//! Exports: `MessageStore`, `REBUILD_WARN_RECORDS`.
//! Role: The object a queue or topic owns; turns messages into ordered payload records.
//! Invariants: Forward traversal yields non-increasing priorities, FIFO within a priority.
//! Invariants: The bucket table is rebuilt from storage on `init` and never persisted.
use tracing::{debug, warn};

use crate::core::barrier::SyncBarrier;
use crate::core::error::{Error, ErrorKind};
use crate::core::handle::Handle;
use crate::core::linked::LinkedStore;
use crate::core::message::{DeliveryMode, Message, peek_priority};
use crate::core::priority::PriorityIndex;

/// Rebuild scans above this many records are logged.
pub const REBUILD_WARN_RECORDS: usize = 10_000;

pub struct MessageStore<S: LinkedStore> {
    store: S,
    index: PriorityIndex,
}

impl<S: LinkedStore> MessageStore<S> {
    /// Takes ownership of an opened linked store and rebuilds the bucket table.
    pub fn init(store: S) -> Result<Self, Error> {
        let mut message_store = Self {
            store,
            index: PriorityIndex::new(),
        };
        message_store.rebuild_index()?;
        Ok(message_store)
    }

    fn rebuild_index(&mut self) -> Result<(), Error> {
        self.index.clear();
        let mut count = 0usize;
        let mut previous_priority = u8::MAX;
        let mut cursor = self.store.first()?;
        while let Some(handle) = cursor {
            let priority = self.priority_of(handle)?;
            if priority > previous_priority {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("stored records are not in priority order")
                    .with_handle(handle));
            }
            self.index.record_store(priority, handle);
            previous_priority = priority;
            count += 1;
            cursor = self.store.next(handle)?;
        }
        if count > REBUILD_WARN_RECORDS {
            warn!(records = count, "priority index rebuilt with a full scan");
        } else {
            debug!(records = count, "priority index rebuilt");
        }
        Ok(())
    }

    fn priority_of(&self, handle: Handle) -> Result<u8, Error> {
        let prefix = self.store.retrieve_header(handle, 1)?;
        peek_priority(&prefix).map_err(|err| err.with_handle(handle))
    }

    pub fn first(&self) -> Result<Option<Handle>, Error> {
        self.store.first()
    }

    pub fn next(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        self.store.next(handle)
    }

    pub fn previous(&self, handle: Handle) -> Result<Option<Handle>, Error> {
        self.store.previous(handle)
    }

    /// Links `message` behind every record of equal or higher priority.
    /// `Ok(None)` when the backing store has no space left.
    pub fn store(&mut self, message: &Message) -> Result<Option<Handle>, Error> {
        let payload = message.encode()?;
        let after = self.index.insertion_point(message.priority);
        let Some(handle) = self.store.store(&payload, after)? else {
            return Ok(None);
        };
        self.index.record_store(message.priority, handle);
        Ok(Some(handle))
    }

    pub fn delete(&mut self, handle: Handle) -> Result<(), Error> {
        let priority = self.priority_of(handle)?;
        let predecessor = self.store.delete(handle)?;
        self.index.record_delete(priority, handle, predecessor);
        Ok(())
    }

    /// Rewrites a message. A priority change moves it to the new priority's tail.
    pub fn replace(&mut self, handle: Handle, message: &Message) -> Result<Option<Handle>, Error> {
        let old_priority = self.priority_of(handle)?;
        if old_priority != message.priority {
            let locked = self.store.is_locked(handle);
            let Some(moved) = self.store(message)? else {
                return Ok(None);
            };
            self.delete(handle)?;
            if locked {
                self.store.lock(moved)?;
            }
            return Ok(Some(moved));
        }

        let payload = message.encode()?;
        let Some(result) = self.store.replace(handle, &payload)? else {
            return Ok(None);
        };
        if result != handle {
            self.index.record_move(message.priority, handle, result);
        }
        Ok(Some(result))
    }

    pub fn retrieve(&self, handle: Handle) -> Result<Message, Error> {
        let payload = self.store.retrieve(handle)?;
        Message::decode(&payload).map_err(|err| err.with_handle(handle))
    }

    pub fn retrieve_priority(&self, handle: Handle) -> Result<u8, Error> {
        self.priority_of(handle)
    }

    pub fn lock(&self, handle: Handle) -> Result<bool, Error> {
        self.store.lock(handle)
    }

    pub fn unlock(&self, handle: Handle) -> Result<(), Error> {
        self.store.unlock(handle)
    }

    pub fn is_locked(&self, handle: Handle) -> bool {
        self.store.is_locked(handle)
    }

    pub fn size(&self) -> usize {
        self.store.size()
    }

    pub fn store_usage(&self) -> u8 {
        self.store.store_usage()
    }

    pub fn absolute_store_usage(&self) -> u8 {
        self.store.absolute_store_usage()
    }

    pub fn commit_changes(&mut self) -> Result<(), Error> {
        self.store.commit_changes()
    }

    pub fn commit_changes_async(&mut self, barrier: &SyncBarrier) -> Result<(), Error> {
        self.store.commit_changes_async(barrier)
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.index.clear();
        self.store.close()
    }

    pub fn destroy(&mut self) -> Result<(), Error> {
        self.store.destroy()?;
        // A volatile backend keeps its records through destroy.
        if !matches!(self.store.first(), Ok(Some(_))) {
            self.index.clear();
        }
        Ok(())
    }

    pub fn is_fail_safe(&self) -> bool {
        self.store.is_fail_safe()
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.store.is_fail_safe() {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::NonPersistent
        }
    }

    pub fn priority_index(&self) -> &PriorityIndex {
        &self.index
    }

    pub fn linked_store(&self) -> &S {
        &self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}
