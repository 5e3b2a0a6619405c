//! Purpose: Provision the message store a queue or topic owns.
//! Exports: `StoreMode`, `QueueStore`, `open_queue_store`.
//! Role: Picks the backend (journaled, plain block, volatile) from the queue's configuration.
//! Invariants: Persistent stores are journaled unless `journal_enabled` is false.
//! Invariants: The returned store has already rebuilt its priority index.
use std::sync::Arc;

use tracing::info;

use crate::core::block_store::BlockStore;
use crate::core::config::StoreConfig;
use crate::core::error::Error;
use crate::core::journaled::JournalingStore;
use crate::core::linked::LinkedStore;
use crate::core::memory::MemoryStore;
use crate::core::message_store::MessageStore;
use crate::core::tasks::AsyncTaskManager;

pub type ApiResult<T> = Result<T, Error>;

pub type QueueStore = MessageStore<Box<dyn LinkedStore>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreMode {
    Persistent,
    NonPersistent,
}

/// Opens (or creates) the store named `name` under `config.data_dir`.
/// `tasks` runs async commits for journaled stores; without it they complete inline.
pub fn open_queue_store(
    config: &StoreConfig,
    name: &str,
    mode: StoreMode,
    tasks: Option<Arc<AsyncTaskManager>>,
) -> ApiResult<QueueStore> {
    config.validate()?;
    let backend: Box<dyn LinkedStore> = match mode {
        StoreMode::Persistent if config.journal_enabled => {
            Box::new(JournalingStore::open(config, name, tasks)?)
        }
        StoreMode::Persistent => Box::new(BlockStore::open_or_create(config, name)?),
        StoreMode::NonPersistent => {
            Box::new(MemoryStore::new(config.max_volatile_messages as usize))
        }
    };
    let store = MessageStore::init(backend)?;
    info!(
        store = name,
        mode = ?mode,
        journaled = config.journal_enabled && mode == StoreMode::Persistent,
        size = store.size(),
        "opened queue store"
    );
    Ok(store)
}
