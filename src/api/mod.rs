//! Purpose: Define the public Rust API boundary for the queue storage core.
//! Exports: Store types, message codec, commit primitives, and provisioning.
//! Role: Surface consumed by the owning queue/topic layer and the bench binary.
//! Invariants: This module is the supported path to storage primitives.
//! Invariants: Additions here are additive-only.

mod provision;

pub use crate::core::barrier::{SyncBarrier, WaitOutcome};
pub use crate::core::block_store::BlockStore;
pub use crate::core::config::{StoreConfig, StorePaths, TaskManagerConfig};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::handle::{Handle, NO_HANDLE};
pub use crate::core::journaled::{JournalingStore, RecoveryReport};
pub use crate::core::linked::LinkedStore;
pub use crate::core::memory::MemoryStore;
pub use crate::core::message::{DEFAULT_PRIORITY, DeliveryMode, Message, PRIORITY_LEVELS};
pub use crate::core::message_store::MessageStore;
pub use crate::core::priority::PriorityIndex;
pub use crate::core::tasks::{AsyncTaskManager, FlushRequest, Flushable, Task, TaskStats};
pub use provision::{ApiResult, QueueStore, StoreMode, open_queue_store};
