// Core modules implementing block storage, journaling, priority ordering, and errors.
pub mod barrier;
pub mod block;
pub mod block_store;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod handle;
pub mod journal;
pub mod journaled;
pub mod linked;
pub mod memory;
pub mod message;
pub mod message_store;
pub mod priority;
pub mod tasks;
