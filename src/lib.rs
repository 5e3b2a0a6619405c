//! Purpose: Persistence core for a message-queue broker: block files, journal, priority order.
//! Exports: `api` (supported surface) and `core` (storage, journaling, codecs, errors).
//! Role: Library owned by queue/topic objects; one `MessageStore` per destination.
//! Invariants: Structural mutation is single-writer; `&mut self` carries that contract.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
