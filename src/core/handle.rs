//! Purpose: Record handles and their on-disk i32 encoding.
//! Exports: `Handle`, `NO_HANDLE`.
//! Role: The stable record reference every store hands out.
//! Invariants: `None` encodes as -1 and every negative raw value decodes to `None`.
use std::fmt;

pub const NO_HANDLE: i32 = -1;

/// Stable reference to the first block (or slot) of a stored record.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Handle(u32);

impl Handle {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn to_raw(handle: Option<Handle>) -> i32 {
        match handle {
            Some(handle) => handle.0 as i32,
            None => NO_HANDLE,
        }
    }

    /// Negative raw values decode to `None`.
    pub fn from_raw(raw: i32) -> Option<Handle> {
        if raw < 0 { None } else { Some(Handle(raw as u32)) }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
