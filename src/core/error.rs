//! Purpose: One error type for every storage failure surfaced by the core.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`.
//! Role: Typed, fatal failures; space exhaustion is never an `Error` (it is `Ok(None)`).
//! Invariants: `ErrorKind::reason` strings are stable and additive-only.
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

use libc::{EACCES, EPERM};

use crate::core::handle::Handle;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    AlreadyExists,
    Busy,
    Permission,
    Corrupt,
    Io,
    InvalidHandle,
    JournalFailed,
    Closed,
}

impl ErrorKind {
    /// Short machine-readable reason code.
    pub fn reason(self) -> &'static str {
        match self {
            ErrorKind::Internal => "internal",
            ErrorKind::Usage => "usage",
            ErrorKind::NotFound => "not-found",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::Busy => "busy",
            ErrorKind::Permission => "permission",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Io => "io",
            ErrorKind::InvalidHandle => "invalid-handle",
            ErrorKind::JournalFailed => "journal-failed",
            ErrorKind::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<PathBuf>,
    handle: Option<Handle>,
    offset: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            handle: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn reason(&self) -> &'static str {
        self.kind.reason()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        Error::new(ErrorKind::Io).with_path(path).with_source(err)
    }

    pub(crate) fn invalid_handle(handle: Handle) -> Self {
        Error::new(ErrorKind::InvalidHandle)
            .with_message("handle does not name a live record")
            .with_handle(handle)
    }

    /// Rebuilds an equivalent error for fan-out to several waiters.
    /// The source chain is flattened into the message.
    pub(crate) fn duplicate(&self) -> Self {
        let mut message = self.message.clone();
        if let Some(source) = &self.source {
            let text = match message {
                Some(msg) => format!("{msg}: {source}"),
                None => source.to_string(),
            };
            message = Some(text);
        }
        Self {
            kind: self.kind,
            message,
            path: self.path.clone(),
            handle: self.handle,
            offset: self.offset,
            source: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(handle) = self.handle {
            write!(f, " (handle: {handle})")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub(crate) fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::AlreadyExists => 4,
        ErrorKind::Busy => 5,
        ErrorKind::Permission => 6,
        ErrorKind::Corrupt => 7,
        ErrorKind::Io => 8,
        ErrorKind::InvalidHandle => 9,
        ErrorKind::JournalFailed => 10,
        ErrorKind::Closed => 11,
    }
}
