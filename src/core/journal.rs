//! Purpose: Write-ahead journal records, the append-only writer, and the replay scanner.
//! Exports: `JournalRecord`, `JournalWriter`, `JournalScan`, `scan_journal`.
//! Role: Durable log of block-store mutations between checkpoints.
//! Invariants: Record = tag:u8, body_len:u32, body, checksum:[u8;4] (SHA-256 prefix of tag+body).
//! Invariants: Only records followed by a well-formed `Commit` are ever replayed.
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};
use crate::core::handle::Handle;

const TAG_STORE: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_REPLACE: u8 = 3;
const TAG_COMMIT: u8 = 4;

const PREFIX_LEN: usize = 5;
const CHECKSUM_LEN: usize = 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JournalRecord {
    Store {
        handle: Handle,
        after: Option<Handle>,
        payload: Vec<u8>,
    },
    Delete {
        handle: Handle,
    },
    /// `result` is the handle the record lives at after the replace.
    Replace {
        handle: Handle,
        result: Handle,
        payload: Vec<u8>,
    },
    Commit {
        seq: u64,
    },
}

impl JournalRecord {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let (tag, body_len) = match self {
            JournalRecord::Store { payload, .. } => (TAG_STORE, 8 + payload.len()),
            JournalRecord::Delete { .. } => (TAG_DELETE, 4),
            JournalRecord::Replace { payload, .. } => (TAG_REPLACE, 8 + payload.len()),
            JournalRecord::Commit { .. } => (TAG_COMMIT, 8),
        };
        out.push(tag);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        match self {
            JournalRecord::Store {
                handle,
                after,
                payload,
            } => {
                out.extend_from_slice(&Handle::to_raw(Some(*handle)).to_le_bytes());
                out.extend_from_slice(&Handle::to_raw(*after).to_le_bytes());
                out.extend_from_slice(payload);
            }
            JournalRecord::Delete { handle } => {
                out.extend_from_slice(&Handle::to_raw(Some(*handle)).to_le_bytes());
            }
            JournalRecord::Replace {
                handle,
                result,
                payload,
            } => {
                out.extend_from_slice(&Handle::to_raw(Some(*handle)).to_le_bytes());
                out.extend_from_slice(&Handle::to_raw(Some(*result)).to_le_bytes());
                out.extend_from_slice(payload);
            }
            JournalRecord::Commit { seq } => out.extend_from_slice(&seq.to_le_bytes()),
        }
        let digest = checksum(out[start], &out[start + PREFIX_LEN..]);
        out.extend_from_slice(&digest);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Decodes the record at the start of `buf`; `None` means torn or malformed.
    pub fn decode(buf: &[u8]) -> Option<(JournalRecord, usize)> {
        if buf.len() < PREFIX_LEN {
            return None;
        }
        let tag = buf[0];
        let body_len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let total = PREFIX_LEN.checked_add(body_len)?.checked_add(CHECKSUM_LEN)?;
        if buf.len() < total {
            return None;
        }
        let body = &buf[PREFIX_LEN..PREFIX_LEN + body_len];
        if buf[PREFIX_LEN + body_len..total] != checksum(tag, body) {
            return None;
        }
        let record = match tag {
            TAG_STORE if body_len >= 8 => JournalRecord::Store {
                handle: Handle::from_raw(read_i32(body, 0))?,
                after: Handle::from_raw(read_i32(body, 4)),
                payload: body[8..].to_vec(),
            },
            TAG_DELETE if body_len == 4 => JournalRecord::Delete {
                handle: Handle::from_raw(read_i32(body, 0))?,
            },
            TAG_REPLACE if body_len >= 8 => JournalRecord::Replace {
                handle: Handle::from_raw(read_i32(body, 0))?,
                result: Handle::from_raw(read_i32(body, 4))?,
                payload: body[8..].to_vec(),
            },
            TAG_COMMIT if body_len == 8 => {
                let mut seq = [0u8; 8];
                seq.copy_from_slice(body);
                JournalRecord::Commit {
                    seq: u64::from_le_bytes(seq),
                }
            }
            _ => return None,
        };
        Some((record, total))
    }
}

fn checksum(tag: u8, body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(body);
    let digest = hasher.finalize();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_le_bytes(out)
}

/// Result of reading a journal from the start.
#[derive(Debug, Default)]
pub struct JournalScan {
    pub batches: Vec<Vec<JournalRecord>>,
    pub last_commit_seq: u64,
    /// Offset just past the last well-formed `Commit`.
    pub committed_len: u64,
    pub total_len: u64,
    /// Well-formed records after the last commit.
    pub uncommitted_records: usize,
}

impl JournalScan {
    pub fn discarded_bytes(&self) -> u64 {
        self.total_len - self.committed_len
    }

    pub fn record_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

pub fn scan_journal(path: &Path) -> Result<JournalScan, Error> {
    let mut buf = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut buf).map_err(|err| Error::io(path, err))?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(JournalScan::default());
        }
        Err(err) => return Err(Error::io(path, err)),
    }
    Ok(scan_bytes(&buf))
}

pub fn scan_bytes(buf: &[u8]) -> JournalScan {
    let mut scan = JournalScan {
        total_len: buf.len() as u64,
        ..JournalScan::default()
    };
    let mut pending = Vec::new();
    let mut offset = 0usize;
    while let Some((record, len)) = JournalRecord::decode(&buf[offset..]) {
        offset += len;
        match record {
            JournalRecord::Commit { seq } => {
                scan.batches.push(std::mem::take(&mut pending));
                scan.last_commit_seq = seq;
                scan.committed_len = offset as u64;
            }
            other => pending.push(other),
        }
    }
    scan.uncommitted_records = pending.len();
    scan
}

/// Buffered append-only journal file.
pub struct JournalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
    scratch: Vec<u8>,
}

impl JournalWriter {
    /// Opens the journal for appending after `len` bytes, dropping anything beyond.
    pub fn open(path: impl AsRef<Path>, len: u64) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::io(&path, err))?;
        file.set_len(len).map_err(|err| Error::io(&path, err))?;
        file.seek(SeekFrom::Start(len))
            .map_err(|err| Error::io(&path, err))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            len,
            scratch: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, record: &JournalRecord) -> Result<(), Error> {
        self.scratch.clear();
        record.encode_into(&mut self.scratch);
        self.writer
            .write_all(&self.scratch)
            .map_err(|err| journal_error(&self.path, "journal append failed", err))?;
        self.len += self.scratch.len() as u64;
        Ok(())
    }

    /// Forces everything appended so far to stable storage.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.writer
            .flush()
            .map_err(|err| journal_error(&self.path, "journal flush failed", err))?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|err| journal_error(&self.path, "journal fsync failed", err))
    }

    pub fn truncate(&mut self) -> Result<(), Error> {
        self.writer
            .flush()
            .map_err(|err| journal_error(&self.path, "journal flush failed", err))?;
        let file = self.writer.get_mut();
        file.set_len(0)
            .map_err(|err| journal_error(&self.path, "journal truncate failed", err))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|err| journal_error(&self.path, "journal truncate failed", err))?;
        file.sync_all()
            .map_err(|err| journal_error(&self.path, "journal fsync failed", err))?;
        self.len = 0;
        Ok(())
    }
}

fn journal_error(path: &Path, message: &str, err: std::io::Error) -> Error {
    Error::new(ErrorKind::JournalFailed)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}
