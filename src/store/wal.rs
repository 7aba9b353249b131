//! Commit log — one CRC-framed record per committed crank.
//!
//! Record framing:
//! ```text
//! [body_len: u32][crc32(body): u32][body]
//! body = [op_count: u32] op*
//! op   = [tag: u8] field*      field = [len: u32][bytes]
//! ```
//!
//! A record is all-or-nothing. A record whose bytes stop short of its
//! declared length is a torn tail left by a crash mid-append: it is dropped
//! and that crank never happened. A complete record that fails its CRC or
//! doesn't decode is corruption, which is fatal.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::error::{KernelError, KernelResult};
use crate::slots::VatId;

const HEADER_LEN: usize = 8;

/// One state change inside a committed crank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    Set { key: String, value: String },
    Delete { key: String },
    Transcript { vat: VatId, pos: u64, entry: String },
    Bundle { id: String, bytes: Vec<u8> },
}

impl LogOp {
    fn tag(&self) -> u8 {
        match self {
            Self::Set { .. } => 1,
            Self::Delete { .. } => 2,
            Self::Transcript { .. } => 10,
            Self::Bundle { .. } => 20,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            Self::Set { key, value } => {
                put_field(out, key.as_bytes());
                put_field(out, value.as_bytes());
            }
            Self::Delete { key } => put_field(out, key.as_bytes()),
            Self::Transcript { vat, pos, entry } => {
                put_field(out, &u64::from(vat.0).to_le_bytes());
                put_field(out, &pos.to_le_bytes());
                put_field(out, entry.as_bytes());
            }
            Self::Bundle { id, bytes } => {
                put_field(out, id.as_bytes());
                put_field(out, bytes);
            }
        }
    }

    fn decode(cursor: &mut Cursor<'_>) -> KernelResult<Self> {
        let op = match cursor.byte()? {
            1 => Self::Set {
                key: cursor.text()?,
                value: cursor.text()?,
            },
            2 => Self::Delete { key: cursor.text()? },
            10 => Self::Transcript {
                vat: VatId(u32::try_from(cursor.u64()?).map_err(|_| {
                    KernelError::InvalidData("vat id out of range".into())
                })?),
                pos: cursor.u64()?,
                entry: cursor.text()?,
            },
            20 => Self::Bundle {
                id: cursor.text()?,
                bytes: cursor.field()?.to_vec(),
            },
            tag => return Err(KernelError::InvalidData(format!("unknown log op tag {tag}"))),
        };
        Ok(op)
    }
}

fn put_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Encode a crank's ops as a record body. Also what the crank hash covers.
pub fn encode_ops(ops: &[LogOp]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(ops.len() as u32).to_le_bytes());
    for op in ops {
        op.encode_into(&mut body);
    }
    body
}

fn decode_ops(body: &[u8]) -> KernelResult<Vec<LogOp>> {
    let mut cursor = Cursor { bytes: body, pos: 0 };
    let count = cursor.u32()? as usize;
    let mut ops = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        ops.push(LogOp::decode(&mut cursor)?);
    }
    if cursor.pos != body.len() {
        return Err(KernelError::InvalidData(format!(
            "{} trailing bytes after {count} ops",
            body.len() - cursor.pos
        )));
    }
    Ok(ops)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> KernelResult<&'a [u8]> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or_else(|| KernelError::InvalidData(format!("short op at byte {}", self.pos)))?;
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> KernelResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> KernelResult<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> KernelResult<u64> {
        let start = self.pos;
        let raw = self.field()?;
        <[u8; 8]>::try_from(raw)
            .map(u64::from_le_bytes)
            .map_err(|_| KernelError::InvalidData(format!("bad integer field at byte {start}")))
    }

    fn field(&mut self) -> KernelResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn text(&mut self) -> KernelResult<String> {
        String::from_utf8(self.field()?.to_vec())
            .map_err(|e| KernelError::InvalidData(format!("non-UTF-8 log field: {e}")))
    }
}

fn checksum(body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

/// The on-disk commit log of a durable store.
pub struct CommitLog {
    file: File,
    path: PathBuf,
}

impl CommitLog {
    pub fn open(path: &Path) -> KernelResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| KernelError::Wal(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Append one crank's ops as a single record and fsync.
    pub fn append(&mut self, ops: &[LogOp]) -> KernelResult<()> {
        let body = encode_ops(ops);
        let mut record = Vec::with_capacity(HEADER_LEN + body.len());
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(&checksum(&body).to_le_bytes());
        record.extend_from_slice(&body);
        self.file.write_all(&record)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Every committed record, oldest first.
    pub fn records(&self) -> KernelResult<Vec<Vec<LogOp>>> {
        Ok(self.scan()?.0)
    }

    /// Read every committed record and cut a torn tail off the file, so the
    /// next append lands right after the last good record.
    pub fn recover(&mut self) -> KernelResult<Vec<Vec<LogOp>>> {
        let (records, good_len) = self.scan()?;
        if good_len < self.len_bytes()? {
            tracing::warn!(good_len, "truncating torn tail of {}", self.path.display());
            self.file.set_len(good_len).map_err(|e| {
                KernelError::Wal(format!("cannot truncate {}: {e}", self.path.display()))
            })?;
            self.file.sync_all()?;
        }
        Ok(records)
    }

    /// Records plus the byte length they cover.
    fn scan(&self) -> KernelResult<(Vec<Vec<LogOp>>, u64)> {
        let bytes = std::fs::read(&self.path)
            .map_err(|e| KernelError::Wal(format!("cannot read {}: {e}", self.path.display())))?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let Some(header) = bytes.get(offset..offset + HEADER_LEN) else {
                tracing::warn!(offset, "dropping torn record header");
                break;
            };
            let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let stored = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            let start = offset + HEADER_LEN;
            let Some(body) = bytes.get(start..start + body_len) else {
                tracing::warn!(offset, body_len, "dropping torn record body");
                break;
            };

            let corrupted = |reason: String| KernelError::WalCorrupted {
                offset: offset as u64,
                reason,
            };
            let computed = checksum(body);
            if computed != stored {
                return Err(corrupted(format!(
                    "checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
                )));
            }
            records.push(decode_ops(body).map_err(|e| corrupted(e.to_string()))?);
            offset = start + body_len;
        }
        Ok((records, offset as u64))
    }

    /// Empty the log. Only call once everything in it is in a snapshot.
    pub fn truncate(&mut self) -> KernelResult<()> {
        self.file
            .set_len(0)
            .map_err(|e| KernelError::Wal(format!("cannot truncate {}: {e}", self.path.display())))?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn len_bytes(&self) -> KernelResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}
