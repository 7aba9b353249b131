//! Store — transactional key-value, transcript and bundle storage.
//!
//! Three committed maps plus one crank buffer. Reads see the buffer layered
//! over committed state. `commit()` writes the whole buffer as a single WAL
//! batch, fsyncs, then folds it into committed state; `abort()` throws it away.
//! Savepoints snapshot the buffer so a crank can rewind part of its work.
//!
//! Durable layout:
//! ```text
//! <data_dir>/kernel.snapshot   committed state as of the last checkpoint
//! <data_dir>/kernel.wal        commits since then
//! ```

pub mod wal;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KernelError, KernelResult};
use crate::slots::VatId;
use wal::{CommitLog, LogOp};

const ACTIVITY_HASH_KEY: &str = "activityhash";
const SNAPSHOT_FILE: &str = "kernel.snapshot";
const WAL_FILE: &str = "kernel.wal";

/// Named rewind points within a crank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Savepoint {
    /// Before the event was taken off its queue.
    Start,
    /// After the event was taken, before it was delivered.
    Deliver,
}

#[derive(Debug, Clone, Default)]
struct CrankBuffer {
    kv: BTreeMap<String, Option<String>>,
    transcripts: BTreeMap<(VatId, u64), String>,
    bundles: BTreeMap<String, Vec<u8>>,
}

impl CrankBuffer {
    fn is_empty(&self) -> bool {
        self.kv.is_empty() && self.transcripts.is_empty() && self.bundles.is_empty()
    }

    fn to_ops(&self) -> Vec<LogOp> {
        let kv = self.kv.iter().map(|(key, value)| match value {
            Some(v) => LogOp::Set {
                key: key.clone(),
                value: v.clone(),
            },
            None => LogOp::Delete { key: key.clone() },
        });
        let transcripts = self.transcripts.iter().map(|((vat, pos), entry)| LogOp::Transcript {
            vat: *vat,
            pos: *pos,
            entry: entry.clone(),
        });
        let bundles = self.bundles.iter().map(|(id, bytes)| LogOp::Bundle {
            id: id.clone(),
            bytes: bytes.clone(),
        });
        kv.chain(transcripts).chain(bundles).collect()
    }
}

/// On-disk snapshot of committed state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    kv: BTreeMap<String, String>,
    transcripts: Vec<(VatId, u64, String)>,
    /// Bundle bytes, hex-encoded.
    bundles: BTreeMap<String, String>,
}

pub struct Store {
    kv: BTreeMap<String, String>,
    transcripts: BTreeMap<(VatId, u64), String>,
    bundles: BTreeMap<String, Vec<u8>>,
    buffer: CrankBuffer,
    savepoints: BTreeMap<Savepoint, CrankBuffer>,
    log: Option<CommitLog>,
    data_dir: Option<PathBuf>,
}

impl Store {
    /// A store with no backing files. Commits are atomic but not durable.
    pub fn in_memory() -> Self {
        Self {
            kv: BTreeMap::new(),
            transcripts: BTreeMap::new(),
            bundles: BTreeMap::new(),
            buffer: CrankBuffer::default(),
            savepoints: BTreeMap::new(),
            log: None,
            data_dir: None,
        }
    }

    /// Open or create a durable store in `data_dir`.
    /// Loads the last snapshot, then replays the WAL on top of it.
    pub fn open(data_dir: &Path) -> KernelResult<Self> {
        std::fs::create_dir_all(data_dir)?;

        let mut store = Self::in_memory();

        let snapshot_path = data_dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let bytes = std::fs::read(&snapshot_path)?;
            let snap: SnapshotFile = serde_json::from_slice(&bytes)
                .map_err(|e| KernelError::Snapshot(format!("unreadable snapshot: {e}")))?;
            store.kv = snap.kv;
            store.transcripts = snap
                .transcripts
                .into_iter()
                .map(|(vat, pos, entry)| ((vat, pos), entry))
                .collect();
            for (id, encoded) in snap.bundles {
                let bytes = hex::decode(&encoded)
                    .map_err(|e| KernelError::Snapshot(format!("bundle {id}: {e}")))?;
                store.bundles.insert(id, bytes);
            }
        }

        let mut log = CommitLog::open(&data_dir.join(WAL_FILE))?;
        let records = log.recover()?;
        for op in records.iter().flatten() {
            store.apply(op);
        }
        if !records.is_empty() {
            tracing::debug!(
                cranks = records.len(),
                "replayed commit log in {}",
                data_dir.display()
            );
        }

        store.log = Some(log);
        store.data_dir = Some(data_dir.to_path_buf());
        Ok(store)
    }

    fn apply(&mut self, op: &LogOp) {
        match op {
            LogOp::Set { key, value } => {
                self.kv.insert(key.clone(), value.clone());
            }
            LogOp::Delete { key } => {
                self.kv.remove(key);
            }
            LogOp::Transcript { vat, pos, entry } => {
                self.transcripts.insert((*vat, *pos), entry.clone());
            }
            LogOp::Bundle { id, bytes } => {
                self.bundles.insert(id.clone(), bytes.clone());
            }
        }
    }

    // ── Key-value ──

    pub fn get(&self, key: &str) -> Option<&str> {
        match self.buffer.kv.get(key) {
            Some(pending) => pending.as_deref(),
            None => self.kv.get(key).map(String::as_str),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.buffer.kv.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: &str) {
        if self.has(key) {
            self.buffer.kv.insert(key.to_string(), None);
        }
    }

    /// All live keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: BTreeSet<String> = self
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for (k, v) in self
            .buffer
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            if v.is_some() {
                keys.insert(k.clone());
            } else {
                keys.remove(k);
            }
        }
        keys.into_iter().collect()
    }

    /// The first live key strictly after `prior` that starts with `prefix`.
    pub fn next_key_after(&self, prefix: &str, prior: &str) -> Option<String> {
        let start = if prior < prefix { prefix } else { prior };
        let committed = self
            .kv
            .range::<str, _>((std::ops::Bound::Excluded(start), std::ops::Bound::Unbounded))
            .map(|(k, _)| k);
        let pending = self
            .buffer
            .kv
            .range::<str, _>((std::ops::Bound::Excluded(start), std::ops::Bound::Unbounded))
            .map(|(k, _)| k);
        let mut candidates: BTreeSet<&String> = BTreeSet::new();
        // Both maps are sorted; the answer is among the first few live keys of either.
        for k in committed.take_while(|k| k.starts_with(prefix)) {
            if self.get(k).is_some() {
                candidates.insert(k);
                break;
            }
        }
        for k in pending.take_while(|k| k.starts_with(prefix)) {
            if self.get(k).is_some() {
                candidates.insert(k);
                break;
            }
        }
        candidates.into_iter().next().cloned()
    }

    // ── Transcripts ──

    pub fn append_transcript(&mut self, vat: VatId, pos: u64, entry: String) {
        self.buffer.transcripts.insert((vat, pos), entry);
    }

    /// Transcript entries for `vat` with positions in `[from, to)`.
    pub fn read_transcript(&self, vat: VatId, from: u64, to: u64) -> KernelResult<Vec<String>> {
        (from..to)
            .map(|pos| {
                self.buffer
                    .transcripts
                    .get(&(vat, pos))
                    .or_else(|| self.transcripts.get(&(vat, pos)))
                    .cloned()
                    .ok_or_else(|| {
                        KernelError::InvalidData(format!("missing transcript entry {vat}:{pos}"))
                    })
            })
            .collect()
    }

    // ── Bundles ──

    /// Store `bytes` under their content address. Returns the bundle ID.
    pub fn add_bundle(&mut self, bytes: Vec<u8>) -> String {
        let id = bundle_id(&bytes);
        if !self.has_bundle(&id) {
            self.buffer.bundles.insert(id.clone(), bytes);
        }
        id
    }

    pub fn get_bundle(&self, id: &str) -> Option<&[u8]> {
        self.buffer
            .bundles
            .get(id)
            .or_else(|| self.bundles.get(id))
            .map(Vec::as_slice)
    }

    pub fn has_bundle(&self, id: &str) -> bool {
        self.get_bundle(id).is_some()
    }

    // ── Crank transactions ──

    pub fn establish_savepoint(&mut self, sp: Savepoint) {
        self.savepoints.insert(sp, self.buffer.clone());
    }

    /// Rewind the crank buffer to a savepoint. Later savepoints are dropped.
    pub fn rollback_to(&mut self, sp: Savepoint) {
        match self.savepoints.get(&sp) {
            Some(saved) => self.buffer = saved.clone(),
            None => self.buffer = CrankBuffer::default(),
        }
        self.savepoints.retain(|k, _| *k <= sp);
    }

    /// Discard everything since the last commit.
    pub fn abort(&mut self) {
        self.buffer = CrankBuffer::default();
        self.savepoints.clear();
    }

    /// Commit the crank buffer. Returns the crank hash, or `None` if nothing changed.
    ///
    /// The WAL write happens before committed state changes; if it fails the
    /// caller must treat the kernel as dead.
    pub fn commit(&mut self) -> KernelResult<Option<String>> {
        self.savepoints.clear();
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut ops = self.buffer.to_ops();
        let crank_hash = crank_hash(&ops);
        let activity = chain_hash(self.activity_hash(), &crank_hash);
        self.buffer
            .kv
            .insert(ACTIVITY_HASH_KEY.to_string(), Some(activity.clone()));
        ops.push(LogOp::Set {
            key: ACTIVITY_HASH_KEY.to_string(),
            value: activity,
        });

        if let Some(log) = self.log.as_mut() {
            log.append(&ops)?;
        }

        let buffer = std::mem::take(&mut self.buffer);
        for (key, value) in buffer.kv {
            match value {
                Some(v) => self.kv.insert(key, v),
                None => self.kv.remove(&key),
            };
        }
        self.transcripts.extend(buffer.transcripts);
        self.bundles.extend(buffer.bundles);

        Ok(Some(crank_hash))
    }

    /// Running hash over every commit so far. Empty string before the first.
    pub fn activity_hash(&self) -> &str {
        self.kv.get(ACTIVITY_HASH_KEY).map(String::as_str).unwrap_or("")
    }

    /// Write a snapshot of committed state and truncate the WAL.
    /// A no-op for in-memory stores.
    pub fn checkpoint(&mut self) -> KernelResult<()> {
        let (Some(dir), Some(log)) = (self.data_dir.as_ref(), self.log.as_mut()) else {
            return Ok(());
        };

        let snap = SnapshotFile {
            kv: self.kv.clone(),
            transcripts: self
                .transcripts
                .iter()
                .map(|((vat, pos), entry)| (*vat, *pos, entry.clone()))
                .collect(),
            bundles: self
                .bundles
                .iter()
                .map(|(id, bytes)| (id.clone(), hex::encode(bytes)))
                .collect(),
        };
        let bytes = serde_json::to_vec(&snap)?;

        let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;

        log.truncate()?;
        tracing::debug!("checkpointed {} keys to {}", self.kv.len(), dir.display());
        Ok(())
    }

    /// WAL size in bytes (0 for in-memory stores).
    pub fn wal_size(&self) -> KernelResult<u64> {
        match &self.log {
            Some(log) => log.len_bytes(),
            None => Ok(0),
        }
    }
}

/// Content address of a bundle: `b1-` + SHA-256 hex.
pub fn bundle_id(bytes: &[u8]) -> String {
    format!("b1-{}", hex::encode(Sha256::digest(bytes)))
}

fn crank_hash(ops: &[LogOp]) -> String {
    hex::encode(Sha256::digest(wal::encode_ops(ops)))
}

fn chain_hash(prev: &str, crank: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(b"\n");
    hasher.update(crank.as_bytes());
    hex::encode(hasher.finalize())
}
