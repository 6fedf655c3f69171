use crate::error::EdgeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Flush the memtable to a segment after this many WAL appends.
const FLUSH_EVERY_OPS: usize = 256;

const WAL_FILE: &str = "wal.log";
const SEGMENT_PREFIX: &str = "seg-";
const SEGMENT_SUFFIX: &str = ".sst";

/// One versioned cell. `record=None` is a tombstone; tombstones are retained
/// (in memory and in segments) because their `updated_at` participates in
/// last-write-wins conflict resolution with peers after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub record: Option<serde_json::Value>,
    pub updated_at: u64,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        self.record.is_none()
    }
}

#[derive(Serialize, Deserialize)]
struct WalLine {
    key: String,
    #[serde(flatten)]
    entry: Entry,
}

struct TableState {
    mem: BTreeMap<String, Entry>,
    wal: File,
    /// WAL appends since the last flush.
    wal_ops: usize,
    next_segment: u64,
}

/// One on-disk table: an fsynced append-only WAL plus sorted snapshot
/// segments. The full merged view lives in `mem` (the tables hold
/// configuration, not data-plane payloads), so reads never touch disk; the
/// files exist for durability. A flush writes a complete sorted segment,
/// removes the segments it supersedes, and truncates the WAL.
///
/// All file I/O is synchronous; the async `Store` front-end routes writes
/// through `spawn_blocking`.
pub struct LsmTable {
    dir: PathBuf,
    state: Mutex<TableState>,
}

impl LsmTable {
    /// Open (or create) the table directory, loading segments oldest to
    /// newest and then replaying the WAL on top.
    ///
    /// A torn final WAL line (crash mid-append) is dropped with a warning;
    /// any other parse failure is unrecoverable corruption and fails the
    /// open — the caller exits rather than serve from a partial table.
    pub fn open(dir: &Path) -> Result<Self, EdgeError> {
        fs::create_dir_all(dir)
            .map_err(|e| EdgeError::Storage(format!("create {}: {}", dir.display(), e)))?;

        let mut mem = BTreeMap::new();
        let mut next_segment: u64 = 0;

        for (seq, path) in list_segments(dir)? {
            load_lines(&path, false, |line| {
                let parsed: WalLine = serde_json::from_str(line).map_err(|e| {
                    EdgeError::Storage(format!("corrupt segment {}: {}", path.display(), e))
                })?;
                mem.insert(parsed.key, parsed.entry);
                Ok(())
            })?;
            next_segment = next_segment.max(seq + 1);
        }

        let wal_path = dir.join(WAL_FILE);
        let mut wal_ops = 0usize;
        if wal_path.exists() {
            load_lines(&wal_path, true, |line| {
                let parsed: WalLine = serde_json::from_str(line).map_err(|e| {
                    EdgeError::Storage(format!("corrupt wal {}: {}", wal_path.display(), e))
                })?;
                mem.insert(parsed.key, parsed.entry);
                wal_ops += 1;
                Ok(())
            })?;
        }

        let wal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)
            .map_err(|e| EdgeError::Storage(format!("open wal: {}", e)))?;

        debug!(
            "store: table opened, dir={}, keys={}, replayed_wal_ops={}",
            dir.display(),
            mem.len(),
            wal_ops
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(TableState {
                mem,
                wal,
                wal_ops,
                next_segment,
            }),
        })
    }

    /// Durable write: WAL append + fsync before the memtable is touched.
    /// Returns only after the local commit. Linearizable per key — the table
    /// lock covers both the file append and the memtable update.
    pub fn put(&self, key: &str, entry: Entry) -> Result<(), EdgeError> {
        let mut state = self.lock()?;

        let line = serde_json::to_string(&WalLine {
            key: key.to_string(),
            entry: entry.clone(),
        })
        .map_err(|e| EdgeError::Storage(format!("encode wal line: {}", e)))?;

        state
            .wal
            .write_all(line.as_bytes())
            .and_then(|_| state.wal.write_all(b"\n"))
            .and_then(|_| state.wal.sync_data())
            .map_err(|e| EdgeError::Storage(format!("wal append: {}", e)))?;

        state.mem.insert(key.to_string(), entry);
        state.wal_ops += 1;

        if state.wal_ops >= FLUSH_EVERY_OPS {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Current cell for `key`, tombstones included.
    pub fn get_entry(&self, key: &str) -> Result<Option<Entry>, EdgeError> {
        Ok(self.lock()?.mem.get(key).cloned())
    }

    /// Live record for `key` (tombstones filtered).
    pub fn get(&self, key: &str) -> Result<Option<serde_json::Value>, EdgeError> {
        Ok(self
            .lock()?
            .mem
            .get(key)
            .and_then(|e| e.record.clone()))
    }

    /// Snapshot of all live (key, record) pairs.
    pub fn list(&self) -> Result<Vec<(String, serde_json::Value)>, EdgeError> {
        Ok(self
            .lock()?
            .mem
            .iter()
            .filter_map(|(k, e)| e.record.clone().map(|r| (k.clone(), r)))
            .collect())
    }

    /// Snapshot of every cell including tombstones, for replication sync.
    pub fn dump(&self) -> Result<Vec<(String, Entry)>, EdgeError> {
        Ok(self
            .lock()?
            .mem
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect())
    }

    /// Force a segment flush (used at graceful shutdown).
    pub fn flush(&self) -> Result<(), EdgeError> {
        let mut state = self.lock()?;
        if state.wal_ops == 0 {
            return Ok(());
        }
        self.flush_locked(&mut state)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TableState>, EdgeError> {
        self.state
            .lock()
            .map_err(|_| EdgeError::Storage("table lock poisoned".into()))
    }

    /// Write the full memtable as a new sorted segment, drop superseded
    /// segments, and truncate the WAL. Written to a temp file and renamed so
    /// a crash mid-flush leaves either the old state or the new, never half.
    fn flush_locked(&self, state: &mut TableState) -> Result<(), EdgeError> {
        let seq = state.next_segment;
        let tmp_path = self.dir.join(format!("{}{:08}.tmp", SEGMENT_PREFIX, seq));
        let seg_path = self
            .dir
            .join(format!("{}{:08}{}", SEGMENT_PREFIX, seq, SEGMENT_SUFFIX));

        {
            let mut tmp = File::create(&tmp_path)
                .map_err(|e| EdgeError::Storage(format!("create segment: {}", e)))?;
            for (key, entry) in state.mem.iter() {
                let line = serde_json::to_string(&WalLine {
                    key: key.clone(),
                    entry: entry.clone(),
                })
                .map_err(|e| EdgeError::Storage(format!("encode segment line: {}", e)))?;
                tmp.write_all(line.as_bytes())
                    .and_then(|_| tmp.write_all(b"\n"))
                    .map_err(|e| EdgeError::Storage(format!("write segment: {}", e)))?;
            }
            tmp.sync_all()
                .map_err(|e| EdgeError::Storage(format!("sync segment: {}", e)))?;
        }
        fs::rename(&tmp_path, &seg_path)
            .map_err(|e| EdgeError::Storage(format!("publish segment: {}", e)))?;

        // Older segments are fully contained in the one just written.
        for (old_seq, old_path) in list_segments(&self.dir)? {
            if old_seq < seq {
                if let Err(e) = fs::remove_file(&old_path) {
                    warn!(
                        "store: failed to remove superseded segment {}: {}",
                        old_path.display(),
                        e
                    );
                }
            }
        }

        // Truncate the WAL now that its contents are in the segment.
        let wal_path = self.dir.join(WAL_FILE);
        state.wal = File::create(&wal_path)
            .map_err(|e| EdgeError::Storage(format!("truncate wal: {}", e)))?;
        state.wal_ops = 0;
        state.next_segment = seq + 1;

        debug!(
            "store: table flushed, dir={}, segment={}, keys={}",
            self.dir.display(),
            seq,
            state.mem.len()
        );
        Ok(())
    }
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, EdgeError> {
    let mut segments = Vec::new();
    let entries = fs::read_dir(dir)
        .map_err(|e| EdgeError::Storage(format!("read {}: {}", dir.display(), e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| EdgeError::Storage(format!("read dir entry: {}", e)))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        {
            if let Ok(seq) = stem.parse::<u64>() {
                segments.push((seq, entry.path()));
            }
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Stream a line-oriented file through `apply`. With `tolerate_torn_tail`,
/// a final line that fails to parse is dropped (crash mid-append) — the
/// parse error is surfaced from `apply` for every other position.
fn load_lines(
    path: &Path,
    tolerate_torn_tail: bool,
    mut apply: impl FnMut(&str) -> Result<(), EdgeError>,
) -> Result<(), EdgeError> {
    let file =
        File::open(path).map_err(|e| EdgeError::Storage(format!("open {}: {}", path.display(), e)))?;
    let reader = BufReader::new(file);
    let lines: Vec<String> = reader
        .lines()
        .collect::<Result<_, _>>()
        .map_err(|e| EdgeError::Storage(format!("read {}: {}", path.display(), e)))?;

    let total = lines.len();
    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        if let Err(e) = apply(line) {
            if tolerate_torn_tail && i + 1 == total {
                warn!(
                    "store: dropping torn trailing line in {} ({})",
                    path.display(),
                    e
                );
                return Ok(());
            }
            return Err(e);
        }
    }
    Ok(())
}
