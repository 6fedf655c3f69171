pub mod lsm;

use crate::error::EdgeError;
use crate::model::now_millis;
use futures_util::Stream;
use lsm::{Entry, LsmTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// The three logical tables. Each maps to one LSM directory under the store
/// root, mirroring the persisted layout `<STORE_DIR>/{pools,backends,certificates}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Pools,
    Backends,
    Certificates,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Pools, Table::Backends, Table::Certificates];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Pools => "pools",
            Table::Backends => "backends",
            Table::Certificates => "certificates",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EdgeError> {
        match s {
            "pools" => Ok(Table::Pools),
            "backends" => Ok(Table::Backends),
            "certificates" => Ok(Table::Certificates),
            other => Err(EdgeError::Validation(format!("unknown table '{}'", other))),
        }
    }

    /// Fields with a maintained secondary index.
    fn indexed_fields(&self) -> &'static [&'static str] {
        match self {
            Table::Pools => &[],
            Table::Backends => &["pool_name", "healthy"],
            Table::Certificates => &["domain", "expires_at"],
        }
    }
}

/// A single change on a table, delivered to `subscribe` streams. Carries
/// changes of every origin: local admin writes, volatile checkpoints, and
/// records replicated from peers.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Put { key: String, record: Value },
    Delete { key: String },
}

/// Wire envelope for cross-node replication: one durable write, shipped
/// asynchronously to every peer and exchanged in bulk on snapshot sync.
/// `record=None` replicates a delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationOp {
    pub origin: String,
    pub table: String,
    pub key: String,
    pub record: Option<Value>,
    pub updated_at: u64,
}

struct TableHandle {
    lsm: Arc<LsmTable>,
    changes: broadcast::Sender<ChangeEvent>,
    /// field → canonical value → set of keys. Rebuilt at open, maintained on
    /// every mutation under this lock.
    indexes: Mutex<HashMap<&'static str, HashMap<String, HashSet<String>>>>,
}

/// Replicated persistent key/value store for pool, backend, and certificate
/// records.
///
/// Local writes commit to the per-table LSM engine before returning, then
/// flow out through the replication feed. Writes arriving from peers come in
/// through `apply_replicated`, which resolves conflicts last-write-wins on
/// `updated_at` (wall-clock unix ms stamped by the writing node; ties broken
/// by the lexicographically larger serialized record) and never re-enters the
/// replication feed.
pub struct Store {
    node: String,
    pools: TableHandle,
    backends: TableHandle,
    certificates: TableHandle,
    repl_tx: mpsc::UnboundedSender<ReplicationOp>,
}

impl Store {
    /// Open all tables under `dir`. Any unrecoverable corruption fails the
    /// open; the caller treats that as fatal.
    ///
    /// Returns the store plus the replication feed: the stream of local
    /// durable writes the cluster replicator ships to peers.
    pub fn open(
        dir: &Path,
        node: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ReplicationOp>), EdgeError> {
        init_schema(dir)?;
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();

        let open_table = |table: Table| -> Result<TableHandle, EdgeError> {
            let lsm = Arc::new(LsmTable::open(&dir.join(table.as_str()))?);
            let (changes, _) = broadcast::channel(1024);
            let handle = TableHandle {
                lsm,
                changes,
                indexes: Mutex::new(HashMap::new()),
            };
            rebuild_indexes(table, &handle)?;
            Ok(handle)
        };

        let store = Arc::new(Self {
            node: node.to_string(),
            pools: open_table(Table::Pools)?,
            backends: open_table(Table::Backends)?,
            certificates: open_table(Table::Certificates)?,
            repl_tx,
        });

        info!("store: opened, dir={}", dir.display());
        Ok((store, repl_rx))
    }

    fn table(&self, table: Table) -> &TableHandle {
        match table {
            Table::Pools => &self.pools,
            Table::Backends => &self.backends,
            Table::Certificates => &self.certificates,
        }
    }

    /// Durable write, replicated to peers. Returns after the local commit;
    /// replication is asynchronous (fire-and-forget with background retry).
    pub async fn put(&self, table: Table, key: &str, record: Value) -> Result<(), EdgeError> {
        let updated_at = self.commit(table, key, Some(record.clone())).await?;
        let _ = self.repl_tx.send(ReplicationOp {
            origin: self.node.clone(),
            table: table.as_str().to_string(),
            key: key.to_string(),
            record: Some(record),
            updated_at,
        });
        Ok(())
    }

    /// Durable write that stays on this node. Used for volatile-counter and
    /// health checkpoints, which are per-node observations — replicating them
    /// would have peers overwrite each other's probe results.
    pub async fn put_local(&self, table: Table, key: &str, record: Value) -> Result<(), EdgeError> {
        self.commit(table, key, Some(record)).await?;
        Ok(())
    }

    /// Idempotent delete: succeeds whether or not the key exists.
    pub async fn delete(&self, table: Table, key: &str) -> Result<(), EdgeError> {
        let updated_at = self.commit(table, key, None).await?;
        let _ = self.repl_tx.send(ReplicationOp {
            origin: self.node.clone(),
            table: table.as_str().to_string(),
            key: key.to_string(),
            record: None,
            updated_at,
        });
        Ok(())
    }

    pub fn get(&self, table: Table, key: &str) -> Result<Value, EdgeError> {
        self.table(table)
            .lsm
            .get(key)?
            .ok_or_else(|| EdgeError::NotFound(format!("{}/{}", table.as_str(), key)))
    }

    /// Unordered snapshot of all live records.
    pub fn list(&self, table: Table) -> Result<Vec<Value>, EdgeError> {
        Ok(self
            .table(table)
            .lsm
            .list()?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// All records where `field == value`. Only the maintained indexes are
    /// queryable; asking for anything else is a caller bug surfaced as
    /// `Validation`.
    pub fn index_lookup(
        &self,
        table: Table,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, EdgeError> {
        if !table.indexed_fields().contains(&field) {
            return Err(EdgeError::Validation(format!(
                "field '{}' is not indexed on table '{}'",
                field,
                table.as_str()
            )));
        }
        let handle = self.table(table);
        let mut keys: Vec<String> = {
            let indexes = handle
                .indexes
                .lock()
                .map_err(|_| EdgeError::Storage("index lock poisoned".into()))?;
            indexes
                .get(field)
                .and_then(|buckets| buckets.get(&canonical_index_value(value)))
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default()
        };
        // bucket sets are unordered; callers (pool hydration above all) need
        // a stable result
        keys.sort();
        let wanted = canonical_index_value(value);
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = handle.lsm.get(&key)? {
                // the index is advisory under concurrent writers; the live
                // record decides membership
                let matches = record
                    .get(field)
                    .map(|v| canonical_index_value(v) == wanted)
                    .unwrap_or(false);
                if matches {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Lazy infinite stream of change events on one table, including changes
    /// received from peers. A subscriber that falls behind skips the missed
    /// window with a warning and keeps streaming — consumers are idempotent
    /// upsert appliers that resync from `list` when it matters.
    pub fn subscribe(&self, table: Table) -> impl Stream<Item = ChangeEvent> + Send + Unpin {
        let rx = self.table(table).changes.subscribe();
        let table_name = table.as_str();
        Box::pin(futures_util::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            "store: change subscriber lagged, table={}, missed={}",
                            table_name, missed
                        );
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    /// Apply a write received from a peer. Last-write-wins on `updated_at`;
    /// returns whether the op was applied (false = stale, local copy newer).
    pub async fn apply_replicated(&self, op: ReplicationOp) -> Result<bool, EdgeError> {
        if op.origin == self.node {
            return Ok(false);
        }
        let table = Table::parse(&op.table)?;
        let handle = self.table(table);

        if let Some(current) = handle.lsm.get_entry(&op.key)? {
            if op.updated_at < current.updated_at {
                return Ok(false);
            }
            if op.updated_at == current.updated_at {
                // Same-millisecond writes from two partitions: pick a winner
                // deterministically so all nodes converge on one value.
                let incoming = serde_json::to_string(&op.record).unwrap_or_default();
                let local = serde_json::to_string(&current.record).unwrap_or_default();
                if incoming <= local {
                    return Ok(false);
                }
            }
        }

        self.commit_entry(
            table,
            &op.key,
            Entry {
                record: op.record,
                updated_at: op.updated_at,
            },
        )
        .await?;
        Ok(true)
    }

    /// Full dump of every cell (tombstones included) for join-time sync.
    pub fn snapshot(&self) -> Result<Vec<ReplicationOp>, EdgeError> {
        let mut ops = Vec::new();
        for table in Table::ALL {
            for (key, entry) in self.table(table).lsm.dump()? {
                ops.push(ReplicationOp {
                    origin: self.node.clone(),
                    table: table.as_str().to_string(),
                    key,
                    record: entry.record,
                    updated_at: entry.updated_at,
                });
            }
        }
        Ok(ops)
    }

    /// Flush all tables (graceful shutdown).
    pub fn flush_all(&self) -> Result<(), EdgeError> {
        for table in Table::ALL {
            self.table(table).lsm.flush()?;
        }
        Ok(())
    }

    // -- private helpers --

    /// Local commit path shared by put/put_local/delete. Stamps `updated_at`
    /// from the record when present (the model types maintain it), falling
    /// back to the commit time, and returns the stamp used.
    async fn commit(
        &self,
        table: Table,
        key: &str,
        record: Option<Value>,
    ) -> Result<u64, EdgeError> {
        let updated_at = record
            .as_ref()
            .and_then(|r| r.get("updated_at"))
            .and_then(|v| v.as_u64())
            .unwrap_or_else(now_millis);
        self.commit_entry(
            table,
            key,
            Entry {
                record,
                updated_at,
            },
        )
        .await?;
        Ok(updated_at)
    }

    async fn commit_entry(&self, table: Table, key: &str, entry: Entry) -> Result<(), EdgeError> {
        let handle = self.table(table);

        let old = handle.lsm.get(key)?;

        let lsm = handle.lsm.clone();
        let key_owned = key.to_string();
        let entry_clone = entry.clone();
        tokio::task::spawn_blocking(move || lsm.put(&key_owned, entry_clone))
            .await
            .map_err(|e| EdgeError::Storage(format!("commit task: {}", e)))??;

        update_indexes(table, handle, key, old.as_ref(), entry.record.as_ref())?;

        let event = match entry.record {
            Some(record) => ChangeEvent::Put {
                key: key.to_string(),
                record,
            },
            None => ChangeEvent::Delete {
                key: key.to_string(),
            },
        };
        let _ = handle.changes.send(event);
        Ok(())
    }
}

/// On-disk format version, bumped only on incompatible layout changes.
const SCHEMA_VERSION: u32 = 1;

/// Idempotent schema initialization: a fresh directory gets the version
/// marker, an existing one is checked against it. A joining node therefore
/// adopts whatever schema the deployment already runs, and a version
/// mismatch is corruption-grade (refuse to serve rather than misread).
fn init_schema(dir: &Path) -> Result<(), EdgeError> {
    let schema_dir = dir.join("schema");
    std::fs::create_dir_all(&schema_dir)
        .map_err(|e| EdgeError::Storage(format!("create {}: {}", schema_dir.display(), e)))?;

    let version_path = schema_dir.join("VERSION");
    if version_path.exists() {
        let raw = std::fs::read_to_string(&version_path)
            .map_err(|e| EdgeError::Storage(format!("read schema version: {}", e)))?;
        let found: u32 = raw
            .trim()
            .parse()
            .map_err(|_| EdgeError::Storage(format!("unreadable schema version '{}'", raw.trim())))?;
        if found != SCHEMA_VERSION {
            return Err(EdgeError::Storage(format!(
                "schema version mismatch: disk has {}, this build expects {}",
                found, SCHEMA_VERSION
            )));
        }
    } else {
        std::fs::write(&version_path, format!("{}\n", SCHEMA_VERSION))
            .map_err(|e| EdgeError::Storage(format!("write schema version: {}", e)))?;
    }
    Ok(())
}

/// Canonical string form of an indexed value: strings raw, everything else
/// as its JSON text. Both sides of an index lookup go through this.
fn canonical_index_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn rebuild_indexes(table: Table, handle: &TableHandle) -> Result<(), EdgeError> {
    let fields = table.indexed_fields();
    if fields.is_empty() {
        return Ok(());
    }
    let mut indexes: HashMap<&'static str, HashMap<String, HashSet<String>>> = HashMap::new();
    for (key, record) in handle.lsm.list()? {
        for field in fields {
            if let Some(value) = record.get(*field) {
                indexes
                    .entry(field)
                    .or_default()
                    .entry(canonical_index_value(value))
                    .or_default()
                    .insert(key.clone());
            }
        }
    }
    *handle
        .indexes
        .lock()
        .map_err(|_| EdgeError::Storage("index lock poisoned".into()))? = indexes;
    Ok(())
}

fn update_indexes(
    table: Table,
    handle: &TableHandle,
    key: &str,
    old: Option<&Value>,
    new: Option<&Value>,
) -> Result<(), EdgeError> {
    let fields = table.indexed_fields();
    if fields.is_empty() {
        return Ok(());
    }
    let mut indexes = handle
        .indexes
        .lock()
        .map_err(|_| EdgeError::Storage("index lock poisoned".into()))?;
    for field in fields {
        if let Some(old_value) = old.and_then(|r| r.get(*field)) {
            if let Some(buckets) = indexes.get_mut(field) {
                let canon = canonical_index_value(old_value);
                if let Some(keys) = buckets.get_mut(&canon) {
                    keys.remove(key);
                    if keys.is_empty() {
                        buckets.remove(&canon);
                    }
                }
            }
        }
        if let Some(new_value) = new.and_then(|r| r.get(*field)) {
            indexes
                .entry(field)
                .or_default()
                .entry(canonical_index_value(new_value))
                .or_default()
                .insert(key.to_string());
        }
    }
    Ok(())
}
