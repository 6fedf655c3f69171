pub mod health;
pub mod registry;

use crate::balance;
use crate::error::EdgeError;
use crate::model::{AlgorithmState, BackendRecord, PoolRecord, PoolStats};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Mailbox protocol for a pool actor. Every operation on a pool flows
/// through here, so counters and the algorithm cursor are mutated from
/// exactly one task and observe enqueue order.
enum PoolCommand {
    AddBackend {
        backend: BackendRecord,
        reply: oneshot::Sender<Result<BackendRecord, EdgeError>>,
    },
    /// Store-change path (local echo or peer replication): upsert the config
    /// fields while preserving this node's volatile counters and health.
    SyncBackend { backend: BackendRecord },
    RemoveBackend {
        id: String,
        reply: Option<oneshot::Sender<Result<(), EdgeError>>>,
    },
    Select {
        reply: oneshot::Sender<Result<BackendRecord, EdgeError>>,
    },
    Release { id: String },
    SetHealth { id: String, healthy: bool },
    List {
        reply: oneshot::Sender<Vec<BackendRecord>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Record {
        reply: oneshot::Sender<PoolRecord>,
    },
    /// Pool config changed (admin or peer). Algorithm state carries over.
    SyncRecord { record: PoolRecord },
    Shutdown,
}

/// Cheap, cloneable handle to a running pool actor.
///
/// All methods are non-blocking message sends; the awaits only wait for the
/// actor to reach the command in its mailbox. A handle whose actor has shut
/// down reports `NotFound` — the pool was deleted.
#[derive(Clone)]
pub struct PoolHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn gone(&self) -> EdgeError {
        EdgeError::NotFound(format!("pool '{}'", self.name))
    }

    fn send(&self, cmd: PoolCommand) -> Result<(), EdgeError> {
        self.tx.send(cmd).map_err(|_| self.gone())
    }

    /// Add a backend. Fails with `AlreadyExists` when the id collides; the
    /// pool is left untouched in that case.
    pub async fn add_backend(&self, backend: BackendRecord) -> Result<BackendRecord, EdgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::AddBackend { backend, reply })?;
        rx.await.map_err(|_| self.gone())?
    }

    pub fn sync_backend(&self, backend: BackendRecord) {
        let _ = self.tx.send(PoolCommand::SyncBackend { backend });
    }

    /// Remove a backend by id. In-flight requests holding its lease finish;
    /// no later selection returns it.
    pub async fn remove_backend(&self, id: &str) -> Result<(), EdgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::RemoveBackend {
            id: id.to_string(),
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Fire-and-forget removal, used by the store-change watcher where the
    /// record is already gone and "not found" is not an error.
    pub fn remove_backend_quiet(&self, id: &str) {
        let _ = self.tx.send(PoolCommand::RemoveBackend {
            id: id.to_string(),
            reply: None,
        });
    }

    /// Select a backend under the pool's algorithm and take a connection
    /// lease on it. The lease releases the slot on drop — every exit path of
    /// the caller, including cancellation and panic, pays the release.
    pub async fn select_backend(&self) -> Result<BackendLease, EdgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::Select { reply })?;
        let backend = rx.await.map_err(|_| self.gone())??;
        Ok(BackendLease {
            backend,
            pool: self.clone(),
            armed: true,
        })
    }

    /// Decrement a backend's connection gauge. Always succeeds; releasing a
    /// backend that was removed meanwhile is a no-op.
    pub fn release_backend(&self, id: &str) {
        let _ = self.tx.send(PoolCommand::Release { id: id.to_string() });
    }

    pub fn set_health(&self, id: &str, healthy: bool) {
        let _ = self.tx.send(PoolCommand::SetHealth {
            id: id.to_string(),
            healthy,
        });
    }

    pub async fn list_backends(&self) -> Result<Vec<BackendRecord>, EdgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::List { reply })?;
        rx.await.map_err(|_| self.gone())
    }

    pub async fn stats(&self) -> Result<PoolStats, EdgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::Stats { reply })?;
        rx.await.map_err(|_| self.gone())
    }

    pub async fn record(&self) -> Result<PoolRecord, EdgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::Record { reply })?;
        rx.await.map_err(|_| self.gone())
    }

    pub fn sync_record(&self, record: PoolRecord) {
        let _ = self.tx.send(PoolCommand::SyncRecord { record });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PoolCommand::Shutdown);
    }
}

/// RAII connection lease from `select_backend`. Exactly one release per
/// successful selection: dropping the lease sends it, on every exit path.
pub struct BackendLease {
    backend: BackendRecord,
    pool: PoolHandle,
    armed: bool,
}

impl BackendLease {
    /// Snapshot of the selected backend at selection time.
    pub fn backend(&self) -> &BackendRecord {
        &self.backend
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.pool.release_backend(&self.backend.id);
        }
    }
}

/// Spawn the actor task for `record`, seeded with `backends` (typically read
/// back from the store at boot). Returns the handle plus the task handle the
/// registry joins on delete.
pub fn spawn(
    record: PoolRecord,
    backends: Vec<BackendRecord>,
) -> (PoolHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = PoolHandle {
        name: Arc::from(record.name.as_str()),
        tx,
    };
    let actor = PoolActor {
        state: record.algorithm_state.clone(),
        record,
        backends,
    };
    let task = tokio::spawn(actor.run(rx));
    (handle, task)
}

struct PoolActor {
    record: PoolRecord,
    backends: Vec<BackendRecord>,
    state: AlgorithmState,
}

impl PoolActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolCommand>) {
        info!(
            "pool: actor started, pool={}, algorithm={}, backends={}",
            self.record.name,
            self.record.algorithm.as_str(),
            self.backends.len()
        );
        while let Some(cmd) = rx.recv().await {
            if self.handle(cmd) {
                break;
            }
        }
        info!("pool: actor stopped, pool={}", self.record.name);
    }

    /// Returns true on shutdown.
    fn handle(&mut self, cmd: PoolCommand) -> bool {
        match cmd {
            PoolCommand::AddBackend { backend, reply } => {
                let _ = reply.send(self.add_backend(backend));
            }
            PoolCommand::SyncBackend { backend } => self.sync_backend(backend),
            PoolCommand::RemoveBackend { id, reply } => {
                let result = self.remove_backend(&id);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            PoolCommand::Select { reply } => {
                let _ = reply.send(self.select());
            }
            PoolCommand::Release { id } => {
                if let Some(backend) = self.backends.iter_mut().find(|b| b.id == id) {
                    backend.dec_connections();
                }
            }
            PoolCommand::SetHealth { id, healthy } => {
                if let Some(backend) = self.backends.iter_mut().find(|b| b.id == id) {
                    *backend = backend.set_health(healthy);
                }
            }
            PoolCommand::List { reply } => {
                let _ = reply.send(self.backends.clone());
            }
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            PoolCommand::Record { reply } => {
                let mut record = self.record.clone();
                record.algorithm_state = self.state.clone();
                let _ = reply.send(record);
            }
            PoolCommand::SyncRecord { record } => {
                debug!(
                    "pool: config synced, pool={}, algorithm={}",
                    record.name,
                    record.algorithm.as_str()
                );
                self.record = record;
            }
            PoolCommand::Shutdown => return true,
        }
        false
    }

    fn add_backend(&mut self, backend: BackendRecord) -> Result<BackendRecord, EdgeError> {
        if self.backends.iter().any(|b| b.id == backend.id) {
            return Err(EdgeError::AlreadyExists(format!(
                "backend '{}' in pool '{}'",
                backend.id, self.record.name
            )));
        }
        let backend = backend.in_pool(&self.record.name);
        self.backends.push(backend.clone());
        Ok(backend)
    }

    fn sync_backend(&mut self, incoming: BackendRecord) {
        match self.backends.iter_mut().find(|b| b.id == incoming.id) {
            Some(existing) => {
                // Config fields come from the record; volatile fields stay
                // this node's own observations.
                let mut merged = incoming;
                merged.healthy = existing.healthy;
                merged.current_connections = existing.current_connections;
                merged.total_requests = existing.total_requests;
                merged.last_check = existing.last_check;
                *existing = merged;
            }
            None => self.backends.push(incoming),
        }
    }

    fn remove_backend(&mut self, id: &str) -> Result<(), EdgeError> {
        let before = self.backends.len();
        self.backends.retain(|b| b.id != id);
        if self.backends.len() == before {
            return Err(EdgeError::NotFound(format!(
                "backend '{}' in pool '{}'",
                id, self.record.name
            )));
        }
        Ok(())
    }

    fn select(&mut self) -> Result<BackendRecord, EdgeError> {
        let (id, next_state) = balance::select(&self.backends, self.record.algorithm, &self.state)?;
        self.state = next_state;
        let backend = self
            .backends
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or(EdgeError::NoBackends)?;
        backend.inc_connections();
        Ok(backend.clone())
    }

    fn stats(&self) -> PoolStats {
        let healthy = self.backends.iter().filter(|b| b.healthy).count();
        PoolStats {
            pool_name: self.record.name.clone(),
            algorithm: self.record.algorithm,
            total_backends: self.backends.len(),
            healthy_backends: healthy,
            unhealthy_backends: self.backends.len() - healthy,
            current_connections: self.backends.iter().map(|b| b.current_connections).sum(),
            total_requests: self.backends.iter().map(|b| b.total_requests).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Algorithm;

    fn pool(algorithm: Algorithm) -> (PoolHandle, tokio::task::JoinHandle<()>) {
        spawn(PoolRecord::new("p", algorithm).unwrap(), Vec::new())
    }

    async fn add(handle: &PoolHandle, url: &str) -> BackendRecord {
        handle
            .add_backend(BackendRecord::new(url).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_robin_selection_order() {
        let (handle, _task) = pool(Algorithm::RoundRobin);
        add(&handle, "http://a:1").await;
        add(&handle, "http://a:2").await;
        add(&handle, "http://a:3").await;

        let mut picked = Vec::new();
        for _ in 0..10 {
            let lease = handle.select_backend().await.unwrap();
            picked.push(lease.backend().id.clone());
        }
        assert_eq!(
            picked,
            vec![
                "http://a:1",
                "http://a:2",
                "http://a:3",
                "http://a:1",
                "http://a:2",
                "http://a:3",
                "http://a:1",
                "http://a:2",
                "http://a:3",
                "http://a:1",
            ]
        );
    }

    #[tokio::test]
    async fn test_unhealthy_backend_not_selected() {
        let (handle, _task) = pool(Algorithm::RoundRobin);
        add(&handle, "http://a:1").await;
        add(&handle, "http://a:2").await;
        add(&handle, "http://a:3").await;
        for _ in 0..10 {
            let _ = handle.select_backend().await.unwrap();
        }

        handle.set_health("http://a:2", false);
        let mut picked = Vec::new();
        for _ in 0..3 {
            let lease = handle.select_backend().await.unwrap();
            picked.push(lease.backend().id.clone());
        }
        assert_eq!(picked, vec!["http://a:1", "http://a:3", "http://a:1"]);

        // recovery is immediate
        handle.set_health("http://a:2", true);
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.healthy_backends, 3);
    }

    #[tokio::test]
    async fn test_empty_pool_returns_no_backends() {
        let (handle, _task) = pool(Algorithm::LeastConnections);
        assert!(matches!(
            handle.select_backend().await,
            Err(EdgeError::NoBackends)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected_without_mutation() {
        let (handle, _task) = pool(Algorithm::RoundRobin);
        add(&handle, "http://a:1").await;
        let dup = handle
            .add_backend(BackendRecord::new("http://a:1/other-path").unwrap())
            .await;
        assert!(matches!(dup, Err(EdgeError::AlreadyExists(_))));
        assert_eq!(handle.stats().await.unwrap().total_backends, 1);
    }

    #[tokio::test]
    async fn test_removed_backend_never_selected_again() {
        let (handle, _task) = pool(Algorithm::RoundRobin);
        add(&handle, "http://a:1").await;
        add(&handle, "http://a:2").await;

        handle.remove_backend("http://a:1").await.unwrap();
        for _ in 0..6 {
            let lease = handle.select_backend().await.unwrap();
            assert_eq!(lease.backend().id, "http://a:2");
        }
        assert!(matches!(
            handle.remove_backend("http://a:1").await,
            Err(EdgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_gauge_equals_selects_minus_releases() {
        let (handle, _task) = pool(Algorithm::LeastConnections);
        add(&handle, "http://a:1").await;
        add(&handle, "http://a:2").await;

        let l1 = handle.select_backend().await.unwrap();
        let l2 = handle.select_backend().await.unwrap();
        let l3 = handle.select_backend().await.unwrap();
        assert_eq!(handle.stats().await.unwrap().current_connections, 3);
        assert_eq!(handle.stats().await.unwrap().total_requests, 3);

        drop(l2);
        // mailbox ordering: the release lands before the stats read
        assert_eq!(handle.stats().await.unwrap().current_connections, 2);

        drop(l1);
        drop(l3);
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.current_connections, 0);
        assert_eq!(stats.total_requests, 3);
    }

    #[tokio::test]
    async fn test_least_connections_tracks_leases() {
        let (handle, _task) = pool(Algorithm::LeastConnections);
        add(&handle, "http://a:1").await;
        add(&handle, "http://a:2").await;

        let l1 = handle.select_backend().await.unwrap();
        assert_eq!(l1.backend().id, "http://a:1");
        let l2 = handle.select_backend().await.unwrap();
        assert_eq!(l2.backend().id, "http://a:2");
        drop(l1);
        let l3 = handle.select_backend().await.unwrap();
        assert_eq!(l3.backend().id, "http://a:1");
    }

    #[tokio::test]
    async fn test_release_after_removal_is_noop() {
        let (handle, _task) = pool(Algorithm::RoundRobin);
        add(&handle, "http://a:1").await;
        let lease = handle.select_backend().await.unwrap();
        handle.remove_backend("http://a:1").await.unwrap();
        drop(lease); // no panic, no underflow
        assert_eq!(handle.stats().await.unwrap().total_backends, 0);
    }

    #[tokio::test]
    async fn test_sync_backend_preserves_volatile_fields() {
        let (handle, _task) = pool(Algorithm::RoundRobin);
        add(&handle, "http://a:1").await;
        let _lease = handle.select_backend().await.unwrap();
        handle.set_health("http://a:1", false);

        // config update arrives from a peer with fresh defaults
        let mut incoming = BackendRecord::new("http://a:1").unwrap().in_pool("p");
        incoming.weight = 7;
        handle.sync_backend(incoming);

        let backends = handle.list_backends().await.unwrap();
        assert_eq!(backends[0].weight, 7);
        assert!(!backends[0].healthy);
        assert_eq!(backends[0].current_connections, 1);
        assert_eq!(backends[0].total_requests, 1);
    }

    #[tokio::test]
    async fn test_shutdown_makes_handle_report_not_found() {
        let (handle, task) = pool(Algorithm::RoundRobin);
        handle.shutdown();
        task.await.unwrap();
        assert!(matches!(
            handle.select_backend().await,
            Err(EdgeError::NotFound(_))
        ));
    }
}
