use crate::events::EventBus;
use crate::model::{BackendRecord, PoolRecord, SslMode};
use crate::pool::{self, health, PoolHandle};
use crate::proxy::tcp;
use crate::store::Store;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

struct PassthroughListener {
    port: u16,
    shutdown: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

struct PoolEntry {
    handle: PoolHandle,
    actor: tokio::task::JoinHandle<()>,
    health_shutdown: Arc<Notify>,
    health: tokio::task::JoinHandle<()>,
    passthrough: Option<PassthroughListener>,
}

/// Registry of live pool actors: `pool name → handle`, with dynamic
/// registration on create and full teardown on delete.
///
/// Deleting a pool joins its actor, cancels its health checker, and closes
/// any passthrough listener bound to it — nothing keeps serving a name that
/// no longer exists.
#[derive(Clone)]
pub struct PoolRegistry {
    pools: Arc<DashMap<String, PoolEntry>>,
    store: Arc<Store>,
    events: EventBus,
    tcp_connect_timeout: Duration,
}

impl PoolRegistry {
    pub fn new(store: Arc<Store>, events: EventBus, tcp_connect_timeout: Duration) -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            store,
            events,
            tcp_connect_timeout,
        }
    }

    pub fn get(&self, name: &str) -> Option<PoolHandle> {
        self.pools.get(name).map(|entry| entry.handle.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Register a pool from its record. New names spawn an actor (seeded
    /// with `backends`), a health checker, and — for passthrough pools with
    /// an assigned port — a TCP listener. Existing names get a config sync,
    /// and the listener follows ssl_mode/port changes.
    pub fn upsert(&self, record: PoolRecord, backends: Vec<BackendRecord>) {
        if let Some(mut entry) = self.pools.get_mut(&record.name) {
            entry.handle.sync_record(record.clone());

            let desired = desired_listen_port(&record);
            let current = entry.passthrough.as_ref().map(|l| l.port);
            if desired != current {
                if let Some(listener) = entry.passthrough.take() {
                    info!(
                        "registry: closing passthrough listener, pool={}, port={}",
                        record.name, listener.port
                    );
                    listener.shutdown.notify_waiters();
                    listener.task.abort();
                }
                if let Some(port) = desired {
                    entry.passthrough =
                        Some(self.spawn_passthrough(entry.handle.clone(), port));
                }
            }
            return;
        }

        let name = record.name.clone();
        let passthrough_port = desired_listen_port(&record);
        let (handle, actor) = pool::spawn(record, backends);

        let health_shutdown = Arc::new(Notify::new());
        let health = health::spawn_health_checker(
            handle.clone(),
            self.store.clone(),
            self.events.clone(),
            health_shutdown.clone(),
        );

        let passthrough =
            passthrough_port.map(|port| self.spawn_passthrough(handle.clone(), port));

        self.pools.insert(
            name,
            PoolEntry {
                handle,
                actor,
                health_shutdown,
                health,
                passthrough,
            },
        );
    }

    /// Deregister and fully tear down a pool. Idempotent.
    pub async fn remove(&self, name: &str) {
        let Some((_, entry)) = self.pools.remove(name) else {
            return;
        };
        entry.health_shutdown.notify_waiters();
        entry.health.abort();
        if let Some(listener) = entry.passthrough {
            listener.shutdown.notify_waiters();
            listener.task.abort();
        }
        entry.handle.shutdown();
        if entry.actor.await.is_err() {
            warn!("registry: pool actor join failed, pool={}", name);
        }
        info!("registry: pool removed, pool={}", name);
    }

    /// Tear down every pool (process shutdown).
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove(&name).await;
        }
    }

    fn spawn_passthrough(&self, handle: PoolHandle, port: u16) -> PassthroughListener {
        let shutdown = Arc::new(Notify::new());
        let task = tcp::spawn_passthrough_listener(
            handle,
            port,
            self.tcp_connect_timeout,
            shutdown.clone(),
        );
        PassthroughListener {
            port,
            shutdown,
            task,
        }
    }
}

fn desired_listen_port(record: &PoolRecord) -> Option<u16> {
    if record.ssl_mode != SslMode::Passthrough {
        return None;
    }
    let port = record.listen_port();
    if port.is_none() {
        warn!(
            "registry: passthrough pool without listen_port metadata is unreachable, pool={}",
            record.name
        );
    }
    port
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Algorithm;

    fn registry() -> (PoolRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _feed) = Store::open(dir.path(), "n1").unwrap();
        (
            PoolRegistry::new(store, EventBus::new(), Duration::from_secs(5)),
            dir,
        )
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (registry, _dir) = registry();
        let record = PoolRecord::new("api", Algorithm::RoundRobin).unwrap();
        registry.upsert(record, Vec::new());

        let handle = registry.get("api").unwrap();
        assert_eq!(handle.name(), "api");
        assert!(registry.get("other").is_none());
    }

    #[tokio::test]
    async fn test_upsert_existing_syncs_config() {
        let (registry, _dir) = registry();
        let record = PoolRecord::new("api", Algorithm::RoundRobin).unwrap();
        registry.upsert(record.clone(), Vec::new());
        assert_eq!(registry.len(), 1);

        let mut updated = record;
        updated.algorithm = Algorithm::Random;
        registry.upsert(updated, Vec::new());
        assert_eq!(registry.len(), 1);

        let handle = registry.get("api").unwrap();
        assert_eq!(
            handle.record().await.unwrap().algorithm,
            Algorithm::Random
        );
    }

    #[tokio::test]
    async fn test_remove_joins_actor() {
        let (registry, _dir) = registry();
        let record = PoolRecord::new("api", Algorithm::RoundRobin).unwrap();
        registry.upsert(record, Vec::new());

        let handle = registry.get("api").unwrap();
        registry.remove("api").await;
        assert!(registry.get("api").is_none());
        assert!(handle.stats().await.is_err());

        // idempotent
        registry.remove("api").await;
    }

    #[tokio::test]
    async fn test_passthrough_listener_lifecycle() {
        let (registry, _dir) = registry();
        let port = {
            // grab a free port, then release it for the listener
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut record = PoolRecord::new("pg", Algorithm::RoundRobin).unwrap();
        record.ssl_mode = SslMode::Passthrough;
        record
            .metadata
            .insert("listen_port".into(), port.to_string());
        registry.upsert(record.clone(), Vec::new());

        // listener comes up
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("listener bound");

        // deleting the pool closes it
        registry.remove("pg").await;
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("listener closed after pool delete");
    }
}
