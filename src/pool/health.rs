use crate::events::{EdgeEvent, EventBus};
use crate::model::pool::MIN_HEALTH_CHECK_INTERVAL_MS;
use crate::pool::PoolHandle;
use crate::store::{Store, Table};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Deadline for a single liveness probe. A backend that cannot accept a TCP
/// connection within this window is unhealthy.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Concurrent probes per round.
const PROBE_CONCURRENCY: usize = 16;

/// One scheduler per pool. Every `health_check_interval` it probes each
/// backend in parallel and pushes transitions into the pool actor, where
/// they take effect on the next selection.
///
/// The round is awaited in full before the next interval is slept, so a
/// backend never has two probes in flight at once. Flipped flags are
/// checkpointed to the store (node-local, debounced to once per round);
/// steady-state rounds never touch the store.
pub fn spawn_health_checker(
    handle: PoolHandle,
    store: Arc<Store>,
    events: EventBus,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Re-read the record each round so interval changes apply
            // without restarting the checker.
            let record = match handle.record().await {
                Ok(r) => r,
                Err(_) => return, // pool deleted
            };
            let interval = Duration::from_millis(
                record
                    .health_check_interval_ms
                    .max(MIN_HEALTH_CHECK_INTERVAL_MS),
            );

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.notified() => return,
            }

            let backends = match handle.list_backends().await {
                Ok(b) => b,
                Err(_) => return,
            };
            if backends.is_empty() {
                continue;
            }

            let results: Vec<(String, bool, bool)> = stream::iter(backends.clone())
                .map(|backend| {
                    let addr = backend.addr();
                    let id = backend.id.clone();
                    let was = backend.healthy;
                    async move {
                        let ok = probe(&addr).await;
                        (id, was, ok)
                    }
                })
                .buffer_unordered(PROBE_CONCURRENCY)
                .collect()
                .await;

            let mut flipped = Vec::new();
            for (id, was, ok) in results {
                handle.set_health(&id, ok);
                metrics::gauge!(
                    "edge_backend_health_status",
                    "pool" => handle.name().to_string(),
                    "backend" => id.clone(),
                )
                .set(if ok { 1.0 } else { 0.0 });
                metrics::counter!(
                    "edge_health_check_total",
                    "pool" => handle.name().to_string(),
                    "result" => if ok { "success" } else { "failure" },
                )
                .increment(1);

                if ok != was {
                    if ok {
                        debug!(
                            "health: backend recovered, pool={}, backend={}",
                            handle.name(),
                            id
                        );
                    } else {
                        warn!(
                            "health: backend marked unhealthy, pool={}, backend={}",
                            handle.name(),
                            id
                        );
                    }
                    events.publish(EdgeEvent::BackendHealthChanged {
                        pool: handle.name().to_string(),
                        backend_id: id.clone(),
                        healthy: ok,
                    });
                    flipped.push((id, ok));
                }
            }

            if !flipped.is_empty() {
                checkpoint(&handle, &store, &flipped).await;
            }
        }
    })
}

/// Liveness probe: can we open a TCP connection within the deadline? No
/// application bytes are sent — this is not a correctness check.
async fn probe(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Persist flipped health flags so a restarted node starts from the last
/// observation instead of optimistic defaults. Node-local — peer nodes run
/// their own probes.
async fn checkpoint(handle: &PoolHandle, store: &Store, flipped: &[(String, bool)]) {
    let backends = match handle.list_backends().await {
        Ok(b) => b,
        Err(_) => return,
    };
    for (id, _) in flipped {
        let Some(backend) = backends.iter().find(|b| &b.id == id) else {
            continue;
        };
        let value = match serde_json::to_value(backend) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if let Err(e) = store
            .put_local(Table::Backends, &backend.storage_key(), value)
            .await
        {
            warn!(
                "health: checkpoint failed, pool={}, backend={}, error={}",
                handle.name(),
                id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Algorithm, BackendRecord, PoolRecord};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_against_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(probe(&addr.to_string()).await);
    }

    #[tokio::test]
    async fn test_probe_against_closed_port() {
        // bind-then-drop guarantees nothing listens on the port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!probe(&addr.to_string()).await);
    }

    #[tokio::test]
    async fn test_checker_flips_unreachable_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _feed) = Store::open(dir.path(), "n1").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let mut record = PoolRecord::new("p", Algorithm::RoundRobin).unwrap();
        record.health_check_interval_ms = 1_000;
        let backend = BackendRecord::new(&format!("http://{}", dead_addr))
            .unwrap()
            .in_pool("p");
        let (handle, _task) = crate::pool::spawn(record, vec![backend]);

        let events = EventBus::new();
        let mut event_rx = events.subscribe();
        let shutdown = Arc::new(Notify::new());
        let checker = spawn_health_checker(handle.clone(), store, events, shutdown.clone());

        // first round fires after one interval and flips the backend
        match tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("health transition within one interval")
            .unwrap()
        {
            EdgeEvent::BackendHealthChanged { pool, healthy, .. } => {
                assert_eq!(pool, "p");
                assert!(!healthy);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.unhealthy_backends, 1);

        shutdown.notify_waiters();
        let _ = checker.await;
    }
}
