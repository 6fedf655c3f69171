use crate::store::{ReplicationOp, Store};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Per-peer backlog bound. A peer that stays unreachable long enough to
/// accumulate this many ops is resynced by snapshot pull when it returns;
/// further ops are dropped rather than growing without bound.
const PEER_QUEUE_CAP: usize = 4_096;

const SHIP_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF_START: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Fan local store writes out to every known peer.
///
/// Each peer gets an ordered queue drained by its own task; a failed ship
/// retries with capped backoff, so writes to a briefly-absent peer are
/// queued for later replay rather than surfaced to anyone. Nothing on this
/// path ever reaches a request handler.
pub fn spawn_replicator(
    cookie: String,
    mut feed: mpsc::UnboundedReceiver<ReplicationOp>,
    mut peers_rx: watch::Receiver<BTreeSet<SocketAddr>>,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = build_peer_client();
        let mut queues: HashMap<SocketAddr, mpsc::Sender<ReplicationOp>> = HashMap::new();

        loop {
            tokio::select! {
                op = feed.recv() => {
                    let Some(op) = op else { return };
                    let peers = peers_rx.borrow().clone();
                    for peer in peers {
                        let queue = queues.entry(peer).or_insert_with(|| {
                            spawn_peer_queue(peer, cookie.clone(), client.clone())
                        });
                        match queue.try_send(op.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // the bounded backlog is the lag signal
                                warn!(
                                    "cluster: replication backlog full, dropping op, peer={}, table={}, key={}",
                                    peer, op.table, op.key
                                );
                                metrics::counter!(
                                    "edge_store_replication_total",
                                    "peer" => peer.to_string(),
                                    "result" => "lagged",
                                )
                                .increment(1);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                queues.remove(&peer);
                            }
                        }
                    }
                }
                changed = peers_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Queues for departed peers are kept: their tasks hold
                    // the backlog and replay it if the peer returns before
                    // the backlog ages out.
                    let current = peers_rx.borrow().clone();
                    debug!("cluster: replicator peer set updated, peers={}", current.len());
                }
                _ = shutdown.notified() => return,
            }
        }
    })
}

fn spawn_peer_queue(
    peer: SocketAddr,
    cookie: String,
    client: reqwest::Client,
) -> mpsc::Sender<ReplicationOp> {
    let (tx, mut rx) = mpsc::channel::<ReplicationOp>(PEER_QUEUE_CAP);
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let mut backoff = RETRY_BACKOFF_START;
            loop {
                match ship_op(&client, peer, &cookie, &op).await {
                    Ok(()) => {
                        metrics::counter!(
                            "edge_store_replication_total",
                            "peer" => peer.to_string(),
                            "result" => "success",
                        )
                        .increment(1);
                        break;
                    }
                    Err(e) => {
                        metrics::counter!(
                            "edge_store_replication_total",
                            "peer" => peer.to_string(),
                            "result" => "failure",
                        )
                        .increment(1);
                        debug!(
                            "cluster: ship failed, retrying, peer={}, table={}, key={}, error={}",
                            peer, op.table, op.key, e
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                    }
                }
            }
        }
    });
    tx
}

async fn ship_op(
    client: &reqwest::Client,
    peer: SocketAddr,
    cookie: &str,
    op: &ReplicationOp,
) -> Result<(), String> {
    let url = format!("http://{}/cluster/replicate", peer);
    let resp = client
        .post(&url)
        .bearer_auth(cookie)
        .json(op)
        .timeout(SHIP_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("peer answered {}", resp.status()));
    }
    Ok(())
}

/// Join-time sync: adopt the existing cluster state from the first peer
/// that answers. Returns whether a snapshot was merged — a lone first node
/// finds nobody and starts from its own disk, which is also fine.
pub async fn pull_snapshot(
    peers: &BTreeSet<SocketAddr>,
    cookie: &str,
    store: &Store,
) -> bool {
    let client = build_peer_client();
    for peer in peers {
        let url = format!("http://{}/cluster/snapshot", peer);
        let ops: Vec<ReplicationOp> = match client
            .get(&url)
            .bearer_auth(cookie)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => match resp.json().await {
                Ok(ops) => ops,
                Err(e) => {
                    warn!("cluster: snapshot decode failed, peer={}, error={}", peer, e);
                    continue;
                }
            },
            Err(e) => {
                debug!("cluster: snapshot pull failed, peer={}, error={}", peer, e);
                continue;
            }
        };

        let total = ops.len();
        let mut applied = 0usize;
        for op in ops {
            match store.apply_replicated(op).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => warn!("cluster: snapshot apply failed, peer={}, error={}", peer, e),
            }
        }
        info!(
            "cluster: snapshot merged, peer={}, ops={}, applied={}",
            peer, total, applied
        );
        return true;
    }
    info!("cluster: no peer answered snapshot pull, starting from local state");
    false
}

fn build_peer_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .no_proxy()
        .build()
        .expect("failed to build cluster HTTP client")
}
