use crate::config::ClusterConfig;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Resolve the discovery query to the current peer set. Every node in the
/// deployment answers on the shared admin port.
pub async fn resolve_peers(query: &str, port: u16) -> std::io::Result<BTreeSet<SocketAddr>> {
    let addrs = tokio::net::lookup_host((query, port)).await?;
    Ok(addrs.collect())
}

/// Peers present in exactly one of two successive answer sets.
pub fn diff_peer_sets(
    old: &BTreeSet<SocketAddr>,
    new: &BTreeSet<SocketAddr>,
) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
    let joined = new.difference(old).copied().collect();
    let left = old.difference(new).copied().collect();
    (joined, left)
}

/// DNS polling loop producing the lazy sequence of peer sets. Subscribers
/// (the replicator) watch the channel and diff successive values to derive
/// join/leave events.
///
/// A failed resolution keeps the last known set — DNS being briefly
/// unreachable is not the same thing as every peer leaving.
pub fn spawn_discovery_loop(
    cluster: ClusterConfig,
    peers_tx: watch::Sender<BTreeSet<SocketAddr>>,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(query) = cluster.query() else {
            return;
        };
        let mut known = BTreeSet::new();

        loop {
            match resolve_peers(&query, cluster.peer_port).await {
                Ok(current) => {
                    let (joined, left) = diff_peer_sets(&known, &current);
                    for peer in &joined {
                        info!("cluster: peer joined, peer={}", peer);
                    }
                    for peer in &left {
                        info!("cluster: peer left, peer={}", peer);
                    }
                    if !joined.is_empty() || !left.is_empty() {
                        known = current.clone();
                        let _ = peers_tx.send(current);
                    } else {
                        debug!("cluster: peer set unchanged, peers={}", known.len());
                    }
                }
                Err(e) => {
                    warn!(
                        "cluster: discovery query failed, query={}, error={}",
                        query, e
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(cluster.poll_interval()) => {}
                _ = shutdown.notified() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_diff_derives_join_and_leave_events() {
        let old: BTreeSet<_> = [addr("10.0.0.1:9090"), addr("10.0.0.2:9090")].into();
        let new: BTreeSet<_> = [addr("10.0.0.2:9090"), addr("10.0.0.3:9090")].into();

        let (joined, left) = diff_peer_sets(&old, &new);
        assert_eq!(joined, vec![addr("10.0.0.3:9090")]);
        assert_eq!(left, vec![addr("10.0.0.1:9090")]);

        let (joined, left) = diff_peer_sets(&new, &new);
        assert!(joined.is_empty());
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let peers = resolve_peers("localhost", 9090).await.unwrap();
        assert!(!peers.is_empty());
        assert!(peers.iter().all(|p| p.port() == 9090));
    }
}
