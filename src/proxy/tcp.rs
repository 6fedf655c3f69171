use crate::pool::PoolHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Layer-4 passthrough for `ssl_mode=passthrough` pools.
///
/// The listening port is the routing information: each passthrough pool gets
/// its own listener (admin-assigned via pool metadata), so no application
/// bytes — TLS records included — are ever inspected. Accepted connections
/// are spliced byte-for-byte to a selected backend.
pub fn spawn_passthrough_listener(
    handle: PoolHandle,
    port: u16,
    connect_timeout: Duration,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(l) => l,
            Err(e) => {
                error!(
                    "tcp: bind failed, pool={}, port={}, error={}",
                    handle.name(),
                    port,
                    e
                );
                return;
            }
        };
        info!(
            "tcp: passthrough listening, pool={}, port={}",
            handle.name(),
            port
        );

        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown.notified() => {
                    info!("tcp: passthrough closing, pool={}, port={}", handle.name(), port);
                    return;
                }
            };

            let (client, peer_addr) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    error!("tcp: accept failed, pool={}, error={}", handle.name(), e);
                    continue;
                }
            };
            metrics::counter!(
                "edge_connections_total",
                "listener" => "passthrough",
                "status" => "accepted",
            )
            .increment(1);

            let handle = handle.clone();
            tokio::spawn(async move {
                splice_connection(handle, client, peer_addr, connect_timeout).await;
            });
        }
    })
}

/// Select a backend under a lease and splice bytes in both directions until
/// either half closes or errors. The lease drop releases the pool's
/// connection slot on every exit path.
async fn splice_connection(
    handle: PoolHandle,
    mut client: TcpStream,
    peer_addr: std::net::SocketAddr,
    connect_timeout: Duration,
) {
    let lease = match handle.select_backend().await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(
                "tcp: no backend for connection, pool={}, peer={}, error={}",
                handle.name(),
                peer_addr,
                e
            );
            return; // dropping the client socket is the only signal we have
        }
    };
    let backend_addr = lease.backend().addr();

    let mut upstream =
        match tokio::time::timeout(connect_timeout, TcpStream::connect(&backend_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(
                    "tcp: backend connect failed, pool={}, backend={}, error={}",
                    handle.name(),
                    backend_addr,
                    e
                );
                return;
            }
            Err(_) => {
                warn!(
                    "tcp: backend connect timeout, pool={}, backend={}",
                    handle.name(),
                    backend_addr
                );
                return;
            }
        };

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_backend, to_client)) => {
            metrics::counter!(
                "edge_tcp_bytes_transferred_total",
                "pool" => handle.name().to_string(),
                "direction" => "upstream",
            )
            .increment(to_backend);
            metrics::counter!(
                "edge_tcp_bytes_transferred_total",
                "pool" => handle.name().to_string(),
                "direction" => "downstream",
            )
            .increment(to_client);
            debug!(
                "tcp: connection closed, pool={}, backend={}, up_bytes={}, down_bytes={}",
                handle.name(),
                backend_addr,
                to_backend,
                to_client
            );
        }
        Err(e) => {
            // either side erroring tears down both halves
            debug!(
                "tcp: splice ended with error, pool={}, backend={}, error={}",
                handle.name(),
                backend_addr,
                e
            );
        }
    }
    drop(lease);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Algorithm, BackendRecord, PoolRecord};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// End-to-end splice: client bytes reach an echo backend and come back
    /// unmodified, and the lease is released when the connection closes.
    #[tokio::test]
    async fn test_passthrough_echoes_bytes_and_releases_lease() {
        // echo backend
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = backend_listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        let record = PoolRecord::new("pg", Algorithm::RoundRobin).unwrap();
        let backend = BackendRecord::new(&format!("http://{}", backend_addr))
            .unwrap()
            .in_pool("pg");
        let (handle, _task) = crate::pool::spawn(record, vec![backend]);

        // passthrough listener on an ephemeral port
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let splice_handle = handle.clone();
        tokio::spawn(async move {
            let (client, peer) = front.accept().await.unwrap();
            splice_connection(splice_handle, client, peer, Duration::from_secs(5)).await;
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"\x16\x03\x01hello").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x16\x03\x01hello");

        drop(client);
        // the splice task releases the lease once both halves close
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if handle.stats().await.unwrap().current_connections == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("lease released after close");
    }

    #[tokio::test]
    async fn test_connect_failure_still_releases_lease() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let record = PoolRecord::new("pg", Algorithm::RoundRobin).unwrap();
        let backend = BackendRecord::new(&format!("http://{}", dead_addr))
            .unwrap()
            .in_pool("pg");
        let (handle, _task) = crate::pool::spawn(record, vec![backend]);

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let splice_handle = handle.clone();
        let done = tokio::spawn(async move {
            let (client, peer) = front.accept().await.unwrap();
            splice_connection(splice_handle, client, peer, Duration::from_millis(500)).await;
        });

        let _client = TcpStream::connect(front_addr).await.unwrap();
        done.await.unwrap();
        assert_eq!(handle.stats().await.unwrap().current_connections, 0);
        assert_eq!(handle.stats().await.unwrap().total_requests, 1);
    }
}
