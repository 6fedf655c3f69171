mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::EdgeState;

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Run the plain-HTTP proxy listener with graceful shutdown: on signal the
/// accept loop stops and in-flight connections get `DRAIN_TIMEOUT` to
/// finish before the process moves on.
pub async fn run_http_server(
    listen: &str,
    state: EdgeState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: http listening, addr={}", addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: http: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "edge_connections_total",
                    "listener" => "http",
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: http: accept failed, error={}", e);
                metrics::counter!(
                    "edge_connections_total",
                    "listener" => "http",
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        serve_connection(stream, peer_addr, state.clone(), active_conns.clone(), false);
    }

    drain(&active_conns, "http").await;
    Ok(())
}

/// Run the TLS-terminating listener. Certificates are chosen per handshake
/// by SNI against the replicated certificates table.
pub async fn run_https_server(
    listen: &str,
    state: EdgeState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(crate::tls::server_config(state.sni.clone()));
    info!("server: https listening, addr={}", addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: https: stop accepting new connections, draining...");
                break;
            }
        };

        let (tcp, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "edge_connections_total",
                    "listener" => "https",
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: https: accept failed, error={}", e);
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let state = state.clone();
        let active_conns = active_conns.clone();
        tokio::spawn(async move {
            // handshake failures (no SNI match, bad client) are routine
            let stream = match acceptor.accept(tcp).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(
                        "server: https: handshake failed, peer={}, error={}",
                        peer_addr, e
                    );
                    return;
                }
            };
            serve_tls_connection(stream, peer_addr, state, active_conns).await;
        });
    }

    drain(&active_conns, "https").await;
    Ok(())
}

fn serve_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    state: EdgeState,
    active_conns: Arc<AtomicI64>,
    via_tls: bool,
) {
    metrics::gauge!("edge_connections_active").increment(1.0);
    active_conns.fetch_add(1, Ordering::Relaxed);

    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let state_inner = state.clone();
        let svc = service_fn(move |req: Request<Incoming>| {
            let state = state_inner.clone();
            async move { proxy::http::handle_request(req, state, peer_addr, via_tls).await }
        });

        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .http1()
            .keep_alive(true)
            .http2()
            .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
            .serve_connection_with_upgrades(io, svc)
            .await
        {
            if !e.to_string().contains("connection closed") {
                debug!(
                    "server: connection error, peer={}, error={}",
                    peer_addr, e
                );
            }
        }

        metrics::gauge!("edge_connections_active").decrement(1.0);
        active_conns.fetch_sub(1, Ordering::Relaxed);
    });
}

async fn serve_tls_connection(
    stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
    peer_addr: SocketAddr,
    state: EdgeState,
    active_conns: Arc<AtomicI64>,
) {
    metrics::gauge!("edge_connections_active").increment(1.0);
    active_conns.fetch_add(1, Ordering::Relaxed);

    let io = TokioIo::new(stream);
    let state_inner = state.clone();
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state_inner.clone();
        async move { proxy::http::handle_request(req, state, peer_addr, true).await }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
        .serve_connection_with_upgrades(io, svc)
        .await
    {
        if !e.to_string().contains("connection closed") {
            debug!(
                "server: https connection error, peer={}, error={}",
                peer_addr, e
            );
        }
    }

    metrics::gauge!("edge_connections_active").decrement(1.0);
    active_conns.fetch_sub(1, Ordering::Relaxed);
}

async fn drain(active_conns: &AtomicI64, listener: &str) {
    let active = active_conns.load(Ordering::Relaxed);
    if active == 0 {
        return;
    }
    info!(
        "server: {}: waiting for {} active connections to drain",
        listener, active
    );
    let wait = async {
        loop {
            if active_conns.load(Ordering::Relaxed) == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, wait).await {
        Ok(_) => info!("server: {}: all connections drained", listener),
        Err(_) => info!(
            "server: {}: drain timeout ({}s), {} connections still active",
            listener,
            DRAIN_TIMEOUT.as_secs(),
            active_conns.load(Ordering::Relaxed)
        ),
    }
}

/// Run the admin listener: REST API, metrics, and the internal cluster
/// replication endpoints.
pub async fn run_admin_server(listen: &str, state: EdgeState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
