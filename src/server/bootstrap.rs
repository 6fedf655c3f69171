use crate::acme::ChallengeStore;
use crate::cluster;
use crate::config::EdgeConfig;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::model::{backend, BackendRecord, CertificateRecord, PoolRecord};
use crate::pool::registry::PoolRegistry;
use crate::proxy::http::UpstreamClients;
use crate::proxy::resolver::RouteResolver;
use crate::server::{self, EdgeState};
use crate::store::{ChangeEvent, Store, Table};
use anyhow::Result;
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. Listener addresses given on the
/// command line override the config file.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Node lifecycle: init → recover store → join cluster → hydrate pools →
/// watch → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = EdgeConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        config.admin_listen = admin_listen;
    }
    let config = Arc::new(config);

    let metrics = Metrics::install();

    let node: Arc<str> = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "edge-node".to_string())
        .into();

    // Store recovery is the one fatal path: serving from a half-read table
    // would replicate corruption to the whole cluster.
    let (store, replication_feed) = match Store::open(&config.store_dir, &node) {
        Ok(v) => v,
        Err(e) => {
            error!("store: unrecoverable state on startup, error={}", e);
            anyhow::bail!("store recovery failed: {}", e);
        }
    };

    let events = EventBus::new();
    let challenges = ChallengeStore::new();
    let resolver = RouteResolver::new(&config.base_domain, &config.default_pool);
    let clients = UpstreamClients::build(
        config.proxy.connect_timeout(),
        config.proxy.idle_timeout(),
        config.proxy.pool_max_idle_per_host,
    );
    let sni = Arc::new(crate::tls::SniResolver::new());
    let pools = PoolRegistry::new(store.clone(), events.clone(), config.proxy.connect_timeout());

    let state = EdgeState {
        config: config.clone(),
        store: store.clone(),
        pools: pools.clone(),
        resolver,
        clients,
        sni: sni.clone(),
        challenges,
        events,
        metrics,
        node: node.clone(),
        started_at: Instant::now(),
    };

    let shutdown = Arc::new(Notify::new());

    // Cluster membership first: a joining node adopts existing state before
    // hydrating pools, so it comes up with the cluster's view, not just its
    // own disk.
    if config.cluster.enabled() {
        join_cluster(&state, replication_feed, &shutdown).await;
    } else {
        info!("cluster: disabled, running standalone");
        drop(replication_feed);
    }

    hydrate_pools(&state);
    rebuild_sni(&state);

    start_store_watchers(&state, &shutdown);
    start_admin_server(&state);

    let mut listener_handles = Vec::new();
    if config.serve {
        info!("server: starting listeners, listen={}", config.listen);
        listener_handles.push(tokio::spawn({
            let listen = config.listen.clone();
            let state = state.clone();
            let shutdown = shutdown.clone();
            async move { server::run_http_server(&listen, state, shutdown).await }
        }));
        if let Some(https_listen) = config.https_listen.clone() {
            listener_handles.push(tokio::spawn({
                let state = state.clone();
                let shutdown = shutdown.clone();
                async move { server::run_https_server(&https_listen, state, shutdown).await }
            }));
        }
    } else {
        info!("server: public listeners disabled (serve=false)");
    }

    wait_for_shutdown(&shutdown).await;

    // Graceful teardown: stop selecting, join actors, then flush the store.
    state.pools.shutdown_all().await;
    if let Err(e) = store.flush_all() {
        warn!("store: flush on shutdown failed, error={}", e);
    }
    for handle in listener_handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("server: listener error: {}", e),
            Err(e) => error!("server: listener task error: {}", e),
        }
    }

    info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

// ---------------------------------------------------------------------------
// Cluster join — snapshot pull, then continuous discovery + replication.
// ---------------------------------------------------------------------------

async fn join_cluster(
    state: &EdgeState,
    replication_feed: tokio::sync::mpsc::UnboundedReceiver<crate::store::ReplicationOp>,
    shutdown: &Arc<Notify>,
) {
    let cluster_cfg = state.config.cluster.clone();
    let cookie = cluster_cfg
        .release_cookie
        .clone()
        .unwrap_or_default(); // validate() already rejected the empty case

    let initial_peers: BTreeSet<std::net::SocketAddr> = match cluster_cfg.query() {
        Some(query) => match cluster::discovery::resolve_peers(&query, cluster_cfg.peer_port).await
        {
            Ok(peers) => {
                info!(
                    "cluster: initial discovery, query={}, peers={}",
                    query,
                    peers.len()
                );
                peers
            }
            Err(e) => {
                warn!("cluster: initial discovery failed, error={}", e);
                BTreeSet::new()
            }
        },
        None => BTreeSet::new(),
    };

    if !initial_peers.is_empty() {
        cluster::pull_snapshot(&initial_peers, &cookie, &state.store).await;
    }

    let (peers_tx, peers_rx) = watch::channel(initial_peers);
    cluster::spawn_discovery_loop(cluster_cfg, peers_tx, shutdown.clone());
    cluster::spawn_replicator(cookie, replication_feed, peers_rx, shutdown.clone());
}

// ---------------------------------------------------------------------------
// Pool hydration and store watchers — the store is the source of truth; the
// registry mirrors it, whether a change came from this node's admin API or
// from a peer.
// ---------------------------------------------------------------------------

fn seed_backends(store: &Store, pool_name: &str) -> Vec<BackendRecord> {
    match store.index_lookup(Table::Backends, "pool_name", &serde_json::json!(pool_name)) {
        Ok(values) => values
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<BackendRecord>(v) {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!(
                        "bootstrap: skipping undecodable backend, pool={}, error={}",
                        pool_name, e
                    );
                    None
                }
            })
            .collect(),
        Err(e) => {
            warn!(
                "bootstrap: backend lookup failed, pool={}, error={}",
                pool_name, e
            );
            Vec::new()
        }
    }
}

fn hydrate_pools(state: &EdgeState) {
    let records = match state.store.list(Table::Pools) {
        Ok(values) => values,
        Err(e) => {
            warn!("bootstrap: pool listing failed, error={}", e);
            return;
        }
    };
    for value in records {
        match serde_json::from_value::<PoolRecord>(value) {
            Ok(record) => {
                let backends = seed_backends(&state.store, &record.name);
                state.pools.upsert(record, backends);
            }
            Err(e) => warn!("bootstrap: skipping undecodable pool, error={}", e),
        }
    }
    info!("bootstrap: pools hydrated, count={}", state.pools.len());
}

fn rebuild_sni(state: &EdgeState) {
    let certs: Vec<CertificateRecord> = match state.store.list(Table::Certificates) {
        Ok(values) => values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        Err(e) => {
            warn!("bootstrap: certificate listing failed, error={}", e);
            return;
        }
    };
    state.sni.rebuild(&certs);
}

fn start_store_watchers(state: &EdgeState, shutdown: &Arc<Notify>) {
    // pools table → registry membership
    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        let mut changes = state.store.subscribe(Table::Pools);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = changes.next() => {
                        match event {
                            Some(ChangeEvent::Put { record, .. }) => {
                                match serde_json::from_value::<PoolRecord>(record) {
                                    Ok(pool) => {
                                        let backends = seed_backends(&state.store, &pool.name);
                                        state.pools.upsert(pool, backends);
                                    }
                                    Err(e) => warn!("watch: undecodable pool record, error={}", e),
                                }
                            }
                            Some(ChangeEvent::Delete { key }) => {
                                state.pools.remove(&key).await;
                            }
                            None => return,
                        }
                    }
                    _ = shutdown.notified() => return,
                }
            }
        });
    }

    // backends table → live pool membership
    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        let mut changes = state.store.subscribe(Table::Backends);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = changes.next() => {
                        match event {
                            Some(ChangeEvent::Put { record, .. }) => {
                                match serde_json::from_value::<BackendRecord>(record) {
                                    Ok(b) => {
                                        if let Some(handle) = state.pools.get(&b.pool_name) {
                                            handle.sync_backend(b);
                                        }
                                    }
                                    Err(e) => warn!("watch: undecodable backend record, error={}", e),
                                }
                            }
                            Some(ChangeEvent::Delete { key }) => {
                                if let Some((pool_name, id)) = backend::split_storage_key(&key) {
                                    if let Some(handle) = state.pools.get(pool_name) {
                                        handle.remove_backend_quiet(id);
                                    }
                                }
                            }
                            None => return,
                        }
                    }
                    _ = shutdown.notified() => return,
                }
            }
        });
    }

    // certificates table → SNI map
    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        let mut changes = state.store.subscribe(Table::Certificates);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = changes.next() => {
                        if event.is_none() {
                            return;
                        }
                        rebuild_sni(&state);
                    }
                    _ = shutdown.notified() => return,
                }
            }
        });
    }
}

fn start_admin_server(state: &EdgeState) {
    let s = state.clone();
    let admin_addr = state.config.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
