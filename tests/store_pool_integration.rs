//! End-to-end exercise of the persistence → hydration → selection path:
//! records written through the store come back after a restart and drive a
//! live pool actor exactly as before.

use singularity_edge::events::EventBus;
use singularity_edge::model::{Algorithm, BackendRecord, PoolRecord};
use singularity_edge::pool::registry::PoolRegistry;
use singularity_edge::proxy::resolver::RouteResolver;
use singularity_edge::store::{Store, Table};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn registry_for(store: Arc<Store>) -> PoolRegistry {
    PoolRegistry::new(store, EventBus::new(), Duration::from_secs(5))
}

fn hydrate(store: &Arc<Store>, registry: &PoolRegistry) {
    for value in store.list(Table::Pools).unwrap() {
        let record: PoolRecord = serde_json::from_value(value).unwrap();
        let backends = store
            .index_lookup(Table::Backends, "pool_name", &serde_json::json!(record.name))
            .unwrap()
            .into_iter()
            .map(|v| serde_json::from_value::<BackendRecord>(v).unwrap())
            .collect();
        registry.upsert(record, backends);
    }
}

async fn create_pool_with_backends(
    store: &Arc<Store>,
    registry: &PoolRegistry,
    name: &str,
    urls: &[&str],
) {
    let record = PoolRecord::new(name, Algorithm::RoundRobin).unwrap();
    registry.upsert(record.clone(), Vec::new());
    store
        .put(
            Table::Pools,
            name,
            serde_json::to_value(&record).unwrap(),
        )
        .await
        .unwrap();

    let handle = registry.get(name).unwrap();
    for url in urls {
        let added = handle
            .add_backend(BackendRecord::new(url).unwrap())
            .await
            .unwrap();
        store
            .put(
                Table::Backends,
                &added.storage_key(),
                serde_json::to_value(&added).unwrap(),
            )
            .await
            .unwrap();
    }
}

async fn open(dir: &Path) -> Arc<Store> {
    let (store, _feed) = Store::open(dir, "it-node").unwrap();
    store
}

#[tokio::test]
async fn test_pool_survives_restart_and_keeps_selecting() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open(dir.path()).await;
        let registry = registry_for(store.clone());
        create_pool_with_backends(
            &store,
            &registry,
            "api",
            &["http://a:1", "http://a:2", "http://a:3"],
        )
        .await;
        registry.shutdown_all().await;
    }

    // restart: a fresh store over the same directory hydrates an equivalent
    // registry, and selection behaves as if nothing happened
    let store = open(dir.path()).await;
    let registry = registry_for(store.clone());
    hydrate(&store, &registry);

    let handle = registry.get("api").unwrap();
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.total_backends, 3);
    assert_eq!(stats.healthy_backends, 3);

    let mut picked = Vec::new();
    for _ in 0..6 {
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
        ]
    );

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_resolver_routes_into_registered_pools() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    let registry = registry_for(store.clone());

    create_pool_with_backends(&store, &registry, "api", &["http://api-1:8080"]).await;
    create_pool_with_backends(&store, &registry, "default", &["http://web-1:8080"]).await;

    let resolver = RouteResolver::new("example.com", "default");

    // subdomain → pool `api`
    let name = resolver.resolve(None, Some("api.example.com"));
    let lease = registry
        .get(&name)
        .unwrap()
        .select_backend()
        .await
        .unwrap();
    assert_eq!(lease.backend().id, "http://api-1:8080");

    // bare base domain → default pool
    let name = resolver.resolve(None, Some("example.com"));
    let lease = registry
        .get(&name)
        .unwrap()
        .select_backend()
        .await
        .unwrap();
    assert_eq!(lease.backend().id, "http://web-1:8080");

    // header override beats the host
    let name = resolver.resolve(Some("api"), Some("example.com"));
    assert_eq!(name, "api");

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_backend_delete_propagates_through_store_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    let registry = registry_for(store.clone());
    create_pool_with_backends(&store, &registry, "api", &["http://a:1", "http://a:2"]).await;

    let handle = registry.get("api").unwrap();
    handle.remove_backend("http://a:1").await.unwrap();
    store
        .delete(
            Table::Backends,
            &singularity_edge::model::backend::storage_key("api", "http://a:1"),
        )
        .await
        .unwrap();

    // the store's pool_name index reflects the removal
    let remaining = store
        .index_lookup(Table::Backends, "pool_name", &serde_json::json!("api"))
        .unwrap();
    assert_eq!(remaining.len(), 1);

    // and every subsequent selection avoids the removed backend
    for _ in 0..4 {
        let lease = handle.select_backend().await.unwrap();
        assert_eq!(lease.backend().id, "http://a:2");
    }

    registry.shutdown_all().await;
}
