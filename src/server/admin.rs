use crate::error::EdgeError;
use crate::events::EdgeEvent;
use crate::model::{backend, Algorithm, BackendRecord, CertificateRecord, PoolRecord, SslMode};
use crate::proxy::{full_body, json_error, BoxBody};
use crate::server::EdgeState;
use crate::store::{ReplicationOp, Table};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

/// REST admin surface: thin controllers over the store, the pool registry,
/// and the event channel. Also hosts the internal cluster endpoints
/// (`/cluster/*`, bearer-authenticated with the release cookie) and the
/// Prometheus exposition.
pub async fn handle_admin(
    req: Request<Incoming>,
    state: EdgeState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (method.as_str(), segments.as_slice()) {
        ("GET", ["api", "health"]) => health(&state),

        ("GET", ["api", "pools"]) => list_pools(&state),
        ("POST", ["api", "pools"]) => create_pool(req, state).await,
        ("GET", ["api", "pools", id]) => get_pool(&state, id).await,
        ("DELETE", ["api", "pools", id]) => delete_pool(&state, id).await,

        ("POST", ["api", "pools", id, "backends"]) => {
            let id = id.to_string();
            add_backend(req, state, &id).await
        }
        ("DELETE", ["api", "pools", id, "backends", rest @ ..]) if !rest.is_empty() => {
            let backend_id = percent_decode(&rest.join("/"));
            remove_backend(&state, id, &backend_id).await
        }

        ("GET", ["api", "certificates"]) => list_certificates(&state),
        ("POST", ["api", "certificates"]) => request_certificate(req, state).await,
        ("POST", ["api", "certificates", id, "renew"]) => renew_certificate(&state, id),
        ("DELETE", ["api", "certificates", id]) => delete_certificate(&state, id).await,

        ("GET", [".well-known", "acme-challenge", token]) => acme_challenge(&state, token),

        ("GET", ["metrics"]) => metrics_text(&state),

        ("POST", ["cluster", "replicate"]) => {
            if let Some(denied) = check_cluster_auth(&req, &state) {
                Ok(denied)
            } else {
                apply_replication(req, state).await
            }
        }
        ("GET", ["cluster", "snapshot"]) => {
            if let Some(denied) = check_cluster_auth(&req, &state) {
                Ok(denied)
            } else {
                snapshot(&state)
            }
        }

        _ => Ok(json_error(StatusCode::NOT_FOUND, "not found")),
    };

    match response {
        Ok(resp) => Ok(resp),
        Err(e) => Ok(error_response(e)),
    }
}

/// Map core errors onto admin API status codes.
fn error_response(e: EdgeError) -> Response<BoxBody> {
    let status = match &e {
        EdgeError::InvalidUrl(_) | EdgeError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EdgeError::AlreadyExists(_) => StatusCode::CONFLICT,
        EdgeError::NotFound(_) => StatusCode::NOT_FOUND,
        EdgeError::NoBackends => StatusCode::SERVICE_UNAVAILABLE,
        EdgeError::BackendConnect(_) | EdgeError::BackendTls(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("admin: request failed, error={}", e);
    }
    json_error(status, &e.to_string())
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(value.to_string()))
        .unwrap()
}

fn no_content() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(crate::proxy::empty_body())
        .unwrap()
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, EdgeError> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| EdgeError::ClientIo(e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| EdgeError::Validation(format!("invalid body: {}", e)))
}

// ---------------------------------------------------------------------------
// Health / metrics
// ---------------------------------------------------------------------------

fn health(state: &EdgeState) -> Result<Response<BoxBody>, EdgeError> {
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "status": "healthy",
            "node": state.node.as_ref(),
            "uptime": state.uptime_secs(),
        }),
    ))
}

fn metrics_text(state: &EdgeState) -> Result<Response<BoxBody>, EdgeError> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(full_body(state.metrics.render()))
        .unwrap())
}

fn acme_challenge(state: &EdgeState, token: &str) -> Result<Response<BoxBody>, EdgeError> {
    match state.challenges.get(token) {
        Some(key_authorization) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(full_body(key_authorization))
            .unwrap()),
        None => Err(EdgeError::NotFound(format!("challenge '{}'", token))),
    }
}

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreatePoolRequest {
    name: String,
    algorithm: String,
    #[serde(default)]
    ssl_mode: Option<String>,
    #[serde(default)]
    ssl_domain: Option<String>,
    #[serde(default)]
    ssl_cert_id: Option<uuid::Uuid>,
    #[serde(default)]
    health_check_interval_ms: Option<u64>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

fn list_pools(state: &EdgeState) -> Result<Response<BoxBody>, EdgeError> {
    let pools = state.store.list(Table::Pools)?;
    Ok(json_response(StatusCode::OK, &serde_json::Value::Array(pools)))
}

async fn create_pool(
    req: Request<Incoming>,
    state: EdgeState,
) -> Result<Response<BoxBody>, EdgeError> {
    let body: CreatePoolRequest = read_json(req).await?;

    let algorithm = Algorithm::parse(&body.algorithm)?;
    let mut record = PoolRecord::new(&body.name, algorithm)?;
    if let Some(mode) = body.ssl_mode.as_deref() {
        record.ssl_mode = SslMode::parse(mode)?;
        if record.ssl_mode == SslMode::FullStrict {
            record.validate_backend_cert = true;
        }
    }
    record.ssl_domain = body.ssl_domain;
    record.ssl_cert_id = body.ssl_cert_id;
    if let Some(interval) = body.health_check_interval_ms {
        record.health_check_interval_ms = interval;
    }
    if let Some(metadata) = body.metadata {
        record.metadata = metadata;
    }
    record.validate()?;

    if state.store.get(Table::Pools, &record.name).is_ok() {
        return Err(EdgeError::AlreadyExists(format!("pool '{}'", record.name)));
    }

    state.pools.upsert(record.clone(), Vec::new());
    let value = serde_json::to_value(&record)
        .map_err(|e| EdgeError::Storage(format!("encode pool: {}", e)))?;
    state.store.put(Table::Pools, &record.name, value.clone()).await?;

    info!("admin: pool created, pool={}", record.name);
    Ok(json_response(StatusCode::CREATED, &value))
}

async fn get_pool(state: &EdgeState, id: &str) -> Result<Response<BoxBody>, EdgeError> {
    let handle = state
        .pools
        .get(id)
        .ok_or_else(|| EdgeError::NotFound(format!("pool '{}'", id)))?;
    let stats = handle.stats().await?;
    let backends = handle.list_backends().await?;
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "stats": stats,
            "backends": backends,
        }),
    ))
}

async fn delete_pool(state: &EdgeState, id: &str) -> Result<Response<BoxBody>, EdgeError> {
    let known_in_store = state.store.get(Table::Pools, id).is_ok();
    if !known_in_store && !state.pools.contains(id) {
        return Err(EdgeError::NotFound(format!("pool '{}'", id)));
    }

    // Full teardown: actor, health checker, and any passthrough listener.
    state.pools.remove(id).await;

    // Backends exist only under their pool; delete them with it.
    let orphans = state
        .store
        .index_lookup(Table::Backends, "pool_name", &json!(id))?;
    for value in orphans {
        if let Ok(record) = serde_json::from_value::<BackendRecord>(value) {
            state.store.delete(Table::Backends, &record.storage_key()).await?;
        }
    }
    state.store.delete(Table::Pools, id).await?;

    info!("admin: pool deleted, pool={}", id);
    Ok(no_content())
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AddBackendRequest {
    url: String,
    #[serde(default)]
    weight: Option<u32>,
}

async fn add_backend(
    req: Request<Incoming>,
    state: EdgeState,
    pool_id: &str,
) -> Result<Response<BoxBody>, EdgeError> {
    let handle = state
        .pools
        .get(pool_id)
        .ok_or_else(|| EdgeError::NotFound(format!("pool '{}'", pool_id)))?;
    let body: AddBackendRequest = read_json(req).await?;

    let mut record = BackendRecord::new(&body.url)?;
    if let Some(weight) = body.weight {
        if weight == 0 {
            return Err(EdgeError::Validation("weight must be >= 1".into()));
        }
        record.weight = weight;
    }

    let added = handle.add_backend(record).await?;
    let value = serde_json::to_value(&added)
        .map_err(|e| EdgeError::Storage(format!("encode backend: {}", e)))?;
    state
        .store
        .put(Table::Backends, &added.storage_key(), value.clone())
        .await?;

    info!("admin: backend added, pool={}, backend={}", pool_id, added.id);
    Ok(json_response(StatusCode::CREATED, &value))
}

async fn remove_backend(
    state: &EdgeState,
    pool_id: &str,
    backend_id: &str,
) -> Result<Response<BoxBody>, EdgeError> {
    let handle = state
        .pools
        .get(pool_id)
        .ok_or_else(|| EdgeError::NotFound(format!("pool '{}'", pool_id)))?;

    handle.remove_backend(backend_id).await?;
    state
        .store
        .delete(Table::Backends, &backend::storage_key(pool_id, backend_id))
        .await?;

    info!(
        "admin: backend removed, pool={}, backend={}",
        pool_id, backend_id
    );
    Ok(no_content())
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RequestCertificateRequest {
    domain: String,
}

fn list_certificates(state: &EdgeState) -> Result<Response<BoxBody>, EdgeError> {
    let mut certs = state.store.list(Table::Certificates)?;
    for cert in &mut certs {
        if let Some(obj) = cert.as_object_mut() {
            obj.remove("private_key");
        }
    }
    Ok(json_response(StatusCode::OK, &serde_json::Value::Array(certs)))
}

async fn request_certificate(
    req: Request<Incoming>,
    state: EdgeState,
) -> Result<Response<BoxBody>, EdgeError> {
    let body: RequestCertificateRequest = read_json(req).await?;
    let domain = body.domain.trim().to_ascii_lowercase();
    if domain.is_empty() || !domain.contains('.') {
        return Err(EdgeError::Validation(format!("invalid domain '{}'", domain)));
    }

    let existing = state
        .store
        .index_lookup(Table::Certificates, "domain", &json!(domain))?;
    if !existing.is_empty() {
        return Err(EdgeError::AlreadyExists(format!("certificate for '{}'", domain)));
    }

    // Acquisition belongs to the external ACME collaborator; it hears this
    // event, performs the challenge, and writes the issued record back.
    state
        .events
        .publish(EdgeEvent::CertificateRequested { domain: domain.clone() });
    info!("admin: certificate requested, domain={}", domain);

    Ok(json_response(
        StatusCode::CREATED,
        &json!({"domain": domain, "status": "pending"}),
    ))
}

fn renew_certificate(state: &EdgeState, id: &str) -> Result<Response<BoxBody>, EdgeError> {
    let value = state.store.get(Table::Certificates, id)?;
    let record: CertificateRecord = serde_json::from_value(value)
        .map_err(|e| EdgeError::Storage(format!("decode certificate: {}", e)))?;

    state.events.publish(EdgeEvent::CertificateRenewalRequested {
        id: record.id,
        domain: record.domain.clone(),
    });
    info!("admin: certificate renewal requested, domain={}", record.domain);

    Ok(json_response(
        StatusCode::OK,
        &json!({"id": record.id, "domain": record.domain, "status": "renewing"}),
    ))
}

async fn delete_certificate(state: &EdgeState, id: &str) -> Result<Response<BoxBody>, EdgeError> {
    // `delete` is idempotent at the store layer; the API contract wants a
    // 404 for an unknown id, so probe first.
    state.store.get(Table::Certificates, id)?;
    state.store.delete(Table::Certificates, id).await?;
    info!("admin: certificate deleted, id={}", id);
    Ok(no_content())
}

// ---------------------------------------------------------------------------
// Cluster (internal, cookie-authenticated)
// ---------------------------------------------------------------------------

fn check_cluster_auth(req: &Request<Incoming>, state: &EdgeState) -> Option<Response<BoxBody>> {
    let Some(cookie) = state.config.cluster.release_cookie.as_deref() else {
        // not clustered — the endpoints do not exist
        return Some(json_error(StatusCode::NOT_FOUND, "not found"));
    };
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == cookie)
        .unwrap_or(false);
    if !authorized {
        return Some(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
    }
    None
}

async fn apply_replication(
    req: Request<Incoming>,
    state: EdgeState,
) -> Result<Response<BoxBody>, EdgeError> {
    let op: ReplicationOp = read_json(req).await?;
    let applied = state.store.apply_replicated(op).await?;
    Ok(json_response(StatusCode::OK, &json!({"applied": applied})))
}

fn snapshot(state: &EdgeState) -> Result<Response<BoxBody>, EdgeError> {
    let ops = state.store.snapshot()?;
    let value = serde_json::to_value(&ops)
        .map_err(|e| EdgeError::Storage(format!("encode snapshot: {}", e)))?;
    Ok(json_response(StatusCode::OK, &value))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Minimal percent-decoding for path segments. Backend ids contain `://`,
/// so clients may send them either raw or encoded.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("http%3A%2F%2Fa%3A1"), "http://a:1");
        assert_eq!(percent_decode("http://a:1"), "http://a:1");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%2"), "bad%2");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_response(EdgeError::Validation("x".into())).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_response(EdgeError::AlreadyExists("x".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_response(EdgeError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(EdgeError::NoBackends).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_response(EdgeError::Storage("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
