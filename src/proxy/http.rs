use crate::model::SslMode;
use crate::pool::BackendLease;
use crate::proxy::{empty_body, full_body, json_error, remove_hop_headers, resolver, BoxBody};
use crate::server::EdgeState;
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used for `ssl_mode=full`, where the backend leg is encrypted
/// but upstream identity is not verified (self-signed origin certs).
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The two upstream dialers, built once at startup and shared by every pool.
///
/// - `lax`: plain HTTP, or TLS with verification disabled (`full`).
/// - `strict`: TLS with webpki roots + hostname verification (`full_strict`).
///
/// Which one a request uses — and whether the outbound scheme is http or
/// https at all — is decided per pool by its ssl_mode.
#[derive(Clone)]
pub struct UpstreamClients {
    lax: Client<HttpsConnector<HttpConnector>, BoxBody>,
    strict: Client<HttpsConnector<HttpConnector>, BoxBody>,
}

impl UpstreamClients {
    pub fn build(connect_timeout: Duration, idle_timeout: Duration, max_idle: usize) -> Self {
        Self {
            lax: build_client(false, connect_timeout, idle_timeout, max_idle),
            strict: build_client(true, connect_timeout, idle_timeout, max_idle),
        }
    }

    fn for_mode(&self, mode: SslMode) -> &Client<HttpsConnector<HttpConnector>, BoxBody> {
        match mode {
            SslMode::FullStrict => &self.strict,
            _ => &self.lax,
        }
    }
}

fn build_client(
    verify: bool,
    connect_timeout: Duration,
    idle_timeout: Duration,
    max_idle: usize,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(idle_timeout));
    http.set_connect_timeout(Some(connect_timeout));
    http.enforce_http(false);

    let https = if verify {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(idle_timeout)
        .pool_max_idle_per_host(max_idle)
        .build(https)
}

/// Scheme actually dialed upstream. The pool's ssl_mode, not the backend
/// record, decides whether the backend leg is encrypted: off/flexible never
/// use TLS upstream, full/full_strict always do.
fn effective_scheme(mode: SslMode) -> &'static str {
    match mode {
        SslMode::Off | SslMode::Flexible => "http",
        SslMode::Full | SslMode::FullStrict => "https",
        // passthrough pools never reach the HTTP path
        SslMode::Passthrough => "http",
    }
}

/// Handle one terminated HTTP(S) request: resolve a pool, take a backend
/// lease, forward the request, and stream the response back. The lease rides
/// inside the response body so the connection slot is held until the last
/// byte reaches the client (or either side gives up).
pub async fn handle_request(
    req: Request<Incoming>,
    state: EdgeState,
    peer_addr: SocketAddr,
    via_tls: bool,
) -> Result<Response<BoxBody>, hyper::Error> {
    let start = Instant::now();
    let path = req.uri().path().to_string();

    // ACME HTTP-01 answers are served before any routing: the CA dials the
    // bare domain over plain HTTP.
    if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        return Ok(serve_acme_challenge(&state, token));
    }

    let method = req.method().clone();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string));
    let pool_header = req
        .headers()
        .get(resolver::POOL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let pool_name = state
        .resolver
        .resolve(pool_header.as_deref(), host.as_deref());

    metrics::gauge!("edge_http_requests_in_flight", "pool" => pool_name.clone()).increment(1.0);
    let finish = |status: StatusCode| {
        record_request(&pool_name, method.as_str(), status, start);
    };

    let Some(pool) = state.pools.get(&pool_name) else {
        warn!(
            "proxy: no pool for request, pool={}, host={}",
            pool_name,
            host.as_deref().unwrap_or("")
        );
        finish(StatusCode::SERVICE_UNAVAILABLE);
        return Ok(json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "No healthy backends available",
        ));
    };

    let record = match pool.record().await {
        Ok(r) => r,
        Err(_) => {
            finish(StatusCode::SERVICE_UNAVAILABLE);
            return Ok(json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "No healthy backends available",
            ));
        }
    };
    if record.ssl_mode == SslMode::Passthrough {
        // no HTTP inspection may occur for passthrough pools; the request
        // reaching this listener is a routing misconfiguration
        warn!(
            "proxy: passthrough pool addressed over HTTP, pool={}",
            pool_name
        );
        finish(StatusCode::SERVICE_UNAVAILABLE);
        return Ok(json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "pool is passthrough",
        ));
    }

    let lease = match pool.select_backend().await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(
                "proxy: selection failed, pool={}, error={}",
                pool_name, e
            );
            finish(StatusCode::SERVICE_UNAVAILABLE);
            return Ok(json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "No healthy backends available",
            ));
        }
    };
    let backend_addr = lease.backend().addr();
    let scheme = effective_scheme(record.ssl_mode);

    // Outbound URI: scheme://host:port + original path and query.
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let upstream_uri = format!("{}://{}{}", scheme, backend_addr, path_and_query);

    let mut headers = req.headers().clone();
    remove_hop_headers(&mut headers);
    headers.remove(HOST);
    inject_forwarded_headers(&mut headers, peer_addr, host.as_deref().unwrap_or(""), via_tls);

    let (_, body) = req.into_parts();
    let client_errored = Arc::new(AtomicBool::new(false));
    let watched_body = WatchedBody {
        inner: body,
        errored: client_errored.clone(),
    }
    .boxed();

    let mut builder = Request::builder().method(method.clone()).uri(&upstream_uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    builder = builder.header(
        HOST,
        HeaderValue::from_str(&backend_addr).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    let upstream_req = match builder.body(watched_body) {
        Ok(r) => r,
        Err(e) => {
            warn!(
                "proxy: failed to build upstream request, pool={}, error={}",
                pool_name, e
            );
            finish(StatusCode::INTERNAL_SERVER_ERROR);
            return Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
            ));
        }
    };

    let deadline = record
        .request_timeout()
        .unwrap_or(state.config.proxy.request_timeout());
    let client = state.clients.for_mode(record.ssl_mode);

    let upstream_start = Instant::now();
    let result = tokio::time::timeout(deadline, client.request(upstream_req)).await;

    let upstream_resp = match result {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            // A failure while feeding the request body up is the client's
            // fault (400); everything else on this path is a dial, TLS, or
            // upstream protocol failure (502).
            if client_errored.load(Ordering::Relaxed) {
                debug!(
                    "proxy: client body read failed, pool={}, backend={}, error={}",
                    pool_name, backend_addr, e
                );
                finish(StatusCode::BAD_REQUEST);
                return Ok(json_error(StatusCode::BAD_REQUEST, "bad request"));
            }
            warn!(
                "proxy: upstream request failed, pool={}, backend={}, error={}",
                pool_name, backend_addr, e
            );
            finish(StatusCode::BAD_GATEWAY);
            return Ok(json_error(StatusCode::BAD_GATEWAY, "bad gateway"));
        }
        Err(_) => {
            warn!(
                "proxy: upstream deadline elapsed, pool={}, backend={}, deadline_ms={}",
                pool_name,
                backend_addr,
                deadline.as_millis()
            );
            finish(StatusCode::GATEWAY_TIMEOUT);
            return Ok(json_error(StatusCode::GATEWAY_TIMEOUT, "gateway timeout"));
        }
    };

    let status = upstream_resp.status();
    let upstream_elapsed = upstream_start.elapsed();
    let (mut parts, upstream_body) = upstream_resp.into_parts();
    remove_hop_headers(&mut parts.headers);

    // The lease travels with the body: released when streaming finishes,
    // when the backend errors mid-stream, or when the client goes away and
    // hyper drops the response.
    let leased = LeasedBody {
        inner: upstream_body.boxed(),
        _lease: lease,
    };
    let response = Response::from_parts(parts, BodyExt::boxed(leased));

    record_request(&pool_name, method.as_str(), status, start);
    metrics::histogram!(
        "edge_upstream_request_duration_seconds",
        "pool" => pool_name.clone(),
    )
    .record(upstream_elapsed.as_secs_f64());

    info!(
        client_ip = %peer_addr.ip(),
        method = %method,
        host = %host.as_deref().unwrap_or(""),
        path = %path,
        status = status.as_u16(),
        pool = %pool_name,
        backend = %backend_addr,
        latency_ms = %start.elapsed().as_millis(),
        upstream_ms = %upstream_elapsed.as_millis(),
        "access"
    );

    Ok(response)
}

fn serve_acme_challenge(state: &EdgeState, token: &str) -> Response<BoxBody> {
    match state.challenges.get(token) {
        Some(key_authorization) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(full_body(key_authorization))
            .unwrap(),
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(empty_body())
            .unwrap(),
    }
}

fn record_request(pool: &str, method: &str, status: StatusCode, start: Instant) {
    let mut buf = itoa::Buffer::new();
    let status_str = buf.format(status.as_u16());
    metrics::counter!(
        "edge_http_requests_total",
        "pool" => pool.to_string(),
        "method" => method.to_string(),
        "status_code" => status_str.to_owned(),
    )
    .increment(1);
    metrics::histogram!(
        "edge_http_request_duration_seconds",
        "pool" => pool.to_string(),
    )
    .record(start.elapsed().as_secs_f64());
    metrics::gauge!("edge_http_requests_in_flight", "pool" => pool.to_string()).decrement(1.0);
}

/// Standard `X-Forwarded-*` and `X-Real-IP` injection so backends can see
/// the original client and protocol.
fn inject_forwarded_headers(
    headers: &mut http::HeaderMap,
    peer_addr: SocketAddr,
    original_host: &str,
    via_tls: bool,
) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    headers.insert(
        XFP.clone(),
        HeaderValue::from_static(if via_tls { "https" } else { "http" }),
    );

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}

/// Request-body adapter that remembers whether the *client* side errored, so
/// an upstream send failure can be attributed to the right party.
struct WatchedBody {
    inner: Incoming,
    errored: Arc<AtomicBool>,
}

impl Body for WatchedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Err(e))) => {
                this.errored.store(true, Ordering::Relaxed);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Response-body adapter owning the backend lease for the stream's lifetime.
struct LeasedBody {
    inner: BoxBody,
    _lease: BackendLease,
}

impl Body for LeasedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_scheme_by_ssl_mode() {
        assert_eq!(effective_scheme(SslMode::Off), "http");
        assert_eq!(effective_scheme(SslMode::Flexible), "http");
        assert_eq!(effective_scheme(SslMode::Full), "https");
        assert_eq!(effective_scheme(SslMode::FullStrict), "https");
    }

    #[test]
    fn test_forwarded_headers_injected() {
        let peer: SocketAddr = "203.0.113.9:4711".parse().unwrap();
        let mut headers = http::HeaderMap::new();
        inject_forwarded_headers(&mut headers, peer, "api.example.com", true);

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "api.example.com");
        assert_eq!(headers.get("x-real-ip").unwrap(), "203.0.113.9");
    }

    #[test]
    fn test_forwarded_for_appends_to_existing_chain() {
        let peer: SocketAddr = "203.0.113.9:4711".parse().unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.7".parse().unwrap());
        inject_forwarded_headers(&mut headers, peer, "", false);

        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "198.51.100.7, 203.0.113.9"
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
    }
}
