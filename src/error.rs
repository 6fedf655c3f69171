use std::fmt;

/// Crate-wide error type covering the request path, pool mutations, and the
/// replicated store. Request handlers map these onto HTTP status codes; see
/// `server::admin` and `proxy::http`.
#[derive(Debug)]
pub enum EdgeError {
    /// Backend URL failed to parse, had no host, or used an unknown scheme.
    InvalidUrl(String),
    /// Pool or backend identity collision on create/add.
    AlreadyExists(String),
    /// Named pool, backend, or record does not exist.
    NotFound(String),
    /// Selection ran against an empty healthy set.
    NoBackends,
    /// TCP/HTTP dial to the backend failed.
    BackendConnect(String),
    /// TLS handshake or verification against the backend failed.
    BackendTls(String),
    /// I/O failure on the backend side of an established stream.
    UpstreamIo(String),
    /// I/O failure on the client side of an established stream.
    ClientIo(String),
    /// Local disk commit or recovery failure in the store.
    Storage(String),
    /// A change-feed subscriber fell behind and missed events.
    ReplicationLagged,
    /// Admin input failed validation.
    Validation(String),
    /// A deadline elapsed.
    Timeout,
}

impl fmt::Display for EdgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeError::InvalidUrl(msg) => write!(f, "invalid url: {}", msg),
            EdgeError::AlreadyExists(what) => write!(f, "already exists: {}", what),
            EdgeError::NotFound(what) => write!(f, "not found: {}", what),
            EdgeError::NoBackends => write!(f, "no healthy backends available"),
            EdgeError::BackendConnect(msg) => write!(f, "backend connect error: {}", msg),
            EdgeError::BackendTls(msg) => write!(f, "backend tls error: {}", msg),
            EdgeError::UpstreamIo(msg) => write!(f, "upstream i/o error: {}", msg),
            EdgeError::ClientIo(msg) => write!(f, "client i/o error: {}", msg),
            EdgeError::Storage(msg) => write!(f, "storage error: {}", msg),
            EdgeError::ReplicationLagged => write!(f, "replication change feed lagged"),
            EdgeError::Validation(msg) => write!(f, "validation error: {}", msg),
            EdgeError::Timeout => write!(f, "deadline elapsed"),
        }
    }
}

impl std::error::Error for EdgeError {}
