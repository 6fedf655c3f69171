use crate::error::EdgeError;
use crate::model::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single upstream target. The persisted record doubles as the in-memory
/// working copy inside the owning pool actor; the counters
/// (`current_connections`, `total_requests`, `healthy`, `last_check`) are
/// volatile there and only checkpointed to the store opportunistically.
///
/// A `BackendRecord` handed out of the pool actor (from a selection or a
/// listing) is a snapshot — callers must treat it as immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    /// Stable identity: `scheme://host:port`. Unique within a pool.
    pub id: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Name of the owning pool. Indexed in the store.
    #[serde(default)]
    pub pool_name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default)]
    pub current_connections: u64,
    #[serde(default)]
    pub total_requests: u64,
    /// Unix ms of the most recent health probe, `None` before the first one.
    #[serde(default)]
    pub last_check: Option<u64>,
    #[serde(default)]
    pub ssl_verify: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl BackendRecord {
    /// Parse `scheme://host:port[/…]` into a backend. The path, query, and
    /// userinfo are discarded — only the origin identifies a backend. A
    /// missing port falls back to the scheme default (80/443).
    ///
    /// New backends start healthy until the first probe says otherwise.
    pub fn new(raw: &str) -> Result<Self, EdgeError> {
        let url = url::Url::parse(raw).map_err(|e| EdgeError::InvalidUrl(e.to_string()))?;

        let scheme = url.scheme().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(EdgeError::InvalidUrl(format!(
                "unknown scheme '{}', expected http or https",
                scheme
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EdgeError::InvalidUrl(format!("missing host in '{}'", raw)))?
            .to_ascii_lowercase();

        let port = url
            .port_or_known_default()
            .ok_or_else(|| EdgeError::InvalidUrl(format!("missing port in '{}'", raw)))?;

        let now = now_millis();
        Ok(Self {
            id: format!("{}://{}:{}", scheme, host, port),
            scheme,
            host,
            port,
            pool_name: String::new(),
            weight: 1,
            healthy: true,
            current_connections: 0,
            total_requests: 0,
            last_check: None,
            ssl_verify: false,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Assign the owning pool. Used at add time; the pool name is part of the
    /// storage key, never of the backend identity.
    pub fn in_pool(mut self, pool_name: &str) -> Self {
        self.pool_name = pool_name.to_string();
        self
    }

    /// Key under which this backend lives in the `backends` table. The pool
    /// name is prefixed because backend ids are only unique per pool.
    pub fn storage_key(&self) -> String {
        storage_key(&self.pool_name, &self.id)
    }

    /// Copy with the healthy flag set and `last_check` stamped to now.
    pub fn set_health(&self, ok: bool) -> Self {
        let mut copy = self.clone();
        copy.healthy = ok;
        copy.last_check = Some(now_millis());
        copy
    }

    /// Record a selection: one more open connection, one more total request.
    pub fn inc_connections(&mut self) {
        self.current_connections += 1;
        self.total_requests += 1;
    }

    /// Record a release. Saturates at zero so a stray double-release can
    /// never drive the gauge negative.
    pub fn dec_connections(&mut self) {
        self.current_connections = self.current_connections.saturating_sub(1);
    }

    /// Address string used for dialing, `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Compose the `backends` table key for a (pool, backend id) pair.
pub fn storage_key(pool_name: &str, backend_id: &str) -> String {
    format!("{}::{}", pool_name, backend_id)
}

/// Split a `backends` table key back into (pool, backend id).
pub fn split_storage_key(key: &str) -> Option<(&str, &str)> {
    key.split_once("::")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let b = BackendRecord::new("http://app-1.internal:8080").unwrap();
        assert_eq!(b.id, "http://app-1.internal:8080");
        assert_eq!(b.scheme, "http");
        assert_eq!(b.host, "app-1.internal");
        assert_eq!(b.port, 8080);
        assert!(b.healthy);
        assert_eq!(b.current_connections, 0);
        assert_eq!(b.total_requests, 0);
        assert!(b.last_check.is_none());
    }

    #[test]
    fn test_parse_default_ports() {
        assert_eq!(BackendRecord::new("http://a").unwrap().port, 80);
        assert_eq!(BackendRecord::new("https://a").unwrap().port, 443);
    }

    #[test]
    fn test_path_discarded_from_identity() {
        let b = BackendRecord::new("https://api.example.com:9443/v2/health?x=1").unwrap();
        assert_eq!(b.id, "https://api.example.com:9443");
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(matches!(
            BackendRecord::new("ftp://a:21"),
            Err(EdgeError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_rejects_missing_host() {
        assert!(matches!(
            BackendRecord::new("http://:8080"),
            Err(EdgeError::InvalidUrl(_))
        ));
        assert!(matches!(
            BackendRecord::new("not a url"),
            Err(EdgeError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_set_health_stamps_last_check() {
        let b = BackendRecord::new("http://a:1").unwrap();
        let down = b.set_health(false);
        assert!(!down.healthy);
        assert!(down.last_check.is_some());
        // original snapshot untouched
        assert!(b.healthy);
        assert!(b.last_check.is_none());
    }

    #[test]
    fn test_counters() {
        let mut b = BackendRecord::new("http://a:1").unwrap();
        b.inc_connections();
        b.inc_connections();
        assert_eq!(b.current_connections, 2);
        assert_eq!(b.total_requests, 2);
        b.dec_connections();
        assert_eq!(b.current_connections, 1);
        assert_eq!(b.total_requests, 2);
        b.dec_connections();
        b.dec_connections(); // saturates, never negative
        assert_eq!(b.current_connections, 0);
    }

    #[test]
    fn test_storage_key_round_trip() {
        let b = BackendRecord::new("http://a:1").unwrap().in_pool("api");
        assert_eq!(b.storage_key(), "api::http://a:1");
        assert_eq!(
            split_storage_key(&b.storage_key()),
            Some(("api", "http://a:1"))
        );
    }
}
