use crate::error::EdgeError;
use crate::model::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Load-balancing policy evaluated on every selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Random,
}

impl Algorithm {
    pub fn parse(s: &str) -> Result<Self, EdgeError> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "random" => Ok(Self::Random),
            other => Err(EdgeError::Validation(format!(
                "unknown algorithm '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::Random => "random",
        }
    }
}

/// The edge's treatment of TLS on both legs of a connection.
///
/// `Passthrough` switches the pool to the raw-TCP path — no HTTP inspection,
/// no TLS termination. All other modes terminate on the HTTP(S) listeners and
/// only differ in how the backend leg is dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    Off,
    Flexible,
    Full,
    FullStrict,
    Passthrough,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self, EdgeError> {
        match s {
            "off" => Ok(Self::Off),
            "flexible" => Ok(Self::Flexible),
            "full" => Ok(Self::Full),
            "full_strict" => Ok(Self::FullStrict),
            "passthrough" => Ok(Self::Passthrough),
            other => Err(EdgeError::Validation(format!("unknown ssl_mode '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Flexible => "flexible",
            Self::Full => "full",
            Self::FullStrict => "full_strict",
            Self::Passthrough => "passthrough",
        }
    }
}

impl Default for SslMode {
    fn default() -> Self {
        Self::Off
    }
}

/// Per-algorithm memory carried between selections. Stateless algorithms
/// (random, least_connections) leave it untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmState {
    #[serde(default)]
    pub cursor: u64,
}

pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 10_000;
pub const MIN_HEALTH_CHECK_INTERVAL_MS: u64 = 1_000;

/// A named group of backends sharing an algorithm and SSL policy.
///
/// The record is the persisted, replicated shape; the live counterpart is the
/// pool actor in `crate::pool`, which owns the volatile backend counters and
/// the working copy of `algorithm_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    pub algorithm: Algorithm,
    #[serde(default)]
    pub ssl_mode: SslMode,
    #[serde(default)]
    pub ssl_domain: Option<String>,
    #[serde(default)]
    pub ssl_cert_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub validate_backend_cert: bool,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,
    #[serde(default)]
    pub algorithm_state: AlgorithmState,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

fn default_health_interval() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_MS
}

impl PoolRecord {
    pub fn new(name: &str, algorithm: Algorithm) -> Result<Self, EdgeError> {
        let now = now_millis();
        let record = Self {
            name: name.to_string(),
            algorithm,
            ssl_mode: SslMode::Off,
            ssl_domain: None,
            ssl_cert_id: None,
            validate_backend_cert: false,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            algorithm_state: AlgorithmState::default(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        record.validate()?;
        Ok(record)
    }

    /// Enforce the record invariants. Called on create and on every admin
    /// mutation; replicated records are trusted (the writing node validated).
    pub fn validate(&self) -> Result<(), EdgeError> {
        if self.name.is_empty() {
            return Err(EdgeError::Validation("pool name must not be empty".into()));
        }
        if self.name.contains('/') || self.name.contains(':') {
            return Err(EdgeError::Validation(
                "pool name must not contain '/' or ':'".into(),
            ));
        }
        if self.health_check_interval_ms < MIN_HEALTH_CHECK_INTERVAL_MS {
            return Err(EdgeError::Validation(format!(
                "health_check_interval must be >= {} ms",
                MIN_HEALTH_CHECK_INTERVAL_MS
            )));
        }
        if self.ssl_mode == SslMode::FullStrict && !self.validate_backend_cert {
            return Err(EdgeError::Validation(
                "ssl_mode=full_strict requires validate_backend_cert".into(),
            ));
        }
        Ok(())
    }

    /// Admin-assigned listener port for passthrough pools, carried in
    /// metadata because it only exists for `ssl_mode=passthrough`.
    pub fn listen_port(&self) -> Option<u16> {
        self.metadata.get("listen_port").and_then(|v| v.parse().ok())
    }

    /// Optional per-pool override of the proxied-request deadline.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.metadata
            .get("request_timeout_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
    }
}

/// Aggregated pool counters, computed by the pool actor from its live set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_name: String,
    pub algorithm: Algorithm,
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub unhealthy_backends: usize,
    pub current_connections: u64,
    pub total_requests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parse_round_trip() {
        for name in [
            "round_robin",
            "least_connections",
            "weighted_round_robin",
            "random",
        ] {
            assert_eq!(Algorithm::parse(name).unwrap().as_str(), name);
        }
        assert!(Algorithm::parse("ip_hash").is_err());
    }

    #[test]
    fn test_ssl_mode_serde_names() {
        let m: SslMode = serde_json::from_str("\"full_strict\"").unwrap();
        assert_eq!(m, SslMode::FullStrict);
        assert_eq!(serde_json::to_string(&SslMode::Passthrough).unwrap(), "\"passthrough\"");
    }

    #[test]
    fn test_new_pool_defaults() {
        let p = PoolRecord::new("api", Algorithm::RoundRobin).unwrap();
        assert_eq!(p.ssl_mode, SslMode::Off);
        assert_eq!(p.health_check_interval_ms, DEFAULT_HEALTH_CHECK_INTERVAL_MS);
        assert_eq!(p.algorithm_state, AlgorithmState::default());
    }

    #[test]
    fn test_validate_rejects_short_interval() {
        let mut p = PoolRecord::new("api", Algorithm::RoundRobin).unwrap();
        p.health_check_interval_ms = 500;
        assert!(matches!(p.validate(), Err(EdgeError::Validation(_))));
    }

    #[test]
    fn test_validate_full_strict_requires_backend_cert_check() {
        let mut p = PoolRecord::new("api", Algorithm::RoundRobin).unwrap();
        p.ssl_mode = SslMode::FullStrict;
        assert!(p.validate().is_err());
        p.validate_backend_cert = true;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(PoolRecord::new("", Algorithm::Random).is_err());
        assert!(PoolRecord::new("a/b", Algorithm::Random).is_err());
    }

    #[test]
    fn test_metadata_accessors() {
        let mut p = PoolRecord::new("tcp-pg", Algorithm::LeastConnections).unwrap();
        p.metadata.insert("listen_port".into(), "5432".into());
        p.metadata.insert("request_timeout_ms".into(), "15000".into());
        assert_eq!(p.listen_port(), Some(5432));
        assert_eq!(p.request_timeout(), Some(Duration::from_millis(15000)));
    }
}
