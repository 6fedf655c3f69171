use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level node configuration.
///
/// Business state (pools, backends, certificates) lives in the replicated
/// store and is managed through the admin API — this file only carries
/// infrastructure settings: listeners, routing defaults, store location, and
/// cluster membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Plain-HTTP listener.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// TLS listener with SNI certificate lookup. Disabled when unset.
    #[serde(default)]
    pub https_listen: Option<String>,

    /// Admin API / metrics / cluster-replication listener.
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    /// Whether to start the public listeners at all. A node with this off
    /// still replicates and serves the admin API.
    #[serde(default = "default_true")]
    pub serve: bool,

    /// Base domain for subdomain routing: `api.<base_domain>` → pool `api`.
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Pool used when routing cannot otherwise resolve a request.
    #[serde(default = "default_pool_name")]
    pub default_pool: String,

    /// Root directory of the on-disk store, one subdirectory per table.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Cookie-signing secret for the (external) dashboard; loaded here so
    /// one config file serves the whole deployment.
    #[serde(default)]
    pub secret_key_base: Option<String>,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            https_listen: None,
            admin_listen: default_admin_listen(),
            serve: true,
            base_domain: default_base_domain(),
            default_pool: default_pool_name(),
            store_dir: default_store_dir(),
            secret_key_base: None,
            cluster: ClusterConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_pool_name() -> String {
    "default".to_string()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_true() -> bool {
    true
}

/// Cluster membership via DNS polling. Peers are discovered by resolving
/// `dns_query` (derived from the app name when unset) and diffing successive
/// answer sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Application name; `<app_name>.internal` is the default DNS query.
    #[serde(default)]
    pub app_name: Option<String>,

    /// Explicit DNS query overriding the derived one.
    #[serde(default)]
    pub dns_query: Option<String>,

    /// Admin-listener port peers are reached on.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    #[serde(default = "default_dns_poll_interval")]
    pub poll_interval_ms: u64,

    /// Shared secret authenticating replication traffic. Required whenever
    /// clustering is enabled.
    #[serde(default)]
    pub release_cookie: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            app_name: None,
            dns_query: None,
            peer_port: default_peer_port(),
            poll_interval_ms: default_dns_poll_interval(),
            release_cookie: None,
        }
    }
}

fn default_peer_port() -> u16 {
    9090
}

fn default_dns_poll_interval() -> u64 {
    5_000
}

impl ClusterConfig {
    pub fn enabled(&self) -> bool {
        self.app_name.is_some() || self.dns_query.is_some()
    }

    /// The DNS name polled for peer discovery.
    pub fn query(&self) -> Option<String> {
        self.dns_query
            .clone()
            .or_else(|| self.app_name.as_ref().map(|app| format!("{}.internal", app)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Request-path tunables shared by both proxy paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Deadline for a proxied HTTP exchange; pools may override via
    /// `metadata["request_timeout_ms"]`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// TCP connect budget for backend dials (both proxy paths).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upstream keep-alive pool sizing.
    #[serde(default = "default_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default = "default_max_idle")]
    pub pool_max_idle_per_host: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            pool_idle_timeout_secs: default_idle_timeout(),
            pool_max_idle_per_host: default_max_idle(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_max_idle() -> usize {
    32
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}
