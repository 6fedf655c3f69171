pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl EdgeConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — a node starts with zero configuration for local work.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: EdgeConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            EdgeConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded edge node configuration");
        Ok(config)
    }

    /// Environment overrides, matching the deployment contract the release
    /// tooling already sets on Fly-style platforms.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.listen = format!("0.0.0.0:{}", port);
            }
        }
        if let Ok(v) = std::env::var("PHX_SERVER") {
            self.serve = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("PHX_HOST") {
            self.base_domain = v;
        }
        if let Ok(v) = std::env::var("SECRET_KEY_BASE") {
            self.secret_key_base = Some(v);
        }
        if let Ok(v) = std::env::var("STORE_DIR") {
            self.store_dir = v.into();
        }
        if let Ok(v) = std::env::var("RELEASE_COOKIE") {
            self.cluster.release_cookie = Some(v);
        }
        if let Ok(v) = std::env::var("FLY_APP_NAME") {
            self.cluster.app_name = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_domain.is_empty() {
            anyhow::bail!("base_domain must not be empty");
        }
        if self.default_pool.is_empty() {
            anyhow::bail!("default_pool must not be empty");
        }
        // Unauthenticated replication endpoints would let anyone on the
        // network rewrite pool state; clustering without a cookie is a
        // misconfiguration, not a degraded mode.
        if self.cluster.enabled() && self.cluster.release_cookie.is_none() {
            anyhow::bail!("clustering is enabled but no release_cookie is configured");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EdgeConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.admin_listen, "0.0.0.0:9090");
        assert_eq!(config.default_pool, "default");
        assert!(config.serve);
        assert!(config.https_listen.is_none());
        assert!(!config.cluster.enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_src = r#"
            listen = "0.0.0.0:8081"
            base_domain = "edge.example.com"

            [cluster]
            app_name = "edge"
            release_cookie = "s3cret"

            [proxy]
            request_timeout_ms = 30000
        "#;
        let config: EdgeConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8081");
        assert_eq!(config.base_domain, "edge.example.com");
        assert!(config.cluster.enabled());
        assert_eq!(config.cluster.query().as_deref(), Some("edge.internal"));
        assert_eq!(
            config.proxy.request_timeout(),
            std::time::Duration::from_secs(30)
        );
        // untouched sections keep defaults
        assert_eq!(config.cluster.poll_interval_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_dns_query_wins_over_app_name() {
        let config: EdgeConfig = toml::from_str(
            r#"
            [cluster]
            app_name = "edge"
            dns_query = "edge.query.consul"
            release_cookie = "s3cret"
        "#,
        )
        .unwrap();
        assert_eq!(config.cluster.query().as_deref(), Some("edge.query.consul"));
    }

    #[test]
    fn test_clustering_requires_release_cookie() {
        let config: EdgeConfig = toml::from_str(
            r#"
            [cluster]
            app_name = "edge"
        "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
