use crate::model::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

const THIRTY_DAYS_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// A TLS certificate for one domain, as issued by the external ACME
/// collaborator and replicated to every node. The private key never leaves
/// the store except into the SNI resolver; the admin API redacts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: Uuid,
    /// Unique secondary key; one certificate per domain.
    pub domain: String,
    /// Leaf certificate, PEM.
    pub certificate: String,
    /// Private key, PEM.
    pub private_key: String,
    /// Intermediate chain, PEM.
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub issuer: String,
    /// Unix ms. Always present — a record without an expiry is not a
    /// certificate, it is a pending request, and those are not persisted.
    pub expires_at: u64,
    #[serde(default = "default_true")]
    pub auto_renew: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

fn default_true() -> bool {
    true
}

fn default_provider() -> String {
    "letsencrypt".to_string()
}

impl CertificateRecord {
    pub fn new(domain: &str, certificate: String, private_key: String, expires_at: u64) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            domain: domain.to_ascii_lowercase(),
            certificate,
            private_key,
            chain: None,
            issuer: String::new(),
            expires_at,
            auto_renew: true,
            provider: default_provider(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn expired(&self) -> bool {
        self.expires_at < now_millis()
    }

    /// Within the 30-day renewal window (or already past it).
    pub fn expiring_soon(&self) -> bool {
        self.expires_at.saturating_sub(now_millis()) <= THIRTY_DAYS_MS
    }

    /// Leaf + chain concatenated, the shape the TLS stack wants.
    pub fn full_chain_pem(&self) -> String {
        match &self.chain {
            Some(chain) => format!("{}\n{}", self.certificate.trim_end(), chain),
            None => self.certificate.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert_expiring_in(ms: u64) -> CertificateRecord {
        CertificateRecord::new(
            "Example.COM",
            "PEM".into(),
            "KEY".into(),
            now_millis() + ms,
        )
    }

    #[test]
    fn test_domain_lowercased() {
        assert_eq!(cert_expiring_in(1000).domain, "example.com");
    }

    #[test]
    fn test_expiry_windows() {
        let fresh = cert_expiring_in(60 * THIRTY_DAYS_MS);
        assert!(!fresh.expired());
        assert!(!fresh.expiring_soon());

        let soon = cert_expiring_in(THIRTY_DAYS_MS / 2);
        assert!(!soon.expired());
        assert!(soon.expiring_soon());

        let mut gone = cert_expiring_in(0);
        gone.expires_at = now_millis().saturating_sub(1_000);
        assert!(gone.expired());
        assert!(gone.expiring_soon());
    }

    #[test]
    fn test_full_chain_concatenation() {
        let mut c = cert_expiring_in(1000);
        assert_eq!(c.full_chain_pem(), "PEM");
        c.chain = Some("CHAIN".into());
        assert_eq!(c.full_chain_pem(), "PEM\nCHAIN");
    }
}
