use crate::error::EdgeError;
use crate::model::CertificateRecord;
use arc_swap::ArcSwap;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Parse a certificate record's PEM material into a rustls `CertifiedKey`.
pub fn certified_key_from_record(record: &CertificateRecord) -> Result<CertifiedKey, EdgeError> {
    let chain_pem = record.full_chain_pem();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| {
            EdgeError::Validation(format!("invalid certificate PEM for {}: {}", record.domain, e))
        })?;
    if certs.is_empty() {
        return Err(EdgeError::Validation(format!(
            "no certificates in PEM for {}",
            record.domain
        )));
    }

    let key_der = rustls_pemfile::private_key(&mut record.private_key.as_bytes())
        .map_err(|e| {
            EdgeError::Validation(format!("invalid private key PEM for {}: {}", record.domain, e))
        })?
        .ok_or_else(|| {
            EdgeError::Validation(format!("no private key in PEM for {}", record.domain))
        })?;
    let signing_key = any_supported_type(&key_der)
        .map_err(|e| EdgeError::Validation(format!("unsupported key for {}: {}", record.domain, e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// SNI-based certificate lookup for the HTTPS listener.
///
/// The map is swapped wholesale whenever the certificates table changes
/// (local admin writes or peer replication), so handshakes always read a
/// consistent snapshot without locking.
pub struct SniResolver {
    certs: ArcSwap<HashMap<String, Arc<CertifiedKey>>>,
}

impl SniResolver {
    pub fn new() -> Self {
        Self {
            certs: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Rebuild the domain → key map from the current certificate records.
    /// Records whose PEM fails to parse are skipped with a warning — one bad
    /// certificate must not take down every other domain.
    pub fn rebuild(&self, records: &[CertificateRecord]) {
        let mut map = HashMap::with_capacity(records.len());
        for record in records {
            match certified_key_from_record(record) {
                Ok(key) => {
                    map.insert(record.domain.clone(), Arc::new(key));
                }
                Err(e) => {
                    warn!("tls: skipping certificate, domain={}, error={}", record.domain, e);
                }
            }
        }
        info!("tls: sni map rebuilt, domains={}", map.len());
        self.certs.store(Arc::new(map));
    }

    pub fn domain_count(&self) -> usize {
        self.certs.load().len()
    }

    fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.certs
            .load()
            .get(&server_name.to_ascii_lowercase())
            .cloned()
    }
}

impl Default for SniResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver")
            .field("domains", &self.domain_count())
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|name| self.lookup(name))
    }
}

/// Server-side TLS configuration for the HTTPS listener, with per-handshake
/// SNI certificate selection.
pub fn server_config(resolver: Arc<SniResolver>) -> Arc<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_millis;

    fn self_signed(domain: &str) -> CertificateRecord {
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        CertificateRecord::new(
            domain,
            cert.cert.pem(),
            cert.key_pair.serialize_pem(),
            now_millis() + 90 * 24 * 3600 * 1000,
        )
    }

    #[test]
    fn test_certified_key_from_self_signed_record() {
        let record = self_signed("example.com");
        let key = certified_key_from_record(&record).unwrap();
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn test_invalid_pem_rejected() {
        let mut record = self_signed("example.com");
        record.private_key = "not a key".into();
        assert!(matches!(
            certified_key_from_record(&record),
            Err(EdgeError::Validation(_))
        ));
    }

    #[test]
    fn test_sni_lookup_and_rebuild() {
        let resolver = SniResolver::new();
        assert!(resolver.lookup("example.com").is_none());

        resolver.rebuild(&[self_signed("example.com"), self_signed("other.io")]);
        assert_eq!(resolver.domain_count(), 2);
        assert!(resolver.lookup("example.com").is_some());
        assert!(resolver.lookup("EXAMPLE.com").is_some());
        assert!(resolver.lookup("missing.net").is_none());

        // a bad record is skipped, the rest still serve
        let mut broken = self_signed("broken.dev");
        broken.certificate = "garbage".into();
        resolver.rebuild(&[broken, self_signed("other.io")]);
        assert_eq!(resolver.domain_count(), 1);
        assert!(resolver.lookup("other.io").is_some());
        assert!(resolver.lookup("example.com").is_none());
    }
}
