use dashmap::DashMap;
use std::sync::Arc;

/// HTTP-01 challenge tokens, served on `/.well-known/acme-challenge/:token`.
///
/// The external ACME client installs a token before asking the CA to
/// validate and removes it afterwards; the proxy and admin listeners only
/// ever read. Tokens are node-local — the CA follows the A record, so the
/// node that requested the certificate answers the challenge.
#[derive(Clone, Default)]
pub struct ChallengeStore {
    tokens: Arc<DashMap<String, String>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, key_authorization: &str) {
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|v| v.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let store = ChallengeStore::new();
        assert_eq!(store.get("tok"), None);
        store.insert("tok", "tok.thumbprint");
        assert_eq!(store.get("tok"), Some("tok.thumbprint".to_string()));
        store.remove("tok");
        assert_eq!(store.get("tok"), None);
    }
}
