/// Name of the routing override header. Highest priority; case-insensitive
/// like any header name.
pub const POOL_HEADER: &str = "x-pool";

/// Stateless mapping from request metadata to a pool name.
///
/// Priority: explicit `X-Pool` header, then subdomain extraction against the
/// configured base domain, then the default pool. Unknown hosts fall through
/// to the default pool — a custom-domain table is reserved for later.
#[derive(Clone)]
pub struct RouteResolver {
    base_domain: String,
    default_pool: String,
}

impl RouteResolver {
    pub fn new(base_domain: &str, default_pool: &str) -> Self {
        Self {
            base_domain: base_domain.to_ascii_lowercase(),
            default_pool: default_pool.to_string(),
        }
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    pub fn resolve(&self, pool_header: Option<&str>, host: Option<&str>) -> String {
        if let Some(name) = pool_header.map(str::trim).filter(|v| !v.is_empty()) {
            return name.to_string();
        }

        let Some(host) = host else {
            return self.default_pool.clone();
        };
        // Host header may carry a port; only the name routes.
        let host = host
            .split(':')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        if host == self.base_domain {
            return self.default_pool.clone();
        }
        if let Some(prefix) = host.strip_suffix(&format!(".{}", self.base_domain)) {
            // leading label only: "a.b.example.com" routes to "a"
            let label = prefix.split('.').next().unwrap_or_default();
            if !label.is_empty() {
                return label.to_string();
            }
            return self.default_pool.clone();
        }

        self.default_pool.clone()
    }
}
