use crate::acme::ChallengeStore;
use crate::config::EdgeConfig;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::pool::registry::PoolRegistry;
use crate::proxy::http::UpstreamClients;
use crate::proxy::resolver::RouteResolver;
use crate::store::Store;
use crate::tls::SniResolver;
use std::sync::Arc;
use std::time::Instant;

/// Shared node state, cheaply cloneable. One instance is built at bootstrap
/// and handed to every listener and background task.
#[derive(Clone)]
pub struct EdgeState {
    pub config: Arc<EdgeConfig>,
    pub store: Arc<Store>,
    pub pools: PoolRegistry,
    pub resolver: RouteResolver,
    pub clients: UpstreamClients,
    pub sni: Arc<SniResolver>,
    pub challenges: ChallengeStore,
    pub events: EventBus,
    pub metrics: Metrics,
    /// Node identity used in `/api/health` and as the replication origin.
    pub node: Arc<str>,
    pub started_at: Instant,
}

impl EdgeState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
