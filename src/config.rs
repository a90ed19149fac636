use tokio::time::Duration;

/// Routing bucket capacity.
pub const DEFAULT_K: usize = 20;

/// Parameters of a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// How many closest responders a search tries to settle on.
    pub n_closest_responses: usize,
    /// Query failures tolerated before the lookup errors out.
    pub n_max_errors: usize,
    /// Maximum queries in flight at once.
    pub concurrency: usize,
    /// Timeout applied to each individual query.
    pub query_timeout: Duration,
    /// Optional deadline for the whole lookup. When it passes, outstanding
    /// queries are cancelled and the lookup errors.
    pub deadline: Option<Duration>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            n_closest_responses: 8,
            n_max_errors: 3,
            concurrency: 3,
            query_timeout: Duration::from_secs(5),
            deadline: None,
        }
    }
}

/// Parameters of a replicating store invocation.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How many peers must confirm storage.
    pub n_replicas: usize,
    /// Store failures tolerated before the operation errors out.
    pub n_max_errors: usize,
    /// Maximum store requests in flight at once.
    pub concurrency: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            n_replicas: 3,
            n_max_errors: 3,
            concurrency: 3,
        }
    }
}

/// Everything a librarian needs tuned in one place.
#[derive(Debug, Clone)]
pub struct Config {
    /// Routing bucket capacity.
    pub k: usize,
    pub search: SearchConfig,
    pub store: StoreConfig,
    /// Per-RPC timeout applied by the client shim.
    pub rpc_timeout: Duration,
    /// Timeout for liveness pings when a full bucket considers eviction.
    pub healthcheck_timeout: Duration,
    /// How often stale buckets are refreshed with a random-target search.
    pub refresh_interval: Duration,
    /// How many peers to ask for when introducing ourselves.
    pub introduce_num_peers: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            search: SearchConfig::default(),
            store: StoreConfig::default(),
            rpc_timeout: Duration::from_secs(3),
            healthcheck_timeout: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(60 * 60),
            introduce_num_peers: DEFAULT_K as u32,
        }
    }
}
