//! Process configuration for brokers and workers.

use std::{env, net::SocketAddr, num::NonZeroUsize, thread, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    net::{loopback, BROKER_PORT, DEFAULT_WORKER_COUNT, FIRST_WORKER_PORT},
};

/// Environment variable holding a comma-separated worker address list.
pub const WORKERS_ENV: &str = "TORUS_WORKERS";

/// How long a paused run sleeps between checks when no resume arrives.
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_millis(500);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, TypedBuilder)]
pub struct BrokerConfig {
    /// Where driving clients reach the broker.
    #[builder(default = loopback(BROKER_PORT))]
    pub listen_addr: SocketAddr,
    /// Workers in partition order. Fixed for the broker's lifetime.
    #[builder(default = default_worker_addrs())]
    pub worker_addrs: Vec<SocketAddr>,
    /// Deadline on each band call; `None` waits forever. A call that misses
    /// it fails the turn. Shutdown calls made by a kill are always bounded,
    /// by [`DEFAULT_CALL_TIMEOUT`] when this is `None`.
    #[builder(default = Some(DEFAULT_CALL_TIMEOUT))]
    pub call_timeout: Option<Duration>,
    /// Upper bound on how long a paused run goes without rechecking its
    /// state, in case a resume notification is missed.
    #[builder(default = DEFAULT_PAUSE_POLL)]
    pub pause_poll: Duration,
    /// Attempts made to reach each worker at startup.
    #[builder(default = 5)]
    pub connect_attempts: u32,
    #[builder(default = Duration::from_millis(500))]
    pub connect_backoff: Duration,
    #[builder(default = DEFAULT_KEEP_ALIVE)]
    pub keep_alive: Duration,
    /// Time given to connected peers to collect their last responses before
    /// the listener closes.
    #[builder(default = Duration::from_secs(1))]
    pub drain_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct WorkerConfig {
    #[builder(default = loopback(FIRST_WORKER_PORT))]
    pub listen_addr: SocketAddr,
    /// Local execution units each band is split across.
    #[builder(default = available_units())]
    pub local_units: usize,
    #[builder(default = DEFAULT_KEEP_ALIVE)]
    pub keep_alive: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// `127.0.0.1:8031` through `127.0.0.1:8034`.
pub fn default_worker_addrs() -> Vec<SocketAddr> {
    (0..DEFAULT_WORKER_COUNT)
        .map(|i| loopback(FIRST_WORKER_PORT + i))
        .collect()
}

/// Parses a comma-separated list of socket addresses.
pub fn parse_worker_addrs(list: &str) -> Result<Vec<SocketAddr>> {
    list.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(|addr| {
            addr.parse()
                .map_err(|_| Error::InvalidAddress(addr.to_owned()))
        })
        .collect()
}

/// Worker addresses from [`WORKERS_ENV`], if set.
pub fn worker_addrs_from_env() -> Result<Option<Vec<SocketAddr>>> {
    match env::var(WORKERS_ENV) {
        Ok(list) => parse_worker_addrs(&list).map(Some),
        Err(_) => Ok(None),
    }
}

/// Execution units this machine offers, at least one.
pub fn available_units() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
