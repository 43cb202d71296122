//! Fan-out of one turn's bands and fan-in of their results.

use std::{net::SocketAddr, time::Duration};

use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    config::{BrokerConfig, DEFAULT_CALL_TIMEOUT},
    error::{Error, Result},
    life,
    net::{
        link::Link,
        wire::{BandRequest, BandResponse, WorkerRequest, WorkerResponse},
    },
};

/// Something that can step one band per executor concurrently.
///
/// `dispatch` receives exactly [`executors`](Dispatch::executors) bands in
/// partition order and must return their results in that same order, no
/// matter which finished first. It only resolves once every band has been
/// answered; if any band failed the whole turn fails.
pub trait Dispatch: Send + Sync {
    fn executors(&self) -> usize;

    fn dispatch(&self, bands: Vec<BandRequest>) -> BoxFuture<'_, Result<Vec<BandResponse>>>;

    /// Tells every executor to stop. Failures are logged, not returned.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// An open link to one worker process.
pub struct WorkerHandle {
    index: usize,
    addr: SocketAddr,
    link: Link,
}

impl WorkerHandle {
    async fn apply(&self, band: BandRequest, timeout: Option<Duration>) -> Result<BandResponse> {
        let request = WorkerRequest::Band(band);
        let call = self.link.call::<_, WorkerResponse>(&request);
        let response = match timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| Error::WorkerTimedOut {
                    worker: self.index,
                    addr: self.addr,
                    after,
                })?,
            None => call.await,
        };
        match response.map_err(|e| self.failed(e))? {
            WorkerResponse::Band(rows) => Ok(rows),
            WorkerResponse::Failed(reason) => Err(self.failed(Error::Remote(reason))),
            WorkerResponse::ShutdownAck => {
                Err(self.failed(Error::UnexpectedResponse("ShutdownAck to a band")))
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        match self.link.call::<_, WorkerResponse>(&WorkerRequest::Shutdown).await? {
            WorkerResponse::ShutdownAck => Ok(()),
            WorkerResponse::Failed(reason) => Err(Error::Remote(reason)),
            WorkerResponse::Band(_) => Err(Error::UnexpectedResponse("band to a shutdown")),
        }
    }

    fn failed(&self, source: Error) -> Error {
        Error::WorkerCallFailed {
            worker: self.index,
            addr: self.addr,
            source: Box::new(source),
        }
    }
}

/// The fixed, ordered set of remote workers a broker was started with.
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
    call_timeout: Option<Duration>,
}

impl WorkerPool {
    /// Connects to every configured worker in order, retrying each a few
    /// times so workers and broker can be started together.
    pub async fn connect(endpoint: &quinn::Endpoint, config: &BrokerConfig) -> Result<Self> {
        if config.worker_addrs.is_empty() {
            return Err(Error::NoWorkers);
        }
        let mut handles = Vec::with_capacity(config.worker_addrs.len());
        for (index, &addr) in config.worker_addrs.iter().enumerate() {
            let link = connect_with_retry(endpoint, addr, config).await.map_err(|e| {
                Error::WorkerCallFailed {
                    worker: index,
                    addr,
                    source: Box::new(e),
                }
            })?;
            info!(worker = index, %addr, "connected to worker");
            handles.push(WorkerHandle { index, addr, link });
        }
        Ok(Self {
            handles,
            call_timeout: config.call_timeout,
        })
    }
}

async fn connect_with_retry(
    endpoint: &quinn::Endpoint,
    addr: SocketAddr,
    config: &BrokerConfig,
) -> Result<Link> {
    let mut attempt = 1;
    loop {
        match Link::connect(endpoint, addr).await {
            Ok(link) => return Ok(link),
            Err(e) if attempt < config.connect_attempts.max(1) => {
                warn!(%addr, attempt, error = %e, "worker unreachable, retrying");
                tokio::time::sleep(config.connect_backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

impl Dispatch for WorkerPool {
    fn executors(&self) -> usize {
        self.handles.len()
    }

    fn dispatch(&self, bands: Vec<BandRequest>) -> BoxFuture<'_, Result<Vec<BandResponse>>> {
        async move {
            let calls = self.handles.iter().zip(bands).map(|(handle, band)| {
                let span = debug_span!("band", worker = handle.index, rows = band.interior_rows);
                handle.apply(band, self.call_timeout).instrument(span)
            });
            // join_all keeps partition order whatever order replies arrive in
            join_all(calls).await.into_iter().collect()
        }
        .boxed()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        // a kill must finish even when band calls are allowed to wait forever
        let deadline = self.call_timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        async move {
            let calls = self.handles.iter().map(|handle| async move {
                match tokio::time::timeout(deadline, handle.shutdown()).await {
                    Ok(Ok(())) => debug!(worker = handle.index, "worker acknowledged shutdown"),
                    Ok(Err(e)) => {
                        warn!(worker = handle.index, error = %e, "worker shutdown failed")
                    }
                    Err(_) => warn!(
                        worker = handle.index,
                        addr = %handle.addr,
                        after = ?deadline,
                        "worker did not acknowledge shutdown in time"
                    ),
                }
                handle.link.close(b"killed");
            });
            join_all(calls).await;
        }
        .boxed()
    }
}

/// Steps bands on this process's blocking thread pool instead of remote
/// workers, `executors` at a time.
pub struct LocalPool {
    executors: usize,
    local_units: usize,
}

impl LocalPool {
    pub fn new(executors: usize, local_units: usize) -> Self {
        Self {
            executors: executors.max(1),
            local_units: local_units.max(1),
        }
    }
}

impl Dispatch for LocalPool {
    fn executors(&self) -> usize {
        self.executors
    }

    fn dispatch(&self, bands: Vec<BandRequest>) -> BoxFuture<'_, Result<Vec<BandResponse>>> {
        let units = self.local_units;
        async move {
            let tasks = bands.into_iter().map(|band| {
                tokio::task::spawn_blocking(move || {
                    life::apply(&band.band, band.interior_rows as usize, units)
                        .map(|rows| BandResponse { rows })
                })
            });
            join_all(tasks)
                .await
                .into_iter()
                .map(|joined| {
                    joined
                        .map_err(|e| Error::Remote(format!("band task failed: {e}")))
                        .and_then(|stepped| stepped)
                })
                .collect()
        }
        .boxed()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}
