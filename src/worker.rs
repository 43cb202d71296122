//! Worker processes: step whatever band the broker sends and send the
//! interior back.
//!
//! Workers keep no state between calls apart from the shutdown latch. Each
//! band is re-split across the worker's own execution units with the same
//! plan the broker uses across workers.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{select, sync::Semaphore};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    config::WorkerConfig,
    error::{Error, Result},
    life,
    net::{
        endpoint,
        link::{Link, PendingCall},
        wire::{BandRequest, BandResponse, WorkerRequest, WorkerResponse},
    },
    shutdown::ShutdownSignal,
};

/// Band calls a worker will run at once. Shutdown waits for all of them.
const IN_FLIGHT_LIMIT: u32 = 1024;

/// Applies the Life rule to bands.
#[derive(Debug, Clone)]
pub struct WorkerService {
    local_units: usize,
}

impl WorkerService {
    pub fn new(local_units: usize) -> Self {
        Self {
            local_units: local_units.max(1),
        }
    }

    pub fn local_units(&self) -> usize {
        self.local_units
    }

    /// Steps a band and returns its updated interior rows.
    pub fn apply(&self, request: &BandRequest) -> Result<BandResponse> {
        if request.band.width() != request.width as usize {
            return Err(Error::invalid_grid(format!(
                "band is {} cells wide, request says {}",
                request.band.width(),
                request.width
            )));
        }
        let rows = life::apply(&request.band, request.interior_rows as usize, self.local_units)?;
        Ok(BandResponse { rows })
    }
}

/// A worker bound to its listen address, ready to [`serve`](Worker::serve).
pub struct Worker {
    endpoint: quinn::Endpoint,
    service: Arc<WorkerService>,
    shutdown: ShutdownSignal,
    in_flight: Arc<Semaphore>,
    drain_timeout: Duration,
}

impl Worker {
    /// Binds the listener. Must be called inside a tokio runtime.
    pub fn bind(config: WorkerConfig) -> Result<Self> {
        let endpoint = endpoint::server(config.listen_addr, config.keep_alive)?;
        Ok(Self {
            endpoint,
            service: Arc::new(WorkerService::new(config.local_units)),
            shutdown: ShutdownSignal::new(),
            in_flight: Arc::new(Semaphore::new(IN_FLIGHT_LIMIT as usize)),
            drain_timeout: config.drain_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Fires when the worker has been told to shut down.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Accepts connections until a shutdown call arrives, then lets in-flight
    /// bands finish before closing the listener.
    pub async fn serve(self) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            units = self.service.local_units(),
            "worker accepting connections"
        );
        loop {
            select! {
                incoming = self.endpoint.accept() => match incoming {
                    Some(in_progress) => {
                        tokio::spawn(handle_connection(
                            in_progress,
                            self.service.clone(),
                            self.shutdown.clone(),
                            self.in_flight.clone(),
                        ));
                    }
                    None => break,
                },
                _ = self.shutdown.wait() => break,
            }
        }

        info!("worker no longer accepting connections");
        if let Ok(all) = self.in_flight.acquire_many(IN_FLIGHT_LIMIT).await {
            all.forget();
        }
        self.in_flight.close();
        if tokio::time::timeout(self.drain_timeout, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("peers still connected after drain timeout");
        }
        self.endpoint.close(0u32.into(), b"shutdown");
        info!("worker stopped");
        Ok(())
    }
}

async fn handle_connection(
    in_progress: quinn::Connecting,
    service: Arc<WorkerService>,
    shutdown: ShutdownSignal,
    in_flight: Arc<Semaphore>,
) {
    let link = match Link::accept(in_progress).await {
        Ok(link) => link,
        Err(e) => {
            warn!(error = %e, "failed to accept connection");
            return;
        }
    };
    let span = debug_span!("connection", remote = %link.remote_addr());
    async move {
        loop {
            match link.next_call().await {
                Ok(Some(pending)) => {
                    let (service, shutdown, in_flight) =
                        (service.clone(), shutdown.clone(), in_flight.clone());
                    tokio::spawn(
                        async move {
                            let handled = handle_call(pending, service, shutdown, in_flight).await;
                            if let Err(e) = handled {
                                warn!(error = %e, "call failed");
                            }
                        }
                        .in_current_span(),
                    );
                }
                Ok(None) => {
                    debug!("peer closed link");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "link failed");
                    break;
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn handle_call(
    pending: PendingCall,
    service: Arc<WorkerService>,
    shutdown: ShutdownSignal,
    in_flight: Arc<Semaphore>,
) -> Result<()> {
    let (request, responder) = pending.read::<WorkerRequest>().await?;
    match request {
        WorkerRequest::Band(band) => {
            let permit = match in_flight.acquire_owned().await {
                Ok(permit) if !shutdown.is_triggered() => permit,
                _ => {
                    let refusal = WorkerResponse::Failed(Error::ShutdownInProgress.to_string());
                    return responder.respond(&refusal).await;
                }
            };
            debug!(rows = band.interior_rows, width = band.width, "stepping band");
            let stepped = tokio::task::spawn_blocking(move || service.apply(&band)).await;
            let response = match stepped {
                Ok(Ok(rows)) => WorkerResponse::Band(rows),
                Ok(Err(e)) => {
                    warn!(error = %e, "rejected band");
                    WorkerResponse::Failed(e.to_string())
                }
                Err(e) => WorkerResponse::Failed(format!("band task failed: {e}")),
            };
            let sent = responder.respond(&response).await;
            drop(permit);
            sent
        }
        WorkerRequest::Shutdown => {
            info!("shutdown requested");
            let sent = responder.respond(&WorkerResponse::ShutdownAck).await;
            shutdown.trigger();
            sent
        }
    }
}
