use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::select;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    coordinator::Coordinator,
    dispatch::{Dispatch, LocalPool, WorkerPool},
};
use crate::{
    config::{available_units, BrokerConfig},
    error::Result,
    net::{
        endpoint,
        link::{Link, PendingCall},
        wire::{BrokerRequest, BrokerResponse, HaltResponse},
    },
    shutdown::ShutdownSignal,
};

/// The broker process: one coordinator behind a QUIC listener.
pub struct Broker {
    endpoint: quinn::Endpoint,
    coordinator: Arc<Coordinator>,
    exit: ShutdownSignal,
    drain_timeout: Duration,
}

impl Broker {
    /// Binds the listener and connects to every configured worker. Fails if
    /// any worker stays unreachable after the configured retries. With no
    /// workers configured, bands are stepped in-process instead.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        if config.worker_addrs.is_empty() {
            let units = available_units();
            info!(units, "no workers configured, stepping bands in-process");
            return Self::with_dispatch(config, Arc::new(LocalPool::new(units, 1)));
        }
        let endpoint = endpoint::server(config.listen_addr, config.keep_alive)?;
        let pool = WorkerPool::connect(&endpoint, &config).await?;
        Ok(Self::from_parts(endpoint, Arc::new(pool), &config))
    }

    /// Binds the listener but steps bands through `pool` instead of the
    /// configured workers.
    pub fn with_dispatch(config: BrokerConfig, pool: Arc<dyn Dispatch>) -> Result<Self> {
        let endpoint = endpoint::server(config.listen_addr, config.keep_alive)?;
        Ok(Self::from_parts(endpoint, pool, &config))
    }

    fn from_parts(
        endpoint: quinn::Endpoint,
        pool: Arc<dyn Dispatch>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            endpoint,
            coordinator: Arc::new(Coordinator::new(pool, config.pause_poll)),
            exit: ShutdownSignal::new(),
            drain_timeout: config.drain_timeout,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Fires once a kill has been answered. Triggering it from outside stops
    /// the listener the same way.
    pub fn exit_signal(&self) -> ShutdownSignal {
        self.exit.clone()
    }

    /// Answers clients until a kill arrives.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "broker accepting connections");
        loop {
            select! {
                incoming = self.endpoint.accept() => match incoming {
                    Some(in_progress) => {
                        tokio::spawn(handle_connection(
                            in_progress,
                            self.coordinator.clone(),
                            self.exit.clone(),
                        ));
                    }
                    None => break,
                },
                _ = self.exit.wait() => break,
            }
        }

        if tokio::time::timeout(self.drain_timeout, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("clients still connected after drain timeout");
        }
        self.endpoint.close(0u32.into(), b"killed");
        info!("broker stopped");
        Ok(())
    }
}

async fn handle_connection(
    in_progress: quinn::Connecting,
    coordinator: Arc<Coordinator>,
    exit: ShutdownSignal,
) {
    let link = match Link::accept(in_progress).await {
        Ok(link) => link,
        Err(e) => {
            warn!(error = %e, "failed to accept client");
            return;
        }
    };
    let span = debug_span!("client", remote = %link.remote_addr(), id = link.id());
    async move {
        loop {
            match link.next_call().await {
                Ok(Some(pending)) => {
                    let (coordinator, exit) = (coordinator.clone(), exit.clone());
                    // StartRun blocks for the whole run, so every call gets
                    // its own task
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_call(pending, coordinator, exit).await {
                                warn!(error = %e, "call failed");
                            }
                        }
                        .in_current_span(),
                    );
                }
                Ok(None) => {
                    debug!("client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "client link failed");
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
    coordinator: Arc<Coordinator>,
    exit: ShutdownSignal,
) -> Result<()> {
    let (request, responder) = pending.read::<BrokerRequest>().await?;
    let response = match request {
        BrokerRequest::StartRun(run) => match coordinator.start_run(run).await {
            Ok(done) => BrokerResponse::Run(done),
            Err(e) => {
                warn!(error = %e, "run failed");
                BrokerResponse::Failed(e.to_string())
            }
        },
        BrokerRequest::GetAliveCount => BrokerResponse::AliveCount(coordinator.alive_count().await),
        BrokerRequest::GetCurrentWorld => BrokerResponse::World(coordinator.current_world().await),
        BrokerRequest::HaltTurns => BrokerResponse::Halted(HaltResponse {
            completed_turns: coordinator.halt().await,
        }),
        BrokerRequest::PauseServer(pause) => {
            BrokerResponse::Pause(coordinator.pause(pause.pause).await)
        }
        BrokerRequest::KillClients => {
            coordinator.kill().await;
            let sent = responder.respond(&BrokerResponse::Killed).await;
            exit.trigger();
            return sent;
        }
    };
    responder.respond(&response).await
}
