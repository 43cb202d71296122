//! Typed handle a driving client uses to talk to a broker.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::debug;

use crate::{
    config::DEFAULT_KEEP_ALIVE,
    error::{Error, Result},
    grid::BitGrid,
    net::{
        endpoint,
        link::Link,
        wire::{
            AliveCountResponse, BrokerRequest, BrokerResponse, PauseRequest, PauseToggleResponse,
            RunRequest, RunResponse, WorldSnapshotResponse,
        },
    },
};

/// A connection to one broker. Clones share the connection, so a run can be
/// started from one task while another pauses, polls or halts it.
#[derive(Clone)]
pub struct BrokerClient {
    endpoint: quinn::Endpoint,
    link: Link,
    /// What this client last asked for, used by [`toggle_pause`](Self::toggle_pause).
    paused: Arc<AtomicBool>,
}

impl BrokerClient {
    pub async fn connect(broker: SocketAddr) -> Result<Self> {
        let endpoint = endpoint::client(broker, DEFAULT_KEEP_ALIVE)?;
        let link = Link::connect(&endpoint, broker).await?;
        debug!(%broker, "connected to broker");
        Ok(Self {
            endpoint,
            link,
            paused: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn call(&self, request: BrokerRequest) -> Result<BrokerResponse> {
        match self.link.call::<_, BrokerResponse>(&request).await? {
            BrokerResponse::Failed(reason) => Err(Error::Remote(reason)),
            response => Ok(response),
        }
    }

    /// Submits `grid` and waits until the run completes, is halted or is
    /// killed.
    pub async fn start_run(&self, grid: BitGrid, turns: u64) -> Result<RunResponse> {
        let request = RunRequest::new(grid, turns);
        request.validate()?;
        match self.call(BrokerRequest::StartRun(request)).await? {
            BrokerResponse::Run(done) => Ok(done),
            _ => Err(Error::UnexpectedResponse("expected a run result")),
        }
    }

    pub async fn alive_count(&self) -> Result<AliveCountResponse> {
        match self.call(BrokerRequest::GetAliveCount).await? {
            BrokerResponse::AliveCount(count) => Ok(count),
            _ => Err(Error::UnexpectedResponse("expected an alive count")),
        }
    }

    pub async fn current_world(&self) -> Result<WorldSnapshotResponse> {
        match self.call(BrokerRequest::GetCurrentWorld).await? {
            BrokerResponse::World(world) => Ok(world),
            _ => Err(Error::UnexpectedResponse("expected a world snapshot")),
        }
    }

    pub async fn pause(&self) -> Result<PauseToggleResponse> {
        self.set_paused(true).await
    }

    pub async fn resume(&self) -> Result<PauseToggleResponse> {
        self.set_paused(false).await
    }

    /// Resumes if this client last paused the run, pauses otherwise. Returns
    /// whether the run is now meant to be paused.
    pub async fn toggle_pause(&self) -> Result<(bool, PauseToggleResponse)> {
        let pause = !self.paused.load(Ordering::Acquire);
        let response = self.set_paused(pause).await?;
        Ok((pause, response))
    }

    async fn set_paused(&self, pause: bool) -> Result<PauseToggleResponse> {
        match self.call(BrokerRequest::PauseServer(PauseRequest { pause })).await? {
            BrokerResponse::Pause(toggled) => {
                self.paused.store(pause, Ordering::Release);
                Ok(toggled)
            }
            _ => Err(Error::UnexpectedResponse("expected a pause acknowledgement")),
        }
    }

    /// Stops the run after the turn in flight. Returns the merged turn count.
    pub async fn halt(&self) -> Result<u64> {
        match self.call(BrokerRequest::HaltTurns).await? {
            BrokerResponse::Halted(halted) => Ok(halted.completed_turns),
            _ => Err(Error::UnexpectedResponse("expected a halt acknowledgement")),
        }
    }

    /// Tears the whole deployment down: the run, every worker and the broker.
    pub async fn kill(&self) -> Result<()> {
        match self.call(BrokerRequest::KillClients).await? {
            BrokerResponse::Killed => Ok(()),
            _ => Err(Error::UnexpectedResponse("expected a kill acknowledgement")),
        }
    }

    /// Closes the connection and waits for the broker to notice.
    pub async fn close(self) {
        self.link.close(b"bye");
        self.endpoint.wait_idle().await;
    }
}
