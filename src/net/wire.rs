//! Messages exchanged between driving clients, the broker and workers.
//!
//! Every remote call is one request frame answered by one response frame on
//! its own bidirectional stream. Payloads are validated rkyv archives.

use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    grid::BitGrid,
};

/// Client to broker requests.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum BrokerRequest {
    /// Runs turns until the budget is spent or the run is halted. The reply
    /// only arrives once the run stops.
    StartRun(RunRequest),
    GetAliveCount,
    GetCurrentWorld,
    HaltTurns,
    PauseServer(PauseRequest),
    /// Halts, shuts every worker down and then stops the broker.
    KillClients,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum BrokerResponse {
    Run(RunResponse),
    AliveCount(AliveCountResponse),
    World(WorldSnapshotResponse),
    Pause(PauseToggleResponse),
    Halted(HaltResponse),
    Killed,
    Failed(String),
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RunRequest {
    pub turns: u64,
    pub width: u32,
    pub height: u32,
    pub grid: BitGrid,
}

impl RunRequest {
    pub fn new(grid: BitGrid, turns: u64) -> Self {
        Self {
            turns,
            width: grid.width() as u32,
            height: grid.height() as u32,
            grid,
        }
    }

    /// Rejects grids the engine cannot step: widths that are not a whole
    /// number of bytes, empty grids and dimensions that disagree with the
    /// grid itself.
    pub fn validate(&self) -> Result<()> {
        self.grid.validate()?;
        if self.width as usize != self.grid.width() || self.height as usize != self.grid.height() {
            return Err(Error::invalid_grid(format!(
                "request says {}x{} but carries a {}x{} grid",
                self.width,
                self.height,
                self.grid.width(),
                self.grid.height()
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid_grid("grid has no cells"));
        }
        Ok(())
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RunResponse {
    pub grid: BitGrid,
    pub completed_turns: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct AliveCountResponse {
    pub count: u64,
    pub completed_turns: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct WorldSnapshotResponse {
    pub grid: BitGrid,
    pub completed_turns: u64,
}

/// `pause: true` suspends the run at the next turn boundary, `false` resumes
/// it.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct PauseRequest {
    pub pause: bool,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct PauseToggleResponse {
    pub completed_turns: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct HaltResponse {
    pub completed_turns: u64,
}

/// Broker to worker requests.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum WorkerRequest {
    Band(BandRequest),
    Shutdown,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum WorkerResponse {
    Band(BandResponse),
    ShutdownAck,
    Failed(String),
}

/// One partition's rows plus a halo row on either side.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct BandRequest {
    pub interior_rows: u32,
    pub width: u32,
    /// `interior_rows + 2` rows.
    pub band: BitGrid,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct BandResponse {
    /// `interior_rows` rows.
    pub rows: BitGrid,
}

/// A message that can travel inside a frame.
pub trait WireMessage: Sized {
    fn encode(&self) -> Result<AlignedVec>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

macro_rules! wire_message {
    ($($message:ty),* $(,)?) => {$(
        impl WireMessage for $message {
            fn encode(&self) -> Result<AlignedVec> {
                rkyv::to_bytes::<_, 1024>(self).map_err(|_| Error::CouldNotEncodeMessage)
            }

            fn decode(bytes: &[u8]) -> Result<Self> {
                // archives must be read from an aligned buffer
                let mut aligned = AlignedVec::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                rkyv::from_bytes::<$message>(&aligned).map_err(|_| Error::CouldNotDecodeMessage)
            }
        }
    )*};
}

wire_message!(BrokerRequest, BrokerResponse, WorkerRequest, WorkerResponse);
