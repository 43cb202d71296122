//! The broker's authoritative grid and the turn loop that advances it.
//!
//! The grid, the turn counter and the run state form one record behind one
//! lock. A turn holds that lock from planning until its merge, so every
//! control call, reads included, sees a fully merged generation. The lock is
//! fair, which lets calls queued during a turn in before the next one starts.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::{
    select,
    sync::{Mutex, Notify},
};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::dispatch::Dispatch;
use crate::{
    error::{Error, Result},
    grid::BitGrid,
    net::wire::{
        AliveCountResponse, BandRequest, PauseToggleResponse, RunRequest, RunResponse,
        WorldSnapshotResponse,
    },
    partition::plan,
    shutdown::ShutdownSignal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run in progress.
    Idle,
    Running,
    /// Suspended at a turn boundary until resumed.
    Paused,
    /// Stopped early; the grid holds the last merged generation.
    Halted,
    /// Terminal. Workers have been told to shut down.
    Killed,
}

impl RunState {
    fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }
}

struct Shared {
    grid: BitGrid,
    completed_turns: u64,
    target_turns: u64,
    state: RunState,
}

pub struct Coordinator {
    shared: Mutex<Shared>,
    /// Wakes a paused run when its state changes.
    state_changed: Notify,
    /// Fired by [`kill`](Coordinator::kill); abandons any turn in flight.
    killed: ShutdownSignal,
    pool: Arc<dyn Dispatch>,
    pause_poll: Duration,
}

/// What a turn boundary decided.
enum Boundary {
    Step,
    Wait,
    Stop,
}

impl Coordinator {
    pub fn new(pool: Arc<dyn Dispatch>, pause_poll: Duration) -> Self {
        Self {
            shared: Mutex::new(Shared {
                grid: BitGrid::default(),
                completed_turns: 0,
                target_turns: 0,
                state: RunState::Idle,
            }),
            state_changed: Notify::new(),
            killed: ShutdownSignal::new(),
            pool,
            pause_poll,
        }
    }

    pub async fn state(&self) -> RunState {
        self.shared.lock().await.state
    }

    /// Installs the request's grid and steps it until the turn budget is spent
    /// or the run is halted or killed. Returns the last merged generation.
    ///
    /// A failed band call fails its turn: nothing from that turn is merged,
    /// the run is halted and the error is returned. The previous generation
    /// stays readable through [`current_world`](Coordinator::current_world).
    pub async fn start_run(&self, request: RunRequest) -> Result<RunResponse> {
        request.validate()?;
        {
            let mut shared = self.shared.lock().await;
            if shared.state == RunState::Killed || self.killed.is_triggered() {
                return Err(Error::ShutdownInProgress);
            }
            if shared.state.is_active() {
                return Err(Error::RunInProgress {
                    completed_turns: shared.completed_turns,
                });
            }
            shared.grid = request.grid;
            shared.completed_turns = 0;
            shared.target_turns = request.turns;
            shared.state = RunState::Running;
        }
        info!(
            turns = request.turns,
            width = request.width,
            height = request.height,
            executors = self.pool.executors(),
            "run started"
        );

        loop {
            let mut shared = self.shared.lock().await;
            match self.boundary(&mut shared) {
                Boundary::Stop => {
                    info!(
                        completed_turns = shared.completed_turns,
                        state = ?shared.state,
                        "run stopped"
                    );
                    return Ok(RunResponse {
                        grid: shared.grid.clone(),
                        completed_turns: shared.completed_turns,
                    });
                }
                Boundary::Wait => {
                    let notified = self.state_changed.notified();
                    tokio::pin!(notified);
                    // registered before the lock is released so a resume
                    // between here and the select cannot be missed
                    notified.as_mut().enable();
                    drop(shared);
                    select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(self.pause_poll) => {}
                        _ = self.killed.wait() => {}
                    }
                }
                Boundary::Step => {
                    let turn = shared.completed_turns + 1;
                    // a panicking turn must still leave the run in a settled state
                    let step = AssertUnwindSafe(self.step(&shared.grid))
                        .catch_unwind()
                        .instrument(debug_span!("turn", turn));
                    let stepped = select! {
                        stepped = step => stepped.unwrap_or(Err(Error::TurnPanicked { turn })),
                        _ = self.killed.wait() => Err(Error::Killed {
                            completed_turns: shared.completed_turns,
                        }),
                    };
                    match stepped {
                        Ok(next) => {
                            shared.grid = next;
                            shared.completed_turns = turn;
                        }
                        Err(Error::Killed { completed_turns }) => {
                            debug!(completed_turns, "turn abandoned by kill");
                            shared.state = RunState::Killed;
                        }
                        Err(e) => {
                            warn!(
                                turn,
                                transport = e.is_transport(),
                                error = %e,
                                "turn failed, halting run"
                            );
                            shared.state = RunState::Halted;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Decides what the loop does at a turn boundary.
    fn boundary(&self, shared: &mut Shared) -> Boundary {
        if self.killed.is_triggered() {
            shared.state = RunState::Killed;
        }
        match shared.state {
            RunState::Running if shared.completed_turns >= shared.target_turns => {
                shared.state = RunState::Idle;
                Boundary::Stop
            }
            RunState::Running => Boundary::Step,
            RunState::Paused => Boundary::Wait,
            RunState::Idle | RunState::Halted | RunState::Killed => Boundary::Stop,
        }
    }

    /// Plans, fans out, joins and stitches one generation. Leaves `grid`
    /// untouched; the caller swaps the result in.
    async fn step(&self, grid: &BitGrid) -> Result<BitGrid> {
        let parts = plan(grid.height(), self.pool.executors());
        let bands = parts
            .iter()
            .map(|part| {
                Ok(BandRequest {
                    interior_rows: part.len() as u32,
                    width: grid.width() as u32,
                    band: part.band(grid)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let replies = self.pool.dispatch(bands).await?;
        if replies.len() != parts.len() {
            return Err(Error::UnexpectedResponse(
                "band count differs from partition count",
            ));
        }

        let mut next = grid.clone();
        for (part, reply) in parts.iter().zip(replies) {
            let rows = reply.rows;
            // storage must agree with the header, not just the header with the part
            let fits = rows.height() == part.len()
                && rows.width() == grid.width()
                && rows.validate().is_ok();
            if !fits {
                return Err(Error::PartitionMismatch {
                    partition: part.index,
                    expected: part.len(),
                    actual: rows.height(),
                    expected_width: grid.width(),
                    actual_width: rows.width(),
                });
            }
            next.replace_rows(part.start, rows.as_bytes());
        }
        Ok(next)
    }

    pub async fn alive_count(&self) -> AliveCountResponse {
        let shared = self.shared.lock().await;
        AliveCountResponse {
            count: shared.grid.alive_count(),
            completed_turns: shared.completed_turns,
        }
    }

    pub async fn current_world(&self) -> WorldSnapshotResponse {
        let shared = self.shared.lock().await;
        WorldSnapshotResponse {
            grid: shared.grid.clone(),
            completed_turns: shared.completed_turns,
        }
    }

    /// `true` suspends a running run at its next turn boundary, `false`
    /// resumes a paused one. Anything else is left as it is.
    pub async fn pause(&self, pause: bool) -> PauseToggleResponse {
        let mut shared = self.shared.lock().await;
        match (pause, shared.state) {
            (true, RunState::Running) => shared.state = RunState::Paused,
            (false, RunState::Paused) => shared.state = RunState::Running,
            _ => {}
        }
        debug!(
            state = ?shared.state,
            completed_turns = shared.completed_turns,
            "pause set to {pause}"
        );
        self.state_changed.notify_waiters();
        PauseToggleResponse {
            completed_turns: shared.completed_turns,
        }
    }

    /// Stops the run once the turn in flight, if any, has merged. Returns the
    /// number of merged turns.
    pub async fn halt(&self) -> u64 {
        let mut shared = self.shared.lock().await;
        if shared.state.is_active() {
            shared.state = RunState::Halted;
            info!(completed_turns = shared.completed_turns, "run halted");
        }
        self.state_changed.notify_waiters();
        shared.completed_turns
    }

    /// Abandons any turn in flight, stops the run for good and tells every
    /// worker to shut down.
    pub async fn kill(&self) {
        self.killed.trigger();
        {
            let mut shared = self.shared.lock().await;
            shared.state = RunState::Killed;
            info!(completed_turns = shared.completed_turns, "killed");
        }
        self.state_changed.notify_waiters();
        self.pool.shutdown().await;
    }
}
