//! The broker owns the authoritative grid, splits every turn across its
//! workers and answers the driving client's control calls.

mod coordinator;
mod dispatch;
mod server;

pub use coordinator::{Coordinator, RunState};
pub use dispatch::{Dispatch, LocalPool, WorkerHandle, WorkerPool};
pub use server::Broker;
