//! A Game of Life engine on a torus, spread over a broker and a fixed set of
//! worker processes.
//!
//! The broker owns the grid. Each turn it cuts the grid into one horizontal
//! band per worker, sends every band along with the row above and below it,
//! and stitches the stepped interiors back together in partition order. A
//! driving client submits a grid with [`client::BrokerClient`] and can read,
//! pause, halt or kill the run while it is going.

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod grid;
pub mod life;
pub mod net;
pub mod partition;
pub mod shutdown;
pub mod worker;

pub use error::{Error, Result};
pub use grid::BitGrid;
