use std::{net::SocketAddr, time::Duration};

use clap::{Parser, Subcommand};
use rand::{rngs::StdRng, SeedableRng};
use torus::{
    broker::Broker,
    client::BrokerClient,
    config::{self, BrokerConfig, WorkerConfig},
    net::{loopback, BROKER_PORT, FIRST_WORKER_PORT},
    shutdown::ShutdownSignal,
    worker::Worker,
    BitGrid,
};
use tracing::info;

/// Distributed Game of Life on a torus.
#[derive(Parser)]
#[command(name = "torus")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve bands to a broker.
    Worker {
        #[arg(long, default_value_t = loopback(FIRST_WORKER_PORT))]
        listen: SocketAddr,
        /// Execution units each band is split across (default: all cores).
        #[arg(long)]
        units: Option<usize>,
    },
    /// Coordinate runs across a fixed list of workers.
    Broker {
        #[arg(long, default_value_t = loopback(BROKER_PORT))]
        listen: SocketAddr,
        /// Comma-separated worker addresses, in partition order. Falls back
        /// to TORUS_WORKERS, then to the four default loopback ports.
        #[arg(long)]
        workers: Option<String>,
        /// Seconds to wait for a band before failing the turn; 0 waits forever.
        #[arg(long, default_value_t = 30)]
        call_timeout: u64,
    },
    /// Submit a grid and wait for the run to finish.
    Run {
        #[arg(long, default_value_t = loopback(BROKER_PORT))]
        broker: SocketAddr,
        #[arg(long, default_value_t = 512)]
        width: usize,
        #[arg(long, default_value_t = 512)]
        height: usize,
        #[arg(long, default_value_t = 100)]
        turns: u64,
        /// Seed for the random starting grid.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Start from a single glider in the top-left corner instead.
        #[arg(long)]
        glider: bool,
    },
    /// Stop the current run after the turn in flight.
    Halt {
        #[arg(long, default_value_t = loopback(BROKER_PORT))]
        broker: SocketAddr,
    },
    Pause {
        #[arg(long, default_value_t = loopback(BROKER_PORT))]
        broker: SocketAddr,
    },
    Resume {
        #[arg(long, default_value_t = loopback(BROKER_PORT))]
        broker: SocketAddr,
    },
    /// Shut down the broker and every worker.
    Kill {
        #[arg(long, default_value_t = loopback(BROKER_PORT))]
        broker: SocketAddr,
    },
    /// Print the live cell count and completed turns.
    Alive {
        #[arg(long, default_value_t = loopback(BROKER_PORT))]
        broker: SocketAddr,
    },
}

const GLIDER: [(usize, usize); 5] = [(1, 0), (2, 1), (0, 2), (1, 2), (2, 2)];

/// Lets an interrupted listener drain like a killed one.
fn stop_on_ctrl_c(signal: ShutdownSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            signal.trigger();
        }
    });
}

#[tokio::main]
async fn main() -> torus::Result<()> {
    tracing_subscriber::fmt::init();

    match Args::parse().command {
        Command::Worker { listen, units } => {
            let config = WorkerConfig::builder().listen_addr(listen).build();
            let config = match units {
                Some(units) => WorkerConfig {
                    local_units: units,
                    ..config
                },
                None => config,
            };
            let worker = Worker::bind(config)?;
            stop_on_ctrl_c(worker.shutdown_signal());
            worker.serve().await?;
        }
        Command::Broker {
            listen,
            workers,
            call_timeout,
        } => {
            let worker_addrs = match workers {
                Some(list) => config::parse_worker_addrs(&list)?,
                None => {
                    config::worker_addrs_from_env()?.unwrap_or_else(config::default_worker_addrs)
                }
            };
            let config = BrokerConfig::builder()
                .listen_addr(listen)
                .worker_addrs(worker_addrs)
                .call_timeout((call_timeout > 0).then(|| Duration::from_secs(call_timeout)))
                .build();
            let broker = Broker::bind(config).await?;
            stop_on_ctrl_c(broker.exit_signal());
            broker.serve().await?;
        }
        Command::Run {
            broker,
            width,
            height,
            turns,
            seed,
            glider,
        } => {
            let grid = if glider {
                BitGrid::from_fn(width, height, |x, y| GLIDER.contains(&(x, y)))?
            } else {
                BitGrid::random(width, height, 0.25, &mut StdRng::seed_from_u64(seed))?
            };
            let client = BrokerClient::connect(broker).await?;
            info!(width, height, turns, "submitting grid");
            let done = client.start_run(grid, turns).await?;
            println!(
                "{} cells alive after {} turns",
                done.grid.alive_count(),
                done.completed_turns
            );
            client.close().await;
        }
        Command::Halt { broker } => {
            let client = BrokerClient::connect(broker).await?;
            println!("halted after {} turns", client.halt().await?);
            client.close().await;
        }
        Command::Pause { broker } => {
            let client = BrokerClient::connect(broker).await?;
            println!("paused at turn {}", client.pause().await?.completed_turns);
            client.close().await;
        }
        Command::Resume { broker } => {
            let client = BrokerClient::connect(broker).await?;
            println!("resumed at turn {}", client.resume().await?.completed_turns);
            client.close().await;
        }
        Command::Kill { broker } => {
            let client = BrokerClient::connect(broker).await?;
            client.kill().await?;
            println!("killed");
        }
        Command::Alive { broker } => {
            let client = BrokerClient::connect(broker).await?;
            let alive = client.alive_count().await?;
            println!("{} cells alive after {} turns", alive.count, alive.completed_turns);
            client.close().await;
        }
    }
    Ok(())
}
