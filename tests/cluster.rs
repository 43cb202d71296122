//! Brokers and workers talking over real QUIC connections on loopback.

use std::{net::SocketAddr, time::Duration};

use rand::{rngs::StdRng, SeedableRng};
use tokio::task::JoinHandle;
use torus::{
    broker::{Broker, RunState},
    client::BrokerClient,
    config::{BrokerConfig, WorkerConfig},
    life::step_torus,
    net::{
        endpoint,
        link::Link,
        loopback,
        wire::{
            BandRequest, BrokerRequest, BrokerResponse, RunRequest, WorkerRequest, WorkerResponse,
        },
    },
    partition::plan,
    worker::Worker,
    BitGrid, Error,
};

const WAIT: Duration = Duration::from_secs(20);

struct Cluster {
    broker: SocketAddr,
    workers: Vec<SocketAddr>,
    broker_task: JoinHandle<torus::Result<()>>,
    worker_tasks: Vec<JoinHandle<torus::Result<()>>>,
}

fn spawn_worker(units: usize) -> (SocketAddr, JoinHandle<torus::Result<()>>) {
    let worker = Worker::bind(
        WorkerConfig::builder()
            .listen_addr(loopback(0))
            .local_units(units)
            .drain_timeout(Duration::from_millis(200))
            .build(),
    )
    .unwrap();
    let addr = worker.local_addr().unwrap();
    (addr, tokio::spawn(worker.serve()))
}

async fn start_cluster(workers: usize, units: usize) -> Cluster {
    let (worker_addrs, worker_tasks): (Vec<_>, Vec<_>) =
        (0..workers).map(|_| spawn_worker(units)).unzip();
    let broker = Broker::bind(
        BrokerConfig::builder()
            .listen_addr(loopback(0))
            .worker_addrs(worker_addrs.clone())
            .pause_poll(Duration::from_millis(20))
            .drain_timeout(Duration::from_millis(200))
            .build(),
    )
    .await
    .unwrap();
    Cluster {
        broker: broker.local_addr().unwrap(),
        workers: worker_addrs,
        broker_task: tokio::spawn(broker.serve()),
        worker_tasks,
    }
}

/// Accepts the broker's link and every call on it, but never answers.
fn spawn_silent_worker() -> (SocketAddr, JoinHandle<()>) {
    let endpoint = endpoint::server(loopback(0), Duration::from_secs(5)).unwrap();
    let addr = endpoint.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut unanswered = Vec::new();
        while let Some(in_progress) = endpoint.accept().await {
            let Ok(link) = Link::accept(in_progress).await else {
                continue;
            };
            while let Ok(Some(pending)) = link.next_call().await {
                unanswered.push(pending);
            }
        }
    });
    (addr, task)
}

fn impatient_broker_config(worker_addrs: Vec<SocketAddr>) -> BrokerConfig {
    BrokerConfig::builder()
        .listen_addr(loopback(0))
        .worker_addrs(worker_addrs)
        .call_timeout(Some(Duration::from_millis(100)))
        .drain_timeout(Duration::from_millis(200))
        .build()
}

fn reference(grid: &BitGrid, turns: u64) -> BitGrid {
    (0..turns).fold(grid.clone(), |grid, _| step_torus(&grid))
}

fn glider(width: usize, height: usize) -> BitGrid {
    let mut grid = BitGrid::new(width, height).unwrap();
    for (x, y) in [(1, 0), (2, 1), (0, 2), (1, 2), (2, 2)] {
        grid.set(x, y, true);
    }
    grid
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn glider_trace_matches_the_reference() {
    let cluster = start_cluster(2, 1).await;
    let client = BrokerClient::connect(cluster.broker).await.unwrap();
    let grid = glider(8, 8);

    for turns in 1..=4 {
        let done = client.start_run(grid.clone(), turns).await.unwrap();
        let expected = reference(&grid, turns);
        assert_eq!(done.completed_turns, turns);
        assert_eq!(done.grid.alive_count(), expected.alive_count());
        assert_eq!(done.grid, expected);
    }

    // a glider crosses an 8x8 torus and lands where it started after 32 turns
    let lap = client.start_run(grid.clone(), 32).await.unwrap();
    assert_eq!(lap.grid, grid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn more_workers_than_rows_still_match_the_reference() {
    let cluster = start_cluster(5, 2).await;
    let client = BrokerClient::connect(cluster.broker).await.unwrap();
    let grid = BitGrid::random(16, 3, 0.5, &mut StdRng::seed_from_u64(11)).unwrap();
    let done = client.start_run(grid.clone(), 6).await.unwrap();
    assert_eq!(done.grid, reference(&grid, 6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshots_during_a_run_are_whole_generations() {
    let cluster = start_cluster(3, 2).await;
    let client = BrokerClient::connect(cluster.broker).await.unwrap();
    let grid = BitGrid::random(64, 48, 0.35, &mut StdRng::seed_from_u64(21)).unwrap();

    let run = tokio::spawn({
        let client = client.clone();
        let grid = grid.clone();
        async move { client.start_run(grid, 200).await }
    });

    let mut last_turn = 0;
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(15)).await;
        let snapshot = client.current_world().await.unwrap();
        assert!(snapshot.completed_turns >= last_turn);
        assert_eq!(snapshot.grid, reference(&grid, snapshot.completed_turns));
        last_turn = snapshot.completed_turns;
    }

    let done = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(done.completed_turns, 200);
    assert_eq!(done.grid, reference(&grid, 200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn halt_returns_the_last_merged_generation() {
    let cluster = start_cluster(2, 1).await;
    let client = BrokerClient::connect(cluster.broker).await.unwrap();
    let grid = BitGrid::random(32, 32, 0.4, &mut StdRng::seed_from_u64(31)).unwrap();

    let run = tokio::spawn({
        let client = client.clone();
        let grid = grid.clone();
        async move { client.start_run(grid, 1_000_000).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let halted_at = client.halt().await.unwrap();

    let done = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(done.completed_turns, halted_at);
    assert_eq!(done.grid, reference(&grid, halted_at));

    // the broker is idle again and takes a new run
    let again = client.start_run(grid.clone(), 2).await.unwrap();
    assert_eq!(again.grid, reference(&grid, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_run_holds_still_and_then_finishes() {
    let cluster = start_cluster(2, 2).await;
    let client = BrokerClient::connect(cluster.broker).await.unwrap();
    let grid = BitGrid::random(32, 32, 0.4, &mut StdRng::seed_from_u64(41)).unwrap();
    let turns = 2_000;

    let run = tokio::spawn({
        let client = client.clone();
        let grid = grid.clone();
        async move { client.start_run(grid, turns).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (paused, at) = client.toggle_pause().await.unwrap();
    assert!(paused);

    let first = client.alive_count().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = client.alive_count().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.completed_turns, at.completed_turns);

    let (paused, _) = client.toggle_pause().await.unwrap();
    assert!(!paused);
    let done = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(done.completed_turns, turns);
    assert_eq!(done.grid, reference(&grid, turns));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_runs_are_refused() {
    let cluster = start_cluster(2, 1).await;
    let client = BrokerClient::connect(cluster.broker).await.unwrap();
    let grid = BitGrid::random(32, 32, 0.4, &mut StdRng::seed_from_u64(51)).unwrap();

    let run = tokio::spawn({
        let client = client.clone();
        let grid = grid.clone();
        async move { client.start_run(grid, 1_000_000).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let refused = client.start_run(grid.clone(), 1).await;
    assert!(matches!(
        refused,
        Err(Error::Remote(reason)) if reason.contains("already in progress")
    ));

    client.halt().await.unwrap();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_grids_are_refused_at_the_broker() {
    let cluster = start_cluster(1, 1).await;
    let endpoint = endpoint::client(cluster.broker, Duration::from_secs(5)).unwrap();
    let link = Link::connect(&endpoint, cluster.broker).await.unwrap();

    let mut lying = RunRequest::new(BitGrid::new(16, 4).unwrap(), 1);
    lying.height = 6;
    let response = link
        .call::<_, BrokerResponse>(&BrokerRequest::StartRun(lying))
        .await
        .unwrap();
    assert!(matches!(response, BrokerResponse::Failed(reason) if reason.contains("invalid grid")));

    let client = BrokerClient::connect(cluster.broker).await.unwrap();
    assert_eq!(client.alive_count().await.unwrap().completed_turns, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kill_stops_the_run_the_workers_and_the_broker() {
    let cluster = start_cluster(3, 1).await;
    let client = BrokerClient::connect(cluster.broker).await.unwrap();
    let grid = BitGrid::random(32, 32, 0.4, &mut StdRng::seed_from_u64(61)).unwrap();

    let run = tokio::spawn({
        let client = client.clone();
        let grid = grid.clone();
        async move { client.start_run(grid, 1_000_000).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.kill().await.unwrap();

    let done = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(done.grid, reference(&grid, done.completed_turns));

    for worker in cluster.worker_tasks {
        tokio::time::timeout(WAIT, worker).await.unwrap().unwrap().unwrap();
    }
    tokio::time::timeout(WAIT, cluster.broker_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_worker_fails_the_turn_without_merging() {
    let cluster = start_cluster(2, 1).await;
    let client = BrokerClient::connect(cluster.broker).await.unwrap();
    let grid = BitGrid::random(16, 8, 0.4, &mut StdRng::seed_from_u64(71)).unwrap();

    let done = client.start_run(grid.clone(), 3).await.unwrap();
    assert_eq!(done.grid, reference(&grid, 3));

    // stop one worker behind the broker's back
    let addr = cluster.workers[0];
    let endpoint = endpoint::client(addr, Duration::from_secs(5)).unwrap();
    let link = Link::connect(&endpoint, addr).await.unwrap();
    let ack = link.call::<_, WorkerResponse>(&WorkerRequest::Shutdown).await.unwrap();
    assert_eq!(ack, WorkerResponse::ShutdownAck);
    let mut workers = cluster.worker_tasks.into_iter();
    tokio::time::timeout(WAIT, workers.next().unwrap())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let failed = client.start_run(grid.clone(), 3).await;
    assert!(matches!(failed, Err(Error::Remote(_))));
    let world = client.current_world().await.unwrap();
    assert_eq!(world.grid, grid);
    assert_eq!(world.completed_turns, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_answer_bands_and_shutdown_directly() {
    let (addr, task) = spawn_worker(3);
    let endpoint = endpoint::client(addr, Duration::from_secs(5)).unwrap();
    let link = Link::connect(&endpoint, addr).await.unwrap();

    let grid = BitGrid::random(24, 10, 0.5, &mut StdRng::seed_from_u64(81)).unwrap();
    let expected = step_torus(&grid);
    for part in plan(grid.height(), 3) {
        let request = WorkerRequest::Band(BandRequest {
            interior_rows: part.len() as u32,
            width: 24,
            band: part.band(&grid).unwrap(),
        });
        match link.call::<_, WorkerResponse>(&request).await.unwrap() {
            WorkerResponse::Band(response) => {
                assert_eq!(response.rows.as_bytes(), expected.rows(part.start, part.end))
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    let wrong = WorkerRequest::Band(BandRequest {
        interior_rows: 9,
        width: 24,
        band: BitGrid::new(24, 4).unwrap(),
    });
    assert!(matches!(
        link.call::<_, WorkerResponse>(&wrong).await.unwrap(),
        WorkerResponse::Failed(_)
    ));

    let ack = link.call::<_, WorkerResponse>(&WorkerRequest::Shutdown).await.unwrap();
    assert_eq!(ack, WorkerResponse::ShutdownAck);
    link.close(b"done");
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn band_past_its_deadline_fails_the_turn_and_keeps_the_grid() {
    let (silent, silent_task) = spawn_silent_worker();
    let (live, _live_task) = spawn_worker(1);
    let broker = Broker::bind(impatient_broker_config(vec![live, silent]))
        .await
        .unwrap();
    let addr = broker.local_addr().unwrap();
    let coordinator = broker.coordinator();
    let _broker_task = tokio::spawn(broker.serve());

    let client = BrokerClient::connect(addr).await.unwrap();
    let grid = BitGrid::random(16, 8, 0.4, &mut StdRng::seed_from_u64(91)).unwrap();
    let failed = tokio::time::timeout(WAIT, client.start_run(grid.clone(), 3))
        .await
        .unwrap();
    assert!(matches!(
        failed,
        Err(Error::Remote(reason)) if reason.contains("did not answer within")
    ));
    assert_eq!(coordinator.state().await, RunState::Halted);

    let world = client.current_world().await.unwrap();
    assert_eq!(world.grid, grid);
    assert_eq!(world.completed_turns, 0);
    silent_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kill_finishes_when_a_worker_never_acknowledges() {
    let (silent, silent_task) = spawn_silent_worker();
    let (live, live_task) = spawn_worker(1);
    let broker = Broker::bind(impatient_broker_config(vec![silent, live]))
        .await
        .unwrap();
    let addr = broker.local_addr().unwrap();
    let broker_task = tokio::spawn(broker.serve());

    let client = BrokerClient::connect(addr).await.unwrap();
    tokio::time::timeout(WAIT, client.kill()).await.unwrap().unwrap();

    tokio::time::timeout(WAIT, live_task).await.unwrap().unwrap().unwrap();
    tokio::time::timeout(WAIT, broker_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    silent_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_workers_steps_bands_inside_the_broker() {
    let broker = Broker::bind(
        BrokerConfig::builder()
            .listen_addr(loopback(0))
            .worker_addrs(vec![])
            .drain_timeout(Duration::from_millis(200))
            .build(),
    )
    .await
    .unwrap();
    let addr = broker.local_addr().unwrap();
    let _broker_task = tokio::spawn(broker.serve());

    let client = BrokerClient::connect(addr).await.unwrap();
    let grid = BitGrid::random(40, 24, 0.3, &mut StdRng::seed_from_u64(101)).unwrap();
    let done = client.start_run(grid.clone(), 12).await.unwrap();
    assert_eq!(done.completed_turns, 12);
    assert_eq!(done.grid, reference(&grid, 12));
}
