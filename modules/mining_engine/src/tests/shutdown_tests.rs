// modules/mining_engine/src/tests/shutdown_tests.rs
use super::stub_pool::{self, LowNonceHasher};
use crate::shutdown::{LiveConnection, ShutdownCoordinator, ShutdownPhase, ShutdownSettings, TeardownParts};
use crate::submission::submission_queue;
use crate::worker::{WorkerConfig, WorkerPool};
use anyhow::Result;
use pool_stratum_connector::{
    ClientSettings, ConnectionState, EngineStats, JobBoard, PoolEndpoint, ProtocolClient, ShareCandidate,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn candidate(nonce: u32) -> ShareCandidate {
    ShareCandidate {
        job_id: "j1".to_string(),
        nonce,
        extranonce2: vec![0, 0, 0, 1],
        ntime: vec![0x50, 0x4e, 0x86, 0xb9],
        digest: [0u8; 32],
    }
}

async fn live_connection(endpoint: PoolEndpoint) -> Result<LiveConnection> {
    let board = Arc::new(JobBoard::new());
    let stats = Arc::new(EngineStats::new());
    let (client, closer) = ProtocolClient::connect(endpoint, ClientSettings::default(), board, stats).await?;
    let io_cancel = CancellationToken::new();
    let receive_task = tokio::spawn({
        let client = Arc::clone(&client);
        let cancel = io_cancel.clone();
        async move { client.receive_loop(cancel).await }
    });
    Ok(LiveConnection {
        client,
        closer,
        receive_task,
        io_cancel,
    })
}

#[tokio::test]
async fn test_signal_twice_forces_immediate_close() -> Result<()> {
    let (endpoint, pool) = stub_pool::spawn(1, |_, mut conn| async move {
        conn.accept_handshake().await;
        while conn.try_next_request().await.is_some() {}
        conn
    })
    .await;
    let connection = live_connection(endpoint).await?;
    let client = Arc::clone(&connection.client);

    let coordinator = ShutdownCoordinator::default();
    let (tx, queue) = submission_queue(16);
    for nonce in 0..5 {
        tx.push(candidate(nonce));
    }
    let workers = WorkerPool::spawn(
        &WorkerConfig {
            threads: 2,
            ..WorkerConfig::default()
        },
        Arc::new(JobBoard::new()),
        Arc::new(LowNonceHasher { below: 0 }),
        tx.clone(),
        Arc::new(EngineStats::new()),
        coordinator.token(),
    )?;

    assert_eq!(coordinator.signal(), ShutdownPhase::StopRequested);
    assert!(coordinator.token().is_cancelled());
    assert!(!coordinator.is_forced());
    coordinator.signal();
    assert!(coordinator.is_forced());

    let started = Instant::now();
    let report = coordinator
        .teardown(TeardownParts {
            workers: Some(workers),
            queue,
            connection: Some(connection),
            submitting: None,
        })
        .await;
    assert!(started.elapsed() < Duration::from_millis(500), "took {:?}", started.elapsed());

    assert_eq!(coordinator.phase(), ShutdownPhase::Closed);
    assert!(report.forced);
    assert_eq!(report.drained, 0);
    assert_eq!(report.discarded, 5);
    assert!(report.socket_closed);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(!client.accepts_submits());
    assert!(!tx.push(candidate(99)));

    let served = pool.await?;
    assert_eq!(served[0].submits(), 0);
    Ok(())
}

#[tokio::test]
async fn test_orderly_stop_drains_queue() -> Result<()> {
    let (endpoint, pool) = stub_pool::spawn(1, |_, mut conn| async move {
        conn.accept_handshake().await;
        conn.accept_submits().await;
        conn
    })
    .await;
    let connection = live_connection(endpoint).await?;

    let coordinator = ShutdownCoordinator::default();
    let (tx, queue) = submission_queue(16);
    for nonce in 0..3 {
        tx.push(candidate(nonce));
    }
    drop(tx);

    assert_eq!(coordinator.signal(), ShutdownPhase::StopRequested);
    let report = coordinator
        .teardown(TeardownParts {
            workers: None,
            queue,
            connection: Some(connection),
            submitting: None,
        })
        .await;

    assert!(!report.forced);
    assert_eq!(report.drained, 3);
    assert_eq!(report.discarded, 0);
    assert!(report.socket_closed);
    assert_eq!(coordinator.phase(), ShutdownPhase::Closed);

    let served = pool.await?;
    assert_eq!(served[0].submits(), 3);
    let nonces: Vec<&str> = served[0]
        .received
        .iter()
        .filter(|v| v["method"] == "mining.submit")
        .filter_map(|v| v["params"][4].as_str())
        .collect();
    assert_eq!(nonces, vec!["00000000", "00000001", "00000002"]);
    Ok(())
}

#[tokio::test]
async fn test_drain_window_drops_what_it_cannot_send() -> Result<()> {
    const QUEUED: usize = 2000;
    let resume = Arc::new(Notify::new());
    let (endpoint, pool) = stub_pool::spawn(1, {
        let resume = Arc::clone(&resume);
        move |_, mut conn| {
            let resume = Arc::clone(&resume);
            async move {
                conn.accept_handshake().await;
                // Not reading lets the client's socket buffers fill up.
                resume.notified().await;
                while conn.try_next_request().await.is_some() {}
                conn
            }
        }
    })
    .await;
    let connection = live_connection(endpoint).await?;

    let coordinator = ShutdownCoordinator::new(ShutdownSettings {
        drain_window: Duration::from_millis(300),
        ..ShutdownSettings::default()
    });
    let (tx, queue) = submission_queue(QUEUED);
    let wide_job = "j".repeat(16 * 1024);
    for nonce in 0..QUEUED as u32 {
        tx.push(ShareCandidate {
            job_id: wide_job.clone(),
            ..candidate(nonce)
        });
    }
    drop(tx);

    coordinator.signal();
    let started = Instant::now();
    let report = coordinator
        .teardown(TeardownParts {
            workers: None,
            queue,
            connection: Some(connection),
            submitting: None,
        })
        .await;
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(!report.forced);
    assert!(report.discarded > 0);
    assert_eq!(report.drained + report.discarded, QUEUED);
    assert!(report.socket_closed);

    resume.notify_one();
    let served = pool.await?;
    // Only what the drain finished writing reached the pool.
    assert_eq!(served[0].submits(), report.drained);
    Ok(())
}

#[tokio::test]
async fn test_teardown_joins_idle_workers() -> Result<()> {
    let coordinator = ShutdownCoordinator::new(ShutdownSettings {
        join_window: Duration::from_secs(1),
        ..ShutdownSettings::default()
    });
    let (tx, queue) = submission_queue(16);
    let workers = WorkerPool::spawn(
        &WorkerConfig {
            threads: 3,
            ..WorkerConfig::default()
        },
        Arc::new(JobBoard::new()),
        Arc::new(LowNonceHasher { below: 0 }),
        tx,
        Arc::new(EngineStats::new()),
        coordinator.token(),
    )?;

    // No signal first: teardown requests the stop itself.
    let report = coordinator
        .teardown(TeardownParts {
            workers: Some(workers),
            queue,
            connection: None,
            submitting: None,
        })
        .await;
    assert!(coordinator.token().is_cancelled());
    assert_eq!(report.workers_joined, 3);
    assert_eq!(report.workers_abandoned, 0);
    assert!(!report.socket_closed);
    assert_eq!(coordinator.phase(), ShutdownPhase::Closed);
    Ok(())
}

#[tokio::test]
async fn test_phases_only_move_forward() -> Result<()> {
    let coordinator = ShutdownCoordinator::default();
    let mut phases = coordinator.phase_changes();
    assert_eq!(coordinator.phase(), ShutdownPhase::Running);

    coordinator.signal();
    phases.changed().await?;
    assert_eq!(*phases.borrow_and_update(), ShutdownPhase::StopRequested);

    let (_tx, queue) = submission_queue(4);
    coordinator
        .teardown(TeardownParts {
            workers: None,
            queue,
            connection: None,
            submitting: None,
        })
        .await;
    assert_eq!(coordinator.phase(), ShutdownPhase::Closed);

    // A signal after close changes nothing.
    assert_eq!(coordinator.signal(), ShutdownPhase::Closed);
    assert!(!coordinator.is_forced());
    Ok(())
}

#[tokio::test]
async fn test_retire_closes_lost_connection() -> Result<()> {
    let (endpoint, pool) = stub_pool::spawn(1, |_, mut conn| async move {
        conn.accept_handshake().await;
        conn
    })
    .await;
    let connection = live_connection(endpoint).await?;
    let client = Arc::clone(&connection.client);

    // The stub returns and drops its socket once the handshake is done.
    let served = pool.await?;
    drop(served);
    let mut states = client.state_changes();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == ConnectionState::Disconnected),
    )
    .await??;

    let coordinator = ShutdownCoordinator::default();
    coordinator.retire(connection).await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(!client.accepts_submits());
    assert_eq!(coordinator.phase(), ShutdownPhase::Running);
    Ok(())
}
