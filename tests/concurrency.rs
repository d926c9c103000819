//! Concurrent handshakes and contended pipelines

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use handshake_pipeline::communicator::{Communicator, CommunicatorOptions};
use handshake_pipeline::config::NetworkConfig;
use handshake_pipeline::protocol::handshake::ClientHandshake;
use handshake_pipeline::protocol::pipeline::{Initializer, RunResult};
use handshake_pipeline::service::{Client, ClientStage, Server};
use handshake_pipeline::transport::local::{LocalConnector, LocalHub};
use handshake_pipeline::utils::metrics::Metrics;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_local_handshakes_get_distinct_ids() {
    let clients = 32usize;
    let config = NetworkConfig::default();
    let hub = LocalHub::new();
    let metrics = Arc::new(Metrics::new());
    let server = Arc::new(Server::new(&config, Arc::clone(&metrics)));
    let listener = hub.bind(7000, server.options().clone()).unwrap();
    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(Arc::clone(&server).serve_local(listener, shutdown_rx));

    let mut tasks = JoinSet::new();
    for _ in 0..clients {
        let connector = Arc::new(LocalConnector::new(Arc::clone(&hub), 7000));
        let config = config.clone();
        tasks.spawn(async move {
            let client = Client::new(connector, &config, Arc::new(Metrics::new())).unwrap();
            let mut chain = client.start(ClientHandshake::new());
            let stage = chain.until_complete(Duration::from_millis(5)).await.unwrap();
            (client, stage)
        });
    }

    let mut ids = HashSet::new();
    let mut connected = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (client, stage) = joined.unwrap();
        match stage {
            ClientStage::Authenticated(id) => assert!(ids.insert(id)),
            other => panic!("unexpected stage {other:?}"),
        }
        connected.push(client);
    }

    assert_eq!(ids.len(), clients);
    assert_eq!(server.registry().len(), clients);
    assert_eq!(metrics.snapshot().handshakes_success, clients as u64);
}

#[test]
fn contended_run_never_interleaves_phases() {
    let threads = 8;
    let phases = 200;
    let (client, server) = Communicator::pair("c", "s", CommunicatorOptions::default());
    let initializer = Arc::new(Initializer::new(client));
    let executed = Arc::new(AtomicUsize::new(0));
    for _ in 0..phases {
        let executed = Arc::clone(&executed);
        initializer.add_producer("tick", move |io| {
            executed.fetch_add(1, Ordering::SeqCst);
            io.write_frame(|out| {
                out.put_u8(1);
                Ok(())
            })
        });
    }

    let barrier = Arc::new(Barrier::new(threads));
    let rejected = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let initializer = Arc::clone(&initializer);
            let barrier = Arc::clone(&barrier);
            let rejected = Arc::clone(&rejected);
            std::thread::spawn(move || {
                barrier.wait();
                loop {
                    match initializer.run() {
                        Ok(RunResult::Finished) => break,
                        Ok(_) => {}
                        Err(e) if e.is_already_running() => {
                            rejected.fetch_add(1, Ordering::Relaxed);
                            std::thread::yield_now();
                        }
                        Err(e) => panic!("unexpected error {e}"),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(executed.load(Ordering::SeqCst), phases);
    assert_eq!(initializer.pending_phases(), 0);
    initializer.communicator().flush().unwrap();
    assert_eq!(server.inbox_len(), phases * 5);
}
