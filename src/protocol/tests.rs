// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::communicator::{Communicator, CommunicatorOptions, ConnectionId};
use crate::core::buffer::Buffer;
use crate::core::frame;
use crate::error::{constants, ProtocolError, Result};
use crate::future::{Completer, Pending};
use crate::protocol::context::ContextKey;
use crate::protocol::handshake::*;
use crate::protocol::phase::Phase;
use crate::protocol::pipeline::{Initializer, RunResult};
use crate::protocol::session_key::{
    encrypted_consumer, encrypted_producer, issue_key_phase, receive_key_phase, KeyRole,
};
use crate::service::registry::SessionRegistry;
use crate::transport::local::LocalHub;
use crate::utils::crypto::CipherSuite;
use crate::utils::timeout::RESUME_TTL;

const NAME: ContextKey<String> = ContextKey::new("test.name");
const NAME_LEN: ContextKey<usize> = ContextKey::new("test.name_len");

fn pair() -> (Communicator, Communicator) {
    Communicator::pair("client", "server", CommunicatorOptions::default())
}

/// Run and flush every side until none of them makes progress
fn settle(sides: &[&Initializer]) {
    for _ in 0..64 {
        let mut progressed = false;
        for side in sides {
            if side.communicator().is_closed() {
                continue;
            }
            let before = side.phase_labels();
            let _ = side.run_until_blocked();
            let flushed = side.communicator().flush().unwrap_or(0);
            progressed |= flushed > 0 || side.phase_labels() != before;
        }
        if !progressed {
            return;
        }
    }
    panic!("sides kept making progress");
}

fn name_reader() -> Phase {
    Phase::consumer("read_name", |io| {
        let Some(mut body) = io.read_frame()? else {
            return Ok(false);
        };
        let name = body.get_string()?;
        io.context.insert(NAME, name);
        Ok(true)
    })
}

#[test]
fn test_n_phases_finish_with_shared_context() {
    let (client, _server) = pair();
    let init = Initializer::new(client);
    init.add_config("store", |context, _| {
        context.insert(NAME, "ada".to_string());
        Ok(())
    });
    init.add_producer("send", |io| {
        let name = io.context.get(NAME)?.clone();
        io.write_frame(|out| {
            out.put_string(&name)
        })
    });
    init.add_config("measure", |context, _| {
        let len = context.get(NAME)?.len();
        context.insert(NAME_LEN, len);
        Ok(())
    });

    assert_eq!(init.run().unwrap(), RunResult::PendingNext);
    assert_eq!(init.run().unwrap(), RunResult::PendingNext);
    assert_eq!(init.run().unwrap(), RunResult::Finished);
    assert_eq!(init.run().unwrap(), RunResult::Finished);
    assert_eq!(init.with_context(|context| *context.get(NAME_LEN).unwrap()), 3);
    assert_eq!(init.communicator().pending_outgoing(), 4 + 4 + 3);
}

#[test]
fn test_split_delivery_matches_whole_delivery() {
    let mut encoded = Buffer::new();
    frame::write_frame_with(&mut encoded, |out| {
        out.put_string("partial reads")
    })
    .unwrap();
    let bytes = encoded.as_slice().to_vec();

    let whole = Initializer::new(Communicator::new("whole"));
    whole.add_phase(name_reader());
    whole.communicator().receive(&bytes);
    assert_eq!(whole.run().unwrap(), RunResult::Finished);

    let split = Initializer::new(Communicator::new("split"));
    split.add_phase(name_reader());
    for (i, byte) in bytes.iter().enumerate() {
        split.communicator().receive(&[*byte]);
        let expected = if i + 1 == bytes.len() {
            RunResult::Finished
        } else {
            RunResult::AwaitingData
        };
        assert_eq!(split.run().unwrap(), expected, "after byte {i}");
    }

    let read = |init: &Initializer| init.with_context(|context| context.get(NAME).unwrap().clone());
    assert_eq!(read(&whole), read(&split));
    assert_eq!(split.communicator().inbox_len(), 0);
}

#[test]
fn test_reentrant_run_fails_and_leaves_queue() {
    let init = Arc::new(Initializer::new(Communicator::new("reentrant")));
    let observed = Arc::new(Mutex::new(None));

    let inner = Arc::downgrade(&init);
    let slot = Arc::clone(&observed);
    init.add_producer("reenter", move |_io| {
        let init = inner.upgrade().expect("initializer alive");
        *slot.lock().unwrap() = Some(init.run().unwrap_err());
        Ok(())
    });
    init.add_config("after", |_, _| Ok(()));

    assert_eq!(init.run().unwrap(), RunResult::PendingNext);
    let error = observed.lock().unwrap().take().unwrap();
    assert!(error.is_already_running());
    assert_eq!(init.phase_labels(), vec!["after"]);
    assert!(!init.communicator().is_closed());
}

#[test]
fn test_false_guard_skips_without_consuming() {
    let comm = Communicator::new("guarded");
    comm.receive(&[0, 0, 0, 1, 42]);
    let init = Initializer::new(comm);
    init.add_phase(
        Phase::consumer("never", |_io| Err(ProtocolError::FramingError("ran".into())))
            .when(|context| context.contains(NAME)),
    );
    init.add_phase(name_reader().when(|_| true));

    assert_eq!(init.run().unwrap(), RunResult::PendingNext);
    assert_eq!(init.communicator().inbox_len(), 5);
    assert_eq!(init.phase_labels(), vec!["read_name"]);
}

#[test]
fn test_guard_is_not_reevaluated_on_retry() {
    let init = Initializer::new(Communicator::new("retry"));
    let checks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&checks);
    init.add_phase(name_reader().when(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    }));

    assert_eq!(init.run().unwrap(), RunResult::AwaitingData);
    assert_eq!(init.run().unwrap(), RunResult::AwaitingData);
    assert_eq!(checks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_phase_error_disconnects_with_cause() {
    let init = Initializer::new(Communicator::new("failing"));
    let cause = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&cause);
    init.communicator().add_disconnected_listener(move |reason| {
        *sink.lock().unwrap() = reason.clone();
    });
    init.add_config("missing", |context, _| context.get(NAME).map(|_| ()));
    init.add_config("unreached", |_, _| Ok(()));

    let error = init.run().unwrap_err();
    assert!(matches!(error.root(), ProtocolError::ContextKeyMissing("test.name")));
    assert!(init.communicator().is_closed());
    assert_eq!(init.pending_phases(), 0);

    let recorded = cause.lock().unwrap().clone().unwrap();
    assert!(matches!(*recorded, ProtocolError::ContextKeyMissing(_)));
    assert!(matches!(init.run(), Err(ProtocolError::ConnectionClosed)));
}

#[test]
fn test_follow_ups_run_in_order_after_current() {
    let init = Initializer::new(Communicator::new("follow"));
    init.add_producer("first", |io| {
        io.then(Phase::config("inserted_a", |_, _| Ok(())));
        io.then(Phase::config("inserted_b", |_, _| Ok(())));
        Ok(())
    });
    init.add_config("last", |_, _| Ok(()));
    init.run().unwrap();
    assert_eq!(init.phase_labels(), vec!["inserted_a", "inserted_b", "last"]);
}

#[test]
fn test_encrypted_phases_round_trip() {
    let (client, server) = pair();
    let client_init = Initializer::new(client);
    let server_init = Initializer::new(server);

    client_init.add_phase(issue_key_phase(CipherSuite::ChaCha20, KeyRole::Encrypt));
    client_init.add_phase(encrypted_producer("secret.send", |_, out| {
        out.put_string("top secret")
    }));
    server_init.add_phase(receive_key_phase(KeyRole::Decrypt));
    server_init.add_phase(encrypted_consumer("secret.read", |context, mut plain| {
        context.insert(NAME, plain.get_string()?);
        Ok(())
    }));

    settle(&[&client_init, &server_init]);
    assert_eq!(client_init.pending_phases(), 0);
    assert_eq!(server_init.pending_phases(), 0);
    assert_eq!(
        server_init.with_context(|context| context.get(NAME).unwrap().clone()),
        "top secret"
    );
}

fn registry() -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(16, RESUME_TTL))
}

#[test]
fn test_local_handshake_authenticates_both_sides() {
    let (client, server) = pair();
    let registry = registry();
    let client_init = Initializer::new(client.clone());
    let server_init = Initializer::new(server.clone());

    let app_runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&app_runs);
    client_init.install(
        ClientHandshake::new()
            .add_producer("app.name", |io| {
                io.write_frame(|out| {
                    out.put_string("ada")
                })
            })
            .phases(),
    );
    server_init.install(
        ServerHandshake::new(registry.clone())
            .add_phase(name_reader())
            .add_config("app.count", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .phases(),
    );

    settle(&[&client_init, &server_init]);
    assert!(client.is_authenticated() && server.is_authenticated());
    assert!(client.id().is_registered());
    assert_eq!(client.id(), server.id());
    assert_eq!(app_runs.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len(), 1);
    assert!(client_init.with_context(|context| *context.get(FRESH).unwrap()));
}

/// Records the migration request; the test attaches the new transport itself
#[derive(Default)]
struct DeferredMigrator {
    requests: Mutex<Vec<(u16, Completer<()>)>>,
}

impl DeferredMigrator {
    fn take(&self) -> (u16, Completer<()>) {
        self.requests.lock().unwrap().pop().expect("migration requested")
    }
}

impl Migrator for DeferredMigrator {
    fn migrate(&self, communicator: &Communicator, port: u16) -> Result<Pending<()>> {
        communicator.detach();
        let (completer, pending) = Pending::channel();
        self.requests.lock().unwrap().push((port, completer));
        Ok(pending)
    }
}

#[tokio::test]
async fn test_migration_keeps_identity_and_swaps_transport_once() {
    let hub = LocalHub::new();
    let mut first = hub.bind(4000, CommunicatorOptions::default()).unwrap();
    let mut second = hub.bind(4001, CommunicatorOptions::default()).unwrap();
    let registry = registry();
    let migrator = Arc::new(DeferredMigrator::default());

    let client = Communicator::new("local://client");
    hub.connect(4000, &client).unwrap();
    let origin = first.accept().await.unwrap();

    let app_runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&app_runs);
    let server_handshake = ServerHandshake::new(registry.clone()).add_config("app.count", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let client_init = Initializer::new(client.clone());
    client_init.install(ClientHandshake::new().migrator(migrator.clone()).phases());
    let origin_init = Initializer::new(origin.clone());
    origin_init.install(server_handshake.clone().migrate_to(4001).phases());

    settle(&[&client_init, &origin_init]);
    assert_eq!(client_init.phase_labels()[0], "client.await_reconnect");
    assert!(!client.is_authenticated());
    assert!(origin.is_closed());
    assert!(!origin.is_authenticated());
    let assigned = client.id();

    let (port, completer) = migrator.take();
    assert_eq!(port, 4001);
    hub.connect(port, &client).unwrap();
    completer.complete(Ok(()));
    let target = second.accept().await.unwrap();
    let target_init = Initializer::new(target.clone());
    target_init.install(server_handshake.phases());

    settle(&[&client_init, &target_init]);
    assert!(client.is_authenticated() && target.is_authenticated());
    assert_eq!(client.id(), assigned);
    assert_eq!(target.id(), assigned);
    assert_eq!(app_runs.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len(), 1);
    assert!(migrator.requests.lock().unwrap().is_empty());
    assert!(target_init.with_context(|context| *context.get(MIGRATED).unwrap()));
}

#[test]
fn test_migration_without_migrator_fails() {
    let (client, server) = pair();
    let client_init = Initializer::new(client.clone());
    let server_init = Initializer::new(server);
    client_init.install(ClientHandshake::new().phases());
    server_init.install(ServerHandshake::new(registry()).migrate_to(9).phases());

    settle(&[&client_init, &server_init]);
    assert!(client.is_closed());
    assert!(!client.is_authenticated());
}

#[test]
fn test_cancelled_reconnect_never_authenticates() {
    let (client, server) = pair();
    let migrator = Arc::new(DeferredMigrator::default());
    let client_init = Initializer::new(client.clone());
    let server_init = Initializer::new(server);
    client_init.install(ClientHandshake::new().migrator(migrator.clone()).phases());
    server_init.install(ServerHandshake::new(registry()).migrate_to(9).phases());

    settle(&[&client_init, &server_init]);
    let (_, completer) = migrator.take();
    drop(completer);

    let error = client_init.run().unwrap_err();
    assert!(matches!(error.root(), ProtocolError::Cancelled));
    assert!(client.is_closed());
    assert!(!client.is_authenticated());
}

#[test]
fn test_resume_with_unknown_token_is_rejected() {
    let (client, server) = pair();
    let client_init = Initializer::new(client.clone());
    let server_init = Initializer::new(server.clone());
    client_init.install(ClientHandshake::new().resume_with(vec![0; 16]).phases());
    server_init.install(ServerHandshake::new(registry()).phases());

    client_init.run_until_blocked().unwrap();
    client.flush().unwrap();
    let error = server_init.run().unwrap_err();
    assert!(matches!(
        error.root(),
        ProtocolError::InitializationError(message) if message == constants::ERR_UNKNOWN_SESSION
    ));
    assert!(server.is_closed());
    // The local peer sees the close like a socket EOF.
    assert!(client.is_closed());
    assert_eq!(server.id(), ConnectionId::UNREGISTERED);
}

#[test]
fn test_key_message_decode_error_is_reported_as_is() {
    let init = Initializer::new(Communicator::new("keys"));
    init.add_phase(receive_key_phase(KeyRole::Decrypt));
    let mut wire = Buffer::new();
    frame::write_frame_with(&mut wire, |out| out.put_blob(&[0xC3, 0x28])).unwrap();
    init.communicator().receive(wire.as_slice());

    let error = init.run().unwrap_err();
    assert!(matches!(
        error.root(),
        ProtocolError::FramingError(message) if message == constants::ERR_INVALID_UTF8
    ));
}

#[test]
fn test_short_key_message_is_truncated() {
    let init = Initializer::new(Communicator::new("keys"));
    init.add_phase(receive_key_phase(KeyRole::Decrypt));
    let mut wire = Buffer::new();
    frame::write_frame_with(&mut wire, |out| out.put_string("ChaCha20")).unwrap();
    init.communicator().receive(wire.as_slice());

    let error = init.run().unwrap_err();
    assert!(matches!(
        error.root(),
        ProtocolError::FramingError(message) if message == constants::ERR_TRUNCATED_FRAME
    ));
}
