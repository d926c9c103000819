//! Example: In-Process Handshake with Migration
//!
//! Runs a server on two in-process ports. A fresh client connects to the first,
//! receives a session key and an encrypted greeting, is told to migrate to the
//! second port and resumes there under the same id. It then sends a bincode
//! message on a post-handshake channel.
//!
//! Run with: `cargo run --example local_handshake`

#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;
use std::time::Duration;

use handshake_pipeline::communicator::{decode_message, Communicator};
use handshake_pipeline::config::NetworkConfig;
use handshake_pipeline::protocol::handshake::{fresh_only, ClientHandshake, MIGRATED};
use handshake_pipeline::protocol::session_key::{
    encrypted_consumer, encrypted_producer, issue_key_phase, receive_key_phase, KeyRole,
};
use handshake_pipeline::protocol::{ContextKey, InitContext};
use handshake_pipeline::service::{Client, Server};
use handshake_pipeline::transport::local::{LocalConnector, LocalHub};
use handshake_pipeline::utils::logging::init_logging;
use handshake_pipeline::utils::metrics::Metrics;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const GREETING: ContextKey<String> = ContextKey::new("demo.greeting");
const CHAT: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Chat {
    from: String,
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.local_port = Some(4000);
        c.server.migrate_to = Some(4001);
    });
    config.validate_strict()?;
    init_logging(&config.logging)?;

    println!("=== Local Handshake Demo ===\n");

    let hub = LocalHub::new();
    let server = Server::new(&config, Arc::new(Metrics::new()))
        .configure_handshake(|handshake| {
            handshake
                .add_phase(issue_key_phase(config.handshake.cipher_suite, KeyRole::Encrypt))
                .add_phase(encrypted_producer("server.greeting", |_, out| {
                    out.put_string("hello from the origin port")
                }))
        })
        .on_ready(|communicator: Communicator, context: InitContext| {
            let migrated = context.try_get(MIGRATED).copied().unwrap_or(false);
            println!("server: {} ready (migrated: {})", communicator.id(), migrated);
            let reply = communicator.clone();
            let registered = communicator.add_incoming(CHAT, move |payload| {
                let chat: Chat = decode_message(&payload)?;
                println!("server: {} says {:?}", chat.from, chat.text);
                reply.close();
                Ok(())
            });
            if let Err(e) = registered {
                eprintln!("server: could not listen on chat channel: {e}");
            }
        });
    let server = Arc::new(server);

    let (origin_tx, origin_rx) = mpsc::channel(1);
    let (target_tx, target_rx) = mpsc::channel(1);
    let origin = server
        .bind_local(&hub)?
        .ok_or("no local port configured")?;
    let target = hub.bind(4001, server.options().clone())?;
    tokio::spawn(Arc::clone(&server).serve_local(origin, origin_rx));
    tokio::spawn(Arc::clone(&server).serve_local(target, target_rx));

    let client = Client::new(
        Arc::new(LocalConnector::new(Arc::clone(&hub), 4000)),
        &config,
        Arc::new(Metrics::new()),
    )?;
    let handshake = ClientHandshake::new()
        .add_phase(fresh_only(receive_key_phase(KeyRole::Decrypt)))
        .add_phase(fresh_only(encrypted_consumer("client.greeting", |context, mut plain| {
            context.insert(GREETING, plain.get_string()?);
            Ok(())
        })));

    let id = client.establish(handshake).await?;
    let greeting = client
        .initializer()
        .with_context(|context| context.get(GREETING).cloned())?;
    println!("client: authenticated as {} via {}", id, client.endpoint());
    println!("client: decrypted greeting {:?}", greeting);

    client.communicator().send_message(
        CHAT,
        &Chat {
            from: format!("client {id}"),
            text: "made it across ports".into(),
        },
    )?;

    let closed = client.communicator().clone();
    while !closed.is_closed() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    origin_tx.send(()).await?;
    target_tx.send(()).await?;
    client.metrics().log_metrics();
    server.metrics().log_metrics();
    println!("\n=== Demo Complete ===");
    Ok(())
}
