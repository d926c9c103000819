#![no_main]

use std::sync::Arc;
use std::time::Duration;

use handshake_pipeline::communicator::Communicator;
use handshake_pipeline::protocol::handshake::ServerHandshake;
use handshake_pipeline::protocol::pipeline::Initializer;
use handshake_pipeline::service::SessionRegistry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary client bytes to a server handshake; it must fail cleanly or block
    let registry = Arc::new(SessionRegistry::new(4, Duration::from_secs(1)));
    let communicator = Communicator::new("fuzz");
    let initializer = Initializer::new(communicator.clone());
    initializer.install(ServerHandshake::new(registry).migrate_to(9).phases());

    communicator.receive(data);
    if initializer.run_until_blocked().is_err() {
        assert!(communicator.is_closed());
    }
});
