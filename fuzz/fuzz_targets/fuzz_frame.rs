#![no_main]

use handshake_pipeline::core::buffer::Buffer;
use handshake_pipeline::core::frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz channel-0 and channel framing over an arbitrary receive window
    let mut inbox = Buffer::with_capacity(16);
    inbox.append(data);
    while let Ok(Some(_)) = frame::read_frame(&mut inbox, 64 * 1024) {}

    let mut inbox = Buffer::wrap(data.to_vec());
    while let Ok(Some((_channel, payload))) = frame::read_channel_frame(&mut inbox, 64 * 1024) {
        assert!(payload.has_remaining());
    }
});
