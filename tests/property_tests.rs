//! Property-based tests using proptest
//!
//! These tests check buffer and framing invariants across randomly generated
//! payloads and arbitrary delivery splits.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use handshake_pipeline::core::buffer::Buffer;
use handshake_pipeline::core::frame::{self, MAX_FRAME_SIZE};
use handshake_pipeline::protocol::session_key::{
    DecryptingReader, EncryptingWriter, SessionKeyMaterial,
};
use handshake_pipeline::utils::crypto::CipherSuite;
use proptest::prelude::*;

fn encode_frames(payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut wire = Buffer::with_capacity(1);
    for payload in payloads {
        frame::write_frame(&mut wire, payload).unwrap();
    }
    wire.as_slice().to_vec()
}

fn drain_frames(inbox: &mut Buffer, out: &mut Vec<Vec<u8>>) {
    while let Some(frame) = frame::read_frame(inbox, MAX_FRAME_SIZE).expect("valid frame") {
        out.push(frame.remaining_slice().to_vec());
    }
}

// Property: cursor invariants hold after any mix of writes, flips and reads
proptest! {
    #[test]
    fn prop_cursor_invariants(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..20)) {
        let mut buf = Buffer::with_capacity(1);
        let mut written = Vec::new();
        for chunk in &chunks {
            buf.put_slice(chunk);
            written.extend_from_slice(chunk);
            prop_assert!(buf.position() <= buf.limit());
            prop_assert!(buf.limit() <= buf.capacity());
        }
        buf.flip();
        prop_assert_eq!(buf.position(), 0);
        prop_assert_eq!(buf.remaining_slice(), &written[..]);
    }
}

// Property: size-prefixed blobs and strings survive growth from a tiny capacity
proptest! {
    #[test]
    fn prop_blob_and_string_across_growth(blob in prop::collection::vec(any::<u8>(), 0..5000), text in ".{0,200}") {
        let mut buf = Buffer::with_capacity(2);
        buf.put_blob(&blob).unwrap();
        buf.put_string(&text).unwrap();
        buf.put_u64(u64::MAX);
        buf.flip();

        prop_assert_eq!(buf.get_blob().unwrap(), blob);
        prop_assert_eq!(buf.get_string().unwrap(), text);
        prop_assert_eq!(buf.get_u64().unwrap(), u64::MAX);
        prop_assert!(!buf.has_remaining());
    }
}

// Property: delivering a frame stream in arbitrary pieces yields the same frames
proptest! {
    #[test]
    fn prop_split_delivery_matches_whole(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
    ) {
        let wire = encode_frames(&payloads);
        let mut points: Vec<usize> = cuts.iter().map(|cut| cut.index(wire.len() + 1)).collect();
        points.push(0);
        points.push(wire.len());
        points.sort_unstable();

        let mut inbox = Buffer::with_capacity(4);
        let mut frames = Vec::new();
        for window in points.windows(2) {
            inbox.append(&wire[window[0]..window[1]]);
            drain_frames(&mut inbox, &mut frames);
        }

        prop_assert_eq!(frames, payloads);
        prop_assert!(!inbox.has_remaining());
    }
}

// Property: a truncated stream never yields a partial frame
proptest! {
    #[test]
    fn prop_truncated_frame_is_never_consumed(payload in prop::collection::vec(any::<u8>(), 1..1024), keep in any::<prop::sample::Index>()) {
        let wire = encode_frames(std::slice::from_ref(&payload));
        let cut = keep.index(wire.len());
        let mut inbox = Buffer::with_capacity(8);
        inbox.append(&wire[..cut]);

        prop_assert!(frame::read_frame(&mut inbox, MAX_FRAME_SIZE).unwrap().is_none());
        prop_assert_eq!(inbox.remaining(), cut);
    }
}

// Property: channel frames keep their channel and payload
proptest! {
    #[test]
    fn prop_channel_frames_route(channel in 1u8..=255, payload in prop::collection::vec(any::<u8>(), 1..1024)) {
        let mut wire = Buffer::new();
        frame::write_channel_frame(&mut wire, channel, &payload).unwrap();
        wire.flip();

        let (seen, body) = frame::read_channel_frame(&mut wire, MAX_FRAME_SIZE).unwrap().expect("complete frame");
        prop_assert_eq!(seen, channel);
        prop_assert_eq!(body.remaining_slice(), &payload[..]);
    }
}

// Property: sealed envelopes open to the original plaintext
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]
    #[test]
    fn prop_envelope_opens(plaintext in prop::collection::vec(any::<u8>(), 0..2048), header in prop::collection::vec(any::<u8>(), 0..8)) {
        let material = SessionKeyMaterial::generate(CipherSuite::ChaCha20).unwrap();
        let writer = EncryptingWriter::with_header(material.clone().into_encrypter().unwrap(), header.clone());
        let reader = DecryptingReader::with_header(material.into_decrypter().unwrap(), header);

        let mut out = Buffer::new();
        writer.write(&mut out, |plain| {
            plain.put_slice(&plaintext);
            Ok(())
        }).unwrap();
        out.flip();

        let opened = reader.read(&mut out).unwrap().expect("whole envelope");
        prop_assert_eq!(opened.remaining_slice(), &plaintext[..]);
    }
}
