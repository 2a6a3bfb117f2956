#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_dap::dap::codec::{encode, FrameDecoder};
use tether_dap::Message;

// The first byte picks the chunk size; the rest is the stream. Chunking must not change what is
// decoded, and nothing may panic.
fuzz_target!(|data: &[u8]| {
    let Some((&chunk, stream)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(chunk).max(1);

    let mut whole = FrameDecoder::new();
    let expected = whole.feed(stream);

    let mut pieces = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut failed = false;
    for piece in stream.chunks(chunk) {
        match pieces.feed(piece) {
            Ok(decoded) => frames.extend(decoded),
            Err(_) => {
                failed = true;
                break;
            }
        }
    }

    match expected {
        Ok(expected) if !failed => {
            assert_eq!(expected, frames);
            assert_eq!(whole.is_idle(), pieces.is_idle());
        }
        Ok(_) => panic!("chunked decoding failed where whole-buffer decoding succeeded"),
        Err(_) => assert!(failed, "whole-buffer decoding failed where chunked decoding succeeded"),
    }

    for frame in frames {
        if let Ok(message) = Message::decode(&frame.body) {
            let body = message.encode().expect("decoded message should re-encode");
            let mut decoder = FrameDecoder::new();
            let again = decoder.feed(&encode(&body)).expect("encoded frame should decode");
            assert_eq!(again.len(), 1);
        }
    }
});
