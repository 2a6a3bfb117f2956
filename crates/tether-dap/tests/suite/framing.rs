use proptest::prelude::*;
use tether_dap::dap::codec::{encode, encode_with_headers, FrameDecoder};
use tether_dap::dap::AUTH_TOKEN_HEADER;

#[test]
fn every_split_offset_yields_exactly_one_frame() {
    let body = br#"{"seq":12,"type":"request","command":"evaluate","arguments":{"expression":"a\r\n\r\nb"}}"#;
    let framed = encode(body);

    for at in 0..=framed.len() {
        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.feed(&framed[..at]).unwrap();
        frames.extend(decoder.feed(&framed[at..]).unwrap());

        assert_eq!(frames.len(), 1, "split at {at}");
        assert_eq!(frames[0].body, body.to_vec(), "split at {at}");
        assert!(decoder.is_idle(), "split at {at}");
    }
}

proptest! {
    #[test]
    fn decode_of_encode_is_identity(body in proptest::collection::vec(any::<u8>(), 0..1024)) {
        let frames = FrameDecoder::new().feed(&encode(&body)).unwrap();
        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(&frames[0].body, &body);
    }

    #[test]
    fn two_chunk_split_yields_one_frame(
        body in proptest::collection::vec(any::<u8>(), 0..512),
        split in any::<prop::sample::Index>(),
    ) {
        let framed = encode(&body);
        let at = split.index(framed.len() + 1);

        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.feed(&framed[..at]).unwrap();
        frames.extend(decoder.feed(&framed[at..]).unwrap());

        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(&frames[0].body, &body);
        prop_assert!(decoder.is_idle());
    }

    #[test]
    fn arbitrary_chunking_preserves_frame_order(
        bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..8),
        chunk in 1usize..32,
    ) {
        let mut stream = Vec::new();
        for (i, body) in bodies.iter().enumerate() {
            if i == 0 {
                stream.extend(encode_with_headers(&[(AUTH_TOKEN_HEADER, "t0k3n")], body));
            } else {
                stream.extend(encode(body));
            }
        }

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for piece in stream.chunks(chunk) {
            frames.extend(decoder.feed(piece).unwrap());
        }

        prop_assert_eq!(frames.len(), bodies.len());
        prop_assert_eq!(frames[0].auth_token.as_deref(), Some("t0k3n"));
        for (frame, body) in frames.iter().zip(&bodies) {
            prop_assert_eq!(&frame.body, body);
        }
    }
}
