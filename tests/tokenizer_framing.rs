//! Integration coverage for the Tokenizer's public API (Module A), mirroring
//! the core specification's scenario S1 and its determinism invariant.

use bytes::Bytes;
use driver_core::{Framing, Tokenizer};

#[test]
fn delimiter_framing_across_arbitrary_chunk_boundaries() {
    let whole = b"ab".as_slice();
    let rest = b"c\nde\nf".as_slice();

    let mut tok = Tokenizer::new(Framing::Delimiter(Bytes::from_static(b"\n")));
    let mut messages = tok.extract(whole).unwrap();
    messages.extend(tok.extract(rest).unwrap());

    assert_eq!(messages, vec![Bytes::from_static(b"abc\n"), Bytes::from_static(b"de\n")]);
}

#[test]
fn extract_is_independent_of_chunking_strategy() {
    let data = b"one|two|three|".to_vec();

    let mut single_shot = Tokenizer::new(Framing::Delimiter(Bytes::from_static(b"|")));
    let batched = single_shot.extract(&data).unwrap();

    let mut byte_at_a_time = Tokenizer::new(Framing::Delimiter(Bytes::from_static(b"|")));
    let mut streamed = Vec::new();
    for byte in &data {
        streamed.extend(byte_at_a_time.extract(std::slice::from_ref(byte)).unwrap());
    }

    assert_eq!(batched, streamed);
}

#[test]
fn clear_discards_unframed_tail() {
    let mut tok = Tokenizer::new(Framing::Delimiter(Bytes::from_static(b"\n")));
    assert!(tok.extract(b"partial, no newline yet").unwrap().is_empty());
    tok.clear();
    // After clear, the stale tail must not be stitched onto new input.
    let messages = tok.extract(b"fresh\n").unwrap();
    assert_eq!(messages, vec![Bytes::from_static(b"fresh\n")]);
}
