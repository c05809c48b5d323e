//! Feeds arbitrary chunks to the streaming decoder.
//!
//! The first byte picks the chunk size so frame boundaries land anywhere.

#![no_main]

use libfuzzer_sys::fuzz_target;
use protocol::{FrameDecoder, NodeCodec, NodeStream};

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let chunk_size = usize::from(split).max(1);
    let mut stream = NodeStream::new(FrameDecoder::new(), NodeCodec::new());

    for chunk in rest.chunks(chunk_size) {
        stream.push(chunk);
        loop {
            match stream.next_node() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                // Corrupt framing ends the stream.
                Err(_) => return,
            }
        }
    }
});
