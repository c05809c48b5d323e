//! Untrusted node bytes must fail cleanly, and anything that decodes must
//! survive a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use protocol::{decode_node, encode_node, NodeCodec};

fuzz_target!(|data: &[u8]| {
    if let Ok(node) = decode_node(data) {
        let bytes = encode_node(&node).expect("decoded node must re-encode");
        let again = decode_node(&bytes).expect("re-encoded node must decode");
        assert_eq!(again, node);
    }

    // Same bytes as a frame payload, which may claim to be compressed.
    let _ = NodeCodec::new().decode_payload(data);
});
