//! Property tests for the node codec and framing.

use std::collections::BTreeMap;

use proptest::prelude::*;

use crate::binary::{decode_node, encode_node, BinaryNode, NodeContent};
use crate::framing::{Decoded, FrameDecoder, NodeCodec, NodeStream};

fn attr_value() -> impl Strategy<Value = String> {
    prop_oneof![
        "[0-9.-]{0,20}",
        "[0-9A-F]{1,24}",
        "[0-9]{5,12}(:[1-9][0-9]?)?@(s\\.whatsapp\\.net|lid|g\\.us)",
        "\\PC{0,40}",
        Just("result".to_string()),
        Just(String::new()),
    ]
}

fn leaf() -> impl Strategy<Value = BinaryNode> {
    (
        "[a-z]{1,8}",
        prop::collection::btree_map("[a-z]{1,6}", attr_value(), 0..4),
        prop_oneof![
            Just(NodeContent::None),
            prop::collection::vec(any::<u8>(), 0..600).prop_map(NodeContent::Bytes),
        ],
    )
        .prop_map(|(tag, attrs, content): (String, BTreeMap<String, String>, NodeContent)| {
            BinaryNode {
                tag,
                attrs,
                content,
            }
        })
}

fn node() -> impl Strategy<Value = BinaryNode> {
    leaf().prop_recursive(4, 32, 6, |inner| {
        (leaf(), prop::collection::vec(inner, 0..6)).prop_map(|(mut parent, children)| {
            parent.content = NodeContent::Nodes(children);
            parent
        })
    })
}

proptest! {
    #[test]
    fn prop_node_roundtrip(node in node()) {
        let bytes = encode_node(&node).unwrap();
        prop_assert_eq!(decode_node(&bytes).unwrap(), node);
    }

    #[test]
    fn prop_truncated_input_never_panics(node in node(), cut in any::<prop::sample::Index>()) {
        let bytes = encode_node(&node).unwrap();
        let cut = cut.index(bytes.len());
        prop_assert!(decode_node(&bytes[..cut]).is_err());
    }

    #[test]
    fn prop_arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_node(&bytes);
    }

    #[test]
    fn prop_mutated_input_never_panics(
        node in node(),
        at in any::<prop::sample::Index>(),
        value in any::<u8>(),
    ) {
        let mut bytes = encode_node(&node).unwrap();
        let at = at.index(bytes.len());
        bytes[at] = value;
        let _ = decode_node(&bytes);
    }

    #[test]
    fn prop_stream_chunking_is_transparent(
        nodes in prop::collection::vec(node(), 1..5),
        chunk in 1usize..64,
    ) {
        let codec = NodeCodec::new().with_compression_threshold(256);
        let mut wire = Vec::new();
        for node in &nodes {
            wire.extend_from_slice(&codec.encode_frame(node).unwrap());
        }

        let mut stream = NodeStream::new(FrameDecoder::new(), codec);
        let mut decoded = Vec::new();
        for piece in wire.chunks(chunk) {
            stream.push(piece);
            while let Some(item) = stream.next_node().unwrap() {
                match item {
                    Decoded::Node(node) => decoded.push(node),
                    Decoded::Dropped(err) => prop_assert!(false, "dropped frame: {}", err),
                }
            }
        }
        prop_assert_eq!(decoded, nodes);
    }
}
