//! Generate binary node test vectors for interop testing.
//!
//! Run with: cargo run --package protocol --example node_vectors

use protocol::{encode_node, BinaryNode};

fn main() {
    // Test vector 1: keepalive ping
    let ping = BinaryNode::new("iq")
        .with_attr("id", "1")
        .with_attr("to", "s.whatsapp.net")
        .with_attr("type", "get")
        .with_attr("xmlns", "w:p")
        .with_children(vec![BinaryNode::new("ping")]);
    print_test_vector("iq_ping", &ping);

    // Test vector 2: device-qualified recipient
    let to = BinaryNode::new("to").with_attr("jid", "15551234567:3@s.whatsapp.net");
    print_test_vector("device_jid", &to);

    // Test vector 3: hex and nibble packed attributes
    let receipt = BinaryNode::new("receipt")
        .with_attr("id", "3EB0ABCDEF012345")
        .with_attr("t", "1700000000");
    print_test_vector("packed_attrs", &receipt);

    // Test vector 4: encrypted payload
    let enc = BinaryNode::new("enc")
        .with_attr("type", "pkmsg")
        .with_attr("v", "2")
        .with_bytes(vec![0x33, 0x01, 0x02, 0x03]);
    print_test_vector("enc_bytes", &enc);

    // Test vector 5: empty child list and empty attribute
    let list = BinaryNode::new("list").with_attr("to", "").with_children(vec![]);
    print_test_vector("empty_list", &list);
}

fn print_test_vector(name: &str, node: &BinaryNode) {
    let bytes = encode_node(node).expect("serialization failed");
    println!("# {node}");
    println!("{name} = {}", hex::encode(&bytes));
}
