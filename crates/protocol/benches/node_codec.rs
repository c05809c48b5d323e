//! Performance benchmarks for the node codec.
//!
//! These benchmarks measure the hot paths on every inbound and outbound
//! stanza:
//! - Node encoding and decoding
//! - Framing with and without compression
//! - Ratchet encryption of a message payload

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::crypto::{IdentityKeyPair, KeyPair, RatchetLimits, RatchetState};
use protocol::{decode_node, encode_node, BinaryNode, FrameDecoder, NodeCodec, NodeStream};

fn message_stanza(payload_len: usize, recipients: usize) -> BinaryNode {
    let participants = (0..recipients)
        .map(|i| {
            BinaryNode::new("to")
                .with_attr("jid", format!("1555000{i:04}:{}@s.whatsapp.net", i % 4))
                .with_children(vec![BinaryNode::new("enc")
                    .with_attr("v", "2")
                    .with_attr("type", "msg")
                    .with_bytes(vec![0xA5u8; payload_len])])
        })
        .collect();
    BinaryNode::new("message")
        .with_attr("id", "3EB0C431A2F4E8B9D1")
        .with_attr("to", "120363025246125486@g.us")
        .with_attr("type", "text")
        .with_children(vec![BinaryNode::new("participants").with_children(participants)])
}

/// Benchmark raw node encoding and decoding.
fn bench_node_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_codec");

    for (name, payload, recipients) in [("single_64B", 64, 1), ("fanout_8x256B", 256, 8)] {
        let node = message_stanza(payload, recipients);
        let bytes = encode_node(&node).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_function(format!("encode_{name}"), |b| {
            b.iter(|| encode_node(black_box(&node)).unwrap());
        });
        group.bench_function(format!("decode_{name}"), |b| {
            b.iter(|| decode_node(black_box(&bytes)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark framing, including LZ4 on large stanzas.
fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");
    let node = message_stanza(1024, 16);

    let compressed = NodeCodec::new();
    let plain = NodeCodec::without_compression();
    let compressed_frame = compressed.encode_frame(&node).unwrap();
    group.throughput(Throughput::Bytes(compressed_frame.len() as u64));

    group.bench_function("encode_frame_lz4", |b| {
        b.iter(|| compressed.encode_frame(black_box(&node)).unwrap());
    });
    group.bench_function("encode_frame_plain", |b| {
        b.iter(|| plain.encode_frame(black_box(&node)).unwrap());
    });
    group.bench_function("stream_decode_lz4", |b| {
        b.iter(|| {
            let mut stream = NodeStream::new(FrameDecoder::new(), NodeCodec::new());
            stream.push(black_box(&compressed_frame));
            stream.next_node().unwrap()
        });
    });

    group.finish();
}

/// Benchmark the per-message ratchet step.
fn bench_ratchet(c: &mut Criterion) {
    let mut group = c.benchmark_group("ratchet");
    let alice_id = IdentityKeyPair::generate().public();
    let bob_id = IdentityKeyPair::generate().public();
    let bob_spk = KeyPair::generate();
    let secret = [7u8; 32];
    let mut alice = RatchetState::initiator(&secret, &bob_spk.public(), alice_id, bob_id).unwrap();
    let bob = RatchetState::responder(&secret, bob_spk, bob_id, alice_id);
    let payload = vec![0u8; 512];
    let limits = RatchetLimits::default();

    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("encrypt_512B", |b| {
        b.iter(|| alice.encrypt(black_box(&payload)).unwrap());
    });

    let message = alice.encrypt(&payload).unwrap();
    group.bench_function("decrypt_512B", |b| {
        b.iter(|| {
            let mut receiver = bob.clone();
            receiver.decrypt(black_box(&message), &limits).unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_node_codec, bench_framing, bench_ratchet);

criterion_main!(benches);
