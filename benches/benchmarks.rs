//! Benchmarks for the synchronous protocol core.
//!
//! Run with: `cargo bench`

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use wsconn::extensions::ExtensionPipeline;
use wsconn::protocol::{
    Frame, HandshakeRequest, MessageAssembler, OpCode, apply_mask, apply_mask_fast,
    compute_accept_key,
};

const SIZES: [usize; 3] = [10, 1024, 64 * 1024];

fn wire_frame(payload_size: usize, key: Option<[u8; 4]>) -> BytesMut {
    let mut buf = BytesMut::new();
    Frame::binary(vec![0xAB; payload_size]).write(&mut buf, key);
    buf
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    let mut pipeline = ExtensionPipeline::default();

    for size in SIZES {
        let unmasked = wire_frame(size, None);
        let masked = wire_frame(size, Some([0x37, 0xfa, 0x21, 0x3d]));
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("unmasked", size), &unmasked, |b, buf| {
            b.iter(|| Frame::decode(black_box(buf), false, None, &mut pipeline))
        });
        group.bench_with_input(BenchmarkId::new("masked", size), &masked, |b, buf| {
            b.iter(|| Frame::decode(black_box(buf), true, None, &mut pipeline))
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    let mut pipeline = ExtensionPipeline::default();

    for size in SIZES {
        let frame = Frame::binary(vec![0xAB; size]);
        let mut buf = BytesMut::with_capacity(size + 14);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("unmasked", size), &frame, |b, frame| {
            b.iter(|| {
                buf.clear();
                frame.clone().encode(&mut buf, false, &mut pipeline)
            })
        });
        group.bench_with_input(BenchmarkId::new("masked", size), &frame, |b, frame| {
            b.iter(|| {
                buf.clear();
                frame
                    .clone()
                    .encode_with_key(&mut buf, Some([1, 2, 3, 4]), &mut pipeline)
            })
        });
    }
    group.finish();
}

fn bench_masking(c: &mut Criterion) {
    let mut group = c.benchmark_group("masking");
    let key = [0x37, 0xfa, 0x21, 0x3d];

    for size in SIZES {
        let mut data = vec![0xAB; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::new("bytewise", size), |b| {
            b.iter(|| apply_mask(black_box(&mut data), key))
        });
        group.bench_function(BenchmarkId::new("word", size), |b| {
            b.iter(|| apply_mask_fast(black_box(&mut data), key))
        });
    }
    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let chunk = "ascii and ünïcödé ".repeat(64);
    let fragments: Vec<Frame> = (0..16)
        .map(|i| {
            let opcode = if i == 0 { OpCode::Text } else { OpCode::Continuation };
            Frame::new(i == 15, opcode, chunk.as_bytes().to_vec())
        })
        .collect();
    group.throughput(Throughput::Bytes((chunk.len() * 16) as u64));

    group.bench_function("text_16_fragments", |b| {
        b.iter(|| {
            let mut assembler = MessageAssembler::new(None);
            let mut message = None;
            for frame in fragments.iter().cloned() {
                message = assembler.push(frame).unwrap_or(None);
            }
            message
        })
    });
    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let request = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Protocol: chat, superchat\r\n\r\n";

    c.bench_function("handshake_parse_validate", |b| {
        b.iter(|| {
            let request = HandshakeRequest::parse(black_box(request)).unwrap();
            request.validate().map(str::len)
        })
    });
    c.bench_function("accept_key", |b| {
        b.iter(|| compute_accept_key(black_box("dGhlIHNhbXBsZSBub25jZQ==")))
    });
}

criterion_group!(
    benches,
    bench_decode,
    bench_encode,
    bench_masking,
    bench_reassembly,
    bench_handshake
);
criterion_main!(benches);
