//! Performance benchmarks for frame processing.
//!
//! These benchmarks measure the hot paths in the daemon:
//! - Frame encoding and decoding
//! - Decoding raw process output into text
//! - Session output fan-out

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use daemon::session::decode::OutputDecoder;
use daemon::session::{ClientHandle, SessionOutputBroadcaster};
use protocol::{Frame, FrameCodec};

/// Benchmark frame encoding for typical output sizes.
fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    let codec = FrameCodec::new();

    for (name, size) in [("keystroke_1B", 1), ("chunk_4KB", 4096), ("burst_64KB", 65536)] {
        let frame = Frame::output("bench-session", "x".repeat(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| codec.encode(black_box(&frame)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark decoding client frames.
fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    let codec = FrameCodec::new();

    let input = codec.encode(&Frame::input("ls -la\n")).unwrap();
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.bench_function("input", |b| {
        b.iter(|| codec.decode(black_box(&input)).unwrap());
    });

    let resize = codec.encode(&Frame::resize(132, 50)).unwrap();
    group.throughput(Throughput::Bytes(resize.len() as u64));
    group.bench_function("resize", |b| {
        b.iter(|| codec.decode(black_box(&resize)).unwrap());
    });

    let output = codec
        .encode(&Frame::output("bench-session", "y".repeat(4096)))
        .unwrap();
    group.throughput(Throughput::Bytes(output.len() as u64));
    group.bench_function("output_4KB", |b| {
        b.iter(|| codec.decode(black_box(&output)).unwrap());
    });

    group.finish();
}

/// Benchmark turning raw output bytes into text.
fn bench_output_decoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_decoder");

    let ascii = vec![b'a'; 4096];
    group.throughput(Throughput::Bytes(ascii.len() as u64));
    group.bench_function("ascii_4KB", |b| {
        b.iter(|| {
            let mut decoder = OutputDecoder::new();
            decoder.decode(black_box(&ascii))
        });
    });

    // Multibyte characters cut at every chunk boundary.
    let text = "héllo wörld ✓ ".repeat(256);
    let bytes = text.as_bytes();
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("split_utf8_4KB", |b| {
        b.iter(|| {
            let mut decoder = OutputDecoder::new();
            let mut out = String::with_capacity(bytes.len());
            for chunk in bytes.chunks(7) {
                out.push_str(&decoder.decode(black_box(chunk)));
            }
            out
        });
    });

    group.finish();
}

/// Benchmark publishing output to attached clients.
fn bench_broadcaster(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcaster");
    group.throughput(Throughput::Elements(1));

    for clients in [1usize, 4, 16] {
        let broadcaster = SessionOutputBroadcaster::new(1000);
        let mut receivers = Vec::with_capacity(clients);
        for i in 0..clients {
            let (handle, rx) = ClientHandle::with_capacity(format!("client-{}", i), 1024);
            broadcaster.attach(handle, |_| Frame::output("bench-session", ""));
            receivers.push(rx);
        }
        let frame = Frame::output("bench-session", "z".repeat(256));

        group.bench_function(format!("publish_{}_clients", clients), |b| {
            b.iter(|| {
                broadcaster.publish(black_box(frame.clone()));
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_output_decoder,
    bench_broadcaster
);
criterion_main!(benches);
