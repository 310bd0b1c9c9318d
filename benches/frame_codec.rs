//! Benchmarks for the serial frame codec and the dispatch pipeline
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pedlbrd::config::Config;
use pedlbrd::device::codec::{encode_command, encode_frame, DecodeOutcome, FrameDecoder};
use pedlbrd::device::{DispatchTable, Opcode, PinStates, SerialFrame};
use std::io::Cursor;

/// A stream of analog and digital frames as a busy board would send them
fn sample_stream(frames: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frames * 4);
    for i in 0..frames {
        let frame = if i % 4 == 0 {
            SerialFrame::new(Opcode::Digital, vec![(i % 10) as u8, (i % 2) as u8])
        } else {
            let value = (i * 37 % 1024) as u16;
            SerialFrame::new(
                Opcode::Analog,
                vec![(i % 4) as u8, (value >> 7) as u8, (value & 0x7F) as u8],
            )
        };
        bytes.extend(encode_frame(&frame));
    }
    bytes
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frames");

    for size in [100, 1000, 10_000].iter() {
        let stream = sample_stream(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &stream, |b, stream| {
            b.iter(|| {
                let mut cursor = Cursor::new(stream.as_slice());
                let mut decoder = FrameDecoder::new();
                let mut frames = 0usize;
                while let Ok(outcome) = decoder.decode(&mut cursor) {
                    match outcome {
                        DecodeOutcome::Frame(frame) => {
                            black_box(frame);
                            frames += 1;
                        }
                        DecodeOutcome::Idle => break,
                        _ => {}
                    }
                }
                frames
            });
        });
    }

    group.finish();
}

fn bench_encode_command(c: &mut Criterion) {
    c.bench_function("encode_get_command", |b| {
        b.iter(|| encode_command(black_box(Opcode::Get), black_box(&[b'S' as i32, 17, 2])))
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let config = Config::default();
    let table = DispatchTable::from_config(&config);
    let mut states = PinStates::from_config(&config);

    c.bench_function("dispatch_analog", |b| {
        let mut raw = 0u16;
        b.iter(|| {
            raw = (raw + 7) % 1024;
            black_box(table.dispatch_analog(&mut states, (raw % 4) as usize, raw))
        })
    });
}

criterion_group!(benches, bench_decode, bench_encode_command, bench_dispatch);
criterion_main!(benches);
