//! Benchmarks for the `svn-core` crate.
//!
//! Run with:
//! - `cargo bench`

#![allow(missing_docs)]

use std::hint::black_box;
use std::io::Write;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use svn_core::delta::DeltaApplier;
use svn_core::merge::{MergeMarkers, merge};
use svn_core::sequence::{DiffOptions, diff};

const ZLIB_MIN_COMPRESS_SIZE: usize = 512;

#[derive(Clone, Copy, Debug)]
enum SvndiffVersion {
    V0 = 0,
    V1 = 1,
    V2 = 2,
}

fn abort_with_error(message: &str) -> ! {
    eprintln!("{message}");
    std::process::abort();
}

fn encode_uint(val: u64, out: &mut Vec<u8>) {
    let mut groups = vec![(val & 0x7f) as u8];
    let mut rest = val >> 7;
    while rest > 0 {
        groups.push(((rest & 0x7f) as u8) | 0x80);
        rest >>= 7;
    }
    out.extend(groups.iter().rev());
}

fn encode_section(version: SvndiffVersion, data: &[u8]) -> Vec<u8> {
    if matches!(version, SvndiffVersion::V0) {
        return data.to_vec();
    }
    let mut out = Vec::new();
    encode_uint(data.len() as u64, &mut out);
    let compressed = match version {
        SvndiffVersion::V1 if data.len() >= ZLIB_MIN_COMPRESS_SIZE => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
            if encoder.write_all(data).is_err() {
                abort_with_error("zlib encoder write failed");
            }
            match encoder.finish() {
                Ok(v) => v,
                Err(_) => abort_with_error("zlib encoder finish failed"),
            }
        }
        SvndiffVersion::V2 => lz4_flex::compress(data),
        _ => data.to_vec(),
    };
    if compressed.len() >= data.len() {
        out.extend_from_slice(data);
    } else {
        out.extend_from_slice(&compressed);
    }
    out
}

/// A single-window delta that copies the first half of the base and
/// appends `tail` as new data.
fn encode_delta(version: SvndiffVersion, base_len: usize, tail: &[u8]) -> Vec<u8> {
    let copy_len = base_len / 2;
    let mut instructions = Vec::new();
    instructions.push(0x00);
    encode_uint(copy_len as u64, &mut instructions);
    encode_uint(0, &mut instructions);
    instructions.push(0x80);
    encode_uint(tail.len() as u64, &mut instructions);

    let instructions = encode_section(version, &instructions);
    let new_data = encode_section(version, tail);

    let mut out = vec![b'S', b'V', b'N', version as u8];
    encode_uint(0, &mut out);
    encode_uint(base_len as u64, &mut out);
    encode_uint((copy_len + tail.len()) as u64, &mut out);
    encode_uint(instructions.len() as u64, &mut out);
    encode_uint(new_data.len() as u64, &mut out);
    out.extend_from_slice(&instructions);
    out.extend_from_slice(&new_data);
    out
}

fn bench_delta_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_apply");
    let base = vec![b'a'; 32 * 1024];
    let tail = vec![b'z'; 16 * 1024];

    for version in [SvndiffVersion::V0, SvndiffVersion::V1, SvndiffVersion::V2] {
        let delta = encode_delta(version, base.len(), &tail);
        group.throughput(Throughput::Bytes((base.len() / 2 + tail.len()) as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("{version:?}"), "1k_chunks"),
            &delta,
            |b, delta| {
                b.iter(|| {
                    let mut out = Vec::with_capacity(base.len());
                    let mut applier = DeltaApplier::new(&base);
                    for chunk in delta.chunks(1024) {
                        if applier.push(chunk, &mut out).is_err() {
                            abort_with_error("delta push failed");
                        }
                    }
                    if applier.finish(&mut out).is_err() {
                        abort_with_error("delta finish failed");
                    }
                    black_box(out.len());
                });
            },
        );
    }
    group.finish();
}

fn text(lines: usize, edit_every: usize, salt: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..lines {
        if edit_every > 0 && i % edit_every == 0 {
            out.extend_from_slice(format!("{salt} {i}\n").as_bytes());
        } else {
            out.extend_from_slice(format!("line {i}\n").as_bytes());
        }
    }
    out
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    for &lines in &[1_000usize, 10_000] {
        let left = text(lines, 0, "");
        let right = text(lines, 97, "edited");
        group.throughput(Throughput::Bytes(left.len() as u64));
        for (name, exponent) in [("unbounded", 1.0), ("depth_0.5", 0.5)] {
            let options = DiffOptions::default().with_search_depth(exponent);
            group.bench_with_input(BenchmarkId::new(name, lines), &options, |b, options| {
                b.iter(|| match diff(&left, &right, options) {
                    Ok(result) => black_box(result.blocks().len()),
                    Err(_) => abort_with_error("diff failed"),
                });
            });
        }
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    let base = text(5_000, 0, "");
    let local = text(5_000, 101, "local");
    let latest = text(5_000, 89, "latest");
    let markers = MergeMarkers::default();
    group.throughput(Throughput::Bytes(base.len() as u64));
    group.bench_function("interleaved_edits", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(base.len());
            if merge(&base, &local, &latest, &markers, &mut out).is_err() {
                abort_with_error("merge failed");
            }
            black_box(out.len());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_delta_apply, bench_diff, bench_merge);
criterion_main!(benches);
