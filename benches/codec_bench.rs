//! Codec benchmark tests
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use bytes::BytesMut;
use relaykit::chunk::{ChunkReader, ChunkWriter};
use relaykit::common::clock::{Clock, ManualClock};
use relaykit::crypto::kdf::{session_subkey, ss_subkey};
use relaykit::crypto::AeadCipher;
use relaykit::shadowsocks2022::{Method, PacketClient, PacketService};
use relaykit::Address;
use std::sync::Arc;

const PAYLOAD_16K: usize = 16 * 1024;

fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(1_700_000_000))
}

fn bench_stream_chunks(c: &mut Criterion) {
    let key = [7u8; 32];
    let payload = vec![0xa5u8; PAYLOAD_16K];

    let mut group = c.benchmark_group("stream_chunks");
    group.throughput(Throughput::Bytes(PAYLOAD_16K as u64));

    group.bench_function("seal_16k", |b| {
        let mut writer = ChunkWriter::new(AeadCipher::aes_256_gcm(&key).unwrap());
        let mut out = BytesMut::with_capacity(PAYLOAD_16K + 64);
        b.iter(|| {
            out.clear();
            writer.encode(black_box(&payload), &mut out).unwrap();
            black_box(out.len())
        })
    });

    group.bench_function("open_16k", |b| {
        // One sealed stream replayed against a fresh reader per batch.
        b.iter_batched(
            || {
                let mut writer = ChunkWriter::new(AeadCipher::aes_256_gcm(&key).unwrap());
                let mut sealed = BytesMut::new();
                writer.encode(&payload, &mut sealed).unwrap();
                (ChunkReader::new(AeadCipher::aes_256_gcm(&key).unwrap()), sealed)
            },
            |(mut reader, mut sealed)| {
                let mut out = BytesMut::with_capacity(PAYLOAD_16K);
                reader.decode(&mut sealed, &mut out).unwrap();
                black_box(out.len())
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_udp_packets(c: &mut Criterion) {
    let psk = vec![0xaau8; 32];
    let destination = Address::from("1.1.1.1");
    let payload = vec![0x5au8; 1400];

    let mut group = c.benchmark_group("udp_packets");
    group.throughput(Throughput::Bytes(1400));

    group.bench_function("encode_aes256", |b| {
        let mut client =
            PacketClient::new(Method::Blake3Aes256Gcm, vec![psk.clone()], clock()).unwrap();
        let mut out = BytesMut::with_capacity(2048);
        b.iter(|| {
            out.clear();
            client
                .encode(black_box(&destination), 443, &payload, &mut out)
                .unwrap();
            black_box(out.len())
        })
    });

    group.bench_function("decode_aes256", |b| {
        let service =
            PacketService::new(Method::Blake3Aes256Gcm, vec![psk.clone()], clock()).unwrap();
        b.iter_batched(
            || {
                let mut client =
                    PacketClient::new(Method::Blake3Aes256Gcm, vec![psk.clone()], clock())
                        .unwrap();
                let mut packet = BytesMut::new();
                client.encode(&destination, 443, &payload, &mut packet).unwrap();
                packet
            },
            |packet| black_box(service.decode(&packet).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });

    group.bench_function("encode_xchacha", |b| {
        let mut client =
            PacketClient::new(Method::Blake3ChaCha20Poly1305, vec![psk.clone()], clock())
                .unwrap();
        let mut out = BytesMut::with_capacity(2048);
        b.iter(|| {
            out.clear();
            client
                .encode(black_box(&destination), 443, &payload, &mut out)
                .unwrap();
            black_box(out.len())
        })
    });

    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    let psk = [3u8; 32];
    let salt = [9u8; 32];

    let mut group = c.benchmark_group("key_derivation");
    group.throughput(Throughput::Elements(1));

    group.bench_function("blake3_session_subkey", |b| {
        b.iter(|| black_box(session_subkey(black_box(&psk), black_box(&salt), 32)))
    });

    group.bench_function("hkdf_sha1_subkey", |b| {
        b.iter(|| black_box(ss_subkey(black_box(&psk), black_box(&salt)).unwrap()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_stream_chunks,
    bench_udp_packets,
    bench_key_derivation
);
criterion_main!(benches);
