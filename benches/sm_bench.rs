//! Session management codec benchmark.
//!
//! Measures encode/decode of the fixed-layout SM packet. The SM plane is
//! a slow path, but the codec also runs in the Nexus receive thread for
//! every control datagram, so it should stay trivially cheap.
//!
//! Run with:
//! ```bash
//! cargo bench --bench sm_bench
//! ```

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use udrpc::{SmPacket, SmPktType, SM_PACKET_SIZE};

fn sample_packet() -> SmPacket {
    let mut pkt = SmPacket::new(SmPktType::ConnectReq);
    pkt.client.set_hostname("client-3.cluster").unwrap();
    pkt.client.app_tid = 1;
    pkt.client.phy_port = 0;
    pkt.client.session_num = 42;
    pkt.client.start_seq = 0x1234_5678_9ABC;
    pkt.server.set_hostname("server-7.cluster").unwrap();
    pkt.server.app_tid = 2;
    pkt.server.phy_port = 0;
    pkt
}

fn bench_codec(c: &mut Criterion) {
    let pkt = sample_packet();
    let bytes = pkt.to_bytes();

    let mut group = c.benchmark_group("sm_codec");
    group.throughput(Throughput::Bytes(SM_PACKET_SIZE as u64));

    group.bench_function("encode", |b| b.iter(|| black_box(&pkt).to_bytes()));
    group.bench_function("decode", |b| {
        b.iter(|| SmPacket::from_bytes(black_box(&bytes)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
