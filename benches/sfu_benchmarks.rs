use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;
use webrtc::rtp::header::{Extension, Header};
use webrtc::rtp::packet::Packet;

// Import from the roomcast library
use roomcast::admission::AdmissionLimiter;
use roomcast::peer::scrub_header_extensions;
use roomcast::room::{User, UserState};
use roomcast::signal::RosterPayload;

// 1. Benchmark the per-packet header scrub (Hot Path)
// Every forwarded packet gets its extensions stripped before fan-out
fn bench_packet_scrub(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_operations");

    // Create a typical audio packet (approx 1200 bytes) with extensions
    let packet = Packet {
        header: Header {
            version: 2,
            payload_type: 111,
            sequence_number: 1234,
            timestamp: 987654321,
            ssrc: 11223344,
            extension: true,
            extension_profile: 0xBEDE,
            extensions: vec![Extension {
                id: 1,
                payload: Bytes::from_static(&[0x10]),
            }],
            ..Default::default()
        },
        payload: Bytes::from(vec![0u8; 1200]),
    };

    group.bench_function("scrub_header_extensions", |b| {
        b.iter(|| {
            let mut p = packet.clone();
            scrub_header_extensions(&mut p);
            p
        })
    });

    group.finish();
}

// 2. Benchmark the admission token bucket (Upgrade Path)
fn bench_admission(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let limiter = Arc::new(AdmissionLimiter::new());

    let mut group = c.benchmark_group("admission");
    group.bench_function("try_admit", |b| {
        b.to_async(&rt).iter(|| {
            let limiter = limiter.clone();
            async move {
                let _ = limiter.try_admit().await;
            }
        })
    });

    group.finish();
}

// 3. Benchmark roster encoding (Broadcast Path)
// Every state mutation re-encodes the roster for all sessions
fn bench_roster_encode(c: &mut Criterion) {
    let users: Vec<User> = (0..25)
        .map(|i| User {
            id: Uuid::new_v4(),
            name: format!("user-{}", i),
            state: if i % 3 == 0 {
                UserState::Speaking
            } else {
                UserState::Listening
            },
        })
        .collect();

    let mut group = c.benchmark_group("roster");
    group.bench_function("encode_25_users", |b| {
        b.iter(|| {
            serde_json::to_string(&RosterPayload {
                users: users.clone(),
            })
            .unwrap()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_scrub,
    bench_admission,
    bench_roster_encode
);
criterion_main!(benches);
