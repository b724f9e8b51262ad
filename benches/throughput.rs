//! Throughput Benchmark for FlashGate
//!
//! Measures the bulk mutation path through the command executor and the
//! cost of registering sessions, including replacement of a duplicate
//! identity.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flashgate::commands::{CommandExecutor, CommandServices, DeploymentPolicy, InitializeHandler};
use flashgate::protocol::Frame;
use flashgate::session::{
    Capabilities, ClientConnection, ClientDescriptor, EventHub, Session, SessionRegistry,
    SessionSettings, TransportHandle,
};
use flashgate::storage::{CacheStore, MemoryCache, MemoryCacheConfig, MemoryCatalog};
use std::net::SocketAddr;
use std::sync::Arc;

fn bulk(s: &str) -> Frame {
    Frame::bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn setup() -> (CommandExecutor, ClientConnection) {
    let events = Arc::new(EventHub::new());
    let cache = Arc::new(
        MemoryCache::new(MemoryCacheConfig::default()).with_events(Arc::clone(&events)),
    );
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add(cache);
    let executor = CommandExecutor::new(
        InitializeHandler::new(
            catalog,
            Arc::new(SessionRegistry::new()),
            events,
            false,
            DeploymentPolicy::AcceptRemote,
        ),
        CommandServices::default(),
    );

    let addr = SocketAddr::from(([127, 0, 0, 1], 9800));
    let (transport, _closed) = TransportHandle::new();
    let mut conn = ClientConnection::new(addr, addr, transport);
    let init = Frame::array(vec![
        bulk("INIT"),
        Frame::integer(1),
        Frame::integer(1),
        Frame::integer(2),
        bulk("default"),
        bulk("bench"),
        Frame::Null,
        Frame::integer(5000),
        Frame::integer(0),
        Frame::integer(0),
        Frame::Null,
        Frame::array(vec![bulk("bench"), bulk("criterion"), Frame::integer(1), bulk("localhost")]),
    ]);
    executor.execute(&mut conn, init);
    (executor, conn)
}

fn bulk_frame(tag: &str, request_id: i64, keys: &[Frame], value: &Frame) -> Frame {
    let entries = keys.iter().map(|_| Frame::array(vec![value.clone()])).collect();
    Frame::array(vec![
        bulk(tag),
        Frame::integer(request_id),
        Frame::integer(request_id),
        Frame::integer(2),
        Frame::array(keys.to_vec()),
        Frame::array(entries),
        Frame::integer(0),
        Frame::Null,
        Frame::Null,
        Frame::integer(-1),
        Frame::integer(1),
    ])
}

/// Benchmark INSERTBULK with growing batch sizes
fn bench_insert_bulk(c: &mut Criterion) {
    let (executor, mut conn) = setup();
    let value = Frame::bulk(Bytes::from("x".repeat(256)));

    let mut group = c.benchmark_group("insert_bulk");
    for batch in [1usize, 16, 128] {
        let keys: Vec<Frame> = (0..batch).map(|i| bulk(&format!("key:{}", i))).collect();
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &keys, |b, keys| {
            let mut id = 0i64;
            b.iter(|| {
                id += 1;
                black_box(executor.execute(&mut conn, bulk_frame("INSERTBULK", id, keys, &value)));
            });
        });
    }
    group.finish();
}

/// Benchmark ADDBULK where every key is fresh
fn bench_add_bulk(c: &mut Criterion) {
    let (executor, mut conn) = setup();
    let value = bulk("small_value");

    let mut group = c.benchmark_group("add_bulk");
    group.throughput(Throughput::Elements(16));
    group.bench_function("fresh_keys_16", |b| {
        let mut id = 0i64;
        b.iter(|| {
            id += 1;
            let keys: Vec<Frame> = (0..16).map(|i| bulk(&format!("k:{}:{}", id, i))).collect();
            black_box(executor.execute(&mut conn, bulk_frame("ADDBULK", id, &keys, &value)));
        });
    });
    group.finish();
}

/// Benchmark session registration and duplicate eviction
fn bench_registry(c: &mut Criterion) {
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(MemoryCacheConfig::default()));
    let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
    let session = |id: &str| {
        let (transport, _closed) = TransportHandle::new();
        Arc::new(Session::new(SessionSettings {
            client_id: id.to_string(),
            client_version: 5000,
            command_version: 2,
            capabilities: Capabilities::default(),
            descriptor: ClientDescriptor::default(),
            cache: Arc::clone(&cache),
            peer,
            transport,
        }))
    };

    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_unique", |b| {
        let registry = SessionRegistry::new();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(registry.register(&format!("client:{}", i), session("unique")));
        });
    });

    group.bench_function("register_evict", |b| {
        let registry = SessionRegistry::new();
        b.iter(|| {
            if let Some(evicted) = registry.register("same", session("same")) {
                evicted.mark_replaced();
                let _ = evicted.dispose();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_insert_bulk, bench_add_bulk, bench_registry);
criterion_main!(benches);
