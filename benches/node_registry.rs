//! Benchmark for the sharded node registry
//!
//! Target: 10K registry updates/sec

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fleet_operator::domain::{GeoInfo, NodeDescriptor, NodeMetrics, NodeStatus};
use fleet_operator::registry::{NodeId, NodeRegistry};

fn descriptor(name: &str) -> NodeDescriptor {
    NodeDescriptor {
        name: name.to_string(),
        ip: "203.0.113.10".to_string(),
        geo: GeoInfo::default(),
        protocol: Some("vless-ws-tls".to_string()),
    }
}

fn bench_register_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_registry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_single_node", |b| {
        let registry = NodeRegistry::new();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let _ = registry.register(black_box(descriptor(&format!("node-{}", counter))));
        });
    });

    group.finish();
}

fn bench_heartbeat(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_registry");
    group.throughput(Throughput::Elements(1));

    // Pre-register nodes
    let registry = NodeRegistry::new();
    let ids: Vec<NodeId> = (0..1000)
        .map(|i| registry.register(descriptor(&format!("node-{:04}", i))))
        .collect();

    group.bench_function("heartbeat", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let node_id = &ids[counter % ids.len()];
            let metrics = NodeMetrics {
                cpu_percent: Some(12.5),
                ram_percent: Some(40.0),
                ..Default::default()
            };
            let _ = registry.heartbeat(
                black_box(node_id.clone()),
                NodeStatus::Online,
                Some(metrics),
            );
        });
    });

    group.finish();
}

fn bench_concurrent_heartbeats(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_registry");
    group.throughput(Throughput::Elements(100));

    // Pre-register nodes
    let registry = NodeRegistry::new();
    let ids: Vec<NodeId> = (0..1000)
        .map(|i| registry.register(descriptor(&format!("node-{:04}", i))))
        .collect();

    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_heartbeats", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let reg = registry.clone();
                    let node_id = ids[i % ids.len()].clone();
                    handles.push(tokio::spawn(async move {
                        let _ = reg.heartbeat(node_id, NodeStatus::Online, None);
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

fn bench_list_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_registry");
    group.throughput(Throughput::Elements(1));

    let registry = NodeRegistry::new();
    for i in 0..1000 {
        let id = registry.register(descriptor(&format!("node-{:04}", i)));
        let _ = registry.heartbeat(id, NodeStatus::Online, None);
    }

    group.bench_function("list_1000_nodes", |b| {
        b.iter(|| {
            let entries = registry.list();
            black_box(entries.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_register_nodes,
    bench_heartbeat,
    bench_concurrent_heartbeats,
    bench_list_snapshot,
);
criterion_main!(benches);
