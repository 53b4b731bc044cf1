use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use meshctl_core::topology::{MoteId, TopologyGraph};
use meshctl_core::PropagationEngine;

/// Chain of `size` motes where every mote also links two hops ahead.
fn build_mesh(size: u16) -> TopologyGraph {
    let graph = TopologyGraph::new();
    for id in 1..=size {
        graph.upsert_mote(MoteId::new(id), 0.0, 0.0);
    }
    for id in 1..size {
        let _ = graph.connect(MoteId::new(id), MoteId::new(id + 1), Some(0.9));
        if id + 2 <= size {
            let _ = graph.connect(MoteId::new(id), MoteId::new(id + 2), Some(0.4));
        }
    }
    graph
}

fn bench_reachability(c: &mut Criterion) {
    let graph = build_mesh(500);
    c.bench_function("reachable_from_500_motes", |b| {
        b.iter(|| graph.reachable_from(black_box(MoteId::new(1))))
    });
}

fn bench_broadcast(c: &mut Criterion) {
    let graph = Arc::new(build_mesh(500));
    let engine = PropagationEngine::seeded(Arc::clone(&graph), 7);
    c.bench_function("broadcast_draws", |b| {
        b.iter(|| engine.broadcast(black_box(MoteId::new(250))))
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let graph = build_mesh(500);
    c.bench_function("topology_snapshot", |b| b.iter(|| graph.snapshot()));
}

criterion_group!(benches, bench_reachability, bench_broadcast, bench_snapshot);
criterion_main!(benches);
