//! Broadcast and replay benchmarks
//!
//! Measures the cost of getting a change from a mutator onto the wire.
//!
//! - Buffered flush: N list mutations coalesced into one envelope
//! - Immediate send: one observable change encoded and fanned out
//! - Hub record: one change sequenced, buffered and fanned out
//!
//! Run with: cargo bench --bench flush_bench

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rivulet_core::binding::{Binding, BindingRegistry, OwnerTree};
use rivulet_core::broadcast::{BroadcastConfig, BroadcastCore};
use rivulet_core::collections::TrackedList;
use rivulet_core::observable::Observable;
use rivulet_core::replay::ReplayHub;
use rivulet_core::scheduler::ManualScheduler;
use rivulet_core::session::{SessionError, SessionId, SessionSink};

/// Sink that only counts bytes.
struct NullSink {
    id: SessionId,
}

impl SessionSink for NullSink {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_open(&self) -> bool {
        true
    }

    fn send(&self, text: &str) -> Result<(), SessionError> {
        black_box(text.len());
        Ok(())
    }

    fn close(&self) {}
}

fn null_sink() -> Arc<NullSink> {
    Arc::new(NullSink {
        id: SessionId::generate(),
    })
}

fn bench_buffered_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffered_flush");
    for mutations in [1usize, 16, 256] {
        let list = TrackedList::new();
        let tree = OwnerTree::new("page").bind("items", Binding::tracked(Observable::new(list.clone())));
        let sched = Arc::new(ManualScheduler::new());
        let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
            .scheduler(sched.clone())
            .config(BroadcastConfig::builder().max_queue_depth(1024).build())
            .build();
        core.on_open(null_sink(), None, 0).unwrap();

        group.throughput(Throughput::Elements(mutations as u64));
        group.bench_with_input(BenchmarkId::from_parameter(mutations), &mutations, |b, &n| {
            b.iter(|| {
                for i in 0..n {
                    list.push(i as u64);
                }
                list.clear();
                sched.run_pending();
            });
        });
    }
    group.finish();
}

fn bench_immediate_send(c: &mut Criterion) {
    let count = Observable::new(0u64);
    let tree = OwnerTree::new("page").bind("count", Binding::value(count.clone()));
    let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
        .config(BroadcastConfig::immediate())
        .build();
    for _ in 0..4 {
        core.on_open(null_sink(), None, 0).unwrap();
    }

    c.bench_function("immediate_send_4_sessions", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            count.set(black_box(n));
        });
    });
}

fn bench_hub_record(c: &mut Criterion) {
    let count = Observable::new(0u64);
    let tree = OwnerTree::new("page").bind("count", Binding::value(count.clone()));
    let hub = ReplayHub::new(BindingRegistry::from_tree(&tree).unwrap());
    hub.subscribe(null_sink(), 0).unwrap();

    c.bench_function("hub_record", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            count.set(black_box(n));
        });
    });

    c.bench_function("hub_poll_recent", |b| {
        b.iter(|| black_box(hub.poll(hub.current_sequence().saturating_sub(10))));
    });
}

criterion_group!(
    benches,
    bench_buffered_flush,
    bench_immediate_send,
    bench_hub_record
);
criterion_main!(benches);
