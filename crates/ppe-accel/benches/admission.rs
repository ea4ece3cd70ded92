//! Admission Fast Path Benchmarks

use std::net::Ipv6Addr;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ppe_accel::{
    AccelConnection, AccelOutcome, AccelStateMachine, AdmissionController, AdmissionLimit,
    ConnectionId, HwStatus, IidCalc, IidFields, LimitMode, PpeHal, PrefixTable, SlotPool,
};

/// Engine that accepts everything
struct NullHal;

impl PpeHal for NullHal {
    fn prefix_add(&self, _: u32, _: Ipv6Addr, _: u8) -> Result<(), HwStatus> {
        Ok(())
    }
    fn prefix_del(&self, _: u32) -> Result<(), HwStatus> {
        Ok(())
    }
    fn iid_calc(&self, _: &IidCalc) -> Result<IidFields, HwStatus> {
        Ok(IidFields::default())
    }
    fn iid_add(&self, _: u16, _: &IidFields) -> Result<(), HwStatus> {
        Ok(())
    }
    fn iid_del(&self, _: u16) -> Result<(), HwStatus> {
        Ok(())
    }
}

fn bench_try_begin_pending(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");

    for (name, mode) in [("unbounded", LimitMode::Unbounded), ("fixed", LimitMode::Fixed)] {
        let adm = AdmissionController::new(AdmissionLimit {
            mode,
            max_slots: u32::MAX,
        });
        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("begin_end", name), |b| {
            b.iter(|| {
                let mut g = adm.lock();
                black_box(g.try_begin_pending_within_limit());
                g.end_pending(ppe_accel::PendingOutcome::Failed);
            })
        });
    }

    group.finish();
}

fn bench_accel_cycle(c: &mut Criterion) {
    let sm = AccelStateMachine::new(Arc::new(AdmissionController::default()), 0, None);
    let conn = Arc::new(AccelConnection::new(ConnectionId(1)));

    c.bench_function("accel_request_resolve", |b| {
        b.iter(|| {
            black_box(sm.request_accel(&conn));
            black_box(sm.resolve_pending(&conn, AccelOutcome::TransientFail));
        })
    });
}

fn bench_prefix_refcount(c: &mut Criterion) {
    let table = PrefixTable::new(Arc::new(NullHal), Arc::new(SlotPool::new(64, 1024)));
    let prefix: Ipv6Addr = "2001:db8::".parse().unwrap();
    let held = table.acquire(1, prefix, 48).unwrap();

    let mut group = c.benchmark_group("prefix");
    group.bench_function("shared_acquire_release", |b| {
        b.iter(|| black_box(table.acquire(1, prefix, 48).unwrap()).release())
    });
    group.bench_function("install_remove", |b| {
        b.iter(|| black_box(table.acquire(2, prefix, 48).unwrap()).release())
    });
    group.finish();

    drop(held);
}

criterion_group!(
    benches,
    bench_try_begin_pending,
    bench_accel_cycle,
    bench_prefix_refcount,
);

criterion_main!(benches);
