//! Connection workload
//!
//! Worker threads pull connection numbers from a queue, take a free IID slot,
//! offload the connection and hand it to a reaper that decelerates it once
//! its hold time has passed. A slot goes back on the free list only after
//! everything programmed on its flow indices has been removed.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use ppe_accel::{
    AccelConnection, ConnFlow, ConnectionId, NptKind, Nptv6Frontend, Nptv6Rule, OffloadHandle,
    OffloadResult,
};
use serde::Serialize;

use crate::engine::SimulatedHal;

/// Attempts per connection before giving up on it
const MAX_ATTEMPTS: u32 = 3;

/// Ingress interfaces flows are spread over
const L3_IFS: u32 = 4;

/// Slot pairs addressable with a 16-bit flow index
const MAX_IID_SLOTS: u16 = 1 << 15;

/// Workload shape
#[derive(Debug, Clone)]
pub struct Workload {
    pub connections: u32,
    pub workers: usize,
    pub hold: Duration,
    pub iid_slots: u16,
}

#[derive(Default)]
struct Counters {
    offloaded: AtomicU64,
    refused: AtomicU64,
    failed: AtomicU64,
    decel_mid_flight: AtomicU64,
    decelerated: AtomicU64,
    decel_errors: AtomicU64,
}

/// Workload outcome
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Report {
    pub offloaded: u64,
    pub refused: u64,
    pub failed: u64,
    pub decel_mid_flight: u64,
    pub decelerated: u64,
    pub decel_errors: u64,
    pub elapsed_ms: u64,
}

type Held = (Instant, Arc<AccelConnection>, OffloadHandle<SimulatedHal>, u16);

/// Address pair for connection `n` on IID slot `slot`
fn flows(n: u32, slot: u16) -> (ConnFlow, ConnFlow) {
    let host = (n & 0xffff) as u16;
    let inside = Ipv6Addr::new(0xfd00, 1, 0, 0, 0, 0, 0x10, host);
    let outside = Ipv6Addr::new(0x2001, 0xdb8, 5, 0, 0, 0, 0x10, host);
    let peer = Ipv6Addr::new(0x2001, 0xdb8, 0xffff, 0, 0, 0, 0, 1);

    let fwd = ConnFlow {
        flow_index: slot * 2,
        in_l3_if: 1 + n % L3_IFS,
        match_src: inside,
        match_dest: peer,
        xlate_src: outside,
        xlate_dest: peer,
    };
    let rev = ConnFlow {
        flow_index: slot * 2 + 1,
        in_l3_if: 1 + (n + 1) % L3_IFS,
        match_src: peer,
        match_dest: outside,
        xlate_src: peer,
        xlate_dest: inside,
    };
    (fwd, rev)
}

fn rule() -> Nptv6Rule {
    Nptv6Rule {
        src_pfx: Ipv6Addr::new(0xfd00, 1, 0, 0, 0, 0, 0, 0),
        dst_pfx: Ipv6Addr::new(0x2001, 0xdb8, 5, 0, 0, 0, 0, 0),
        src_pfx_len: 48,
        dst_pfx_len: 48,
        kind: NptKind::Snpt,
    }
}

fn offload_one(
    fe: &Nptv6Frontend<SimulatedHal>,
    n: u32,
    slot: u16,
    workload: &Workload,
    counters: &Counters,
    held: &channel::Sender<Held>,
) -> Option<u16> {
    let conn = Arc::new(AccelConnection::new(ConnectionId(u64::from(n))));
    let (fwd, rev) = flows(n, slot);
    let rule = rule();

    for attempt in 1..=MAX_ATTEMPTS {
        match fe.offload(&conn, &fwd, &rev, &rule) {
            OffloadResult::Offloaded(handle) => {
                counters.offloaded.fetch_add(1, Ordering::Relaxed);
                let deadline = Instant::now() + workload.hold;
                if let Err(channel::SendError((_, conn, handle, slot))) =
                    held.send((deadline, Arc::clone(&conn), handle, slot))
                {
                    // Reaper gone; tear down here.
                    decelerate(fe, &conn, handle, counters);
                    return Some(slot);
                }
                return None;
            }
            OffloadResult::DecelRequested => {
                counters.decel_mid_flight.fetch_add(1, Ordering::Relaxed);
                return Some(slot);
            }
            OffloadResult::Refused => {
                counters.refused.fetch_add(1, Ordering::Relaxed);
            }
            OffloadResult::Failed(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(conn = %conn.id(), attempt, error = %err, "offload attempt failed");
            }
        }
        // Wait for the next "event" before asking again.
        thread::sleep(workload.hold / 4);
    }
    Some(slot)
}

fn decelerate(
    fe: &Nptv6Frontend<SimulatedHal>,
    conn: &AccelConnection,
    handle: OffloadHandle<SimulatedHal>,
    counters: &Counters,
) {
    match fe.decelerate(conn, handle) {
        Ok(_) => counters.decelerated.fetch_add(1, Ordering::Relaxed),
        Err(err) => {
            tracing::warn!(conn = %conn.id(), error = %err, "decel failed");
            counters.decel_errors.fetch_add(1, Ordering::Relaxed)
        }
    };
}

/// Run the workload to completion
pub fn run(fe: &Nptv6Frontend<SimulatedHal>, workload: &Workload) -> Report {
    let counters = Counters::default();
    let started = Instant::now();
    let (work_tx, work_rx) = channel::bounded::<u32>(workload.workers * 4);
    let (held_tx, held_rx) = channel::unbounded::<Held>();
    let (free_tx, free_rx) = channel::unbounded::<u16>();
    for slot in 0..workload.iid_slots.min(MAX_IID_SLOTS) {
        let _ = free_tx.send(slot);
    }

    thread::scope(|s| {
        let counters = &counters;

        let reaper_free = free_tx.clone();
        s.spawn(move || {
            for (deadline, conn, handle, slot) in held_rx {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
                decelerate(fe, &conn, handle, counters);
                let _ = reaper_free.send(slot);
            }
        });

        for id in 0..workload.workers {
            let work_rx = work_rx.clone();
            let held_tx = held_tx.clone();
            let free_tx = free_tx.clone();
            let free_rx = free_rx.clone();
            s.spawn(move || {
                tracing::debug!(worker = id, "worker starting");
                for n in work_rx {
                    // Blocks until the reaper hands a slot back.
                    let Ok(slot) = free_rx.recv() else {
                        break;
                    };
                    if let Some(slot) = offload_one(fe, n, slot, workload, counters, &held_tx) {
                        let _ = free_tx.send(slot);
                    }
                }
                tracing::debug!(worker = id, "worker stopped");
            });
        }
        drop(held_tx);
        drop(work_rx);
        drop(free_tx);

        for n in 0..workload.connections {
            if work_tx.send(n).is_err() {
                break;
            }
        }
        drop(work_tx);
    });

    Report {
        offloaded: counters.offloaded.load(Ordering::Relaxed),
        refused: counters.refused.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
        decel_mid_flight: counters.decel_mid_flight.load(Ordering::Relaxed),
        decelerated: counters.decelerated.load(Ordering::Relaxed),
        decel_errors: counters.decel_errors.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
