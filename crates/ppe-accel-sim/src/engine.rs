//! Simulated offload engine

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ppe_accel::{HwStatus, IidCalc, IidFields, PpeHal};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

const FAILURES: [HwStatus; 4] = [HwStatus::Busy, HwStatus::Timeout, HwStatus::Full, HwStatus::Fail];

/// Engine that fails programming calls at random
pub struct SimulatedHal {
    fail_rate: f64,
    latency: Duration,
    calls: AtomicU64,
    failures: AtomicU64,
}

/// Engine call counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineCounters {
    pub calls: u64,
    pub injected_failures: u64,
}

impl SimulatedHal {
    /// `fail_rate` must be within `0.0..=1.0`
    pub fn new(fail_rate: f64, latency: Duration) -> Self {
        Self {
            fail_rate,
            latency,
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            calls: self.calls.load(Ordering::Relaxed),
            injected_failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn roll(&self, op: &'static str) -> Result<(), HwStatus> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let mut rng = rand::thread_rng();
        if self.fail_rate > 0.0 && rng.gen_bool(self.fail_rate) {
            let status = *FAILURES.choose(&mut rng).unwrap_or(&HwStatus::Fail);
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(op, %status, "injected engine failure");
            return Err(status);
        }
        Ok(())
    }
}

/// Ones' complement sum of 16-bit words
fn csum(words: &[u16]) -> u16 {
    let mut sum: u32 = words.iter().map(|w| u32::from(*w)).sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

impl PpeHal for SimulatedHal {
    fn prefix_add(&self, l3_if: u32, prefix: Ipv6Addr, prefix_len: u8) -> Result<(), HwStatus> {
        self.roll("prefix_add")?;
        tracing::debug!(l3_if, %prefix, prefix_len, "engine prefix programmed");
        Ok(())
    }

    fn prefix_del(&self, index: u32) -> Result<(), HwStatus> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(index, "engine prefix cleared");
        Ok(())
    }

    fn iid_calc(&self, calc: &IidCalc) -> Result<IidFields, HwStatus> {
        let addr = if calc.is_dnat { calc.dip } else { calc.sip };
        let from = csum(&addr.segments()[..4]);
        let to = csum(&calc.tip.segments()[..4]);
        Ok(IidFields {
            iid: calc.tip.segments()[7],
            adjustment: !csum(&[from, !to]),
            adj_offset: calc.tip_prefix_len.div_ceil(16).min(7),
        })
    }

    fn iid_add(&self, flow_index: u16, fields: &IidFields) -> Result<(), HwStatus> {
        self.roll("iid_add")?;
        tracing::debug!(flow_index, iid = fields.iid, "engine IID programmed");
        Ok(())
    }

    fn iid_del(&self, flow_index: u16) -> Result<(), HwStatus> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(flow_index, "engine IID cleared");
        Ok(())
    }
}
