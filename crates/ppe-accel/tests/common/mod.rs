//! Shared engine double for integration tests

#![allow(dead_code)]

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ppe_accel::{ConnFlow, HwStatus, IidCalc, IidFields, NptKind, Nptv6Rule, PpeHal};

/// Counting engine with switchable failures and an optional completion hook
#[derive(Default)]
pub struct CountingHal {
    pub prefix_adds: AtomicUsize,
    pub prefix_dels: AtomicUsize,
    pub iid_adds: AtomicUsize,
    pub iid_dels: AtomicUsize,
    pub fail_prefix_add: Mutex<Option<HwStatus>>,
    pub fail_iid_add: Mutex<Option<HwStatus>>,
    pub on_iid_add: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl CountingHal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn adds(&self) -> usize {
        self.prefix_adds.load(Ordering::SeqCst)
    }

    pub fn dels(&self) -> usize {
        self.prefix_dels.load(Ordering::SeqCst)
    }
}

impl PpeHal for CountingHal {
    fn prefix_add(&self, _l3_if: u32, _prefix: Ipv6Addr, _len: u8) -> Result<(), HwStatus> {
        if let Some(status) = *self.fail_prefix_add.lock() {
            return Err(status);
        }
        self.prefix_adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn prefix_del(&self, _index: u32) -> Result<(), HwStatus> {
        self.prefix_dels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn iid_calc(&self, calc: &IidCalc) -> Result<IidFields, HwStatus> {
        Ok(IidFields {
            iid: calc.tip.segments()[7],
            adjustment: 0,
            adj_offset: 3,
        })
    }

    fn iid_add(&self, _flow_index: u16, _fields: &IidFields) -> Result<(), HwStatus> {
        if let Some(hook) = self.on_iid_add.lock().as_ref() {
            hook();
        }
        if let Some(status) = *self.fail_iid_add.lock() {
            return Err(status);
        }
        self.iid_adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn iid_del(&self, _flow_index: u16) -> Result<(), HwStatus> {
        self.iid_dels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn ip(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

/// Forward/reverse pair for connection `n` (flow indices 2n, 2n+1)
pub fn flows(n: u16) -> (ConnFlow, ConnFlow) {
    let host = n + 1;
    let fwd = ConnFlow {
        flow_index: 2 * n,
        in_l3_if: 1,
        match_src: Ipv6Addr::new(0xfd00, 1, 0, 0, 0, 0, 0, host),
        match_dest: ip("2001:db8:9::1"),
        xlate_src: Ipv6Addr::new(0x2001, 0xdb8, 5, 0, 0, 0, 0, host),
        xlate_dest: ip("2001:db8:9::1"),
    };
    let rev = ConnFlow {
        flow_index: 2 * n + 1,
        in_l3_if: 2,
        match_src: ip("2001:db8:9::1"),
        match_dest: fwd.xlate_src,
        xlate_src: ip("2001:db8:9::1"),
        xlate_dest: fwd.match_src,
    };
    (fwd, rev)
}

pub fn snpt_rule() -> Nptv6Rule {
    Nptv6Rule {
        src_pfx: ip("fd00:1::"),
        dst_pfx: ip("2001:db8:5::"),
        src_pfx_len: 48,
        dst_pfx_len: 48,
        kind: NptKind::Snpt,
    }
}
