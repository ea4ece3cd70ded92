//! Acceleration Statistics
//!
//! Read-only, point-in-time view over the admission counters, the pending
//! registry and the slot pool.

use serde::Serialize;

use crate::accel::AccelStateMachine;
use crate::admission::LimitMode;
use crate::hal::PpeHal;
use crate::prefix::PrefixTable;

/// Stats snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccelStats {
    /// Connections in ACCEL_PENDING
    pub pending: i64,
    /// Connections in ACCEL or DECEL_PENDING
    pub accelerated: i64,
    /// Connections in DECEL_PENDING
    pub pending_decel: i64,
    /// Pending transitions granted since start
    pub admitted_total: u64,
    /// Pending transitions refused by the limit since start
    pub refused_total: u64,
    /// Attempts force-resolved by the pending deadline
    pub forced_timeouts: u64,
    /// Attempts awaiting completion in the registry
    pub pending_attempts: usize,
    /// Prefix rows with a nonzero refcount
    pub prefixes_in_use: usize,
    /// IID slots with at least one direction programmed
    pub iids_in_use: usize,
    /// Prefix installs issued to the engine
    pub prefix_installs: u64,
    /// Prefix deletes issued to the engine
    pub prefix_removals: u64,
    /// Active admission policy
    pub limit_mode: LimitMode,
    /// Engine capacity the fixed limit enforces
    pub max_slots: u32,
}

impl AccelStats {
    /// Collect from live state (each source read separately, not atomic)
    pub fn collect<H: PpeHal>(sm: &AccelStateMachine, prefixes: &PrefixTable<H>) -> Self {
        let adm = sm.admission().snapshot();
        let pool = prefixes.pool();
        Self {
            pending: adm.pending,
            accelerated: adm.accelerated,
            pending_decel: adm.pending_decel,
            admitted_total: adm.admitted_total,
            refused_total: adm.refused_total,
            forced_timeouts: sm.forced_timeouts(),
            pending_attempts: sm.pending_attempts(),
            prefixes_in_use: pool.prefixes_in_use(),
            iids_in_use: pool.iids_in_use(),
            prefix_installs: prefixes.installs(),
            prefix_removals: prefixes.removals(),
            limit_mode: adm.limit_mode,
            max_slots: adm.max_slots,
        }
    }

    /// Connections holding or about to hold an engine slot
    pub fn occupancy(&self) -> i64 {
        self.pending + self.accelerated
    }
}
