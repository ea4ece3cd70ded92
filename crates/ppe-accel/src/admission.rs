//! Admission Controller
//!
//! Process-wide pending/accelerated counters for one protocol family. The
//! controller only counts; it never fails, it only refuses admission.
//!
//! Under [`LimitMode::Fixed`] the sum `pending + accelerated` is checked
//! against the slot limit before a connection may enter the pending state.
//! The check is not a reservation across the whole offload pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::lock::{LockRank, RankedGuard, RankedMutex};

/// Acceleration limiting policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitMode {
    /// Keep offering connections; the engine evicts rules when full
    #[default]
    Unbounded,
    /// Never exceed the engine's connection capacity
    Fixed,
}

/// Active limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionLimit {
    /// Limiting policy
    pub mode: LimitMode,
    /// Connection capacity used under [`LimitMode::Fixed`]
    pub max_slots: u32,
}

impl Default for AdmissionLimit {
    fn default() -> Self {
        Self {
            mode: LimitMode::Unbounded,
            max_slots: crate::DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// How a pending acceleration ended, from the counters' point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    /// Connection is now accelerated
    Succeeded,
    /// Connection is not accelerated
    Failed,
}

/// Counters guarded by the admission lock
#[derive(Debug, Default)]
pub struct AdmissionCounters {
    pending: i64,
    accelerated: i64,
    pending_decel: i64,
    limit: AdmissionLimit,
}

/// Decrement, treating a negative result as a broken invariant.
///
/// Debug builds panic. Release builds log and clamp to zero.
fn decrement(counter: &mut i64, name: &'static str) {
    *counter -= 1;
    if *counter < 0 {
        if cfg!(debug_assertions) {
            panic!("{} count underflow", name);
        }
        tracing::error!(counter = name, "admission counter underflow, clamping to zero");
        *counter = 0;
    }
}

/// Held admission lock
pub struct AdmissionGuard<'a> {
    counters: RankedGuard<'a, AdmissionCounters>,
    stats: &'a AdmissionStats,
}

impl AdmissionGuard<'_> {
    /// Grant a pending slot unless the fixed limit is reached
    pub fn try_begin_pending(&mut self, mode: LimitMode, max_slots: u32) -> bool {
        let c = &mut *self.counters;
        if mode == LimitMode::Fixed && c.pending + c.accelerated >= i64::from(max_slots) {
            self.stats.refused.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                pending = c.pending,
                accelerated = c.accelerated,
                max_slots,
                "accel limit reached, accel denied"
            );
            return false;
        }

        c.pending += 1;
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// [`Self::try_begin_pending`] against the controller's configured limit
    pub fn try_begin_pending_within_limit(&mut self) -> bool {
        let limit = self.counters.limit;
        self.try_begin_pending(limit.mode, limit.max_slots)
    }

    /// Close out a pending attempt
    pub fn end_pending(&mut self, outcome: PendingOutcome) {
        decrement(&mut self.counters.pending, "pending accel");
        if outcome == PendingOutcome::Succeeded {
            self.counters.accelerated += 1;
        }
    }

    /// Connection fully decelerated
    pub fn end_accel(&mut self) {
        decrement(&mut self.counters.accelerated, "accelerated");
    }

    /// Deceleration request issued to the engine
    pub fn begin_decel(&mut self) {
        self.counters.pending_decel += 1;
    }

    /// Deceleration request completed
    pub fn end_decel(&mut self) {
        decrement(&mut self.counters.pending_decel, "pending decel");
    }

    /// Connections mid-transition toward accelerated
    pub fn pending(&self) -> i64 {
        self.counters.pending
    }

    /// Connections currently accelerated
    pub fn accelerated(&self) -> i64 {
        self.counters.accelerated
    }

    /// Deceleration requests awaiting completion
    pub fn pending_decel(&self) -> i64 {
        self.counters.pending_decel
    }

    /// Configured limit
    pub fn limit(&self) -> AdmissionLimit {
        self.counters.limit
    }
}

/// Lifetime totals (lock-free)
#[derive(Debug, Default)]
pub struct AdmissionStats {
    admitted: AtomicU64,
    refused: AtomicU64,
}

/// Admission counters snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
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
    /// Active admission policy
    pub limit_mode: LimitMode,
    /// Engine capacity the fixed limit enforces
    pub max_slots: u32,
}

/// Process-wide admission state for one protocol family
#[derive(Debug)]
pub struct AdmissionController {
    counters: RankedMutex<AdmissionCounters>,
    stats: AdmissionStats,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionLimit::default())
    }
}

impl AdmissionController {
    /// Create new controller with limit
    pub fn new(limit: AdmissionLimit) -> Self {
        Self {
            counters: RankedMutex::new(
                LockRank::Admission,
                AdmissionCounters {
                    limit,
                    ..Default::default()
                },
            ),
            stats: AdmissionStats::default(),
        }
    }

    /// Take the admission lock.
    ///
    /// Callers holding a connection lock reach this through
    /// [`crate::ConnectionGuard::nest`] instead.
    pub fn lock(&self) -> AdmissionGuard<'_> {
        AdmissionGuard {
            counters: self.counters.lock(),
            stats: &self.stats,
        }
    }

    /// Grant a pending slot unless the fixed limit is reached
    pub fn try_begin_pending(&self, mode: LimitMode, max_slots: u32) -> bool {
        self.lock().try_begin_pending(mode, max_slots)
    }

    /// Close out a pending attempt
    pub fn end_pending(&self, outcome: PendingOutcome) {
        self.lock().end_pending(outcome)
    }

    /// Connection fully decelerated
    pub fn end_accel(&self) {
        self.lock().end_accel()
    }

    /// Replace the active limit
    pub fn set_limit(&self, limit: AdmissionLimit) {
        self.lock().counters.limit = limit;
        tracing::info!(mode = ?limit.mode, max_slots = limit.max_slots, "accel limit updated");
    }

    /// Active limit
    pub fn limit(&self) -> AdmissionLimit {
        self.lock().limit()
    }

    /// Point-in-time counters
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let guard = self.lock();
        AdmissionSnapshot {
            pending: guard.pending(),
            accelerated: guard.accelerated(),
            pending_decel: guard.pending_decel(),
            admitted_total: self.stats.admitted.load(Ordering::Relaxed),
            refused_total: self.stats.refused.load(Ordering::Relaxed),
            limit_mode: guard.limit().mode,
            max_slots: guard.limit().max_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(max_slots: u32) -> AdmissionController {
        AdmissionController::new(AdmissionLimit {
            mode: LimitMode::Fixed,
            max_slots,
        })
    }

    #[test]
    fn test_unbounded_always_admits() {
        let adm = AdmissionController::default();
        for _ in 0..10_000 {
            assert!(adm.try_begin_pending(LimitMode::Unbounded, 1));
        }
        assert_eq!(adm.snapshot().pending, 10_000);
    }

    #[test]
    fn test_fixed_limit_counts_pending_and_accelerated() {
        let adm = fixed(2);
        let mut g = adm.lock();

        assert!(g.try_begin_pending_within_limit());
        g.end_pending(PendingOutcome::Succeeded);
        assert!(g.try_begin_pending_within_limit());
        assert!(!g.try_begin_pending_within_limit());
        assert_eq!((g.pending(), g.accelerated()), (1, 1));

        g.end_accel();
        assert!(g.try_begin_pending_within_limit());
    }

    #[test]
    fn test_refusal_changes_nothing() {
        let adm = fixed(1);
        assert!(adm.try_begin_pending(LimitMode::Fixed, 1));
        let before = adm.snapshot();
        assert!(!adm.try_begin_pending(LimitMode::Fixed, 1));
        let after = adm.snapshot();

        assert_eq!(before.pending, after.pending);
        assert_eq!(before.accelerated, after.accelerated);
        assert_eq!(after.refused_total, 1);
    }

    #[test]
    fn test_failed_pending_frees_capacity() {
        let adm = fixed(1);
        assert!(adm.try_begin_pending(LimitMode::Fixed, 1));
        adm.end_pending(PendingOutcome::Failed);
        assert!(adm.try_begin_pending(LimitMode::Fixed, 1));

        let snap = adm.snapshot();
        assert_eq!(snap.pending, 1);
        assert_eq!(snap.accelerated, 0);
    }

    #[test]
    fn test_decel_counters() {
        let adm = AdmissionController::default();
        let mut g = adm.lock();
        assert!(g.try_begin_pending_within_limit());
        g.end_pending(PendingOutcome::Succeeded);
        g.begin_decel();
        assert_eq!(g.pending_decel(), 1);
        g.end_accel();
        g.end_decel();
        assert_eq!((g.accelerated(), g.pending_decel()), (0, 0));
    }

    #[test]
    fn test_set_limit() {
        let adm = AdmissionController::default();
        adm.set_limit(AdmissionLimit {
            mode: LimitMode::Fixed,
            max_slots: 0,
        });
        assert!(!adm.lock().try_begin_pending_within_limit());
        assert_eq!(adm.limit().mode, LimitMode::Fixed);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "pending accel count underflow")]
    fn test_pending_underflow_is_fatal() {
        let adm = AdmissionController::default();
        adm.end_pending(PendingOutcome::Failed);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "accelerated count underflow")]
    fn test_accelerated_underflow_is_fatal() {
        let adm = AdmissionController::default();
        adm.end_accel();
    }
}
