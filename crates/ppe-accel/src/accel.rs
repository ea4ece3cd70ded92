//! Acceleration State Machine
//!
//! ```text
//!            request_accel          resolve_pending(Succeeded)
//!   DECEL ─────────────────▶ ACCEL_PENDING ─────────────────▶ ACCEL
//!     ▲                          │    │                          │
//!     │   resolve_pending        │    │ resolve_pending          │ request_decel
//!     ├──────(TransientFail)─────┘    │ (PermanentFail or        ▼
//!     │                               │  driver fail limit)  DECEL_PENDING
//!     │   reset_failure               ▼                          │
//!     ├────────────────────────── ACCEL_FAIL (sticky)            │
//!     │                                                          │
//!     └──────────────────────── resolve_decel ───────────────────┘
//! ```
//!
//! Every transition into or out of ACCEL_PENDING goes through the admission
//! controller while the connection lock is held, connection lock first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::admission::{AdmissionController, PendingOutcome};
use crate::connection::{AccelConnection, AccelMode, ConnectionGuard, ConnectionId, FailReason};

/// How an acceleration attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelOutcome {
    /// Rule installed
    Succeeded,
    /// Rule can never be installed; connection becomes sticky-failed
    PermanentFail(FailReason),
    /// Rule not installed this time; a later event may retry
    TransientFail,
}

impl AccelOutcome {
    fn pending_outcome(self) -> PendingOutcome {
        match self {
            Self::Succeeded => PendingOutcome::Succeeded,
            Self::PermanentFail(_) | Self::TransientFail => PendingOutcome::Failed,
        }
    }
}

/// Proof of a granted pending transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTicket {
    /// Connection the attempt belongs to
    pub conn: ConnectionId,
    /// Attempt generation
    pub attempt: u64,
}

/// Result of a deceleration request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecelRequest {
    /// Connection was pending; deceleration happens when the attempt resolves
    Deferred,
    /// Connection moved to DECEL_PENDING; caller removes the rule and calls
    /// [`AccelStateMachine::resolve_decel`]
    Started,
    /// Nothing to decelerate
    NotAccelerated,
}

/// Registry entry for an attempt awaiting completion
struct PendingEntry {
    conn: Arc<AccelConnection>,
    attempt: u64,
    since: Instant,
}

/// Per-connection acceleration state machine bound to one admission controller
pub struct AccelStateMachine {
    admission: Arc<AdmissionController>,
    driver_fail_limit: u32,
    pending_timeout: Option<Duration>,
    /// Attempts in ACCEL_PENDING, only touched under the owning connection lock
    pending: DashMap<ConnectionId, PendingEntry>,
    forced_timeouts: AtomicU64,
}

impl AccelStateMachine {
    /// Create new state machine.
    ///
    /// `driver_fail_limit` of 0 never converts transient failures into a
    /// permanent one. `pending_timeout` of `None` disables forced expiry.
    pub fn new(
        admission: Arc<AdmissionController>,
        driver_fail_limit: u32,
        pending_timeout: Option<Duration>,
    ) -> Self {
        Self {
            admission,
            driver_fail_limit,
            pending_timeout,
            pending: DashMap::new(),
            forced_timeouts: AtomicU64::new(0),
        }
    }

    /// Admission controller
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Configured pending deadline
    pub fn pending_timeout(&self) -> Option<Duration> {
        self.pending_timeout
    }

    /// Attempts currently awaiting completion
    pub fn pending_attempts(&self) -> usize {
        self.pending.len()
    }

    /// Attempts force-resolved by the deadline
    pub fn forced_timeouts(&self) -> u64 {
        self.forced_timeouts.load(Ordering::Relaxed)
    }

    /// Ask to enter ACCEL_PENDING.
    ///
    /// `false` is backpressure, not an error: wait for another network event
    /// before trying again.
    pub fn request_accel(&self, conn: &Arc<AccelConnection>) -> bool {
        self.begin_accel(conn).is_some()
    }

    /// [`Self::request_accel`] returning the attempt's ticket
    pub fn begin_accel(&self, conn: &Arc<AccelConnection>) -> Option<PendingTicket> {
        if conn.regeneration_required() {
            tracing::trace!(conn = %conn.id(), "accel refused: regeneration required");
            return None;
        }

        let mut guard = conn.lock();
        if let Some(stale) = guard.stale_attempt {
            tracing::trace!(conn = %conn.id(), stale, "accel refused: expired attempt still draining");
            return None;
        }

        if guard.mode.is_failed() {
            tracing::trace!(conn = %conn.id(), mode = ?guard.mode, "accel refused: failed");
            return None;
        }

        if guard.mode != AccelMode::Decel {
            tracing::trace!(conn = %conn.id(), mode = ?guard.mode, "accel refused: wrong mode");
            return None;
        }

        if !guard.nest(&self.admission).admission().try_begin_pending_within_limit() {
            return None;
        }

        let now = Instant::now();
        guard.mode = AccelMode::AccelPending;
        guard.attempt += 1;
        let attempt = guard.attempt;

        self.pending.insert(
            conn.id(),
            PendingEntry {
                conn: Arc::clone(conn),
                attempt,
                since: now,
            },
        );

        Some(PendingTicket {
            conn: conn.id(),
            attempt,
        })
    }

    /// Resolve the connection's pending attempt.
    ///
    /// Returns whether a deceleration was requested while the attempt was in
    /// flight; the caller must honor it immediately.
    ///
    /// # Panics
    ///
    /// If the connection is not in ACCEL_PENDING.
    pub fn resolve_pending(&self, conn: &AccelConnection, outcome: AccelOutcome) -> bool {
        let mut guard = conn.lock();
        self.resolve_locked(&mut guard, outcome)
    }

    /// Resolve a specific attempt.
    ///
    /// Returns `None` when the attempt is no longer the pending one, which
    /// happens after the deadline force-resolved it. The caller then owns
    /// cleanup of whatever it programmed for that attempt and must call
    /// [`Self::release_stale`] once that cleanup is done.
    pub fn resolve_attempt(
        &self,
        conn: &AccelConnection,
        ticket: &PendingTicket,
        outcome: AccelOutcome,
    ) -> Option<bool> {
        debug_assert_eq!(conn.id(), ticket.conn);
        let mut guard = conn.lock();
        if guard.mode != AccelMode::AccelPending || guard.attempt != ticket.attempt {
            tracing::debug!(
                conn = %conn.id(),
                attempt = ticket.attempt,
                current = guard.attempt,
                mode = ?guard.mode,
                "stale completion ignored"
            );
            return None;
        }
        Some(self.resolve_locked(&mut guard, outcome))
    }

    /// Lift the fence left by a force-expired attempt once its late
    /// completion has released every engine resource. Returns whether
    /// `ticket` was the fenced attempt.
    pub fn release_stale(&self, conn: &AccelConnection, ticket: &PendingTicket) -> bool {
        let mut guard = conn.lock();
        if guard.stale_attempt != Some(ticket.attempt) {
            return false;
        }
        guard.stale_attempt = None;
        tracing::debug!(conn = %conn.id(), attempt = ticket.attempt, "expired attempt drained");
        true
    }

    fn resolve_locked(&self, guard: &mut ConnectionGuard<'_>, outcome: AccelOutcome) -> bool {
        let id = guard.id();
        let attempt = guard.attempt;
        let driver_fail_limit = self.driver_fail_limit;

        let decel_pending = {
            let mut nested = guard.nest(&self.admission);
            let (state, admission) = nested.split();

            assert!(
                state.mode == AccelMode::AccelPending,
                "{}: accel mode unexpected: {:?}",
                id,
                state.mode
            );

            state.mode = match outcome {
                AccelOutcome::Succeeded => {
                    state.driver_fails = 0;
                    AccelMode::Accel
                }
                AccelOutcome::PermanentFail(reason) => AccelMode::Fail(reason),
                AccelOutcome::TransientFail => {
                    state.driver_fails += 1;
                    if driver_fail_limit > 0 && state.driver_fails >= driver_fail_limit {
                        tracing::warn!(conn = %id, fails = state.driver_fails, "driver fail limit reached");
                        AccelMode::Fail(FailReason::Driver)
                    } else {
                        AccelMode::Decel
                    }
                }
            };

            let decel_pending = std::mem::take(&mut state.decelerate_pending);
            admission.end_pending(outcome.pending_outcome());
            decel_pending
        };

        self.pending.remove_if(&id, |_, entry| entry.attempt == attempt);
        tracing::trace!(conn = %id, ?outcome, mode = ?guard.mode, decel_pending, "accel pending cleared");
        decel_pending
    }

    /// Force-resolve every attempt pending longer than the deadline as
    /// [`AccelOutcome::TransientFail`]. Returns the number expired.
    ///
    /// An expired attempt stays fenced until [`Self::release_stale`]: its
    /// programming may still be in flight, so the connection is not admitted
    /// again before then.
    pub fn expire_stale_pending(&self, now: Instant) -> usize {
        let Some(timeout) = self.pending_timeout else {
            return 0;
        };

        let stale: Vec<(Arc<AccelConnection>, u64)> = self
            .pending
            .iter()
            .filter(|e| now.saturating_duration_since(e.since) >= timeout)
            .map(|e| (Arc::clone(&e.conn), e.attempt))
            .collect();

        let mut expired = 0;
        for (conn, attempt) in stale {
            let mut guard = conn.lock();
            if guard.mode != AccelMode::AccelPending || guard.attempt != attempt {
                // Resolved between the scan and the lock.
                continue;
            }
            let decel_pending = self.resolve_locked(&mut guard, AccelOutcome::TransientFail);
            guard.stale_attempt = Some(attempt);
            tracing::warn!(
                conn = %conn.id(),
                attempt,
                timeout_ms = timeout.as_millis() as u64,
                decel_pending,
                "pending acceleration timed out, forced to transient failure"
            );
            self.forced_timeouts.fetch_add(1, Ordering::Relaxed);
            expired += 1;
        }
        expired
    }

    /// Ask to leave the accelerated state
    pub fn request_decel(&self, conn: &AccelConnection) -> DecelRequest {
        let mut guard = conn.lock();
        let mode = guard.mode;
        match mode {
            AccelMode::AccelPending => {
                guard.decelerate_pending = true;
                tracing::debug!(conn = %conn.id(), "decel deferred until accel completes");
                DecelRequest::Deferred
            }
            AccelMode::Accel => {
                let mut nested = guard.nest(&self.admission);
                let (state, admission) = nested.split();
                state.mode = AccelMode::DecelPending;
                admission.begin_decel();
                DecelRequest::Started
            }
            _ => DecelRequest::NotAccelerated,
        }
    }

    /// Complete a deceleration started by [`Self::request_decel`].
    ///
    /// # Panics
    ///
    /// If the connection is not in DECEL_PENDING.
    pub fn resolve_decel(&self, conn: &AccelConnection) {
        let mut guard = conn.lock();
        let id = guard.id();
        let mut nested = guard.nest(&self.admission);
        let (state, admission) = nested.split();

        assert!(
            state.mode == AccelMode::DecelPending,
            "{}: decel mode unexpected: {:?}",
            id,
            state.mode
        );

        state.mode = AccelMode::Decel;
        admission.end_accel();
        admission.end_decel();
    }

    /// Clear a sticky failure so the connection may be accelerated again.
    /// Returns whether the connection was failed.
    pub fn reset_failure(&self, conn: &AccelConnection) -> bool {
        let mut guard = conn.lock();
        if !guard.mode.is_failed() {
            return false;
        }
        tracing::debug!(conn = %conn.id(), mode = ?guard.mode, "accel failure reset");
        guard.mode = AccelMode::Decel;
        guard.driver_fails = 0;
        true
    }
}
