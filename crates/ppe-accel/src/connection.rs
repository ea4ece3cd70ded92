//! Connection Acceleration Record
//!
//! One record per tracked flow. The record's own lock protects the
//! acceleration mode and the decelerate-pending flag; the admission lock may
//! only be taken underneath it via [`ConnectionGuard::nest`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::admission::{AdmissionController, AdmissionGuard};
use crate::lock::{LockRank, RankedGuard, RankedMutex};

/// Connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why acceleration was permanently abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailReason {
    /// Driver failed too many times in a row
    Driver,
    /// Engine rejected the rule itself
    Rule,
    /// Engine accepted the rule but never acted on it
    NoAction,
    /// Connection became defunct mid-attempt
    Defunct,
}

/// Acceleration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AccelMode {
    /// Not accelerated
    Decel,
    /// Offload issued, awaiting completion
    AccelPending,
    /// Offloaded
    Accel,
    /// Removal issued, awaiting completion
    DecelPending,
    /// Acceleration permanently failed (sticky)
    Fail(FailReason),
}

impl AccelMode {
    /// Permanently failed
    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Fail(_))
    }
}

/// State protected by the connection lock
#[derive(Debug)]
pub struct ConnectionState {
    pub(crate) mode: AccelMode,
    pub(crate) decelerate_pending: bool,
    pub(crate) driver_fails: u32,
    pub(crate) attempt: u64,
    pub(crate) stale_attempt: Option<u64>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            mode: AccelMode::Decel,
            decelerate_pending: false,
            driver_fails: 0,
            attempt: 0,
            stale_attempt: None,
        }
    }

    /// Current mode
    pub fn mode(&self) -> AccelMode {
        self.mode
    }

    /// Deceleration requested while pending
    pub fn decelerate_pending(&self) -> bool {
        self.decelerate_pending
    }

    /// Consecutive transient driver failures
    pub fn driver_fails(&self) -> u32 {
        self.driver_fails
    }

    /// Generation of the most recent acceleration attempt
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Force-expired attempt whose completion has not drained yet.
    ///
    /// While set, the engine may still be programming that attempt's flow
    /// indices and no new attempt is admitted.
    pub fn stale_attempt(&self) -> Option<u64> {
        self.stale_attempt
    }
}

/// Per-flow acceleration record
pub struct AccelConnection {
    id: ConnectionId,
    regen_required: AtomicBool,
    state: RankedMutex<ConnectionState>,
}

impl AccelConnection {
    /// Create new record in [`AccelMode::Decel`]
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            regen_required: AtomicBool::new(false),
            state: RankedMutex::new(LockRank::Connection, ConnectionState::new()),
        }
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Take the connection lock
    pub fn lock(&self) -> ConnectionGuard<'_> {
        ConnectionGuard {
            id: self.id,
            state: self.state.lock(),
        }
    }

    /// Current mode (takes the lock briefly)
    pub fn mode(&self) -> AccelMode {
        self.state.lock().mode
    }

    /// Mark the connection as needing regeneration; acceleration is refused
    /// until cleared
    pub fn set_regeneration_required(&self, required: bool) {
        self.regen_required.store(required, Ordering::Release);
    }

    /// Regeneration pending
    pub fn regeneration_required(&self) -> bool {
        self.regen_required.load(Ordering::Acquire)
    }
}

impl fmt::Debug for AccelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccelConnection")
            .field("id", &self.id)
            .field("regen_required", &self.regeneration_required())
            .finish_non_exhaustive()
    }
}

impl Drop for AccelConnection {
    fn drop(&mut self) {
        let mode = self.state.get_mut().mode;
        if !matches!(mode, AccelMode::Decel | AccelMode::Fail(_)) {
            tracing::error!(conn = %self.id, ?mode, "connection destroyed while not decelerated");
        }
    }
}

/// Held connection lock
pub struct ConnectionGuard<'a> {
    id: ConnectionId,
    state: RankedGuard<'a, ConnectionState>,
}

impl<'a> ConnectionGuard<'a> {
    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Take the admission lock underneath this connection lock.
    ///
    /// The returned guard borrows this one, so the admission lock is always
    /// released before the connection lock.
    pub fn nest<'g>(&'g mut self, admission: &'g AdmissionController) -> NestedGuard<'g, 'a> {
        NestedGuard {
            admission: admission.lock(),
            conn: self,
        }
    }
}

impl std::ops::Deref for ConnectionGuard<'_> {
    type Target = ConnectionState;

    fn deref(&self) -> &ConnectionState {
        &self.state
    }
}

impl std::ops::DerefMut for ConnectionGuard<'_> {
    fn deref_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }
}

/// Connection lock plus admission lock, taken in that order
pub struct NestedGuard<'g, 'a> {
    admission: AdmissionGuard<'g>,
    conn: &'g mut ConnectionGuard<'a>,
}

impl<'g, 'a> NestedGuard<'g, 'a> {
    /// Connection state
    pub fn conn(&mut self) -> &mut ConnectionGuard<'a> {
        &mut *self.conn
    }

    /// Admission counters
    pub fn admission(&mut self) -> &mut AdmissionGuard<'g> {
        &mut self.admission
    }

    /// Both halves at once
    pub fn split(&mut self) -> (&mut ConnectionGuard<'a>, &mut AdmissionGuard<'g>) {
        (&mut *self.conn, &mut self.admission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_connection_is_decel() {
        let conn = AccelConnection::new(ConnectionId(7));
        assert_eq!(conn.mode(), AccelMode::Decel);
        assert_eq!(conn.id().to_string(), "conn-7");
        assert!(!conn.lock().decelerate_pending());
    }

    #[test]
    fn test_nested_lock_order() {
        let conn = AccelConnection::new(ConnectionId(1));
        let adm = AdmissionController::default();

        let mut guard = conn.lock();
        {
            let mut nested = guard.nest(&adm);
            assert!(nested.admission().try_begin_pending_within_limit());
            nested.conn().mode = AccelMode::AccelPending;
            assert_eq!(crate::lock::held_rank(), Some(LockRank::Admission));
        }
        assert_eq!(crate::lock::held_rank(), Some(LockRank::Connection));
        assert_eq!(guard.mode(), AccelMode::AccelPending);

        let mut nested = guard.nest(&adm);
        let (state, adm_guard) = nested.split();
        state.mode = AccelMode::Decel;
        adm_guard.end_pending(crate::PendingOutcome::Failed);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_connection_under_admission_panics() {
        let conn = AccelConnection::new(ConnectionId(1));
        let adm = AdmissionController::default();

        let _adm = adm.lock();
        let _conn = conn.lock();
    }

    #[test]
    fn test_regeneration_flag() {
        let conn = AccelConnection::new(ConnectionId(3));
        conn.set_regeneration_required(true);
        assert!(conn.regeneration_required());
        conn.set_regeneration_required(false);
        assert!(!conn.regeneration_required());
    }
}
