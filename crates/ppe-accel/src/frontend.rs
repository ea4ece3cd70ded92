//! NPTv6 Offload Frontend
//!
//! Drives one connection through the whole offload: admission, both prefix
//! rows, both IID directions, then resolution of the pending attempt. Every
//! engine resource taken along the way is owned by an [`OffloadHandle`] and
//! released on error or deceleration.

use std::sync::Arc;

use crate::accel::{AccelOutcome, AccelStateMachine, DecelRequest};
use crate::admission::AdmissionController;
use crate::config::AccelConfig;
use crate::connection::{AccelConnection, FailReason};
use crate::error::{AccelError, Result};
use crate::hal::PpeHal;
use crate::iid::{Direction, IidRef, IidTable};
use crate::nptv6::{ConnFlow, NptPrefixes, Nptv6Rule};
use crate::prefix::PrefixTable;
use crate::slot::SlotPool;
use crate::stats::AccelStats;

/// Engine resources of one offloaded connection
pub struct OffloadHandle<H: PpeHal> {
    fwd_iid: IidRef<H>,
    rev_iid: IidRef<H>,
    prefixes: NptPrefixes<H>,
}

impl<H: PpeHal> OffloadHandle<H> {
    /// Prefix rows held (flow, return)
    pub fn prefix_indices(&self) -> (Option<u32>, Option<u32>) {
        (self.rev_iid.prefix_index(), self.fwd_iid.prefix_index())
    }

    /// Remove both IIDs and release both prefix rows.
    ///
    /// Everything is released even if the engine reports an error; the first
    /// error is returned.
    pub fn remove(self) -> Result<()> {
        let fwd = self.fwd_iid.remove();
        let rev = self.rev_iid.remove();
        self.prefixes.release();
        fwd?;
        rev?;
        Ok(())
    }
}

impl<H: PpeHal> std::fmt::Debug for OffloadHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadHandle")
            .field("fwd_iid", &self.fwd_iid)
            .field("rev_iid", &self.rev_iid)
            .field("prefixes", &self.prefixes)
            .finish()
    }
}

/// Result of an offload attempt
pub enum OffloadResult<H: PpeHal> {
    /// Offloaded; keep the handle until deceleration
    Offloaded(OffloadHandle<H>),
    /// Not admitted (backpressure or connection not eligible)
    Refused,
    /// Offloaded, but a deceleration arrived mid-flight; already torn down
    DecelRequested,
    /// Engine programming failed; nothing is held
    Failed(AccelError),
}

impl<H: PpeHal> OffloadResult<H> {
    /// Handle if offloaded
    pub fn into_handle(self) -> Option<OffloadHandle<H>> {
        match self {
            Self::Offloaded(handle) => Some(handle),
            _ => None,
        }
    }

    /// Check if offloaded
    pub fn is_offloaded(&self) -> bool {
        matches!(self, Self::Offloaded(_))
    }
}

impl<H: PpeHal> std::fmt::Debug for OffloadResult<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offloaded(h) => f.debug_tuple("Offloaded").field(h).finish(),
            Self::Refused => f.write_str("Refused"),
            Self::DecelRequested => f.write_str("DecelRequested"),
            Self::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Map a programming error to the attempt's outcome
fn classify(err: &AccelError) -> AccelOutcome {
    match err {
        AccelError::InvalidPrefix(_)
        | AccelError::PrefixIndexOutOfRange(_)
        | AccelError::IidIndexOutOfRange(_) => AccelOutcome::PermanentFail(FailReason::Rule),
        _ => AccelOutcome::TransientFail,
    }
}

/// NPTv6 offload pipeline over one engine
pub struct Nptv6Frontend<H: PpeHal> {
    sm: Arc<AccelStateMachine>,
    prefixes: PrefixTable<H>,
    iids: IidTable<H>,
}

impl<H: PpeHal> Nptv6Frontend<H> {
    /// Create new frontend over existing state
    pub fn new(sm: Arc<AccelStateMachine>, hal: Arc<H>, pool: Arc<SlotPool>) -> Self {
        Self {
            sm,
            prefixes: PrefixTable::new(Arc::clone(&hal), Arc::clone(&pool)),
            iids: IidTable::new(hal, pool),
        }
    }

    /// Build admission, state machine and slot pool from `config`
    pub fn from_config(config: &AccelConfig, hal: Arc<H>) -> Result<Self> {
        config.validate()?;
        let admission = Arc::new(AdmissionController::new(config.admission_limit()));
        let sm = Arc::new(AccelStateMachine::new(
            admission,
            config.driver_fail_limit,
            config.pending_timeout(),
        ));
        let pool = Arc::new(SlotPool::new(config.prefix_table_size, config.iid_table_size));
        Ok(Self::new(sm, hal, pool))
    }

    /// State machine
    pub fn state_machine(&self) -> &Arc<AccelStateMachine> {
        &self.sm
    }

    /// Prefix table
    pub fn prefixes(&self) -> &PrefixTable<H> {
        &self.prefixes
    }

    /// Offload `conn`
    pub fn offload(
        &self,
        conn: &Arc<AccelConnection>,
        fwd: &ConnFlow,
        rev: &ConnFlow,
        rule: &Nptv6Rule,
    ) -> OffloadResult<H> {
        let Some(ticket) = self.sm.begin_accel(conn) else {
            return OffloadResult::Refused;
        };

        match self.program(fwd, rev, rule) {
            Ok(handle) => match self.sm.resolve_attempt(conn, &ticket, AccelOutcome::Succeeded) {
                None => {
                    // Release before lifting the fence so a new attempt never
                    // sees this attempt's entries.
                    drop(handle);
                    self.sm.release_stale(conn, &ticket);
                    OffloadResult::Failed(AccelError::PendingExpired(conn.id()))
                }
                Some(false) => {
                    tracing::debug!(conn = %conn.id(), "offloaded");
                    OffloadResult::Offloaded(handle)
                }
                Some(true) => {
                    tracing::debug!(conn = %conn.id(), "decel requested during offload");
                    if let Err(e) = self.decelerate(conn, handle) {
                        tracing::warn!(conn = %conn.id(), error = %e, "teardown after deferred decel failed");
                    }
                    OffloadResult::DecelRequested
                }
            },
            Err(err) => {
                let outcome = classify(&err);
                tracing::warn!(conn = %conn.id(), error = %err, ?outcome, "offload failed");
                if self.sm.resolve_attempt(conn, &ticket, outcome).is_none() {
                    tracing::debug!(conn = %conn.id(), "failure reported after pending expired");
                    self.sm.release_stale(conn, &ticket);
                }
                OffloadResult::Failed(err)
            }
        }
    }

    fn program(&self, fwd: &ConnFlow, rev: &ConnFlow, rule: &Nptv6Rule) -> Result<OffloadHandle<H>> {
        let prefixes = NptPrefixes::acquire(&self.prefixes, fwd, rev, rule)?;
        let fwd_iid = self.iids.install(fwd, rev, rule, Direction::Forward, &prefixes)?;
        let rev_iid = self.iids.install(fwd, rev, rule, Direction::Reverse, &prefixes)?;
        Ok(OffloadHandle {
            fwd_iid,
            rev_iid,
            prefixes,
        })
    }

    /// Tear down an offloaded connection.
    ///
    /// Engine errors are returned after the connection has still been moved
    /// back to DECEL and every resource released.
    pub fn decelerate(&self, conn: &AccelConnection, handle: OffloadHandle<H>) -> Result<DecelRequest> {
        let request = self.sm.request_decel(conn);
        if request != DecelRequest::Started {
            tracing::debug!(conn = %conn.id(), ?request, "decel without accelerated state, releasing handle");
            drop(handle);
            return Ok(request);
        }

        let removed = handle.remove();
        self.sm.resolve_decel(conn);
        removed.map(|()| request)
    }

    /// Stats snapshot
    pub fn stats(&self) -> AccelStats {
        AccelStats::collect(&self.sm, &self.prefixes)
    }
}
