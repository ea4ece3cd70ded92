//! IID Table Manager
//!
//! Programs the per-flow interface identifier used for checksum-neutral
//! prefix translation. Forward and reverse flow indices share one IID slot
//! (`flow_index / 2`); each installed direction holds a reference on the
//! prefix row it translates against.
//!
//! Directional dispatch:
//!
//! | rule | side    | prefix_len | tip_prefix_len | kind | address input                        | prefix held |
//! |------|---------|------------|----------------|------|--------------------------------------|-------------|
//! | SNPT | forward | src_len    | dst_len        | SNAT | sip = fwd.match_src, tip = fwd.xlate_src   | return |
//! | SNPT | reverse | dst_len    | src_len        | DNAT | dip = rev.match_dest, tip = rev.xlate_dest | flow   |
//! | DNPT | forward | src_len    | dst_len        | DNAT | dip = fwd.match_dest, tip = fwd.xlate_dest | return |
//! | DNPT | reverse | dst_len    | src_len        | SNAT | sip = rev.match_src, tip = rev.xlate_src   | flow   |

use std::sync::Arc;

use crate::error::{AccelError, Result};
use crate::hal::{HwStatus, IidCalc, PpeHal};
use crate::nptv6::{ConnFlow, NptKind, NptPrefixes, Nptv6Rule, PrefixSide};
use crate::prefix::PrefixRef;
use crate::slot::{SlotPool, IID_FORWARD, IID_REVERSE};

/// Flow direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Originator to responder
    Forward,
    /// Responder to originator
    Reverse,
}

impl Direction {
    fn bit(self) -> u8 {
        match self {
            Self::Forward => IID_FORWARD,
            Self::Reverse => IID_REVERSE,
        }
    }
}

/// What to program for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IidPlan {
    /// Engine flow index
    pub flow_index: u16,
    /// Engine calculation input
    pub calc: IidCalc,
    /// Prefix row this direction references
    pub side: PrefixSide,
}

/// Resolve the directional dispatch for `dir`
pub fn plan(fwd: &ConnFlow, rev: &ConnFlow, rule: &Nptv6Rule, dir: Direction) -> IidPlan {
    let (src_len, dst_len) = (rule.src_pfx_len, rule.dst_pfx_len);
    match (rule.kind, dir) {
        (NptKind::Snpt, Direction::Forward) => IidPlan {
            flow_index: fwd.flow_index,
            calc: IidCalc::snat(src_len, dst_len, fwd.match_src, fwd.xlate_src),
            side: PrefixSide::Return,
        },
        (NptKind::Snpt, Direction::Reverse) => IidPlan {
            flow_index: rev.flow_index,
            calc: IidCalc::dnat(dst_len, src_len, rev.match_dest, rev.xlate_dest),
            side: PrefixSide::Flow,
        },
        (NptKind::Dnpt, Direction::Forward) => IidPlan {
            flow_index: fwd.flow_index,
            calc: IidCalc::dnat(src_len, dst_len, fwd.match_dest, fwd.xlate_dest),
            side: PrefixSide::Return,
        },
        (NptKind::Dnpt, Direction::Reverse) => IidPlan {
            flow_index: rev.flow_index,
            calc: IidCalc::snat(dst_len, src_len, rev.match_src, rev.xlate_src),
            side: PrefixSide::Flow,
        },
    }
}

/// IID table bound to one engine
pub struct IidTable<H> {
    hal: Arc<H>,
    pool: Arc<SlotPool>,
}

impl<H> Clone for IidTable<H> {
    fn clone(&self) -> Self {
        Self {
            hal: Arc::clone(&self.hal),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<H: PpeHal> IidTable<H> {
    /// Create new table over `pool`
    pub fn new(hal: Arc<H>, pool: Arc<SlotPool>) -> Self {
        Self { hal, pool }
    }

    /// Calculate and program the IID for one direction, then take a
    /// reference on that direction's prefix row from `prefixes`.
    pub fn install(
        &self,
        fwd: &ConnFlow,
        rev: &ConnFlow,
        rule: &Nptv6Rule,
        dir: Direction,
        prefixes: &NptPrefixes<H>,
    ) -> Result<IidRef<H>> {
        let plan = plan(fwd, rev, rule, dir);
        let slot = self.pool.iid(plan.flow_index / 2)?;

        // Claim the direction before touching the engine; the holder of the
        // bit is the only one allowed to program or delete this flow index.
        if slot.mark(dir.bit()) & dir.bit() != 0 {
            tracing::warn!(flow_index = plan.flow_index, ?dir, "IID direction already owned");
            return Err(AccelError::hw("iid_add", HwStatus::AlreadyExists));
        }

        let fields = match self.hal.iid_calc(&plan.calc) {
            Ok(fields) => fields,
            Err(status) => {
                slot.clear(dir.bit());
                tracing::warn!(flow_index = plan.flow_index, ?dir, %status, "IID calculation failed");
                return Err(AccelError::hw("iid_calc", status));
            }
        };

        tracing::debug!(
            flow_index = plan.flow_index,
            slot = slot.index(),
            iid = fields.iid,
            adjustment = fields.adjustment,
            adj_offset = fields.adj_offset,
            "iid_add"
        );
        if let Err(status) = self.hal.iid_add(plan.flow_index, &fields) {
            slot.clear(dir.bit());
            tracing::warn!(flow_index = plan.flow_index, ?dir, %status, "IID install failed");
            return Err(AccelError::hw("iid_add", status));
        }

        Ok(IidRef {
            hal: Arc::clone(&self.hal),
            pool: Arc::clone(&self.pool),
            flow_index: plan.flow_index,
            dir,
            prefix: Some(prefixes.side(plan.side).clone()),
        })
    }

    /// Underlying slot pool
    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }
}

/// One programmed IID direction; removed from the engine on drop
pub struct IidRef<H: PpeHal> {
    hal: Arc<H>,
    pool: Arc<SlotPool>,
    flow_index: u16,
    dir: Direction,
    prefix: Option<PrefixRef<H>>,
}

impl<H: PpeHal> IidRef<H> {
    /// Engine flow index
    pub fn flow_index(&self) -> u16 {
        self.flow_index
    }

    /// Direction programmed
    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// Prefix row referenced
    pub fn prefix_index(&self) -> Option<u32> {
        self.prefix.as_ref().map(PrefixRef::index)
    }

    /// Delete from the engine and release the prefix reference.
    ///
    /// `Ok(false)` when the engine no longer had the entry. The prefix
    /// reference is released whatever the engine reports.
    pub fn remove(mut self) -> Result<bool> {
        self.delete()
    }

    fn delete(&mut self) -> Result<bool> {
        let Some(prefix) = self.prefix.take() else {
            return Ok(false);
        };

        tracing::debug!(flow_index = self.flow_index, dir = ?self.dir, "iid_del");
        let res = self.hal.iid_del(self.flow_index);

        if let Ok(slot) = self.pool.iid(self.flow_index / 2) {
            slot.clear(self.dir.bit());
        }
        prefix.release();

        match res {
            Ok(()) => Ok(true),
            Err(HwStatus::NotFound) => {
                tracing::debug!(flow_index = self.flow_index, "IID already gone");
                Ok(false)
            }
            Err(status) => {
                tracing::warn!(flow_index = self.flow_index, %status, "IID delete failed");
                Err(AccelError::hw("iid_del", status))
            }
        }
    }
}

impl<H: PpeHal> Drop for IidRef<H> {
    fn drop(&mut self) {
        // Errors are already logged.
        let _ = self.delete();
    }
}

impl<H: PpeHal> std::fmt::Debug for IidRef<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IidRef")
            .field("flow_index", &self.flow_index)
            .field("dir", &self.dir)
            .field("prefix", &self.prefix_index())
            .finish()
    }
}
