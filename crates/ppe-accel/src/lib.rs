//! PPE Acceleration Admission & NPTv6 Slot Ownership
//!
//! Control-plane core deciding which tracked connections may be offloaded to
//! the packet processing engine (PPE), and owning the engine's refcounted
//! NPTv6 prefix and IID table rows.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      NPTv6 OFFLOAD FRONTEND                      │
//! │                                                                  │
//! │  "needs accel" event                                             │
//! │        │                                                         │
//! │        ▼                                                         │
//! │  ┌──────────────┐  conn lock   ┌───────────────────┐             │
//! │  │ State Machine│─────────────▶│ Admission Control │             │
//! │  │ (per conn)   │  then adm    │ (pending+accel)   │             │
//! │  └──────┬───────┘              └───────────────────┘             │
//! │         │ granted                                                │
//! │         ▼                                                        │
//! │  ┌──────────────┐   refcount   ┌───────────────────┐             │
//! │  │ Prefix Table │◀─────────────│ IID Table         │             │
//! │  │ (0→1 install)│   per dir    │ (flow_index / 2)  │             │
//! │  └──────┬───────┘              └─────────┬─────────┘             │
//! │         │                                │                       │
//! │         ▼                                ▼                       │
//! │  ┌────────────────────────────────────────────────┐              │
//! │  │                  PpeHal (engine)               │              │
//! │  └────────────────────────────────────────────────┘              │
//! │                                                                  │
//! │  PendingWatchdog: force-resolves attempts past their deadline    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lock Order
//!
//! | Rank | Lock | Scope |
//! |------|------|-------|
//! | 1 | connection | one per tracked flow |
//! | 2 | admission | one per protocol family |
//! | 3 | prefix slot | one per prefix row |
//!
//! Locks are taken in increasing rank only. Out-of-order acquisition panics.

#![warn(missing_docs)]

pub mod accel;
pub mod admission;
pub mod config;
pub mod connection;
pub mod error;
pub mod frontend;
pub mod hal;
pub mod iid;
pub mod lock;
pub mod nptv6;
pub mod prefix;
pub mod slot;
pub mod stats;
pub mod watchdog;

pub use accel::{AccelOutcome, AccelStateMachine, DecelRequest, PendingTicket};
pub use admission::{AdmissionController, AdmissionLimit, AdmissionSnapshot, LimitMode, PendingOutcome};
pub use config::{AccelConfig, ConfigError};
pub use connection::{AccelConnection, AccelMode, ConnectionGuard, ConnectionId, FailReason};
pub use error::{AccelError, Result};
pub use frontend::{Nptv6Frontend, OffloadHandle, OffloadResult};
pub use hal::{HwStatus, IidCalc, IidFields, PpeHal};
pub use iid::{Direction, IidRef, IidTable};
pub use nptv6::{ConnFlow, NptExtension, NptKind, NptPrefixes, Nptv6Rule, PrefixSide};
pub use prefix::{PrefixRef, PrefixTable};
pub use slot::SlotPool;
pub use stats::AccelStats;
pub use watchdog::PendingWatchdog;

/// Default engine connection capacity
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4096;

/// Default prefix table rows
pub const DEFAULT_PREFIX_TABLE_SIZE: u32 = 64;

/// Default IID table rows
pub const DEFAULT_IID_TABLE_SIZE: u16 = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_MAX_CONNECTIONS, 4096);
        assert_eq!(AccelConfig::default().iid_table_size, DEFAULT_IID_TABLE_SIZE);
    }
}
