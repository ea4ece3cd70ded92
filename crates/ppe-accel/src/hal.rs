//! Offload Engine Interface
//!
//! Narrow call surface into the packet processing engine driver. Only the
//! NPTv6 table programming calls are needed here: prefix add/delete, IID
//! field calculation, IID add/delete.

use std::net::Ipv6Addr;

use thiserror::Error;

/// Failure codes reported by the offload engine
///
/// Success is `Ok(..)`; everything here is an opaque failure to this crate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwStatus {
    /// Unspecified failure
    #[error("operation failed")]
    Fail,
    /// Request rejected as malformed
    #[error("bad parameter")]
    BadParam,
    /// No such table entry
    #[error("entry not found")]
    NotFound,
    /// Table entry already programmed
    #[error("entry already exists")]
    AlreadyExists,
    /// No free table entry
    #[error("table full")]
    Full,
    /// Engine out of memory
    #[error("out of memory")]
    OutOfMemory,
    /// Operation not supported by this engine
    #[error("not supported")]
    NotSupported,
    /// Engine busy, retry later
    #[error("engine busy")]
    Busy,
    /// Engine did not answer in time
    #[error("engine timeout")]
    Timeout,
}

/// Input to the engine's IID calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IidCalc {
    /// Prefix length of the address being translated
    pub prefix_len: u8,
    /// Prefix length of the translated address
    pub tip_prefix_len: u8,
    /// Destination translation when set, source translation otherwise
    pub is_dnat: bool,
    /// Source address (meaningful when `!is_dnat`)
    pub sip: Ipv6Addr,
    /// Destination address (meaningful when `is_dnat`)
    pub dip: Ipv6Addr,
    /// Translated address
    pub tip: Ipv6Addr,
}

impl IidCalc {
    /// Source-side calculation
    pub fn snat(prefix_len: u8, tip_prefix_len: u8, sip: Ipv6Addr, tip: Ipv6Addr) -> Self {
        Self {
            prefix_len,
            tip_prefix_len,
            is_dnat: false,
            sip,
            dip: Ipv6Addr::UNSPECIFIED,
            tip,
        }
    }

    /// Destination-side calculation
    pub fn dnat(prefix_len: u8, tip_prefix_len: u8, dip: Ipv6Addr, tip: Ipv6Addr) -> Self {
        Self {
            prefix_len,
            tip_prefix_len,
            is_dnat: true,
            sip: Ipv6Addr::UNSPECIFIED,
            dip,
            tip,
        }
    }
}

/// IID fields computed by the engine, programmed as-is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IidFields {
    /// Translated interface identifier
    pub iid: u16,
    /// Checksum-neutral adjustment word
    pub adjustment: u16,
    /// Word position of the adjustment inside the address
    pub adj_offset: u8,
}

/// Offload engine client (abstracted for testing)
pub trait PpeHal: Send + Sync {
    /// Program prefix table row `l3_if`
    fn prefix_add(&self, l3_if: u32, prefix: Ipv6Addr, prefix_len: u8) -> Result<(), HwStatus>;

    /// Clear prefix table row `index`
    fn prefix_del(&self, index: u32) -> Result<(), HwStatus>;

    /// Compute IID fields for one direction
    fn iid_calc(&self, calc: &IidCalc) -> Result<IidFields, HwStatus>;

    /// Program the IID for `flow_index`
    fn iid_add(&self, flow_index: u16, fields: &IidFields) -> Result<(), HwStatus>;

    /// Clear the IID for `flow_index`
    fn iid_del(&self, flow_index: u16) -> Result<(), HwStatus>;
}
