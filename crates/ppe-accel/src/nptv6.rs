//! NPTv6 Rule Model
//!
//! The translator's per-connection extension, the addresses of both flow
//! directions, and the pair of prefix rows one translated flow occupies.

use std::net::Ipv6Addr;

use ipnetwork::Ipv6Network;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hal::PpeHal;
use crate::prefix::{PrefixRef, PrefixTable};

/// Translation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NptKind {
    /// Source prefix translation
    Snpt,
    /// Destination prefix translation
    Dnpt,
}

/// One direction of an offloaded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnFlow {
    /// Engine flow index (forward/reverse pairs share `flow_index / 2`)
    pub flow_index: u16,
    /// Ingress L3 interface number
    pub in_l3_if: u32,
    /// Source address as matched
    pub match_src: Ipv6Addr,
    /// Destination address as matched
    pub match_dest: Ipv6Addr,
    /// Source address after translation
    pub xlate_src: Ipv6Addr,
    /// Destination address after translation
    pub xlate_dest: Ipv6Addr,
}

/// Translator extension attached to the tracked connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NptExtension {
    /// Inside prefix
    pub src_pfx: Ipv6Addr,
    /// Outside prefix
    pub dst_pfx: Ipv6Addr,
    /// Inside prefix length
    pub src_pfx_len: u8,
    /// Outside prefix length
    pub dst_pfx_len: u8,
    /// Translation kind
    pub kind: NptKind,
}

/// Rule as offloaded, oriented to the direction the rule is pushed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nptv6Rule {
    /// Source-side prefix
    pub src_pfx: Ipv6Addr,
    /// Destination-side prefix
    pub dst_pfx: Ipv6Addr,
    /// Source-side prefix length
    pub src_pfx_len: u8,
    /// Destination-side prefix length
    pub dst_pfx_len: u8,
    /// Translation kind
    pub kind: NptKind,
}

fn masked(addr: Ipv6Addr, len: u8) -> Option<Ipv6Addr> {
    Ipv6Network::new(addr, len).ok().map(|n| n.network())
}

impl Nptv6Rule {
    /// Orient the translator's extension to the pushed direction.
    ///
    /// The extension may describe either direction of a bidirectional
    /// connection. The pushed direction's addresses are tried first; failing
    /// that the return direction's, with prefixes and lengths swapped.
    /// `None` when neither matches.
    pub fn from_extension(
        ext: &NptExtension,
        match_ip: Ipv6Addr,
        xlate_ip: Ipv6Addr,
        ret_match: Ipv6Addr,
        ret_match_xlate: Ipv6Addr,
        is_outbound: bool,
    ) -> Option<Self> {
        if masked(match_ip, ext.src_pfx_len)? == ext.src_pfx
            && masked(xlate_ip, ext.dst_pfx_len)? == ext.dst_pfx
        {
            return Some(Self {
                src_pfx: ext.src_pfx,
                dst_pfx: ext.dst_pfx,
                src_pfx_len: ext.src_pfx_len,
                dst_pfx_len: ext.dst_pfx_len,
                kind: ext.kind,
            });
        }

        if masked(ret_match_xlate, ext.src_pfx_len)? == ext.src_pfx
            && masked(ret_match, ext.dst_pfx_len)? == ext.dst_pfx
        {
            return Some(Self {
                src_pfx: ext.dst_pfx,
                dst_pfx: ext.src_pfx,
                src_pfx_len: ext.dst_pfx_len,
                dst_pfx_len: ext.src_pfx_len,
                kind: if is_outbound { NptKind::Dnpt } else { NptKind::Snpt },
            });
        }

        tracing::debug!(?ext, %match_ip, %xlate_ip, "NPTv6 extension matches neither direction");
        None
    }

    /// Length programmed into both prefix rows
    pub fn max_prefix_len(&self) -> u8 {
        self.src_pfx_len.max(self.dst_pfx_len)
    }
}

/// Which of a connection's two prefix rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixSide {
    /// Row keyed by the reverse flow's ingress interface
    Flow,
    /// Row keyed by the forward flow's ingress interface
    Return,
}

/// Both prefix rows held by one offloaded connection
pub struct NptPrefixes<H: PpeHal> {
    flow: PrefixRef<H>,
    ret: PrefixRef<H>,
}

impl<H: PpeHal> NptPrefixes<H> {
    /// Acquire the flow row (reverse ingress, destination prefix) and the
    /// return row (forward ingress, source prefix).
    ///
    /// On failure nothing stays acquired.
    pub fn acquire(
        table: &PrefixTable<H>,
        fwd: &ConnFlow,
        rev: &ConnFlow,
        rule: &Nptv6Rule,
    ) -> Result<Self> {
        let len = rule.max_prefix_len();
        let flow = table.acquire(rev.in_l3_if, rule.dst_pfx, len)?;
        let ret = table.acquire(fwd.in_l3_if, rule.src_pfx, len)?;
        Ok(Self { flow, ret })
    }

    /// Reference on one side
    pub fn side(&self, side: PrefixSide) -> &PrefixRef<H> {
        match side {
            PrefixSide::Flow => &self.flow,
            PrefixSide::Return => &self.ret,
        }
    }

    /// Release both rows
    pub fn release(self) {
        self.flow.release();
        self.ret.release();
    }
}

impl<H: PpeHal> std::fmt::Debug for NptPrefixes<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NptPrefixes")
            .field("flow", &self.flow.index())
            .field("ret", &self.ret.index())
            .finish()
    }
}
