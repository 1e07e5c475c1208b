// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Flow rule request types.
//!
//! A flow rule is an attribute set, an ordered pattern of match
//! clauses, and an action list. These types describe the request as
//! handed to the driver; the driver compiles them into its hardware
//! filter representation.

use crate::mac::MacAddr;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::net::Ipv4Addr;
use core::net::Ipv6Addr;
use serde::Deserialize;
use serde::Serialize;

/// Rule-level attributes.
///
/// The `group` selects the destination resource for queue/RSS rules
/// when nonzero. The `priority` is a placement hint for the hardware
/// filter table. A rule matching VF traffic must set `transfer`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowAttr {
    pub group: u32,
    pub priority: u32,
    pub ingress: bool,
    pub egress: bool,
    pub transfer: bool,
}

impl FlowAttr {
    /// An ingress attribute set with all else defaulted.
    pub fn ingress() -> Self {
        Self { ingress: true, ..Default::default() }
    }
}

/// The spec/mask/last triple carried by a match clause.
///
/// `spec` holds the values to match, `mask` selects which bits of the
/// spec participate. `last` describes a range end; ranges are not
/// supported by this hardware and any clause carrying one is
/// rejected.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Item<T> {
    pub spec: Option<T>,
    pub mask: Option<T>,
    pub last: Option<T>,
}

impl<T> Item<T> {
    pub const fn empty() -> Self {
        Self { spec: None, mask: None, last: None }
    }

    pub fn with_mask(spec: T, mask: T) -> Self {
        Self { spec: Some(spec), mask: Some(mask), last: None }
    }
}

impl<T> Default for Item<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Ethernet header fields.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct EthernetFields {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

/// 802.1Q tag fields. Only the VLAN ID bits of the TCI can be
/// matched.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct VlanFields {
    pub tci: u16,
    pub inner_ethertype: u16,
}

/// IPv4 header fields. Only the source and destination addresses are
/// maskable.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ipv4Fields {
    pub tos: u8,
    pub total_len: u16,
    pub ident: u16,
    pub frag_off: u16,
    pub ttl: u8,
    pub proto: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Default for Ipv4Fields {
    fn default() -> Self {
        Self {
            tos: 0,
            total_len: 0,
            ident: 0,
            frag_off: 0,
            ttl: 0,
            proto: 0,
            checksum: 0,
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// IPv6 header fields. Only the source and destination addresses are
/// maskable.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ipv6Fields {
    pub vtc_flow: u32,
    pub payload_len: u16,
    pub proto: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Default for Ipv6Fields {
    fn default() -> Self {
        Self {
            vtc_flow: 0,
            payload_len: 0,
            proto: 0,
            hop_limit: 0,
            src: Ipv6Addr::UNSPECIFIED,
            dst: Ipv6Addr::UNSPECIFIED,
        }
    }
}

/// TCP header fields. Only the ports are maskable.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct TcpFields {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_off: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

/// UDP header fields. Only the ports are maskable.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct UdpFields {
    pub src_port: u16,
    pub dst_port: u16,
    pub len: u16,
    pub checksum: u16,
}

/// A wildcard clause covering some number of header layers. A depth
/// greater than three shifts MAC matching in later clauses to the
/// inner (encapsulated) header.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct AnyFields {
    pub depth: u32,
}

/// VXLAN header fields. The flags octet must carry the valid-VNI bit
/// and the reserved fields must be zero.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct VxlanFields {
    pub flags: u8,
    pub rsvd0: [u8; 3],
    pub vni: [u8; 3],
    pub rsvd1: u8,
}

/// NVGRE header fields. The first word holds the C/K/S bits and
/// version; the key bit must be the only one set.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct NvgreFields {
    pub flags_version: u16,
    pub protocol: u16,
    pub tni: [u8; 3],
    pub flow_id: u8,
}

/// GRE header fields.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct GreFields {
    pub flags_version: u16,
    pub protocol: u16,
}

/// A virtual-function selector.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct VfFields {
    pub id: u32,
}

/// One clause in a match pattern.
///
/// The pattern is an ordered slice of clauses; the end of the slice
/// is the end of the pattern. `Void` clauses are skipped.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MatchItem {
    Void,
    Any(Item<AnyFields>),
    Ethernet(Item<EthernetFields>),
    Vlan(Item<VlanFields>),
    Ipv4(Item<Ipv4Fields>),
    Ipv6(Item<Ipv6Fields>),
    Tcp(Item<TcpFields>),
    Udp(Item<UdpFields>),
    Vxlan(Item<VxlanFields>),
    Nvgre(Item<NvgreFields>),
    Gre(Item<GreFields>),
    Vf(Item<VfFields>),
}

impl MatchItem {
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Does this clause carry a range end?
    pub fn has_last(&self) -> bool {
        match self {
            Self::Void => false,
            Self::Any(i) => i.last.is_some(),
            Self::Ethernet(i) => i.last.is_some(),
            Self::Vlan(i) => i.last.is_some(),
            Self::Ipv4(i) => i.last.is_some(),
            Self::Ipv6(i) => i.last.is_some(),
            Self::Tcp(i) => i.last.is_some(),
            Self::Udp(i) => i.last.is_some(),
            Self::Vxlan(i) => i.last.is_some(),
            Self::Nvgre(i) => i.last.is_some(),
            Self::Gre(i) => i.last.is_some(),
            Self::Vf(i) => i.last.is_some(),
        }
    }
}

/// The kind of tunnel a flow belongs to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TunnelKind {
    Vxlan,
    Nvgre,
    Gre,
}

impl TunnelKind {
    /// The bit representing this kind in the device's redirect set.
    pub const fn bit(self) -> u32 {
        match self {
            Self::Vxlan => 1 << 0,
            Self::Nvgre => 1 << 1,
            Self::Gre => 1 << 2,
        }
    }
}

impl Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Vxlan => write!(f, "VXLAN"),
            Self::Nvgre => write!(f, "NVGRE"),
            Self::Gre => write!(f, "GRE"),
        }
    }
}

/// Hash-type bits accepted by an RSS action.
pub const RSS_HASH_IPV4: u64 = 1 << 0;
pub const RSS_HASH_TCP_IPV4: u64 = 1 << 1;
pub const RSS_HASH_UDP_IPV4: u64 = 1 << 2;
pub const RSS_HASH_IPV6: u64 = 1 << 3;
pub const RSS_HASH_TCP_IPV6: u64 = 1 << 4;
pub const RSS_HASH_UDP_IPV6: u64 = 1 << 5;

/// Configuration for an RSS action.
///
/// When no key is supplied the driver generates a random one. A key
/// longer than the hardware key size is truncated.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RssConfig {
    pub types: u64,
    pub key: Option<Vec<u8>>,
    pub queues: Vec<u16>,
}

/// One entry in an action list.
///
/// A rule carries exactly one meaningful action; `Void` entries are
/// skipped and a second meaningful action is an error.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlowAction {
    Void,
    Queue { index: u16 },
    Drop,
    Count,
    Vf { id: u16 },
    Rss(RssConfig),
}

impl FlowAction {
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }
}

/// The opaque handle identifying an installed flow.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct FlowHandle(u64);

impl FlowHandle {
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl Display for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}
