// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Filter descriptors and the filter slot pool.

use crate::fw::FwFilterId;
use crate::fw::HwSinkId;
use crate::l2::L2Id;
use bitflags::bitflags;
use core::net::IpAddr;
use kestrel_api::MacAddr;
use kestrel_api::TunnelKind;

bitflags! {
    /// Hardware-behavior flags carried by a filter.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FilterFlags: u32 {
        /// Match on the receive path.
        const RX_PATH = 1 << 0;

        /// Match the outermost header of encapsulated traffic.
        const OUTERMOST = 1 << 1;

        /// The programmed L2 address is the source side.
        const SOURCE_ADDR = 1 << 2;

        /// Drop matching traffic.
        const DROP = 1 << 3;

        /// Count matching traffic without steering it.
        const METER = 1 << 4;
    }
}

bitflags! {
    /// Which match fields are semantically active on a filter.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FieldSet: u32 {
        const DST_MAC = 1 << 0;
        const SRC_MAC = 1 << 1;
        const ETHERTYPE = 1 << 2;
        const OUTER_VLAN = 1 << 3;
        const INNER_VLAN = 1 << 4;
        const SRC_IP = 1 << 5;
        const DST_IP = 1 << 6;
        const SRC_IP_MASK = 1 << 7;
        const DST_IP_MASK = 1 << 8;
        const IP_PROTO = 1 << 9;
        const SRC_PORT = 1 << 10;
        const DST_PORT = 1 << 11;
        const SRC_PORT_MASK = 1 << 12;
        const DST_PORT_MASK = 1 << 13;
        const MIRROR = 1 << 14;
        const TUNNEL = 1 << 15;

        /// Every L3/L4 field. A filter with none of these is an
        /// L2-only match.
        const L3_L4 = Self::SRC_IP.bits()
            | Self::DST_IP.bits()
            | Self::SRC_IP_MASK.bits()
            | Self::DST_IP_MASK.bits()
            | Self::IP_PROTO.bits()
            | Self::SRC_PORT.bits()
            | Self::DST_PORT.bits()
            | Self::SRC_PORT_MASK.bits()
            | Self::DST_PORT_MASK.bits();
    }
}

bitflags! {
    /// Where in the header stack a MAC match applies.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct L2Valid: u8 {
        const DST = 1 << 0;
        const SRC = 1 << 1;
        const INNER_DST = 1 << 2;
        const INNER_SRC = 1 << 3;

        const OUTER = Self::DST.bits() | Self::SRC.bits();
        const ANY_DST = Self::DST.bits() | Self::INNER_DST.bits();
        const ANY_SRC = Self::SRC.bits() | Self::INNER_SRC.bits();
    }
}

/// The hardware representation a filter compiles to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FilterKind {
    /// A shared L2 (MAC/VLAN/ethertype) filter; the rule's hardware
    /// object is its shared L2 entry.
    L2,

    /// An exact-match filter on L2 (and optionally VLAN) fields.
    ExactMatch,

    /// An n-tuple filter on L3/L4 fields.
    #[default]
    Ntuple,

    /// A standing redirect of a whole tunnel kind to a VF.
    TunnelRedirect,
}

/// The match fields of a filter. Two filters with equal `MatchFields`
/// (and equal kind and flags) classify the same traffic; the
/// destination is deliberately not part of this struct.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MatchFields {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub ethertype: u16,
    pub ovlan: u16,
    pub ovlan_mask: u16,
    pub ivlan: u16,
    pub ivlan_mask: u16,

    /// The programmed address of a kind-`L2` filter.
    pub l2_addr: MacAddr,
    pub l2_addr_mask: MacAddr,

    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_ip_mask: Option<IpAddr>,
    pub dst_ip_mask: Option<IpAddr>,
    pub ip_proto: u8,

    pub src_port: u16,
    pub src_port_mask: u16,
    pub dst_port: u16,
    pub dst_port_mask: u16,

    pub tunnel: Option<TunnelKind>,
    pub vni: u32,
}

/// A filter descriptor: the compiled form of one flow rule.
///
/// Allocated empty from the [`FilterPool`], populated by the pattern
/// translator and action dispatch, then either committed to hardware
/// and linked into a sink or discarded back to the pool.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub kind: FilterKind,
    pub flags: FilterFlags,
    pub fields: FieldSet,
    pub l2_valid: L2Valid,
    pub m: MatchFields,

    /// Placement hint, recorded when the rule matches a destination
    /// MAC.
    pub priority: u32,

    /// The destination the filter steers to.
    pub dst: Option<HwSinkId>,

    /// Mirror destination for VF-match rules.
    pub mirror: Option<HwSinkId>,

    /// The shared L2 filter this filter depends on. Non-owning; the
    /// L2 table's reference count is the sole owner-tracking
    /// mechanism.
    pub l2_ref: Option<L2Id>,

    /// The specialized (exact-match or n-tuple) hardware object, once
    /// installed.
    pub hw: Option<FwFilterId>,
}

impl Filter {
    /// Does `other` classify exactly the same traffic? The
    /// destination and mirror ids are ignored.
    pub fn same_match(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.flags == other.flags
            && self.fields == other.fields
            && self.m == other.m
    }

    /// Does this filter match on L2 fields only?
    pub fn l2_only(&self) -> bool {
        !self.fields.intersects(FieldSet::L3_L4)
    }
}

/// A stable index into the filter pool.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FilterId(u16);

impl FilterId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// A fixed-capacity arena of filter slots.
///
/// Allocation hands out stable indices, never addresses, so
/// outstanding ids stay valid across unrelated alloc/free traffic.
#[derive(Debug)]
pub struct FilterPool {
    slots: Vec<Option<Filter>>,
    free: Vec<FilterId>,
}

impl FilterPool {
    pub fn new(capacity: u16) -> Self {
        let slots = (0..capacity).map(|_| None).collect();
        // Pop from the end, so push in reverse to hand out low slots
        // first.
        let free = (0..capacity).rev().map(FilterId).collect();
        Self { slots, free }
    }

    /// Take a free slot, returning its id, or `None` when the pool is
    /// exhausted.
    pub fn alloc(&mut self) -> Option<FilterId> {
        let id = self.free.pop()?;
        self.slots[id.index()] = Some(Filter::default());
        Some(id)
    }

    /// Return a slot to the pool.
    pub fn free(&mut self, id: FilterId) {
        match self.slots[id.index()].take() {
            Some(_) => self.free.push(id),
            None => panic!("bug: double free of filter slot {}", id.0),
        }
    }

    pub fn get(&self, id: FilterId) -> &Filter {
        match self.slots[id.index()].as_ref() {
            Some(f) => f,
            None => panic!("bug: filter slot {} is free", id.0),
        }
    }

    pub fn get_mut(&mut self, id: FilterId) -> &mut Filter {
        match self.slots[id.index()].as_mut() {
            Some(f) => f,
            None => panic!("bug: filter slot {} is free", id.0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_alloc_free() {
        let mut pool = FilterPool::new(2);
        assert_eq!(pool.free_count(), 2);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert!(pool.alloc().is_none());
        assert_eq!(pool.free_count(), 0);

        pool.free(a);
        assert_eq!(pool.free_count(), 1);
        let c = pool.alloc().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn pool_double_free() {
        let mut pool = FilterPool::new(1);
        let a = pool.alloc().unwrap();
        pool.free(a);
        pool.free(a);
    }

    #[test]
    fn same_match_ignores_destination() {
        let mut a = Filter::default();
        a.fields = FieldSet::SRC_IP | FieldSet::DST_IP;
        a.m.src_ip = Some("10.0.0.1".parse().unwrap());
        a.dst = Some(crate::fw::HwSinkId(7));

        let mut b = a.clone();
        b.dst = Some(crate::fw::HwSinkId(9));
        assert!(a.same_match(&b));

        b.m.src_ip = Some("10.0.0.2".parse().unwrap());
        assert!(!a.same_match(&b));
    }

    #[test]
    fn l2_only() {
        let mut f = Filter::default();
        f.fields = FieldSet::DST_MAC | FieldSet::ETHERTYPE | FieldSet::OUTER_VLAN;
        assert!(f.l2_only());

        f.fields |= FieldSet::SRC_PORT;
        assert!(!f.l2_only());
    }
}
