// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Request validation and pattern translation.
//!
//! The validator rejects structurally invalid requests before any
//! resource is touched. The translator walks the match-clause
//! sequence and compiles it into a filter descriptor, enforcing the
//! per-protocol masking rules the hardware imposes.

use crate::device::DeviceConfig;
use crate::filter::FieldSet;
use crate::filter::Filter;
use crate::filter::FilterFlags;
use crate::filter::FilterKind;
use crate::filter::L2Valid;
use crate::fw::FwChannel;
use core::net::IpAddr;
use kestrel_api::ErrorCategory;
use kestrel_api::ErrorKind;
use kestrel_api::FlowAction;
use kestrel_api::FlowAttr;
use kestrel_api::FlowError;
use kestrel_api::MatchItem;
use kestrel_api::TunnelKind;
use slog::Logger;
use slog::debug;

/// The bits of the TCI holding the VLAN ID. The hardware can match
/// the full ID or nothing.
const VLAN_VID_MASK: u16 = 0x0FFF;

/// The only flags octet a VXLAN header may carry: valid-VNI set,
/// everything else reserved.
const VXLAN_FLAGS: u8 = 0x08;

/// NVGRE first word: key-present bit and version zero.
const NVGRE_FLAGS_VERSION: u16 = 0x2000;

/// The transparent-Ethernet-bridging protocol NVGRE encapsulates.
const NVGRE_PROTOCOL: u16 = 0x6558;

/// Reject structurally invalid requests: an empty pattern or action
/// list, a non-ingress or egress attribute set, or any clause
/// carrying a range end. Pure check; runs before any allocation.
pub fn validate_args(
    attr: &FlowAttr,
    pattern: &[MatchItem],
    actions: &[FlowAction],
) -> Result<(), FlowError> {
    if pattern.is_empty() {
        return Err(FlowError {
            kind: ErrorKind::InvalidArgument,
            category: ErrorCategory::Item,
            index: None,
            msg: "empty pattern".to_string(),
        });
    }

    if actions.iter().all(|a| a.is_void()) {
        return Err(FlowError {
            kind: ErrorKind::InvalidArgument,
            category: ErrorCategory::Action,
            index: None,
            msg: "no action specified".to_string(),
        });
    }

    if !attr.ingress {
        return Err(FlowError::attr(
            ErrorKind::Unsupported,
            "only ingress is supported",
        ));
    }

    if attr.egress {
        return Err(FlowError::attr(
            ErrorKind::Unsupported,
            "no support for egress",
        ));
    }

    for (idx, item) in pattern.iter().enumerate() {
        if item.has_last() {
            return Err(FlowError::item(
                ErrorKind::Unsupported,
                idx,
                "no support for range matching",
            ));
        }
    }

    Ok(())
}

/// Decide which hardware representation a pattern requires.
///
/// Any L3/L4 clause forces an n-tuple filter; otherwise Ethernet,
/// wildcard, and VLAN clauses call for exact-match. VLAN cannot be
/// combined with n-tuple matching at all.
pub fn classify(pattern: &[MatchItem]) -> Result<FilterKind, FlowError> {
    let mut l2 = false;
    let mut vlan = None;
    let mut l3l4 = false;

    for (idx, item) in pattern.iter().enumerate() {
        match item {
            MatchItem::Any(_) | MatchItem::Ethernet(_) => l2 = true,
            MatchItem::Vlan(_) => {
                l2 = true;
                vlan = Some(idx);
            }
            MatchItem::Ipv4(_)
            | MatchItem::Ipv6(_)
            | MatchItem::Tcp(_)
            | MatchItem::Udp(_) => l3l4 = true,
            _ => {}
        }
    }

    if l3l4 {
        if let Some(idx) = vlan {
            return Err(FlowError::item(
                ErrorKind::InvalidArgument,
                idx,
                "cannot use VLAN with an n-tuple filter",
            ));
        }
        return Ok(FilterKind::Ntuple);
    }

    if l2 { Ok(FilterKind::ExactMatch) } else { Ok(FilterKind::Ntuple) }
}

fn vni24(bytes: [u8; 3]) -> u32 {
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

/// Compile a match pattern into `filter`.
///
/// Clauses whose spec or mask is absent contribute nothing, except
/// tunnel clauses, where an absent spec/mask pair declares the tunnel
/// kind and a half-present pair is an error.
pub fn translate<C: FwChannel>(
    cfg: &DeviceConfig,
    chan: &C,
    attr: &FlowAttr,
    pattern: &[MatchItem],
    filter: &mut Filter,
    log: &Logger,
) -> Result<(), FlowError> {
    let kind = classify(pattern)?;
    let use_ntuple = kind == FilterKind::Ntuple;
    debug!(log, "classified pattern"; "kind" => ?kind);

    filter.kind = kind;
    filter.flags |= FilterFlags::RX_PATH;

    let mut en = FieldSet::empty();
    let mut l2_valid = L2Valid::empty();
    let mut inner = false;

    for (idx, item) in pattern.iter().enumerate() {
        match item {
            MatchItem::Void => {}

            MatchItem::Any(it) => {
                let Some(spec) = it.spec else { continue };
                inner = spec.depth > 3;
                if inner {
                    debug!(log, "parsing inner headers");
                }
            }

            MatchItem::Ethernet(it) => {
                let (Some(spec), Some(mask)) = (it.spec, it.mask) else {
                    continue;
                };

                // MAC masks must be all-zero or all-one; the hardware
                // cannot express a partial MAC mask.
                if (!mask.src.is_zero() && !mask.src.is_broadcast())
                    || (!mask.dst.is_zero() && !mask.dst.is_broadcast())
                {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "MAC address mask not valid",
                    ));
                }

                if mask.ethertype != 0 && mask.ethertype != 0xFFFF {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "ethertype mask not valid",
                    ));
                }

                if mask.dst.is_broadcast() {
                    if !spec.dst.is_unicast() {
                        return Err(FlowError::item(
                            ErrorKind::InvalidArgument,
                            idx,
                            "destination MAC is invalid",
                        ));
                    }
                    filter.m.dst_mac = spec.dst;
                    en |= FieldSet::DST_MAC;
                    l2_valid |=
                        if inner { L2Valid::INNER_DST } else { L2Valid::DST };
                    filter.priority = attr.priority;
                    debug!(log, "creating a priority flow";
                        "priority" => attr.priority);
                }

                if mask.src.is_broadcast() {
                    if !spec.src.is_unicast() {
                        return Err(FlowError::item(
                            ErrorKind::InvalidArgument,
                            idx,
                            "source MAC is invalid",
                        ));
                    }
                    filter.m.src_mac = spec.src;
                    en |= FieldSet::SRC_MAC;
                    l2_valid |=
                        if inner { L2Valid::INNER_SRC } else { L2Valid::SRC };
                }

                if mask.ethertype != 0 {
                    filter.m.ethertype = spec.ethertype;
                    en |= FieldSet::ETHERTYPE;
                }
            }

            MatchItem::Vlan(it) => {
                let (Some(spec), Some(mask)) = (it.spec, it.mask) else {
                    continue;
                };

                // Only one ethertype source is allowed; an ethertype
                // recorded by an earlier clause means this VLAN clause
                // is trying to match the TPID.
                if en.contains(FieldSet::ETHERTYPE) {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "VLAN TPID matching is not supported",
                    ));
                }

                // Only the VLAN ID can be matched, and only in full.
                if mask.tci == VLAN_VID_MASK {
                    filter.m.ovlan = spec.tci & VLAN_VID_MASK;
                    en |= FieldSet::OUTER_VLAN;
                } else {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "VLAN mask is invalid",
                    ));
                }

                if mask.inner_ethertype != 0 {
                    if mask.inner_ethertype != 0xFFFF {
                        return Err(FlowError::item(
                            ErrorKind::InvalidArgument,
                            idx,
                            "inner ethertype mask not valid",
                        ));
                    }
                    filter.m.ethertype = spec.inner_ethertype;
                    en |= FieldSet::ETHERTYPE;
                }
            }

            MatchItem::Ipv4(it) => {
                let (Some(spec), Some(mask)) = (it.spec, it.mask) else {
                    continue;
                };

                // Only the addresses are maskable.
                if mask.tos != 0
                    || mask.total_len != 0
                    || mask.ident != 0
                    || mask.frag_off != 0
                    || mask.ttl != 0
                    || mask.proto != 0
                    || mask.checksum != 0
                {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "invalid IPv4 mask",
                    ));
                }

                filter.m.src_ip = Some(IpAddr::V4(spec.src));
                filter.m.dst_ip = Some(IpAddr::V4(spec.dst));
                en |= FieldSet::SRC_IP | FieldSet::DST_IP;

                if !mask.src.is_unspecified() {
                    filter.m.src_ip_mask = Some(IpAddr::V4(mask.src));
                    if use_ntuple {
                        en |= FieldSet::SRC_IP_MASK;
                    }
                }

                if !mask.dst.is_unspecified() {
                    filter.m.dst_ip_mask = Some(IpAddr::V4(mask.dst));
                    if use_ntuple {
                        en |= FieldSet::DST_IP_MASK;
                    }
                }

                if spec.proto != 0 {
                    filter.m.ip_proto = spec.proto;
                    en |= FieldSet::IP_PROTO;
                }
            }

            MatchItem::Ipv6(it) => {
                let (Some(spec), Some(mask)) = (it.spec, it.mask) else {
                    continue;
                };

                // Only the addresses are maskable.
                if mask.vtc_flow != 0
                    || mask.payload_len != 0
                    || mask.proto != 0
                    || mask.hop_limit != 0
                {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "invalid IPv6 mask",
                    ));
                }

                filter.m.src_ip = Some(IpAddr::V6(spec.src));
                filter.m.dst_ip = Some(IpAddr::V6(spec.dst));
                en |= FieldSet::SRC_IP | FieldSet::DST_IP;

                if !mask.src.is_unspecified() {
                    filter.m.src_ip_mask = Some(IpAddr::V6(mask.src));
                    if use_ntuple {
                        en |= FieldSet::SRC_IP_MASK;
                    }
                }

                if !mask.dst.is_unspecified() {
                    filter.m.dst_ip_mask = Some(IpAddr::V6(mask.dst));
                    if use_ntuple {
                        en |= FieldSet::DST_IP_MASK;
                    }
                }

                if spec.proto != 0 {
                    filter.m.ip_proto = spec.proto;
                    en |= FieldSet::IP_PROTO;
                }
            }

            MatchItem::Tcp(it) => {
                let (Some(spec), Some(mask)) = (it.spec, it.mask) else {
                    continue;
                };

                // Only the ports are maskable.
                if mask.seq != 0
                    || mask.ack != 0
                    || mask.data_off != 0
                    || mask.flags != 0
                    || mask.window != 0
                    || mask.checksum != 0
                    || mask.urgent != 0
                {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "invalid TCP mask",
                    ));
                }

                filter.m.src_port = spec.src_port;
                filter.m.dst_port = spec.dst_port;
                en |= FieldSet::SRC_PORT | FieldSet::DST_PORT;

                if mask.dst_port != 0 {
                    filter.m.dst_port_mask = mask.dst_port;
                    if use_ntuple {
                        en |= FieldSet::DST_PORT_MASK;
                    }
                }

                if mask.src_port != 0 {
                    filter.m.src_port_mask = mask.src_port;
                    if use_ntuple {
                        en |= FieldSet::SRC_PORT_MASK;
                    }
                }
            }

            MatchItem::Udp(it) => {
                let (Some(spec), Some(mask)) = (it.spec, it.mask) else {
                    continue;
                };

                if mask.len != 0 || mask.checksum != 0 {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "invalid UDP mask",
                    ));
                }

                filter.m.src_port = spec.src_port;
                filter.m.dst_port = spec.dst_port;
                en |= FieldSet::SRC_PORT | FieldSet::DST_PORT;

                if mask.dst_port != 0 {
                    filter.m.dst_port_mask = mask.dst_port;
                    if use_ntuple {
                        en |= FieldSet::DST_PORT_MASK;
                    }
                }

                if mask.src_port != 0 {
                    filter.m.src_port_mask = mask.src_port;
                    if use_ntuple {
                        en |= FieldSet::SRC_PORT_MASK;
                    }
                }
            }

            MatchItem::Vxlan(it) => match (it.spec, it.mask) {
                // A bare clause declares the tunnel kind.
                (None, None) => {
                    filter.m.tunnel = Some(TunnelKind::Vxlan);
                    en |= FieldSet::TUNNEL;
                }
                (Some(spec), Some(mask)) => {
                    if spec.rsvd1 != 0
                        || spec.rsvd0 != [0; 3]
                        || spec.flags != VXLAN_FLAGS
                    {
                        return Err(FlowError::item(
                            ErrorKind::InvalidArgument,
                            idx,
                            "invalid VXLAN item",
                        ));
                    }

                    // The VNI may not be partially masked.
                    if mask.vni != [0xFF; 3] {
                        return Err(FlowError::item(
                            ErrorKind::InvalidArgument,
                            idx,
                            "invalid VNI mask",
                        ));
                    }

                    filter.m.vni = vni24(spec.vni);
                    filter.m.tunnel = Some(TunnelKind::Vxlan);
                    en |= FieldSet::TUNNEL;
                }
                _ => {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "invalid VXLAN item",
                    ));
                }
            },

            MatchItem::Nvgre(it) => match (it.spec, it.mask) {
                (None, None) => {
                    filter.m.tunnel = Some(TunnelKind::Nvgre);
                    en |= FieldSet::TUNNEL;
                }
                (Some(spec), Some(mask)) => {
                    if spec.flags_version != NVGRE_FLAGS_VERSION
                        || spec.protocol != NVGRE_PROTOCOL
                    {
                        return Err(FlowError::item(
                            ErrorKind::InvalidArgument,
                            idx,
                            "invalid NVGRE item",
                        ));
                    }

                    if mask.tni != [0xFF; 3] {
                        return Err(FlowError::item(
                            ErrorKind::InvalidArgument,
                            idx,
                            "invalid TNI mask",
                        ));
                    }

                    filter.m.vni = vni24(spec.tni);
                    filter.m.tunnel = Some(TunnelKind::Nvgre);
                    en |= FieldSet::TUNNEL;
                }
                _ => {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "invalid NVGRE item",
                    ));
                }
            },

            MatchItem::Gre(it) => match (it.spec, it.mask) {
                (None, None) => {
                    filter.m.tunnel = Some(TunnelKind::Gre);
                    en |= FieldSet::TUNNEL;
                }
                (Some(spec), Some(_)) => {
                    if spec.flags_version != 0 {
                        return Err(FlowError::item(
                            ErrorKind::InvalidArgument,
                            idx,
                            "invalid GRE item",
                        ));
                    }
                    filter.m.tunnel = Some(TunnelKind::Gre);
                    en |= FieldSet::TUNNEL;
                }
                _ => {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "invalid GRE item",
                    ));
                }
            },

            MatchItem::Vf(it) => {
                let Some(spec) = it.spec else { continue };

                if !cfg.is_pf() {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "cannot match VF traffic on a virtual function",
                    ));
                }

                if spec.id >= u32::from(cfg.max_vfs) {
                    return Err(FlowError::item(
                        ErrorKind::InvalidArgument,
                        idx,
                        "incorrect VF id",
                    ));
                }

                if !attr.transfer {
                    return Err(FlowError::item(
                        ErrorKind::Unsupported,
                        idx,
                        "matching VF traffic without affecting it \
                         (transfer attribute) is unsupported",
                    ));
                }

                match chan.vf_default_sink(spec.id as u16) {
                    Ok(Some(hw)) => {
                        filter.mirror = Some(hw);
                        en |= FieldSet::MIRROR;
                    }
                    // No driver is bound to the VF.
                    Ok(None) => {
                        return Err(FlowError::item(
                            ErrorKind::InvalidArgument,
                            idx,
                            "unable to get default destination for VF",
                        ));
                    }
                    Err(e) => {
                        return Err(FlowError::item(
                            ErrorKind::Device(e.code),
                            idx,
                            &format!(
                                "unable to get default destination for VF: {e}"
                            ),
                        ));
                    }
                }
            }
        }
    }

    filter.fields = en;
    filter.l2_valid = l2_valid;
    Ok(())
}
