// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The device command channel.
//!
//! Every hardware-facing operation goes through [`FwChannel`]: a
//! synchronous request/response exchange with the device firmware.
//! This core never inspects the wire format of that exchange; it only
//! sees success or a numeric failure cause. Calls may block for
//! arbitrarily long and have no cancellation; a caller wishing to
//! cancel must wait for the call to return and issue a compensating
//! release.

use crate::filter::Filter;
use crate::sink::Sink;
use core::fmt;
use core::fmt::Display;
use kestrel_api::MacAddr;
use kestrel_api::TunnelKind;

/// A firmware-assigned filter identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FwFilterId(pub u64);

/// A firmware-assigned destination resource identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HwSinkId(pub u16);

/// A firmware-assigned RSS context identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RssCtxId(pub u16);

/// The hardware ring-group identifier backing a receive queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GroupId(pub u16);

/// A failure reported by the firmware, carrying its numeric cause.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FwError {
    pub code: i32,
    pub msg: String,
}

impl FwError {
    pub fn new(code: i32, msg: &str) -> Self {
        Self { code, msg: msg.to_string() }
    }
}

impl Display for FwError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "firmware error {}: {}", self.code, self.msg)
    }
}

pub type FwResult<T> = Result<T, FwError>;

/// Parameters for programming a shared L2 filter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct L2FilterParams {
    /// The address the filter matches on.
    pub addr: MacAddr,

    /// Always the full mask; partial L2 masks are not expressible.
    pub addr_mask: MacAddr,

    /// Match the outermost header of encapsulated traffic.
    pub outermost: bool,

    /// Program the source side rather than the destination side.
    pub source_addr: bool,

    /// Ask the firmware to place the filter below the main table,
    /// used for very low-priority rules.
    pub below_hint: bool,
}

/// The synchronous command channel to the device.
///
/// Implementations translate these calls into whatever transport the
/// device uses. Each call either fully takes effect or reports a
/// failure; this core issues compensating releases on error paths.
pub trait FwChannel {
    /// Program a shared L2 filter steering to `dst`.
    fn l2_filter_alloc(
        &self,
        dst: HwSinkId,
        params: &L2FilterParams,
    ) -> FwResult<FwFilterId>;

    /// Remove a previously programmed L2 filter.
    fn l2_filter_free(&self, id: FwFilterId) -> FwResult<()>;

    /// Program an exact-match filter steering to `dst`.
    fn em_filter_alloc(
        &self,
        dst: HwSinkId,
        filter: &Filter,
    ) -> FwResult<FwFilterId>;

    /// Remove a previously programmed exact-match filter.
    fn em_filter_free(&self, id: FwFilterId) -> FwResult<()>;

    /// Program an n-tuple filter steering to `dst`.
    fn ntuple_filter_alloc(
        &self,
        dst: HwSinkId,
        filter: &Filter,
    ) -> FwResult<FwFilterId>;

    /// Remove a previously programmed n-tuple filter.
    fn ntuple_filter_free(&self, id: FwFilterId) -> FwResult<()>;

    /// Allocate a destination resource.
    fn sink_alloc(&self) -> FwResult<HwSinkId>;

    /// Free a destination resource.
    fn sink_free(&self, id: HwSinkId) -> FwResult<()>;

    /// Allocate an RSS context for a destination resource.
    fn rss_ctx_alloc(&self, sink: HwSinkId) -> FwResult<RssCtxId>;

    /// Free an RSS context.
    fn rss_ctx_free(&self, id: RssCtxId) -> FwResult<()>;

    /// Commit a destination resource's configuration.
    fn sink_cfg(&self, sink: &Sink) -> FwResult<()>;

    /// Apply a destination resource's RSS configuration: indirection
    /// table, hash key, and hash types.
    fn rss_cfg(&self, sink: &Sink) -> FwResult<()>;

    /// The ring group backing a receive queue.
    fn queue_group(&self, queue: u16) -> FwResult<GroupId>;

    /// The current default destination of a virtual function, or
    /// `None` when no driver is bound to it.
    fn vf_default_sink(&self, vf: u16) -> FwResult<Option<HwSinkId>>;

    /// The set of tunnel kinds currently redirected, as a bitmask of
    /// [`TunnelKind::bit`] values.
    fn tunnel_redirect_query(&self) -> FwResult<u32>;

    /// Install a standing redirect of all traffic of a tunnel kind.
    fn tunnel_redirect(&self, kind: TunnelKind) -> FwResult<()>;

    /// Remove a standing tunnel redirect.
    fn tunnel_redirect_free(&self, kind: TunnelKind) -> FwResult<()>;

    /// The function id owning the standing redirect for a tunnel
    /// kind.
    fn tunnel_redirect_owner(&self, kind: TunnelKind) -> FwResult<u16>;
}
