// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The per-device flow lifecycle controller.
//!
//! A [`Device`] owns every resource a flow rule touches: the filter
//! pool, the shared-L2 table, and the sink table. The four public
//! operations (validate, create, destroy, flush) each hold the device
//! lock end to end, so the multi-step allocate/resolve/link sequences
//! are atomic with respect to each other.

use crate::filter::FieldSet;
use crate::filter::Filter;
use crate::filter::FilterFlags;
use crate::filter::FilterId;
use crate::filter::FilterKind;
use crate::filter::FilterPool;
use crate::fw::FwChannel;
use crate::fw::FwResult;
use crate::fw::HwSinkId;
use crate::l2::L2Error;
use crate::l2::L2Table;
use crate::parse;
use crate::sink::DEFAULT_SINK;
use crate::sink::HashTypes;
use crate::sink::SinkId;
use crate::sink::SinkTable;
use crate::sync::DevMutex;
use kestrel_api::ErrorCategory;
use kestrel_api::ErrorKind;
use kestrel_api::FlowAction;
use kestrel_api::FlowAttr;
use kestrel_api::FlowError;
use kestrel_api::FlowHandle;
use kestrel_api::MacAddr;
use kestrel_api::MatchItem;
use kestrel_api::RssConfig;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use std::collections::BTreeMap;

/// Whether the device is a physical function or a virtual one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FnMode {
    Pf,
    Vf { trusted: bool },
}

/// Static device configuration, fixed at device bring-up.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub name: String,

    /// Number of receive queues. Queue 0 is reserved for the default
    /// sink and never used by flow rules.
    pub rx_queues: u16,

    /// Destination resources, including the default sink.
    pub max_sinks: u16,

    /// Filter descriptor slots.
    pub filter_capacity: u16,

    /// Shared L2 filter slots.
    pub l2_capacity: u16,

    /// Virtual functions configured under this physical function.
    pub max_vfs: u16,

    pub mode: FnMode,

    /// This function's id, used to decide ownership of standing
    /// tunnel redirects.
    pub fn_id: u16,

    /// Device-wide VLAN-strip receive offload; copied into each
    /// prepared sink.
    pub vlan_strip: bool,

    pub started: bool,

    /// The hardware id of the default sink, assigned at device
    /// bring-up.
    pub default_sink_hw: HwSinkId,
}

impl DeviceConfig {
    pub fn is_pf(&self) -> bool {
        matches!(self.mode, FnMode::Pf)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "kestrel0".to_string(),
            rx_queues: 8,
            max_sinks: 8,
            filter_capacity: 64,
            l2_capacity: 16,
            max_vfs: 0,
            mode: FnMode::Pf,
            fn_id: 0,
            vlan_strip: false,
            started: true,
            default_sink_hw: HwSinkId(1),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct FlowEntry {
    filter: FilterId,
    sink: SinkId,
}

struct DeviceData {
    pool: FilterPool,
    l2: L2Table,
    sinks: SinkTable,
    flows: BTreeMap<FlowHandle, FlowEntry>,
    next_flow: u64,
}

/// The result of scanning installed filters for a structural twin.
struct Equiv {
    sink: SinkId,
    pos: usize,
    filter: FilterId,
    handle: FlowHandle,
}

/// A snapshot of the device's flow state, for observability and
/// tests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceDump {
    pub pool_free: usize,
    pub pool_capacity: usize,
    pub l2_filters: usize,
    pub flows: usize,
    pub sinks: Vec<SinkDump>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SinkDump {
    pub allocated: bool,
    pub queues: Vec<u16>,
    pub filters: usize,
    pub flows: usize,
}

pub struct Device<C: FwChannel> {
    cfg: DeviceConfig,
    chan: C,
    log: Logger,
    data: DevMutex<DeviceData>,
}

impl<C: FwChannel> Device<C> {
    pub fn new(cfg: DeviceConfig, chan: C, log: Logger) -> Self {
        let log = log.new(o!("device" => cfg.name.clone()));
        let data = DeviceData {
            pool: FilterPool::new(cfg.filter_capacity),
            l2: L2Table::new(cfg.l2_capacity),
            sinks: SinkTable::new(
                cfg.max_sinks,
                cfg.rx_queues,
                cfg.default_sink_hw,
            ),
            flows: BTreeMap::new(),
            next_flow: 1,
        };

        Self { cfg, chan, log, data: DevMutex::new(data) }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub fn channel(&self) -> &C {
        &self.chan
    }

    pub fn dump(&self) -> DeviceDump {
        let data = self.data.lock();
        DeviceDump {
            pool_free: data.pool.free_count(),
            pool_capacity: data.pool.capacity(),
            l2_filters: data.l2.len(),
            flows: data.flows.len(),
            sinks: data
                .sinks
                .ids()
                .map(|sid| {
                    let s = data.sinks.get(sid);
                    SinkDump {
                        allocated: s.hw.is_some(),
                        queues: s.queues.clone(),
                        filters: s.filters.len(),
                        flows: s.flows.len(),
                    }
                })
                .collect(),
        }
    }

    /// Check whether a rule could be installed. Everything allocated
    /// along the way is torn down again before returning; success
    /// leaves the device byte-identical to before the call.
    pub fn flow_validate(
        &self,
        attr: &FlowAttr,
        pattern: &[MatchItem],
        actions: &[FlowAction],
    ) -> Result<(), FlowError> {
        let mut guard = self.data.lock();
        let data = &mut *guard;

        parse::validate_args(attr, pattern, actions)?;

        let Some(fid) = data.pool.alloc() else {
            error!(self.log, "not enough resources for a new flow");
            return Err(FlowError::handle(
                ErrorKind::ResourceExhausted,
                "not enough resources for a new flow",
            ));
        };

        let res = self.build(data, attr, pattern, actions, fid);
        // Validation never leaves anything installed.
        self.discard(data, fid);
        res
    }

    /// Compile, deduplicate, and install a rule, returning the handle
    /// of the installed flow. Fails closed: any error releases
    /// everything this call allocated.
    pub fn flow_create(
        &self,
        attr: &FlowAttr,
        pattern: &[MatchItem],
        actions: &[FlowAction],
    ) -> Result<FlowHandle, FlowError> {
        if let FnMode::Vf { trusted } = self.cfg.mode {
            if !trusted {
                return Err(FlowError::handle(
                    ErrorKind::InvalidArgument,
                    "cannot create flows on an untrusted VF",
                ));
            }
        }

        if !self.cfg.started {
            return Err(FlowError {
                kind: ErrorKind::InvalidArgument,
                category: ErrorCategory::Unspecified,
                index: None,
                msg: "device must be started".to_string(),
            });
        }

        let mut guard = self.data.lock();
        let data = &mut *guard;

        parse::validate_args(attr, pattern, actions)?;

        let Some(fid) = data.pool.alloc() else {
            error!(self.log, "not enough resources for a new flow");
            return Err(FlowError::handle(
                ErrorKind::ResourceExhausted,
                "not enough resources for a new flow",
            ));
        };

        if let Err(e) = self.build(data, attr, pattern, actions, fid) {
            self.discard(data, fid);
            return Err(e);
        }

        match self.find_equivalent(data, fid) {
            Some(eq)
                if data.pool.get(eq.filter).dst
                    == data.pool.get(fid).dst =>
            {
                debug!(self.log, "flow already exists");
                self.discard(data, fid);
                return Err(FlowError::handle(
                    ErrorKind::Conflict,
                    "matching flow exists",
                ));
            }
            Some(eq) => {
                debug!(self.log,
                    "flow with same pattern exists, updating destination");
                return self.merge_replace(data, fid, eq);
            }
            None => {}
        }

        if let Err(e) = self.install_hw(data, fid) {
            self.discard(data, fid);
            return Err(e);
        }

        let handle = self.link_flow(data, fid);
        info!(self.log, "flow created"; "flow" => %handle);
        Ok(handle)
    }

    /// Fully reverse a prior [`Self::flow_create`].
    pub fn flow_destroy(&self, handle: FlowHandle) -> Result<(), FlowError> {
        let mut guard = self.data.lock();
        let data = &mut *guard;
        self.destroy_one(data, handle)
    }

    /// Destroy every installed flow on the device. A failure to
    /// release one filter's hardware state stops the operation and
    /// leaves the remaining state untouched.
    pub fn flow_flush(&self) -> Result<(), FlowError> {
        let mut guard = self.data.lock();
        let data = &mut *guard;

        for sid in data.sinks.ids() {
            // Collect, then destroy; the sink's list shrinks as we
            // go.
            let handles = data.sinks.get(sid).flows.clone();
            for handle in handles {
                if let Err(e) = self.destroy_one(data, handle) {
                    error!(self.log, "failed to flush flow in hardware";
                        "flow" => %handle, "err" => %e);
                    return Err(e);
                }
            }
        }

        debug!(self.log, "flushed all flows");
        Ok(())
    }

    /// Translate the pattern and resolve the action into `fid`.
    fn build(
        &self,
        data: &mut DeviceData,
        attr: &FlowAttr,
        pattern: &[MatchItem],
        actions: &[FlowAction],
        fid: FilterId,
    ) -> Result<(), FlowError> {
        parse::translate(
            &self.cfg,
            &self.chan,
            attr,
            pattern,
            data.pool.get_mut(fid),
            &self.log,
        )?;
        self.resolve_action(data, attr, actions, fid)
    }

    /// Dispatch on the rule's single meaningful action, resolving the
    /// destination resource and shared L2 identity.
    fn resolve_action(
        &self,
        data: &mut DeviceData,
        attr: &FlowAttr,
        actions: &[FlowAction],
        fid: FilterId,
    ) -> Result<(), FlowError> {
        let mut meaningful =
            actions.iter().enumerate().filter(|(_, a)| !a.is_void());

        let Some((aidx, act)) = meaningful.next() else {
            return Err(FlowError {
                kind: ErrorKind::InvalidArgument,
                category: ErrorCategory::Action,
                index: None,
                msg: "no action specified".to_string(),
            });
        };

        match act {
            FlowAction::Queue { index } => {
                self.act_queue(data, attr, aidx, *index, fid)?;
            }
            FlowAction::Rss(rss) => {
                self.act_rss(data, attr, aidx, rss, fid)?;
            }
            FlowAction::Drop => {
                self.act_default_sink(data, aidx, fid, FilterFlags::DROP)?;
            }
            FlowAction::Count => {
                self.act_default_sink(data, aidx, fid, FilterFlags::METER)?;
            }
            FlowAction::Vf { id } => {
                self.act_vf(data, aidx, *id, fid)?;
            }
            FlowAction::Void => unreachable!("void actions are filtered"),
        }

        // Exactly one meaningful action is accepted.
        if let Some((extra, _)) = meaningful.next() {
            return Err(FlowError::action(
                ErrorKind::InvalidArgument,
                extra,
                "invalid action: only one action allowed",
            ));
        }

        Ok(())
    }

    /// Queue redirect: resolve or create the sink for the rule's
    /// group, binding the queue on first use.
    fn act_queue(
        &self,
        data: &mut DeviceData,
        attr: &FlowAttr,
        aidx: usize,
        index: u16,
        fid: FilterId,
    ) -> Result<(), FlowError> {
        // Queue 0 is not used for flow filters.
        if index == 0 || index >= self.cfg.rx_queues {
            return Err(FlowError::action(
                ErrorKind::InvalidArgument,
                aidx,
                "invalid queue ID",
            ));
        }
        debug!(self.log, "queue action"; "queue" => index);

        let sid_raw =
            if attr.group != 0 { attr.group } else { u32::from(index) };
        if sid_raw >= u32::from(self.cfg.max_sinks) {
            return Err(FlowError::action(
                ErrorKind::InvalidArgument,
                aidx,
                "no matching destination found",
            ));
        }
        let sid = SinkId(sid_raw as u16);

        if data.sinks.get(sid).in_use() {
            if data.sinks.get(sid).start_group != Some(index) {
                error!(self.log, "destination already in use";
                    "sink" => sid.index());
                return Err(FlowError::action(
                    ErrorKind::InvalidArgument,
                    aidx,
                    "destination already in use by another rule",
                ));
            }
        } else {
            if data.sinks.queue_owner(index) != DEFAULT_SINK {
                error!(self.log, "queue invalid or used by another sink";
                    "queue" => index);
                return Err(FlowError::action(
                    ErrorKind::InvalidArgument,
                    aidx,
                    "queue invalid or in use",
                ));
            }

            data.sinks.claim_queue(index, sid);
            data.sinks.get_mut(sid).start_group = Some(index);

            if let Err(e) = self.sink_prep(data, sid) {
                if let Err(e2) = self.release_sink(data, sid) {
                    error!(self.log, "failed to unwind destination resource";
                        "err" => %e2);
                }
                return Err(FlowError::action(
                    ErrorKind::Device(e.code),
                    aidx,
                    &format!("destination resource prepare failed: {e}"),
                ));
            }
        }

        self.bind_and_adopt(data, sid, aidx, fid)
    }

    /// RSS: bind the listed queues on first use and program the
    /// indirection table and hash configuration.
    fn act_rss(
        &self,
        data: &mut DeviceData,
        attr: &FlowAttr,
        aidx: usize,
        rss: &RssConfig,
        fid: FilterId,
    ) -> Result<(), FlowError> {
        if attr.group == 0 {
            error!(self.log, "group id cannot be 0 for an RSS action");
            return Err(FlowError::attr(
                ErrorKind::InvalidArgument,
                "group id cannot be 0",
            ));
        }

        if attr.group >= u32::from(self.cfg.max_sinks) {
            return Err(FlowError::action(
                ErrorKind::InvalidArgument,
                aidx,
                "no matching destination for RSS group",
            ));
        }
        let sid = SinkId(attr.group as u16);

        if data.sinks.get(sid).in_use() {
            // A fresh configuration can be used as-is; an occupied
            // sink must match the request exactly.
            self.match_rss_cfg(data, sid, aidx, rss)?;
        } else {
            for &q in &rss.queues {
                debug!(self.log, "RSS action queue"; "queue" => q);
                if q == 0 || q >= self.cfg.rx_queues {
                    return Err(FlowError::action(
                        ErrorKind::InvalidArgument,
                        aidx,
                        "invalid queue ID for RSS",
                    ));
                }
                if data.sinks.queue_owner(q) != DEFAULT_SINK {
                    error!(self.log, "queue active with another destination";
                        "queue" => q);
                    return Err(FlowError::action(
                        ErrorKind::InvalidArgument,
                        aidx,
                        "invalid queue ID for RSS",
                    ));
                }
            }

            for &q in &rss.queues {
                data.sinks.claim_queue(q, sid);
            }
            data.sinks.get_mut(sid).start_group = rss.queues.first().copied();

            if let Err(e) = self.sink_prep(data, sid) {
                if let Err(e2) = self.release_sink(data, sid) {
                    error!(self.log, "failed to unwind destination resource";
                        "err" => %e2);
                }
                return Err(FlowError::action(
                    ErrorKind::Device(e.code),
                    aidx,
                    &format!("destination resource prepare failed: {e}"),
                ));
            }

            data.sinks.get_mut(sid).build_rss_table();

            // Hash configuration only matters with more than one
            // ring.
            if data.sinks.get(sid).queue_count() > 1 {
                {
                    let sink = data.sinks.get_mut(sid);
                    sink.hash_types = HashTypes::from_api(rss.types);
                    sink.set_hash_key(rss.key.as_deref());
                }
                if let Err(e) = self.chan.rss_cfg(data.sinks.get(sid)) {
                    if let Err(e2) = self.release_sink(data, sid) {
                        error!(self.log,
                            "failed to unwind destination resource";
                            "err" => %e2);
                    }
                    return Err(FlowError::action(
                        ErrorKind::Device(e.code),
                        aidx,
                        &format!("RSS configuration failed: {e}"),
                    ));
                }
            } else {
                debug!(self.log, "no RSS configuration required");
            }
        }

        self.bind_and_adopt(data, sid, aidx, fid)
    }

    /// An occupied sink accepts an RSS rule only when the requested
    /// queue set matches what is already bound.
    fn match_rss_cfg(
        &self,
        data: &DeviceData,
        sid: SinkId,
        aidx: usize,
        rss: &RssConfig,
    ) -> Result<(), FlowError> {
        let sink = data.sinks.get(sid);

        if sink.queue_count() != rss.queues.len() {
            error!(self.log, "destination and RSS configuration mismatch";
                "bound" => sink.queue_count(), "requested" => rss.queues.len());
            return Err(FlowError::action(
                ErrorKind::InvalidArgument,
                aidx,
                "destination and RSS configuration mismatch",
            ));
        }

        for &q in &rss.queues {
            let grp = self.chan.queue_group(q).map_err(|e| {
                FlowError::action(
                    ErrorKind::Device(e.code),
                    aidx,
                    &format!("ring group lookup failed: {e}"),
                )
            })?;
            if !sink.group_ids.contains(&grp) {
                return Err(FlowError::action(
                    ErrorKind::InvalidArgument,
                    aidx,
                    "destination and RSS configuration mismatch",
                ));
            }
        }

        Ok(())
    }

    /// Drop and count rules steer nothing; they resolve to the
    /// default sink and carry the appropriate behavior flag.
    fn act_default_sink(
        &self,
        data: &mut DeviceData,
        aidx: usize,
        fid: FilterId,
        flag: FilterFlags,
    ) -> Result<(), FlowError> {
        let hw = self.sink_hw(data, DEFAULT_SINK);
        data.pool.get_mut(fid).dst = Some(hw);
        self.l2_attach(data, hw, aidx, fid)?;
        data.pool.get_mut(fid).flags |= flag;
        Ok(())
    }

    /// VF redirect. With a tunnel kind on the filter this becomes a
    /// standing tunnel redirect; otherwise the VF's default
    /// destination becomes the rule's mirror target.
    fn act_vf(
        &self,
        data: &mut DeviceData,
        aidx: usize,
        vf: u16,
        fid: FilterId,
    ) -> Result<(), FlowError> {
        if let Some(kind) = data.pool.get(fid).m.tunnel {
            // On a VF device, only a trusted VF may redirect its own
            // tunnel traffic.
            if let FnMode::Vf { trusted } = self.cfg.mode {
                if !trusted || vf != 0 {
                    return Err(FlowError::action(
                        ErrorKind::InvalidArgument,
                        aidx,
                        "incorrect VF",
                    ));
                }
            }

            let f = data.pool.get_mut(fid);
            f.kind = FilterKind::TunnelRedirect;
            f.dst = Some(self.cfg.default_sink_hw);
            debug!(self.log, "tunnel redirect to VF";
                "tunnel" => %kind, "vf" => vf);
            return Ok(());
        }

        if vf >= self.cfg.max_vfs {
            return Err(FlowError::action(
                ErrorKind::InvalidArgument,
                aidx,
                "incorrect VF id",
            ));
        }

        let mirror = match self.chan.vf_default_sink(vf) {
            Ok(Some(hw)) => hw,
            // No driver is bound to the VF.
            Ok(None) => {
                return Err(FlowError::action(
                    ErrorKind::InvalidArgument,
                    aidx,
                    "unable to get default destination for VF",
                ));
            }
            Err(e) => {
                return Err(FlowError::action(
                    ErrorKind::Device(e.code),
                    aidx,
                    &format!("unable to get default destination for VF: {e}"),
                ));
            }
        };

        {
            let f = data.pool.get_mut(fid);
            f.mirror = Some(mirror);
            f.fields |= FieldSet::MIRROR;
        }

        let hw = self.sink_hw(data, DEFAULT_SINK);
        data.pool.get_mut(fid).dst = Some(hw);
        self.l2_attach(data, hw, aidx, fid)
    }

    /// Point the filter at a resolved sink and attach its shared L2
    /// identity, downgrading an L2-only exact-match rule to a pure L2
    /// filter.
    fn bind_and_adopt(
        &self,
        data: &mut DeviceData,
        sid: SinkId,
        aidx: usize,
        fid: FilterId,
    ) -> Result<(), FlowError> {
        let hw = self.sink_hw(data, sid);
        data.pool.get_mut(fid).dst = Some(hw);
        self.l2_attach(data, hw, aidx, fid)?;
        self.adopt_l2(data, fid);
        Ok(())
    }

    /// Resolve the filter's shared L2 identity, creating and
    /// programming a new shared filter when no installed rule carries
    /// the same identity.
    fn l2_attach(
        &self,
        data: &mut DeviceData,
        dst: HwSinkId,
        aidx: usize,
        fid: FilterId,
    ) -> Result<(), FlowError> {
        let id = data
            .l2
            .resolve(&self.chan, dst, data.pool.get(fid), &self.log)
            .map_err(|e| match e {
                L2Error::Exhausted => FlowError::action(
                    ErrorKind::ResourceExhausted,
                    aidx,
                    "filter not available",
                ),
                L2Error::Fw(f) => FlowError::action(
                    ErrorKind::Device(f.code),
                    aidx,
                    &format!("filter not available: {f}"),
                ),
            })?;

        data.pool.get_mut(fid).l2_ref = Some(id);
        Ok(())
    }

    /// A queue/RSS rule matching nothing beyond its L2 identity needs
    /// no specialized filter; the shared L2 filter is the whole
    /// hardware object.
    fn adopt_l2(&self, data: &mut DeviceData, fid: FilterId) {
        let adopted = {
            let f = data.pool.get(fid);
            match f.l2_ref {
                Some(l2) => {
                    let e = data.l2.get(l2);
                    Some((e.addr, e.outermost, e.source_addr))
                }
                None => None,
            }
        };

        let Some((addr, outermost, source_addr)) = adopted else { return };
        let f = data.pool.get_mut(fid);
        if f.kind == FilterKind::ExactMatch && f.l2_only() {
            f.kind = FilterKind::L2;
            f.m.l2_addr = addr;
            f.m.l2_addr_mask = MacAddr::BROADCAST;
            if outermost {
                f.flags |= FilterFlags::OUTERMOST;
            }
            if source_addr {
                f.flags |= FilterFlags::SOURCE_ADDR;
            }
        }
    }

    /// Prepare a sink's hardware state: ring groups, the resource
    /// itself, an RSS context when more than one queue is bound, and
    /// the final configuration commit.
    fn sink_prep(&self, data: &mut DeviceData, sid: SinkId) -> FwResult<()> {
        let queues = data.sinks.get(sid).queues.clone();

        let mut groups = Vec::with_capacity(queues.len());
        for q in &queues {
            groups.push(self.chan.queue_group(*q)?);
        }

        let hw = self.chan.sink_alloc()?;
        {
            let sink = data.sinks.get_mut(sid);
            sink.hw = Some(hw);
            sink.group_ids = groups;
            sink.vlan_strip = self.cfg.vlan_strip;
        }

        // An RSS context is only required with more than one ring.
        if queues.len() > 1 {
            let ctx = self.chan.rss_ctx_alloc(hw)?;
            data.sinks.get_mut(sid).rss_ctx = Some(ctx);
        } else {
            debug!(self.log, "no RSS context required");
        }

        self.chan.sink_cfg(data.sinks.get(sid))?;
        debug!(self.log, "prepared destination resource";
            "sink" => sid.index(), "hw" => ?hw);
        Ok(())
    }

    /// Tear down a sink's hardware state and return its queues to the
    /// default sink. Frees are attempted in order; the first failure
    /// is reported after the rest have run.
    fn release_sink(&self, data: &mut DeviceData, sid: SinkId) -> FwResult<()> {
        let mut first_err = None;

        let sink = data.sinks.get_mut(sid);
        if let Some(ctx) = sink.rss_ctx.take() {
            if let Err(e) = self.chan.rss_ctx_free(ctx) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(hw) = sink.hw.take() {
            if let Err(e) = self.chan.sink_free(hw) {
                first_err.get_or_insert(e);
            }
        }

        data.sinks.release_queues(sid);
        data.sinks.get_mut(sid).clear();
        debug!(self.log, "released destination resource";
            "sink" => sid.index());

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Release every dynamic sink with queues bound but nothing
    /// depending on it. Such sinks only exist transiently within an
    /// operation; in steady state every bound sink carries a flow.
    fn release_idle_sinks(&self, data: &mut DeviceData) {
        for sid in data.sinks.ids() {
            if sid == DEFAULT_SINK {
                continue;
            }
            if data.sinks.get(sid).in_use() && data.sinks.get(sid).idle() {
                if let Err(e) = self.release_sink(data, sid) {
                    error!(self.log, "failed to release destination resource";
                        "sink" => sid.index(), "err" => %e);
                }
            }
        }
    }

    /// Throw away a filter that will not be installed: drop its
    /// shared-L2 reference, release any sink binding only it was
    /// holding, and return the slot to the pool.
    fn discard(&self, data: &mut DeviceData, fid: FilterId) {
        if let Some(l2) = data.pool.get_mut(fid).l2_ref.take() {
            if let Err(e) = data.l2.release(&self.chan, l2) {
                error!(self.log, "failed to release shared L2 filter";
                    "err" => %e);
            }
        }
        self.release_idle_sinks(data);
        data.pool.free(fid);
    }

    /// Scan every installed filter, newest destination first, for one
    /// classifying exactly the same traffic as `fid`, regardless of
    /// destination.
    fn find_equivalent(
        &self,
        data: &DeviceData,
        fid: FilterId,
    ) -> Option<Equiv> {
        let nf = data.pool.get(fid);

        for sid in data.sinks.ids().rev() {
            let sink = data.sinks.get(sid);
            for (pos, &ofid) in sink.filters.iter().enumerate() {
                if ofid == fid {
                    continue;
                }
                if !data.pool.get(ofid).same_match(nf) {
                    continue;
                }

                let handle = data
                    .flows
                    .iter()
                    .find_map(|(h, e)| (e.filter == ofid).then_some(*h));
                match handle {
                    Some(handle) => {
                        return Some(Equiv {
                            sink: sid,
                            pos,
                            filter: ofid,
                            handle,
                        });
                    }
                    None => panic!("bug: installed filter without a flow"),
                }
            }
        }

        None
    }

    /// Commit a filter to hardware. Kind `L2` rules were already
    /// programmed when their shared L2 identity was resolved.
    fn install_hw(
        &self,
        data: &mut DeviceData,
        fid: FilterId,
    ) -> Result<(), FlowError> {
        let kind = data.pool.get(fid).kind;
        match kind {
            FilterKind::TunnelRedirect => {
                let f = data.pool.get(fid);
                let tunnel = match f.m.tunnel {
                    Some(t) => t,
                    None => panic!("bug: tunnel redirect without tunnel kind"),
                };

                let active =
                    self.chan.tunnel_redirect_query().map_err(|e| {
                        FlowError::handle(
                            ErrorKind::Device(e.code),
                            &format!("unable to query tunnel redirect: {e}"),
                        )
                    })?;

                // A stale redirect of the same kind is replaced.
                if active & tunnel.bit() != 0 {
                    self.chan.tunnel_redirect_free(tunnel).map_err(|e| {
                        error!(self.log,
                            "unable to free pre-existing tunnel redirect";
                            "err" => %e);
                        FlowError::handle(
                            ErrorKind::Device(e.code),
                            "unable to free pre-existing tunnel redirect",
                        )
                    })?;
                }

                self.chan.tunnel_redirect(tunnel).map_err(|e| {
                    FlowError::handle(
                        ErrorKind::Device(e.code),
                        &format!("unable to redirect tunnel to VF: {e}"),
                    )
                })?;
                debug!(self.log, "installed tunnel redirect";
                    "tunnel" => %tunnel);
            }

            FilterKind::ExactMatch => {
                let f = data.pool.get(fid);
                let dst = self.filter_dst(f);
                let hw = self.chan.em_filter_alloc(dst, f).map_err(|e| {
                    FlowError::handle(
                        ErrorKind::Device(e.code),
                        &format!("failed to create flow: {e}"),
                    )
                })?;
                data.pool.get_mut(fid).hw = Some(hw);
            }

            FilterKind::Ntuple => {
                let f = data.pool.get(fid);
                let dst = self.filter_dst(f);
                let hw =
                    self.chan.ntuple_filter_alloc(dst, f).map_err(|e| {
                        FlowError::handle(
                            ErrorKind::Device(e.code),
                            &format!("failed to create flow: {e}"),
                        )
                    })?;
                data.pool.get_mut(fid).hw = Some(hw);
            }

            FilterKind::L2 => {}
        }

        Ok(())
    }

    /// Link an installed filter into its sink and hand out a flow
    /// handle.
    fn link_flow(&self, data: &mut DeviceData, fid: FilterId) -> FlowHandle {
        let sid = self.sink_of_filter(data, fid);
        let handle = FlowHandle::from_raw(data.next_flow);
        data.next_flow += 1;

        let sink = data.sinks.get_mut(sid);
        sink.filters.push(fid);
        sink.flows.push(handle);
        data.flows.insert(handle, FlowEntry { filter: fid, sink: sid });
        handle
    }

    /// An equivalent rule exists at a different destination: release
    /// the old filter's hardware state, install the replacement, and
    /// re-home the existing flow. The caller observes success on the
    /// original handle.
    fn merge_replace(
        &self,
        data: &mut DeviceData,
        new_fid: FilterId,
        eq: Equiv,
    ) -> Result<FlowHandle, FlowError> {
        let old_fid = eq.filter;
        let new_dst = self.filter_dst(data.pool.get(new_fid));

        // For a pure-L2 rule the shared entry itself is reprogrammed
        // at the new destination; otherwise the specialized object is
        // freed here and the replacement installed below.
        let res = match data.pool.get(old_fid).kind {
            FilterKind::L2 => {
                let l2 = match data.pool.get(old_fid).l2_ref {
                    Some(id) => id,
                    None => panic!("bug: L2 filter without a shared entry"),
                };
                data.l2.rebind(&self.chan, l2, new_dst)
            }
            FilterKind::ExactMatch => match data.pool.get(old_fid).hw {
                Some(hw) => self.chan.em_filter_free(hw),
                None => Ok(()),
            },
            FilterKind::Ntuple => match data.pool.get(old_fid).hw {
                Some(hw) => self.chan.ntuple_filter_free(hw),
                None => Ok(()),
            },
            FilterKind::TunnelRedirect => Ok(()),
        };
        if let Err(e) = res {
            error!(self.log, "failed to update flow destination";
                "err" => %e);
            self.discard(data, new_fid);
            return Err(FlowError::handle(
                ErrorKind::Device(e.code),
                &format!("failed to update flow destination: {e}"),
            ));
        }

        if let Some(l2) = data.pool.get_mut(old_fid).l2_ref.take() {
            if let Err(e) = data.l2.release(&self.chan, l2) {
                error!(self.log, "failed to release shared L2 filter";
                    "err" => %e);
            }
        }

        // Unlink the old filter and return its slot.
        data.sinks.get_mut(eq.sink).filters.remove(eq.pos);
        data.pool.free(old_fid);

        if let Err(e) = self.install_hw(data, new_fid) {
            // The old rule's hardware state is already gone; the flow
            // no longer exists in any usable form.
            error!(self.log, "failed to install updated flow"; "err" => %e);
            data.sinks.get_mut(eq.sink).flows.retain(|h| *h != eq.handle);
            data.flows.remove(&eq.handle);
            self.discard(data, new_fid);
            return Err(e);
        }

        // The destination necessarily changed, so the filter and flow
        // move to the new sink.
        let new_sid = self.sink_of_filter(data, new_fid);
        data.sinks.get_mut(new_sid).filters.push(new_fid);
        data.sinks.get_mut(eq.sink).flows.retain(|h| *h != eq.handle);
        data.sinks.get_mut(new_sid).flows.push(eq.handle);
        if let Some(entry) = data.flows.get_mut(&eq.handle) {
            entry.filter = new_fid;
            entry.sink = new_sid;
        }

        // The old destination may have lost its last flow.
        self.release_idle_sinks(data);

        info!(self.log, "flow updated in place"; "flow" => %eq.handle);
        Ok(eq.handle)
    }

    /// The shared destroy path used by both `flow_destroy` and
    /// `flow_flush`: exactly one kind-specific hardware release, then
    /// the shared-L2 release, then unlink and teardown of an emptied
    /// sink.
    fn destroy_one(
        &self,
        data: &mut DeviceData,
        handle: FlowHandle,
    ) -> Result<(), FlowError> {
        let Some(entry) = data.flows.get(&handle).copied() else {
            return Err(FlowError::handle(
                ErrorKind::InvalidArgument,
                "invalid flow: failed to destroy flow",
            ));
        };
        let fid = entry.filter;

        if data.pool.get(fid).kind == FilterKind::TunnelRedirect {
            self.tunnel_redirect_destroy(data, fid)?;
        } else {
            // An installed flow should have its filter linked into
            // its sink; absence means the tables are inconsistent.
            // Noted, not fatal.
            if !data.sinks.get(entry.sink).filters.contains(&fid) {
                error!(self.log, "could not find matching flow";
                    "flow" => %handle);
            }

            let f = data.pool.get(fid);
            let res = match f.kind {
                FilterKind::ExactMatch => match f.hw {
                    Some(hw) => self.chan.em_filter_free(hw),
                    None => Ok(()),
                },
                FilterKind::Ntuple => match f.hw {
                    Some(hw) => self.chan.ntuple_filter_free(hw),
                    None => Ok(()),
                },
                FilterKind::L2 | FilterKind::TunnelRedirect => Ok(()),
            };
            if let Err(e) = res {
                return Err(FlowError::handle(
                    ErrorKind::Device(e.code),
                    &format!("failed to destroy flow: {e}"),
                ));
            }

            if let Some(l2) = data.pool.get_mut(fid).l2_ref.take() {
                if let Err(e) = data.l2.release(&self.chan, l2) {
                    // Put the reference back; the flow still holds
                    // it.
                    data.pool.get_mut(fid).l2_ref = Some(l2);
                    return Err(FlowError::handle(
                        ErrorKind::Device(e.code),
                        &format!("failed to destroy flow: {e}"),
                    ));
                }
            }
        }

        // Unlink and release.
        {
            let sink = data.sinks.get_mut(entry.sink);
            sink.filters.retain(|f| *f != fid);
            sink.flows.retain(|h| *h != handle);
        }
        data.flows.remove(&handle);
        data.pool.free(fid);
        debug!(self.log, "flow destroyed"; "flow" => %handle);

        // The last flow leaving a dynamic sink tears it down and
        // returns its queues to the default sink.
        let sink = data.sinks.get(entry.sink);
        if !sink.default && sink.flows.is_empty() && sink.in_use() {
            if let Err(e) = self.release_sink(data, entry.sink) {
                error!(self.log, "failed to release destination resource";
                    "sink" => entry.sink.index(), "err" => %e);
            }
        }

        Ok(())
    }

    /// A standing tunnel redirect is freed only when this function
    /// still owns it.
    fn tunnel_redirect_destroy(
        &self,
        data: &DeviceData,
        fid: FilterId,
    ) -> Result<(), FlowError> {
        let tunnel = match data.pool.get(fid).m.tunnel {
            Some(t) => t,
            None => panic!("bug: tunnel redirect without tunnel kind"),
        };

        let active = self.chan.tunnel_redirect_query().map_err(|e| {
            FlowError::handle(
                ErrorKind::Device(e.code),
                &format!("unable to query tunnel redirect: {e}"),
            )
        })?;
        if active & tunnel.bit() == 0 {
            return Ok(());
        }

        let owner = self.chan.tunnel_redirect_owner(tunnel).map_err(|e| {
            FlowError::handle(
                ErrorKind::Device(e.code),
                &format!("tunnel redirect info failed: {e}"),
            )
        })?;
        info!(self.log, "tunnel redirect owner"; "owner" => owner,
            "fn_id" => self.cfg.fn_id);

        if owner != self.cfg.fn_id {
            // The redirect was installed by another function; this
            // flow must not tear down its state.
            error!(self.log,
                "tunnel redirect owned by another function, skipping free");
            return Ok(());
        }

        self.chan.tunnel_redirect_free(tunnel).map_err(|e| {
            FlowError::handle(
                ErrorKind::Device(e.code),
                &format!("failed to free tunnel redirect: {e}"),
            )
        })
    }

    fn sink_hw(&self, data: &DeviceData, sid: SinkId) -> HwSinkId {
        match data.sinks.get(sid).hw {
            Some(hw) => hw,
            None => panic!("bug: sink {} has no hardware id", sid.index()),
        }
    }

    fn sink_of_filter(&self, data: &DeviceData, fid: FilterId) -> SinkId {
        let dst = self.filter_dst(data.pool.get(fid));
        match data.sinks.by_hw(dst) {
            Some(sid) => sid,
            None => panic!("bug: no sink with hardware id {dst:?}"),
        }
    }

    fn filter_dst(&self, f: &Filter) -> HwSinkId {
        match f.dst {
            Some(dst) => dst,
            None => panic!("bug: filter has no destination"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NullChan;
    use crate::testing::pf_config;
    use crate::testing::test_log;
    use kestrel_api::Ipv4Fields;
    use kestrel_api::Item;

    fn ip_pattern() -> Vec<MatchItem> {
        vec![MatchItem::Ipv4(Item::with_mask(
            Ipv4Fields {
                src: "10.0.0.1".parse().unwrap(),
                dst: "10.0.0.2".parse().unwrap(),
                ..Default::default()
            },
            Ipv4Fields::default(),
        ))]
    }

    #[test]
    fn queue_zero_rejected() {
        let dev = Device::new(pf_config(), NullChan::default(), test_log());
        let err = dev
            .flow_create(
                &FlowAttr::ingress(),
                &ip_pattern(),
                &[FlowAction::Queue { index: 0 }],
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(err.msg, "invalid queue ID");
    }

    #[test]
    fn second_action_rejected() {
        let dev = Device::new(pf_config(), NullChan::default(), test_log());
        let err = dev
            .flow_create(
                &FlowAttr::ingress(),
                &ip_pattern(),
                &[
                    FlowAction::Void,
                    FlowAction::Queue { index: 1 },
                    FlowAction::Drop,
                ],
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(err.index, Some(2));
    }

    #[test]
    fn untrusted_vf_cannot_create() {
        let cfg = DeviceConfig {
            mode: FnMode::Vf { trusted: false },
            ..pf_config()
        };
        let dev = Device::new(cfg, NullChan::default(), test_log());
        let err = dev
            .flow_create(
                &FlowAttr::ingress(),
                &ip_pattern(),
                &[FlowAction::Drop],
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(err.msg.contains("untrusted"));
    }

    #[test]
    fn stopped_device_cannot_create() {
        let cfg = DeviceConfig { started: false, ..pf_config() };
        let dev = Device::new(cfg, NullChan::default(), test_log());
        let err = dev
            .flow_create(
                &FlowAttr::ingress(),
                &ip_pattern(),
                &[FlowAction::Drop],
            )
            .unwrap_err();
        assert_eq!(err.msg, "device must be started");
    }

    #[test]
    fn unknown_handle_rejected() {
        let dev = Device::new(pf_config(), NullChan::default(), test_log());
        let err = dev.flow_destroy(FlowHandle::from_raw(99)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
