// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Routines shared among integration tests.

use kestrel_flow::api::TunnelKind;
use kestrel_flow::device::Device;
use kestrel_flow::device::DeviceConfig;
use kestrel_flow::filter::Filter;
use kestrel_flow::fw::FwChannel;
use kestrel_flow::fw::FwError;
use kestrel_flow::fw::FwFilterId;
use kestrel_flow::fw::FwResult;
use kestrel_flow::fw::GroupId;
use kestrel_flow::fw::HwSinkId;
use kestrel_flow::fw::L2FilterParams;
use kestrel_flow::fw::RssCtxId;
use kestrel_flow::sink::HashTypes;
use kestrel_flow::sink::RSS_KEY_SIZE;
use kestrel_flow::sink::Sink;
use slog::Drain;
use slog::Logger;
use slog::o;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

/// The hardware id the default sink carries in these tests.
pub const DEFAULT_SINK_HW: HwSinkId = HwSinkId(1);

/// What the stub firmware last saw in an `rss_cfg` call.
#[derive(Clone, Debug)]
pub struct RssSnapshot {
    pub table: Vec<GroupId>,
    pub key: [u8; RSS_KEY_SIZE],
    pub types: HashTypes,
}

/// Firmware-side state tracked by [`StubChannel`]. Live-object
/// counts let tests assert that every error and teardown path
/// released what it allocated.
#[derive(Debug, Default)]
pub struct StubState {
    next_id: u64,

    /// Live L2 filters: id -> (destination, programmed params).
    pub l2_filters: BTreeMap<u64, (u16, L2FilterParams)>,
    /// Live exact-match filters: id -> destination.
    pub em_filters: BTreeMap<u64, u16>,
    /// Live n-tuple filters: id -> destination.
    pub ntuple_filters: BTreeMap<u64, u16>,
    /// Live destination resources.
    pub sinks: BTreeSet<u16>,
    /// Live RSS contexts.
    pub rss_ctxs: BTreeSet<u16>,

    /// Bitmask of standing tunnel redirects.
    pub redirects: u32,
    /// The function owning any standing redirect.
    pub redirect_owner: u16,

    pub l2_allocs: usize,
    pub redirect_installs: usize,
    pub redirect_frees: usize,
    pub sink_cfgs: usize,
    pub last_rss: Option<RssSnapshot>,

    pub fail_ntuple_alloc: bool,
    pub fail_sink_alloc: bool,
    pub vf_no_driver: bool,
}

impl StubState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Every live object the firmware knows about, default sink
    /// excluded.
    pub fn live_objects(&self) -> usize {
        self.l2_filters.len()
            + self.em_filters.len()
            + self.ntuple_filters.len()
            + self.sinks.len()
            + self.rss_ctxs.len()
    }
}

/// An in-memory firmware that models the device's bookkeeping:
/// allocations hand out fresh ids, frees of unknown ids fail.
#[derive(Clone, Default)]
pub struct StubChannel {
    state: Arc<Mutex<StubState>>,
}

impl StubChannel {
    pub fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }
}

impl FwChannel for StubChannel {
    fn l2_filter_alloc(
        &self,
        dst: HwSinkId,
        params: &L2FilterParams,
    ) -> FwResult<FwFilterId> {
        let mut st = self.state();
        let id = st.next_id();
        st.l2_allocs += 1;
        st.l2_filters.insert(id, (dst.0, params.clone()));
        Ok(FwFilterId(id))
    }

    fn l2_filter_free(&self, id: FwFilterId) -> FwResult<()> {
        match self.state().l2_filters.remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(FwError::new(-2, "unknown L2 filter")),
        }
    }

    fn em_filter_alloc(
        &self,
        dst: HwSinkId,
        _filter: &Filter,
    ) -> FwResult<FwFilterId> {
        let mut st = self.state();
        let id = st.next_id();
        st.em_filters.insert(id, dst.0);
        Ok(FwFilterId(id))
    }

    fn em_filter_free(&self, id: FwFilterId) -> FwResult<()> {
        match self.state().em_filters.remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(FwError::new(-2, "unknown EM filter")),
        }
    }

    fn ntuple_filter_alloc(
        &self,
        dst: HwSinkId,
        _filter: &Filter,
    ) -> FwResult<FwFilterId> {
        let mut st = self.state();
        if st.fail_ntuple_alloc {
            return Err(FwError::new(-5, "n-tuple table full"));
        }
        let id = st.next_id();
        st.ntuple_filters.insert(id, dst.0);
        Ok(FwFilterId(id))
    }

    fn ntuple_filter_free(&self, id: FwFilterId) -> FwResult<()> {
        match self.state().ntuple_filters.remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(FwError::new(-2, "unknown n-tuple filter")),
        }
    }

    fn sink_alloc(&self) -> FwResult<HwSinkId> {
        let mut st = self.state();
        if st.fail_sink_alloc {
            return Err(FwError::new(-6, "no destination resources"));
        }
        let id = 100 + st.next_id() as u16;
        st.sinks.insert(id);
        Ok(HwSinkId(id))
    }

    fn sink_free(&self, id: HwSinkId) -> FwResult<()> {
        if self.state().sinks.remove(&id.0) {
            Ok(())
        } else {
            Err(FwError::new(-2, "unknown destination resource"))
        }
    }

    fn rss_ctx_alloc(&self, _sink: HwSinkId) -> FwResult<RssCtxId> {
        let mut st = self.state();
        let id = st.next_id() as u16;
        st.rss_ctxs.insert(id);
        Ok(RssCtxId(id))
    }

    fn rss_ctx_free(&self, id: RssCtxId) -> FwResult<()> {
        if self.state().rss_ctxs.remove(&id.0) {
            Ok(())
        } else {
            Err(FwError::new(-2, "unknown RSS context"))
        }
    }

    fn sink_cfg(&self, _sink: &Sink) -> FwResult<()> {
        self.state().sink_cfgs += 1;
        Ok(())
    }

    fn rss_cfg(&self, sink: &Sink) -> FwResult<()> {
        self.state().last_rss = Some(RssSnapshot {
            table: sink.rss_table.clone(),
            key: sink.hash_key,
            types: sink.hash_types,
        });
        Ok(())
    }

    fn queue_group(&self, queue: u16) -> FwResult<GroupId> {
        Ok(GroupId(0x10 + queue))
    }

    fn vf_default_sink(&self, vf: u16) -> FwResult<Option<HwSinkId>> {
        if self.state().vf_no_driver {
            return Ok(None);
        }
        Ok(Some(HwSinkId(200 + vf)))
    }

    fn tunnel_redirect_query(&self) -> FwResult<u32> {
        Ok(self.state().redirects)
    }

    fn tunnel_redirect(&self, kind: TunnelKind) -> FwResult<()> {
        let mut st = self.state();
        st.redirects |= kind.bit();
        st.redirect_installs += 1;
        Ok(())
    }

    fn tunnel_redirect_free(&self, kind: TunnelKind) -> FwResult<()> {
        let mut st = self.state();
        if st.redirects & kind.bit() == 0 {
            return Err(FwError::new(-2, "no such tunnel redirect"));
        }
        st.redirects &= !kind.bit();
        st.redirect_frees += 1;
        Ok(())
    }

    fn tunnel_redirect_owner(&self, _kind: TunnelKind) -> FwResult<u16> {
        Ok(self.state().redirect_owner)
    }
}

pub fn test_logger() -> Logger {
    if std::env::var_os("KESTREL_TEST_LOG").is_some() {
        let dec = slog_term::PlainSyncDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(dec).build().fuse();
        Logger::root(drain, o!())
    } else {
        Logger::root(slog::Discard, o!())
    }
}

pub fn test_config() -> DeviceConfig {
    DeviceConfig {
        rx_queues: 8,
        max_sinks: 8,
        filter_capacity: 32,
        l2_capacity: 8,
        max_vfs: 4,
        default_sink_hw: DEFAULT_SINK_HW,
        ..Default::default()
    }
}

/// A PF device over a fresh stub firmware. The returned channel is a
/// second handle onto the same firmware state.
pub fn test_device() -> (Device<StubChannel>, StubChannel) {
    let chan = StubChannel::default();
    let dev = Device::new(test_config(), chan.clone(), test_logger());
    (dev, chan)
}

pub fn device_with(cfg: DeviceConfig) -> (Device<StubChannel>, StubChannel) {
    let chan = StubChannel::default();
    let dev = Device::new(cfg, chan.clone(), test_logger());
    (dev, chan)
}
