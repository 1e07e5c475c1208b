// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Shared helpers for the unit tests.

use crate::device::DeviceConfig;
use crate::filter::Filter;
use crate::fw::FwChannel;
use crate::fw::FwFilterId;
use crate::fw::FwResult;
use crate::fw::GroupId;
use crate::fw::HwSinkId;
use crate::fw::L2FilterParams;
use crate::fw::RssCtxId;
use crate::sink::Sink;
use kestrel_api::TunnelKind;
use slog::Logger;
use slog::o;
use std::cell::Cell;

/// A channel that accepts everything and hands out sequential ids.
#[derive(Default)]
pub struct NullChan {
    next: Cell<u64>,
}

impl NullChan {
    fn next_id(&self) -> u64 {
        let id = self.next.get() + 1;
        self.next.set(id);
        id
    }
}

impl FwChannel for NullChan {
    fn l2_filter_alloc(
        &self,
        _dst: HwSinkId,
        _params: &L2FilterParams,
    ) -> FwResult<FwFilterId> {
        Ok(FwFilterId(self.next_id()))
    }

    fn l2_filter_free(&self, _id: FwFilterId) -> FwResult<()> {
        Ok(())
    }

    fn em_filter_alloc(
        &self,
        _dst: HwSinkId,
        _filter: &Filter,
    ) -> FwResult<FwFilterId> {
        Ok(FwFilterId(self.next_id()))
    }

    fn em_filter_free(&self, _id: FwFilterId) -> FwResult<()> {
        Ok(())
    }

    fn ntuple_filter_alloc(
        &self,
        _dst: HwSinkId,
        _filter: &Filter,
    ) -> FwResult<FwFilterId> {
        Ok(FwFilterId(self.next_id()))
    }

    fn ntuple_filter_free(&self, _id: FwFilterId) -> FwResult<()> {
        Ok(())
    }

    fn sink_alloc(&self) -> FwResult<HwSinkId> {
        Ok(HwSinkId(100 + self.next_id() as u16))
    }

    fn sink_free(&self, _id: HwSinkId) -> FwResult<()> {
        Ok(())
    }

    fn rss_ctx_alloc(&self, _sink: HwSinkId) -> FwResult<RssCtxId> {
        Ok(RssCtxId(self.next_id() as u16))
    }

    fn rss_ctx_free(&self, _id: RssCtxId) -> FwResult<()> {
        Ok(())
    }

    fn sink_cfg(&self, _sink: &Sink) -> FwResult<()> {
        Ok(())
    }

    fn rss_cfg(&self, _sink: &Sink) -> FwResult<()> {
        Ok(())
    }

    fn queue_group(&self, queue: u16) -> FwResult<GroupId> {
        Ok(GroupId(queue))
    }

    fn vf_default_sink(&self, vf: u16) -> FwResult<Option<HwSinkId>> {
        Ok(Some(HwSinkId(200 + vf)))
    }

    fn tunnel_redirect_query(&self) -> FwResult<u32> {
        Ok(0)
    }

    fn tunnel_redirect(&self, _kind: TunnelKind) -> FwResult<()> {
        Ok(())
    }

    fn tunnel_redirect_free(&self, _kind: TunnelKind) -> FwResult<()> {
        Ok(())
    }

    fn tunnel_redirect_owner(&self, _kind: TunnelKind) -> FwResult<u16> {
        Ok(0)
    }
}

pub fn test_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

pub fn pf_config() -> DeviceConfig {
    DeviceConfig { max_vfs: 8, ..Default::default() }
}
