// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Shared L2 filter deduplication.
//!
//! Multiple rules with the same MAC/VLAN/ethertype identity share one
//! hardware L2 filter. The table holds at most one entry per distinct
//! identity; the reference count is the sole owner-tracking mechanism
//! and the hardware object is released exactly when the last
//! dependent goes away.

use crate::filter::Filter;
use crate::filter::L2Valid;
use crate::fw::FwChannel;
use crate::fw::FwError;
use crate::fw::FwFilterId;
use crate::fw::FwResult;
use crate::fw::HwSinkId;
use crate::fw::L2FilterParams;
use core::fmt;
use core::fmt::Display;
use kestrel_api::MacAddr;
use slog::Logger;
use slog::debug;

/// A stable index into the L2 table.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct L2Id(u16);

impl L2Id {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// The fields making up an L2 identity. Two rules whose identities
/// are equal share one hardware L2 filter.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct L2Identity {
    pub ethertype: u16,
    pub ovlan: u16,
    pub ovlan_mask: u16,
    pub ivlan: u16,
    pub ivlan_mask: u16,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
}

impl L2Identity {
    pub fn of(f: &Filter) -> Self {
        Self {
            ethertype: f.m.ethertype,
            ovlan: f.m.ovlan,
            ovlan_mask: f.m.ovlan_mask,
            ivlan: f.m.ivlan,
            ivlan_mask: f.m.ivlan_mask,
            src_mac: f.m.src_mac,
            dst_mac: f.m.dst_mac,
        }
    }
}

/// One shared, reference-counted L2 filter.
#[derive(Clone, Debug)]
pub struct SharedL2 {
    pub ident: L2Identity,

    /// The address side actually programmed: the destination MAC
    /// unless only the source is set.
    pub addr: MacAddr,
    pub addr_mask: MacAddr,
    pub outermost: bool,
    pub source_addr: bool,
    pub below_hint: bool,
    pub refs: u32,
    pub hw: FwFilterId,
}

#[derive(Clone, Debug)]
pub enum L2Error {
    /// No free table entry, or the firmware refused the filter.
    Exhausted,

    /// The channel failed while releasing or reprogramming.
    Fw(FwError),
}

impl Display for L2Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "no L2 filter available"),
            Self::Fw(e) => write!(f, "{}", e),
        }
    }
}

impl From<FwError> for L2Error {
    fn from(e: FwError) -> Self {
        Self::Fw(e)
    }
}

/// The shared-L2 filter table.
#[derive(Debug)]
pub struct L2Table {
    slots: Vec<Option<SharedL2>>,
}

impl L2Table {
    pub fn new(capacity: u16) -> Self {
        Self { slots: (0..capacity).map(|_| None).collect() }
    }

    /// Find the entry with the given identity, if one exists.
    ///
    /// Because the table holds at most one entry per identity, this
    /// lookup is equivalent to scanning every installed filter for a
    /// primary (non-dependent) match.
    pub fn find(&self, ident: &L2Identity) -> Option<L2Id> {
        self.slots.iter().enumerate().find_map(|(i, s)| match s {
            Some(e) if e.ident == *ident => Some(L2Id(i as u16)),
            _ => None,
        })
    }

    /// Find-or-create the shared L2 filter for `nf`, taking a
    /// reference on it. A new filter is programmed through the
    /// channel, steering to `dst`.
    pub fn resolve<C: FwChannel>(
        &mut self,
        chan: &C,
        dst: HwSinkId,
        nf: &Filter,
        log: &Logger,
    ) -> Result<L2Id, L2Error> {
        let ident = L2Identity::of(nf);

        if let Some(id) = self.find(&ident) {
            let entry = self.get_mut(id);
            entry.refs += 1;
            debug!(log, "reusing shared L2 filter";
                "hw" => ?entry.hw, "refs" => entry.refs);
            return Ok(id);
        }

        let slot = match self.slots.iter().position(|s| s.is_none()) {
            Some(i) => i,
            None => return Err(L2Error::Exhausted),
        };

        // This rule needs a MAC filter matching no existing L2
        // identity. Program the destination side unless only the
        // source is set.
        let source_addr = !nf.l2_valid.intersects(L2Valid::ANY_DST)
            && nf.l2_valid.intersects(L2Valid::ANY_SRC);
        let addr = if source_addr { ident.src_mac } else { ident.dst_mac };
        let params = L2FilterParams {
            addr,
            addr_mask: MacAddr::BROADCAST,
            outermost: nf.l2_valid.intersects(L2Valid::OUTER),
            source_addr,
            below_hint: nf.priority > u32::from(u16::MAX),
        };

        let hw = match chan.l2_filter_alloc(dst, &params) {
            Ok(hw) => hw,
            Err(_) => return Err(L2Error::Exhausted),
        };

        debug!(log, "created shared L2 filter";
            "addr" => %params.addr, "hw" => ?hw);
        self.slots[slot] = Some(SharedL2 {
            ident,
            addr: params.addr,
            addr_mask: params.addr_mask,
            outermost: params.outermost,
            source_addr: params.source_addr,
            below_hint: params.below_hint,
            refs: 1,
            hw,
        });

        Ok(L2Id(slot as u16))
    }

    /// Drop one reference. The hardware object is freed and the entry
    /// removed when the last reference goes away.
    pub fn release<C: FwChannel>(
        &mut self,
        chan: &C,
        id: L2Id,
    ) -> FwResult<()> {
        let entry = self.get_mut(id);
        if entry.refs > 1 {
            entry.refs -= 1;
            return Ok(());
        }

        let hw = entry.hw;
        chan.l2_filter_free(hw)?;
        self.slots[id.index()] = None;
        Ok(())
    }

    /// Reprogram the entry's hardware filter to steer to a new
    /// destination. Used when a pure-L2 rule is updated in place.
    pub fn rebind<C: FwChannel>(
        &mut self,
        chan: &C,
        id: L2Id,
        dst: HwSinkId,
    ) -> FwResult<()> {
        let params = {
            let entry = self.get(id);
            L2FilterParams {
                addr: entry.addr,
                addr_mask: entry.addr_mask,
                outermost: entry.outermost,
                source_addr: entry.source_addr,
                below_hint: entry.below_hint,
            }
        };

        chan.l2_filter_free(self.get(id).hw)?;
        let hw = chan.l2_filter_alloc(dst, &params)?;
        self.get_mut(id).hw = hw;
        Ok(())
    }

    pub fn get(&self, id: L2Id) -> &SharedL2 {
        match self.slots[id.index()].as_ref() {
            Some(e) => e,
            None => panic!("bug: L2 slot {} is free", id.index()),
        }
    }

    pub fn get_mut(&mut self, id: L2Id) -> &mut SharedL2 {
        match self.slots[id.index()].as_mut() {
            Some(e) => e,
            None => panic!("bug: L2 slot {} is free", id.index()),
        }
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NullChan;
    use crate::testing::test_log;

    fn dst_filter(mac: [u8; 6]) -> Filter {
        let mut f = Filter::default();
        f.m.dst_mac = MacAddr::from(mac);
        f.l2_valid = L2Valid::DST;
        f
    }

    #[test]
    fn resolve_dedups_identical_identities() {
        let chan = NullChan::default();
        let log = test_log();
        let mut table = L2Table::new(4);

        let f = dst_filter([0x02, 0, 0, 0, 0, 0x01]);
        let a = table.resolve(&chan, HwSinkId(5), &f, &log).unwrap();
        let b = table.resolve(&chan, HwSinkId(5), &f, &log).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(a).refs, 2);

        table.release(&chan, a).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(a).refs, 1);

        table.release(&chan, a).unwrap();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn distinct_identities_get_distinct_entries() {
        let chan = NullChan::default();
        let log = test_log();
        let mut table = L2Table::new(4);

        let a = table
            .resolve(&chan, HwSinkId(5), &dst_filter([2, 0, 0, 0, 0, 1]), &log)
            .unwrap();
        let b = table
            .resolve(&chan, HwSinkId(5), &dst_filter([2, 0, 0, 0, 0, 2]), &log)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn programmed_side_prefers_destination() {
        let chan = NullChan::default();
        let log = test_log();
        let mut table = L2Table::new(4);

        let mut both = dst_filter([2, 0, 0, 0, 0, 1]);
        both.m.src_mac = MacAddr::from([2, 0, 0, 0, 0, 9]);
        both.l2_valid |= L2Valid::SRC;
        let id = table.resolve(&chan, HwSinkId(5), &both, &log).unwrap();
        let entry = table.get(id);
        assert_eq!(entry.addr, both.m.dst_mac);
        assert!(!entry.source_addr);
        assert_eq!(entry.addr_mask, MacAddr::BROADCAST);

        let mut src_only = Filter::default();
        src_only.m.src_mac = MacAddr::from([2, 0, 0, 0, 0, 9]);
        src_only.l2_valid = L2Valid::SRC;
        let id = table.resolve(&chan, HwSinkId(5), &src_only, &log).unwrap();
        let entry = table.get(id);
        assert_eq!(entry.addr, src_only.m.src_mac);
        assert!(entry.source_addr);
    }

    #[test]
    fn table_exhaustion() {
        let chan = NullChan::default();
        let log = test_log();
        let mut table = L2Table::new(1);

        table
            .resolve(&chan, HwSinkId(5), &dst_filter([2, 0, 0, 0, 0, 1]), &log)
            .unwrap();
        let err = table
            .resolve(&chan, HwSinkId(5), &dst_filter([2, 0, 0, 0, 0, 2]), &log)
            .unwrap_err();
        assert!(matches!(err, L2Error::Exhausted));
    }
}
