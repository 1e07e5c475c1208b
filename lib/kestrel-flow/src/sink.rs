// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Destination resources.
//!
//! A sink groups one or more receive queues with optional RSS and
//! holds the filters and flows steering to it. Sink 0 is the default
//! sink, always present; the rest are created on first use and torn
//! down when their last flow is destroyed. A queue belongs to at most
//! one sink at a time.

use crate::filter::FilterId;
use crate::fw::GroupId;
use crate::fw::HwSinkId;
use crate::fw::RssCtxId;
use bitflags::bitflags;
use kestrel_api::FlowHandle;
use kestrel_api::RSS_HASH_IPV4;
use kestrel_api::RSS_HASH_IPV6;
use kestrel_api::RSS_HASH_TCP_IPV4;
use kestrel_api::RSS_HASH_TCP_IPV6;
use kestrel_api::RSS_HASH_UDP_IPV4;
use kestrel_api::RSS_HASH_UDP_IPV6;
use rand::RngCore;

/// Entries in a sink's RSS indirection table.
pub const RSS_TABLE_SIZE: usize = 128;

/// Bytes in the hardware hash key.
pub const RSS_KEY_SIZE: usize = 40;

bitflags! {
    /// The hardware hash-type word programmed for RSS.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct HashTypes: u32 {
        const IPV4 = 1 << 0;
        const TCP_IPV4 = 1 << 1;
        const UDP_IPV4 = 1 << 2;
        const IPV6 = 1 << 3;
        const TCP_IPV6 = 1 << 4;
        const UDP_IPV6 = 1 << 5;
    }
}

impl HashTypes {
    /// Convert the API's hash-type bits to the hardware word.
    pub fn from_api(types: u64) -> Self {
        let mut out = Self::empty();
        if types & RSS_HASH_IPV4 != 0 {
            out |= Self::IPV4;
        }
        if types & RSS_HASH_TCP_IPV4 != 0 {
            out |= Self::TCP_IPV4;
        }
        if types & RSS_HASH_UDP_IPV4 != 0 {
            out |= Self::UDP_IPV4;
        }
        if types & RSS_HASH_IPV6 != 0 {
            out |= Self::IPV6;
        }
        if types & RSS_HASH_TCP_IPV6 != 0 {
            out |= Self::TCP_IPV6;
        }
        if types & RSS_HASH_UDP_IPV6 != 0 {
            out |= Self::UDP_IPV6;
        }
        out
    }
}

/// A stable index into the sink table.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SinkId(pub(crate) u16);

/// The always-present default sink.
pub const DEFAULT_SINK: SinkId = SinkId(0);

impl SinkId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// A destination resource.
#[derive(Debug)]
pub struct Sink {
    /// The hardware resource, once allocated.
    pub hw: Option<HwSinkId>,

    /// Bound receive queues, in binding order.
    pub queues: Vec<u16>,

    /// The ring group behind each bound queue.
    pub group_ids: Vec<GroupId>,

    /// RSS context; allocated only when more than one queue is bound.
    pub rss_ctx: Option<RssCtxId>,

    /// The RSS indirection table, round-robin over `group_ids`.
    pub rss_table: Vec<GroupId>,

    pub hash_key: [u8; RSS_KEY_SIZE],
    pub hash_types: HashTypes,
    pub vlan_strip: bool,

    /// The queue a single-queue binding started with; a later rule
    /// naming a different queue may not share this sink.
    pub start_group: Option<u16>,

    /// Installed filters, in install order.
    pub filters: Vec<FilterId>,

    /// Flows bound to this sink, in install order.
    pub flows: Vec<FlowHandle>,

    pub default: bool,
}

impl Sink {
    fn new(default: bool, hw: Option<HwSinkId>) -> Self {
        Self {
            hw,
            queues: Vec::new(),
            group_ids: Vec::new(),
            rss_ctx: None,
            rss_table: Vec::new(),
            hash_key: [0; RSS_KEY_SIZE],
            hash_types: HashTypes::empty(),
            vlan_strip: false,
            start_group: None,
            filters: Vec::new(),
            flows: Vec::new(),
            default,
        }
    }

    /// Does this sink have queues bound?
    pub fn in_use(&self) -> bool {
        !self.queues.is_empty()
    }

    /// Does nothing depend on this sink?
    pub fn idle(&self) -> bool {
        self.filters.is_empty() && self.flows.is_empty()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Fill the indirection table by round-robin replication of the
    /// bound groups.
    pub fn build_rss_table(&mut self) {
        self.rss_table.clear();
        if self.group_ids.is_empty() {
            return;
        }

        while self.rss_table.len() < RSS_TABLE_SIZE {
            for grp in &self.group_ids {
                if self.rss_table.len() == RSS_TABLE_SIZE {
                    break;
                }
                self.rss_table.push(*grp);
            }
        }
    }

    /// Install the caller's hash key, truncated to the hardware size,
    /// or generate a random one when none is supplied.
    pub fn set_hash_key(&mut self, key: Option<&[u8]>) {
        match key {
            Some(key) => {
                let n = key.len().min(RSS_KEY_SIZE);
                self.hash_key = [0; RSS_KEY_SIZE];
                self.hash_key[..n].copy_from_slice(&key[..n]);
            }
            None => rand::rng().fill_bytes(&mut self.hash_key),
        }
    }

    /// Reset everything except list membership. Called as part of
    /// releasing the sink's hardware state.
    pub fn clear(&mut self) {
        self.queues.clear();
        self.group_ids.clear();
        self.rss_table.clear();
        self.hash_key = [0; RSS_KEY_SIZE];
        self.hash_types = HashTypes::empty();
        self.start_group = None;
    }
}

/// The table of destination resources plus queue ownership.
#[derive(Debug)]
pub struct SinkTable {
    sinks: Vec<Sink>,

    /// Owner of each receive queue; unbound queues belong to the
    /// default sink.
    queue_owner: Vec<SinkId>,
    queue_started: Vec<bool>,
}

impl SinkTable {
    pub fn new(max_sinks: u16, rx_queues: u16, default_hw: HwSinkId) -> Self {
        let mut sinks: Vec<Sink> =
            (0..max_sinks).map(|_| Sink::new(false, None)).collect();
        if let Some(s) = sinks.first_mut() {
            *s = Sink::new(true, Some(default_hw));
        }

        Self {
            sinks,
            queue_owner: vec![DEFAULT_SINK; usize::from(rx_queues)],
            queue_started: vec![false; usize::from(rx_queues)],
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn get(&self, id: SinkId) -> &Sink {
        &self.sinks[id.index()]
    }

    pub fn get_mut(&mut self, id: SinkId) -> &mut Sink {
        &mut self.sinks[id.index()]
    }

    pub fn ids(&self) -> impl DoubleEndedIterator<Item = SinkId> + use<> {
        (0..self.sinks.len() as u16).map(SinkId)
    }

    /// The sink with the given hardware id, if any.
    pub fn by_hw(&self, hw: HwSinkId) -> Option<SinkId> {
        self.ids().find(|id| self.get(*id).hw == Some(hw))
    }

    pub fn queue_owner(&self, queue: u16) -> SinkId {
        self.queue_owner[usize::from(queue)]
    }

    pub fn queue_started(&self, queue: u16) -> bool {
        self.queue_started[usize::from(queue)]
    }

    /// Bind a queue to a sink and mark it started.
    pub fn claim_queue(&mut self, queue: u16, sink: SinkId) {
        self.queue_owner[usize::from(queue)] = sink;
        self.queue_started[usize::from(queue)] = true;
        self.sinks[sink.index()].queues.push(queue);
    }

    /// Return every queue of a sink to the default sink.
    pub fn release_queues(&mut self, sink: SinkId) {
        let queues = std::mem::take(&mut self.sinks[sink.index()].queues);
        for q in queues {
            self.queue_owner[usize::from(q)] = DEFAULT_SINK;
            self.queue_started[usize::from(q)] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_type_conversion() {
        let ht = HashTypes::from_api(
            RSS_HASH_IPV4 | RSS_HASH_TCP_IPV4 | RSS_HASH_UDP_IPV6,
        );
        assert_eq!(
            ht,
            HashTypes::IPV4 | HashTypes::TCP_IPV4 | HashTypes::UDP_IPV6
        );
        assert_eq!(HashTypes::from_api(0), HashTypes::empty());
    }

    #[test]
    fn rss_table_round_robin() {
        let mut sink = Sink::new(false, None);
        sink.group_ids = vec![GroupId(4), GroupId(5), GroupId(6)];
        sink.build_rss_table();

        assert_eq!(sink.rss_table.len(), RSS_TABLE_SIZE);
        for (i, grp) in sink.rss_table.iter().enumerate() {
            assert_eq!(*grp, sink.group_ids[i % 3]);
        }
    }

    #[test]
    fn hash_key_truncation() {
        let mut sink = Sink::new(false, None);
        let long = vec![0xAB; RSS_KEY_SIZE + 13];
        sink.set_hash_key(Some(&long));
        assert_eq!(sink.hash_key, [0xAB; RSS_KEY_SIZE]);

        let short = [0x01, 0x02, 0x03];
        sink.set_hash_key(Some(&short));
        assert_eq!(&sink.hash_key[..3], &short);
        assert_eq!(&sink.hash_key[3..], &[0; RSS_KEY_SIZE - 3]);
    }

    #[test]
    fn queue_ownership() {
        let mut table = SinkTable::new(4, 8, HwSinkId(1));
        assert_eq!(table.queue_owner(3), DEFAULT_SINK);

        let sid = SinkId(2);
        table.claim_queue(3, sid);
        assert_eq!(table.queue_owner(3), sid);
        assert!(table.queue_started(3));
        assert_eq!(table.get(sid).queues, vec![3]);

        table.release_queues(sid);
        assert_eq!(table.queue_owner(3), DEFAULT_SINK);
        assert!(!table.queue_started(3));
        assert!(!table.get(sid).in_use());
    }
}
