// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Flow-rule compilation and filter resource management for the
//! Kestrel NIC family.
//!
//! The driver accepts an abstract packet-matching rule (an attribute
//! set, an ordered list of protocol match clauses, and an action
//! list) and compiles it into the hardware's filter representation,
//! bound to a receive queue, an RSS group, a drop or count action, or
//! a VF/tunnel redirect. It owns the full lifecycle of that
//! translation: validation, resource allocation, deduplication
//! against installed filters, destination binding, and teardown, all
//! serialized per device.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod device;
pub mod filter;
pub mod fw;
pub mod l2;
pub mod parse;
pub mod sink;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use kestrel_api as api;
