// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod cmd;
pub mod flow;
pub mod mac;

pub use cmd::*;
pub use flow::*;
pub use mac::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified, this number should increment. We
/// attach no semantic meaning to the number other than as a means for
/// a management plane to verify it was compiled against the same API
/// as the driver.
pub const API_VERSION: u64 = 3;
