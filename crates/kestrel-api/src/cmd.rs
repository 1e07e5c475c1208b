// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The structured error reported for a rejected flow request.

use alloc::string::String;
use alloc::string::ToString;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Why a flow request was rejected.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ErrorKind {
    /// Malformed input: bad masks, conflicting fields, out-of-range
    /// ids.
    InvalidArgument,

    /// The request is well formed but the hardware cannot express it.
    Unsupported,

    /// No filter slot or destination resource is available.
    ResourceExhausted,

    /// An identical rule with the same destination already exists.
    Conflict,

    /// The referenced flow does not exist.
    NotFound,

    /// The device command channel reported a failure; the firmware's
    /// numeric cause is carried verbatim.
    Device(i32),
}

impl ErrorKind {
    /// Convert to a stable numeric cause code.
    pub fn cause(self) -> i32 {
        match self {
            Self::InvalidArgument => 22,
            Self::Unsupported => 95,
            Self::ResourceExhausted => 28,
            Self::Conflict => 17,
            Self::NotFound => 2,
            Self::Device(code) => code,
        }
    }
}

/// Which part of the request the error refers to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ErrorCategory {
    Attribute,
    Item,
    Action,
    Handle,
    Unspecified,
}

/// A rejected flow request.
///
/// `index` identifies the offending clause or action by its position
/// in the request, when one is identifiable.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowError {
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub index: Option<usize>,
    pub msg: String,
}

impl FlowError {
    pub fn attr(kind: ErrorKind, msg: &str) -> Self {
        Self {
            kind,
            category: ErrorCategory::Attribute,
            index: None,
            msg: msg.to_string(),
        }
    }

    pub fn item(kind: ErrorKind, index: usize, msg: &str) -> Self {
        Self {
            kind,
            category: ErrorCategory::Item,
            index: Some(index),
            msg: msg.to_string(),
        }
    }

    pub fn action(kind: ErrorKind, index: usize, msg: &str) -> Self {
        Self {
            kind,
            category: ErrorCategory::Action,
            index: Some(index),
            msg: msg.to_string(),
        }
    }

    pub fn handle(kind: ErrorKind, msg: &str) -> Self {
        Self {
            kind,
            category: ErrorCategory::Handle,
            index: None,
            msg: msg.to_string(),
        }
    }

    /// The numeric cause code for this error.
    pub fn cause(&self) -> i32 {
        self.kind.cause()
    }
}

impl Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.index {
            Some(idx) => write!(
                f,
                "{:?} ({:?}[{}]): {}",
                self.kind, self.category, idx, self.msg
            ),
            None => {
                write!(f, "{:?} ({:?}): {}", self.kind, self.category, self.msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_codes() {
        assert_eq!(ErrorKind::InvalidArgument.cause(), 22);
        assert_eq!(ErrorKind::Conflict.cause(), 17);
        assert_eq!(ErrorKind::Device(-7).cause(), -7);
    }

    #[test]
    fn display() {
        let e = FlowError::item(ErrorKind::Unsupported, 2, "no support for range");
        assert_eq!(e.index, Some(2));
        assert!(e.to_string().contains("no support for range"));
    }
}
