// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The per-device lock.
//!
//! All flow state on a device is mutated in multi-step sequences that
//! must be atomic with respect to each other; a single mutex held for
//! the full duration of each public operation provides that. The
//! wrapper hides the poison surface of the underlying mutex: a
//! poisoned lock means a flow operation panicked mid-update, and
//! there is no sane recovery, so we propagate the panic.

use core::ops::Deref;
use core::ops::DerefMut;
use std::sync::Mutex;

pub struct DevMutex<T> {
    inner: Mutex<T>,
}

pub struct DevMutexGuard<'a, T: 'a> {
    guard: std::sync::MutexGuard<'a, T>,
}

impl<T> Deref for DevMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for DevMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> DevMutex<T> {
    pub fn new(val: T) -> Self {
        DevMutex { inner: Mutex::new(val) }
    }

    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.inner.into_inner().unwrap()
    }

    /// Acquire the lock, blocking until it is available. The lock is
    /// released when the guard is dropped.
    pub fn lock(&self) -> DevMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap();
        DevMutexGuard { guard }
    }
}
