// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The manager, the state store and the snapshot writer all keep their
//! bookkeeping behind `std::sync::RwLock`. A panic inside one event
//! handler must not take every other download down with it, so lock
//! acquisition recovers the guard from a poisoned lock and logs the
//! event instead of propagating the panic.
//!
//! None of these guards may be held across an `.await`.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modeldepot::sync",
                event = "LOCK_POISONED_READ",
                "RwLock poisoned during read; a handler panicked while holding it. Recovering."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modeldepot::sync",
                event = "LOCK_POISONED_WRITE",
                "RwLock poisoned during write; a handler panicked while holding it. Recovering."
            );
            poisoned.into_inner()
        }
    }
}
