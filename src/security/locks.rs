// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant `RwLock` access.
//!
//! The timers, the lock guard and the contract gate keep their state behind
//! `std::sync::RwLock`s held only for short, non-async sections. A panic in
//! one of those sections is logged and the guard recovered, so later timer
//! firings and unlock attempts still see the last written state.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "clinicgate::security",
            event = "LOCK_POISONED_READ",
            "state lock poisoned during read; recovering last written state"
        );
        poisoned.into_inner()
    })
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "clinicgate::security",
            event = "LOCK_POISONED_WRITE",
            "state lock poisoned during write; recovering last written state"
        );
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_then_read() {
        let lock = RwLock::new(0u32);
        *resilient_write(&lock) += 3;
        assert_eq!(*resilient_read(&lock), 3);
    }

    #[test]
    fn test_poisoned_lock_still_usable() {
        let lock = Arc::new(RwLock::new(vec![1u32]));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let mut guard = lock_clone.write().unwrap();
            guard.push(2);
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert!(lock.is_poisoned());
        resilient_write(&lock).push(3);
        assert_eq!(*resilient_read(&lock), vec![1, 2, 3]);
    }
}
