// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A sleeping mutex over the platform's [`RawMutex`].
//!
//! Short critical sections around in-memory maps use `spin`. This lock is for state that stays
//! locked across secure calls, which may take arbitrarily long and may themselves wait on other
//! threads, so waiters block in the platform rather than spinning.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::Ordering;

use crate::platform::{RawMutex, RawMutexProvider};

const UNLOCKED: u32 = 0;
/// Locked, and nobody is sleeping on the word.
const LOCKED: u32 = 1;
/// Locked, and a waiter may be sleeping on the word.
const CONTENDED: u32 = 2;

/// Number of times to re-check a held lock before going to sleep on it.
const SPIN_LIMIT: u32 = 100;

pub(crate) struct Mutex<P: RawMutexProvider, T> {
    raw: P::RawMutex,
    data: UnsafeCell<T>,
}

// SAFETY: The lock hands out at most one guard at a time, so the data is only ever reached from
// the thread holding it.
unsafe impl<P: RawMutexProvider, T: Send> Send for Mutex<P, T> {}
// SAFETY: As above.
unsafe impl<P: RawMutexProvider, T: Send> Sync for Mutex<P, T> {}

impl<P: RawMutexProvider, T> Mutex<P, T> {
    pub(crate) fn new(platform: &P, data: T) -> Self {
        Self {
            raw: platform.new_raw_mutex(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, sleeping while another thread holds it.
    pub(crate) fn lock(&self) -> MutexGuard<'_, P, T> {
        let word = self.raw.underlying_atomic();
        if word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        MutexGuard { mutex: self }
    }

    #[cold]
    fn lock_contended(&self) {
        let word = self.raw.underlying_atomic();

        let mut state = self.spin();
        if state == UNLOCKED {
            match word.compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return,
                Err(current) => state = current,
            }
        }

        loop {
            // Mark the lock contended before sleeping on it. If it was released in the meantime
            // we now own it, marked contended.
            if state != CONTENDED && word.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            let _ = self.raw.block(CONTENDED);
            state = self.spin();
        }
    }

    /// Briefly wait for a held, uncontended lock to be released.
    fn spin(&self) -> u32 {
        let word = self.raw.underlying_atomic();
        let mut spins = SPIN_LIMIT;
        loop {
            let state = word.load(Ordering::Relaxed);
            if state != LOCKED || spins == 0 {
                return state;
            }
            core::hint::spin_loop();
            spins -= 1;
        }
    }

    fn unlock(&self) {
        if self.raw.underlying_atomic().swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.raw.wake_one();
        }
    }
}

/// Exclusive access to the data of a [`Mutex`], released on drop.
#[must_use = "if unused the Mutex will immediately unlock"]
pub(crate) struct MutexGuard<'a, P: RawMutexProvider, T> {
    mutex: &'a Mutex<P, T>,
}

impl<P: RawMutexProvider, T> Deref for MutexGuard<'_, P, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard proves the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<P: RawMutexProvider, T> DerefMut for MutexGuard<'_, P, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard proves the lock is held, and `&mut self` makes this the only access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<P: RawMutexProvider, T> Drop for MutexGuard<'_, P, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
impl<T> Mutex<crate::mock::MockPlatform, T> {
    /// Number of threads asleep waiting for this lock.
    pub(crate) fn raw_sleepers(&self) -> usize {
        self.raw.sleepers()
    }
}
