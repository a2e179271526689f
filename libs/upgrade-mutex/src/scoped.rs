// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deferred lock handles and multi-object locking.
//!
//! The plain [`crate::UpgradeMutex::read`]/`write`/`upgradable_read` family always
//! locks eagerly and returns an already-held guard. That's the right default, but it
//! can't express "acquire several locks together, in whichever order avoids deadlock"
//! -- for that, a handle is needed that *can* exist before the lock is taken. The
//! types here play that role: construct one with [`DeferredShared::defer`] (or the
//! exclusive/upgrade equivalents), hand a batch of them to [`lock_many`], then convert
//! each into its ordinary guard with `into_guard()`.
//!
//! [`crate::ExclusiveGuard::release`] and the `unsafe fn adopt` constructors round out
//! the set: `release` detaches a guard from its RAII cleanup (the caller now owns the
//! obligation to unlock some other way), and `adopt` constructs an already-locked guard
//! for a lock the caller took through some other path (typically: just finished in
//! [`lock_many`]).

use crate::{ExclusiveGuard, SharedGuard, UpgradeGuard, UpgradeMutex};

impl<'a, T: ?Sized> ExclusiveGuard<'a, T> {
    /// Detaches the guard without unlocking, returning the mutex it was locked on.
    ///
    /// The caller becomes responsible for eventually unlocking the mutex, typically
    /// by reconstructing a guard with [`Self::adopt`].
    pub fn release(self) -> &'a UpgradeMutex<T> {
        let mutex = self.mutex();
        std::mem::forget(self);
        mutex
    }

    /// Constructs a guard for a mutex the caller already holds exclusively.
    ///
    /// # Safety
    ///
    /// The caller must currently hold exclusive access to `mutex`, acquired through
    /// some means other than this guard (typically a prior [`Self::release`] or a
    /// successful [`lock_many`] round).
    pub unsafe fn adopt(mutex: &'a UpgradeMutex<T>) -> Self {
        // SAFETY: forwarded from this function's own safety contract.
        unsafe { Self::new(mutex) }
    }

    fn mutex(&self) -> &'a UpgradeMutex<T> {
        self.mutex
    }
}

impl<'a, T: ?Sized> SharedGuard<'a, T> {
    /// Detaches the guard without unlocking, returning the mutex it was locked on.
    pub fn release(self) -> &'a UpgradeMutex<T> {
        let mutex = self.mutex();
        std::mem::forget(self);
        mutex
    }

    /// Constructs a guard for a mutex the caller already holds with shared access.
    ///
    /// # Safety
    ///
    /// The caller must currently hold shared access to `mutex`, acquired through some
    /// means other than this guard.
    pub unsafe fn adopt(mutex: &'a UpgradeMutex<T>) -> Self {
        // SAFETY: forwarded from this function's own safety contract.
        unsafe { Self::new(mutex) }
    }

    fn mutex(&self) -> &'a UpgradeMutex<T> {
        self.mutex
    }
}

impl<'a, T: ?Sized> UpgradeGuard<'a, T> {
    /// Detaches the guard without unlocking, returning the mutex it was locked on.
    pub fn release(self) -> &'a UpgradeMutex<T> {
        let mutex = self.mutex();
        std::mem::forget(self);
        mutex
    }

    /// Constructs a guard for a mutex the caller already holds with upgrade access.
    ///
    /// # Safety
    ///
    /// The caller must currently hold upgrade access to `mutex`, acquired through some
    /// means other than this guard.
    pub unsafe fn adopt(mutex: &'a UpgradeMutex<T>) -> Self {
        // SAFETY: forwarded from this function's own safety contract.
        unsafe { Self::new(mutex) }
    }

    fn mutex(&self) -> &'a UpgradeMutex<T> {
        self.mutex
    }
}

/// A not-yet-acquired handle onto one access mode of an [`UpgradeMutex`].
///
/// Implementors back [`lock_many`]: each handle knows how to try to lock and unlock
/// itself, without owning whether it is currently locked (the caller tracks that by
/// only calling [`lock_many`] once per batch and converting every handle to a guard
/// immediately on success).
pub trait Deferred {
    /// Attempts to acquire this handle's access mode without blocking.
    fn try_lock(&self) -> bool;

    /// Releases this handle's access mode.
    ///
    /// # Safety
    ///
    /// The caller must currently hold the access mode this handle represents, most
    /// recently acquired through [`Self::try_lock`] on this same handle.
    unsafe fn unlock(&self);
}

/// A deferred handle for exclusive access.
pub struct DeferredExclusive<'a, T: ?Sized> {
    mutex: &'a UpgradeMutex<T>,
}

/// A deferred handle for shared access.
pub struct DeferredShared<'a, T: ?Sized> {
    mutex: &'a UpgradeMutex<T>,
}

/// A deferred handle for upgradable access.
pub struct DeferredUpgrade<'a, T: ?Sized> {
    mutex: &'a UpgradeMutex<T>,
}

macro_rules! impl_deferred {
    ($ty:ident, $guard:ident, $try_lock:ident, $unlock:ident) => {
        impl<'a, T: ?Sized> $ty<'a, T> {
            /// Creates a deferred handle that does not yet hold a lock.
            pub const fn defer(mutex: &'a UpgradeMutex<T>) -> Self {
                Self { mutex }
            }

            /// Converts this handle into its guard type.
            ///
            /// # Safety
            ///
            /// The caller must currently hold this handle's access mode, most
            /// recently acquired through [`Deferred::try_lock`] on this handle
            /// (typically: just succeeded inside [`lock_many`]).
            pub unsafe fn into_guard(self) -> $guard<'a, T> {
                // SAFETY: forwarded from this function's own safety contract.
                unsafe { $guard::adopt(self.mutex) }
            }
        }

        impl<T: ?Sized> Deferred for $ty<'_, T> {
            fn try_lock(&self) -> bool {
                self.mutex.raw.$try_lock()
            }

            unsafe fn unlock(&self) {
                self.mutex.raw.$unlock();
            }
        }
    };
}

impl_deferred!(DeferredExclusive, ExclusiveGuard, try_lock, unlock);
impl_deferred!(DeferredShared, SharedGuard, try_lock_shared, unlock_shared);
impl_deferred!(DeferredUpgrade, UpgradeGuard, try_lock_upgrade, unlock_upgrade);

/// Locks every handle in `handles`, or none of them, avoiding deadlock against another
/// thread calling `lock_many` on an overlapping set in a different order.
///
/// This is the try-and-back-off algorithm behind C++'s `std::lock`: try to lock each
/// handle in turn; on the first failure, unlock everything acquired so far, yield the
/// thread, and restart from the beginning. Since no thread ever blocks while holding a
/// partial set, the set of threads calling `lock_many` cannot deadlock against each
/// other (though a handle can of course still block other, unrelated lockers).
///
/// On return every handle in `handles` is locked; callers are expected to immediately
/// convert each one to its guard with `into_guard()`.
pub fn lock_many(handles: &[&dyn Deferred]) {
    'outer: loop {
        for (locked, handle) in handles.iter().enumerate() {
            if handle.try_lock() {
                continue;
            }
            for prior in &handles[..locked] {
                // SAFETY: `prior` was locked by this same loop iteration, immediately
                // above, and nothing else has touched it since.
                unsafe { prior.unlock() };
            }
            std::thread::yield_now();
            continue 'outer;
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_many_acquires_all_or_backs_off() {
        let a = UpgradeMutex::new(1);
        let b = UpgradeMutex::new(2);

        let da = DeferredExclusive::defer(&a);
        let db = DeferredShared::defer(&b);
        lock_many(&[&da, &db]);

        // SAFETY: lock_many just locked both handles.
        let mut ga = unsafe { da.into_guard() };
        // SAFETY: lock_many just locked both handles.
        let gb = unsafe { db.into_guard() };

        *ga += 10;
        assert_eq!(*gb, 2);
    }

    #[test]
    fn release_and_adopt_round_trip() {
        let m = UpgradeMutex::new(0);
        let guard = m.write();
        let mutex_ref = guard.release();
        // SAFETY: `release` just detached without unlocking; we still hold exclusive
        // access and are reconstructing the guard for the same mutex.
        let guard = unsafe { ExclusiveGuard::adopt(mutex_ref) };
        drop(guard);
        assert!(m.try_write().is_some());
    }
}
