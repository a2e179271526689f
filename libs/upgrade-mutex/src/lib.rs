// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A reader/writer mutex with a third, upgradable access mode.
//!
//! In addition to the usual exclusive (`write`) and shared (`read`) modes, this mutex
//! has an *upgrade* mode: at most one upgrade holder may coexist with any number of
//! shared readers, and only the upgrade holder can ask to become the exclusive holder
//! in place, without releasing access to the protected data in between.
//!
//! ```
//! use upgrade_mutex::UpgradeMutex;
//!
//! let lock = UpgradeMutex::new(0u32);
//! {
//!     let mut guard = lock.write();
//!     *guard += 1;
//! }
//! assert_eq!(*lock.read(), 1);
//! ```
//!
//! The state machine itself lives in [`raw::RawUpgradeMutex`], which carries no data
//! and can be driven directly when the protected resource isn't naturally an
//! `UnsafeCell<T>` (see [`scoped`]).

pub mod raw;
pub mod scoped;

use std::cell::UnsafeCell;
use std::fmt;
use std::time::{Duration, Instant};

use raw::RawUpgradeMutex;

/// A mutual-exclusion primitive with shared, upgradable, and exclusive access modes.
pub struct UpgradeMutex<T: ?Sized> {
    raw: RawUpgradeMutex,
    data: UnsafeCell<T>,
}

// SAFETY: `UpgradeMutex` only ever hands out `&T`/`&mut T` through guards that enforce
// the raw mutex's access rules, so it is `Send`/`Sync` under exactly the same bounds as
// `std::sync::RwLock<T>`.
unsafe impl<T: ?Sized + Send> Send for UpgradeMutex<T> {}
// SAFETY: see above.
unsafe impl<T: ?Sized + Send + Sync> Sync for UpgradeMutex<T> {}

impl<T> UpgradeMutex<T> {
    /// Creates a new mutex in an unlocked state, ready for use.
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawUpgradeMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> UpgradeMutex<T> {
    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the mutex mutably, no actual locking takes place -- the
    /// compiler already guarantees that no other threads are accessing the data.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: the `&mut self` means no other reference to `data` can exist.
        unsafe { &mut *self.data.get() }
    }

    /// Locks this mutex with shared read access, blocking the current thread until it
    /// can be acquired.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn read(&self) -> SharedGuard<'_, T> {
        self.raw.lock_shared();
        // SAFETY: we just acquired shared access.
        unsafe { SharedGuard::new(self) }
    }

    /// Attempts to acquire shared read access without blocking.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn try_read(&self) -> Option<SharedGuard<'_, T>> {
        if self.raw.try_lock_shared() {
            // SAFETY: we just acquired shared access.
            Some(unsafe { SharedGuard::new(self) })
        } else {
            None
        }
    }

    /// Attempts to acquire shared read access, blocking at most for `timeout`.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn try_read_for(&self, timeout: Duration) -> Option<SharedGuard<'_, T>> {
        if self.raw.try_lock_shared_for(timeout) {
            // SAFETY: we just acquired shared access.
            Some(unsafe { SharedGuard::new(self) })
        } else {
            None
        }
    }

    /// Attempts to acquire shared read access, blocking at most until `deadline`.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn try_read_until(&self, deadline: Instant) -> Option<SharedGuard<'_, T>> {
        if self.raw.try_lock_shared_until(deadline) {
            // SAFETY: we just acquired shared access.
            Some(unsafe { SharedGuard::new(self) })
        } else {
            None
        }
    }

    /// Locks this mutex with exclusive write access, blocking the current thread
    /// until it can be acquired.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn write(&self) -> ExclusiveGuard<'_, T> {
        self.raw.lock();
        // SAFETY: we just acquired exclusive access.
        unsafe { ExclusiveGuard::new(self) }
    }

    /// Attempts to acquire exclusive write access without blocking.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn try_write(&self) -> Option<ExclusiveGuard<'_, T>> {
        if self.raw.try_lock() {
            // SAFETY: we just acquired exclusive access.
            Some(unsafe { ExclusiveGuard::new(self) })
        } else {
            None
        }
    }

    /// Attempts to acquire exclusive write access, blocking at most for `timeout`.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn try_write_for(&self, timeout: Duration) -> Option<ExclusiveGuard<'_, T>> {
        if self.raw.try_lock_for(timeout) {
            // SAFETY: we just acquired exclusive access.
            Some(unsafe { ExclusiveGuard::new(self) })
        } else {
            None
        }
    }

    /// Attempts to acquire exclusive write access, blocking at most until `deadline`.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn try_write_until(&self, deadline: Instant) -> Option<ExclusiveGuard<'_, T>> {
        if self.raw.try_lock_until(deadline) {
            // SAFETY: we just acquired exclusive access.
            Some(unsafe { ExclusiveGuard::new(self) })
        } else {
            None
        }
    }

    /// Locks this mutex with upgradable read access, blocking the current thread
    /// until it can be acquired.
    ///
    /// Only one thread may hold upgradable access at a time, but it coexists with any
    /// number of plain shared readers. The returned guard can later be converted to
    /// exclusive access in place, without an intervening window where another writer
    /// could sneak in.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn upgradable_read(&self) -> UpgradeGuard<'_, T> {
        self.raw.lock_upgrade();
        // SAFETY: we just acquired upgrade access.
        unsafe { UpgradeGuard::new(self) }
    }

    /// Attempts to acquire upgradable read access without blocking.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn try_upgradable_read(&self) -> Option<UpgradeGuard<'_, T>> {
        if self.raw.try_lock_upgrade() {
            // SAFETY: we just acquired upgrade access.
            Some(unsafe { UpgradeGuard::new(self) })
        } else {
            None
        }
    }

    /// Attempts to acquire upgradable read access, blocking at most for `timeout`.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn try_upgradable_read_for(&self, timeout: Duration) -> Option<UpgradeGuard<'_, T>> {
        if self.raw.try_lock_upgrade_for(timeout) {
            // SAFETY: we just acquired upgrade access.
            Some(unsafe { UpgradeGuard::new(self) })
        } else {
            None
        }
    }

    /// Attempts to acquire upgradable read access, blocking at most until `deadline`.
    #[must_use = "if unused the RwLock will immediately unlock"]
    pub fn try_upgradable_read_until(&self, deadline: Instant) -> Option<UpgradeGuard<'_, T>> {
        if self.raw.try_lock_upgrade_until(deadline) {
            // SAFETY: we just acquired upgrade access.
            Some(unsafe { UpgradeGuard::new(self) })
        } else {
            None
        }
    }
}

#[allow(clippy::missing_fields_in_debug, reason = "internal lock state is deliberately not surfaced, matching std::sync::Mutex's own Debug impl")]
impl<T: ?Sized + fmt::Debug> fmt::Debug for UpgradeMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("UpgradeMutex");
        match self.try_read() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

impl<T: Default> Default for UpgradeMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for UpgradeMutex<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// RAII guard granting shared read access to an [`UpgradeMutex<T>`].
///
/// Dropping the guard releases the shared lock.
#[must_use = "if unused the RwLock will immediately unlock"]
#[clippy::has_significant_drop]
pub struct SharedGuard<'a, T: ?Sized> {
    mutex: &'a UpgradeMutex<T>,
}

/// RAII guard granting upgradable read access to an [`UpgradeMutex<T>`].
///
/// Dropping the guard releases the upgrade lock.
#[must_use = "if unused the RwLock will immediately unlock"]
#[clippy::has_significant_drop]
pub struct UpgradeGuard<'a, T: ?Sized> {
    mutex: &'a UpgradeMutex<T>,
}

/// RAII guard granting exclusive write access to an [`UpgradeMutex<T>`].
///
/// Dropping the guard releases the exclusive lock.
#[must_use = "if unused the RwLock will immediately unlock"]
#[clippy::has_significant_drop]
pub struct ExclusiveGuard<'a, T: ?Sized> {
    mutex: &'a UpgradeMutex<T>,
}

impl<'a, T: ?Sized> SharedGuard<'a, T> {
    /// # Safety
    ///
    /// The caller must already hold shared access to `mutex`.
    unsafe fn new(mutex: &'a UpgradeMutex<T>) -> Self {
        Self { mutex }
    }

    /// Attempts to convert shared access directly into exclusive access in place.
    ///
    /// On success the caller's reader slot is atomically replaced with exclusive
    /// ownership. This only succeeds if the caller is the sole reader and no other
    /// thread holds or is waiting for upgrade/exclusive access; on failure the
    /// original guard is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the original guard unchanged if another reader is still present.
    pub fn try_upgrade(self) -> Result<ExclusiveGuard<'a, T>, Self> {
        if self.mutex.raw.try_unlock_shared_and_lock() {
            let mutex = self.mutex;
            std::mem::forget(self);
            // SAFETY: the raw transition above just granted exclusive access.
            Ok(unsafe { ExclusiveGuard::new(mutex) })
        } else {
            Err(self)
        }
    }

    /// Timed form of [`Self::try_upgrade`].
    ///
    /// # Errors
    ///
    /// Returns the original guard unchanged if another reader is still present.
    pub fn try_upgrade_for(self, timeout: Duration) -> Result<ExclusiveGuard<'a, T>, Self> {
        self.try_upgrade_until(Instant::now() + timeout)
    }

    /// Timed form of [`Self::try_upgrade`].
    ///
    /// # Errors
    ///
    /// Returns the original guard unchanged if another reader is still present.
    pub fn try_upgrade_until(self, deadline: Instant) -> Result<ExclusiveGuard<'a, T>, Self> {
        if self.mutex.raw.try_unlock_shared_and_lock_until(deadline) {
            let mutex = self.mutex;
            std::mem::forget(self);
            // SAFETY: the raw transition above just granted exclusive access.
            Ok(unsafe { ExclusiveGuard::new(mutex) })
        } else {
            Err(self)
        }
    }

    /// Attempts to convert shared access into upgradable access in place.
    ///
    /// Fails if another thread already holds upgrade or exclusive access.
    ///
    /// # Errors
    ///
    /// Returns the original guard unchanged on failure.
    pub fn try_upgrade_to_upgradable(self) -> Result<UpgradeGuard<'a, T>, Self> {
        if self.mutex.raw.try_unlock_shared_and_lock_upgrade() {
            let mutex = self.mutex;
            std::mem::forget(self);
            // SAFETY: the raw transition above just granted upgrade access.
            Ok(unsafe { UpgradeGuard::new(mutex) })
        } else {
            Err(self)
        }
    }

    /// Timed form of [`Self::try_upgrade_to_upgradable`].
    ///
    /// # Errors
    ///
    /// Returns the original guard unchanged on failure.
    pub fn try_upgrade_to_upgradable_for(self, timeout: Duration) -> Result<UpgradeGuard<'a, T>, Self> {
        self.try_upgrade_to_upgradable_until(Instant::now() + timeout)
    }

    /// Timed form of [`Self::try_upgrade_to_upgradable`].
    ///
    /// # Errors
    ///
    /// Returns the original guard unchanged on failure.
    pub fn try_upgrade_to_upgradable_until(self, deadline: Instant) -> Result<UpgradeGuard<'a, T>, Self> {
        if self.mutex.raw.try_unlock_shared_and_lock_upgrade_until(deadline) {
            let mutex = self.mutex;
            std::mem::forget(self);
            // SAFETY: the raw transition above just granted upgrade access.
            Ok(unsafe { UpgradeGuard::new(mutex) })
        } else {
            Err(self)
        }
    }
}

impl<'a, T: ?Sized> UpgradeGuard<'a, T> {
    /// # Safety
    ///
    /// The caller must already hold upgrade access to `mutex`.
    unsafe fn new(mutex: &'a UpgradeMutex<T>) -> Self {
        Self { mutex }
    }

    /// Downgrades upgradable access to shared access. Never fails.
    pub fn downgrade(self) -> SharedGuard<'a, T> {
        self.mutex.raw.unlock_upgrade_and_lock_shared();
        let mutex = self.mutex;
        std::mem::forget(self);
        // SAFETY: the raw transition above just granted shared access.
        unsafe { SharedGuard::new(mutex) }
    }

    /// Converts upgradable access into exclusive access, blocking until every other
    /// shared reader has released. Never fails -- the caller is guaranteed to be the
    /// only possible upgrader or writer, so this cannot deadlock against another
    /// upgrader or writer, only wait on readers to drain.
    pub fn upgrade(self) -> ExclusiveGuard<'a, T> {
        self.mutex.raw.unlock_upgrade_and_lock();
        let mutex = self.mutex;
        std::mem::forget(self);
        // SAFETY: the raw transition above just granted exclusive access.
        unsafe { ExclusiveGuard::new(mutex) }
    }

    /// Attempts to convert upgradable access into exclusive access without blocking.
    ///
    /// Succeeds only if the caller is the sole reader.
    ///
    /// # Errors
    ///
    /// Returns the original guard unchanged if other readers are still present.
    pub fn try_upgrade(self) -> Result<ExclusiveGuard<'a, T>, Self> {
        if self.mutex.raw.try_unlock_upgrade_and_lock() {
            let mutex = self.mutex;
            std::mem::forget(self);
            // SAFETY: the raw transition above just granted exclusive access.
            Ok(unsafe { ExclusiveGuard::new(mutex) })
        } else {
            Err(self)
        }
    }

    /// Timed form of [`Self::try_upgrade`].
    ///
    /// # Errors
    ///
    /// Returns the original guard unchanged if other readers are still present when
    /// the deadline elapses.
    pub fn try_upgrade_for(self, timeout: Duration) -> Result<ExclusiveGuard<'a, T>, Self> {
        self.try_upgrade_until(Instant::now() + timeout)
    }

    /// Timed form of [`Self::try_upgrade`].
    ///
    /// # Errors
    ///
    /// Returns the original guard unchanged if other readers are still present when
    /// the deadline elapses.
    pub fn try_upgrade_until(self, deadline: Instant) -> Result<ExclusiveGuard<'a, T>, Self> {
        if self.mutex.raw.try_unlock_upgrade_and_lock_until(deadline) {
            let mutex = self.mutex;
            std::mem::forget(self);
            // SAFETY: the raw transition above just granted exclusive access.
            Ok(unsafe { ExclusiveGuard::new(mutex) })
        } else {
            Err(self)
        }
    }
}

impl<'a, T: ?Sized> ExclusiveGuard<'a, T> {
    /// # Safety
    ///
    /// The caller must already hold exclusive access to `mutex`.
    unsafe fn new(mutex: &'a UpgradeMutex<T>) -> Self {
        Self { mutex }
    }

    /// Downgrades exclusive access to shared access. Never fails.
    pub fn downgrade(self) -> SharedGuard<'a, T> {
        self.mutex.raw.unlock_and_lock_shared();
        let mutex = self.mutex;
        std::mem::forget(self);
        // SAFETY: the raw transition above just granted shared access.
        unsafe { SharedGuard::new(mutex) }
    }

    /// Downgrades exclusive access to upgradable access. Never fails.
    pub fn downgrade_to_upgradable(self) -> UpgradeGuard<'a, T> {
        self.mutex.raw.unlock_and_lock_upgrade();
        let mutex = self.mutex;
        std::mem::forget(self);
        // SAFETY: the raw transition above just granted upgrade access.
        unsafe { UpgradeGuard::new(mutex) }
    }
}

impl<'a, T: ?Sized> From<ExclusiveGuard<'a, T>> for SharedGuard<'a, T> {
    /// Performs the `unlock_and_lock_shared` transition: an exclusive holder can
    /// always move directly to shared access without releasing to a third party.
    fn from(guard: ExclusiveGuard<'a, T>) -> Self {
        guard.downgrade()
    }
}

impl<'a, T: ?Sized> From<ExclusiveGuard<'a, T>> for UpgradeGuard<'a, T> {
    /// Performs the `unlock_and_lock_upgrade` transition.
    fn from(guard: ExclusiveGuard<'a, T>) -> Self {
        guard.downgrade_to_upgradable()
    }
}

impl<'a, T: ?Sized> From<UpgradeGuard<'a, T>> for SharedGuard<'a, T> {
    /// Performs the `unlock_upgrade_and_lock_shared` transition.
    fn from(guard: UpgradeGuard<'a, T>) -> Self {
        guard.downgrade()
    }
}

impl<'a, T: ?Sized> From<UpgradeGuard<'a, T>> for ExclusiveGuard<'a, T> {
    /// Performs the blocking `unlock_upgrade_and_lock` transition.
    fn from(guard: UpgradeGuard<'a, T>) -> Self {
        guard.upgrade()
    }
}

macro_rules! impl_guard_common {
    ($ty:ident, $unlock:ident) => {
        #[allow(clippy::missing_fields_in_debug, reason = "shows the protected value rather than the back-reference to the mutex")]
        impl<T: ?Sized + fmt::Debug> fmt::Debug for $ty<'_, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty)).field("data", &&**self).finish()
            }
        }

        impl<T: ?Sized> std::ops::Deref for $ty<'_, T> {
            type Target = T;

            fn deref(&self) -> &T {
                // SAFETY: holding this guard guarantees at least read access.
                unsafe { &*self.mutex.data.get() }
            }
        }

        impl<T: ?Sized> Drop for $ty<'_, T> {
            fn drop(&mut self) {
                self.mutex.raw.$unlock();
            }
        }
    };
}

impl_guard_common!(SharedGuard, unlock_shared);
impl_guard_common!(UpgradeGuard, unlock_upgrade);
impl_guard_common!(ExclusiveGuard, unlock);

impl<T: ?Sized> std::ops::DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding an `ExclusiveGuard` guarantees unique access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_read_write() {
        let lock = UpgradeMutex::new(5);
        assert_eq!(*lock.read(), 5);
        *lock.write() += 1;
        assert_eq!(*lock.read(), 6);
    }

    #[test]
    fn concurrent_readers() {
        let lock = UpgradeMutex::new(0);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1, 0);
        assert_eq!(*r2, 0);
        drop((r1, r2));
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn upgradable_coexists_with_readers() {
        let lock = UpgradeMutex::new(0);
        let u = lock.upgradable_read();
        let r = lock.read();
        assert!(lock.try_upgradable_read().is_none());
        drop(r);
        let mut w = u.upgrade();
        *w = 42;
        drop(w);
        assert_eq!(*lock.read(), 42);
    }

    #[test]
    fn shared_try_upgrade_requires_sole_reader() {
        let lock = UpgradeMutex::new(0);
        let r1 = lock.read();
        let r2 = lock.read();
        let r1 = match r1.try_upgrade() {
            Ok(_) => panic!("should not upgrade with another reader present"),
            Err(r1) => r1,
        };
        drop(r2);
        let mut w = r1.try_upgrade().unwrap_or_else(|_| panic!("sole reader should upgrade"));
        *w = 7;
        drop(w);
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn downgrade_round_trip() {
        let lock = UpgradeMutex::new(0);
        let w = lock.write();
        let u = w.downgrade_to_upgradable();
        let r = u.downgrade();
        drop(r);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn debug_impl_does_not_deadlock_when_locked() {
        let lock = UpgradeMutex::new(1);
        let _guard = lock.write();
        assert!(format!("{lock:?}").contains("locked"));
    }
}
