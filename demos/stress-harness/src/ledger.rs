// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A small two-object example built on [`upgrade_mutex::scoped`]: a value protected
//! by an [`upgrade_mutex::UpgradeMutex`], with copy, swap, and average operations that
//! each need to hold locks on two different `Ledger`s at once without risking
//! deadlock against another thread doing the same in the opposite order.

use upgrade_mutex::scoped::{lock_many, DeferredExclusive, DeferredShared, DeferredUpgrade};
use upgrade_mutex::UpgradeMutex;

/// A vector of readings guarded by an upgrade mutex.
pub struct Ledger {
    data: UpgradeMutex<Vec<f64>>,
}

impl Ledger {
    /// Creates a new ledger holding `data`.
    pub const fn new(data: Vec<f64>) -> Self {
        Self { data: UpgradeMutex::new(data) }
    }

    /// Returns a copy of the current contents.
    pub fn snapshot(&self) -> Vec<f64> {
        self.data.read().clone()
    }

    /// Copy-constructs a new, independent ledger from this one's current contents.
    pub fn duplicate(&self) -> Self {
        Self::new(self.snapshot())
    }

    /// Copy-assigns `other`'s contents into `self`.
    ///
    /// Acquires exclusive access to `self` and shared access to `other` together, so
    /// no interleaved writer of either ledger can observe a half-copied `self`.
    pub fn assign(&self, other: &Self) {
        if std::ptr::eq(self, other) {
            return;
        }

        let this = DeferredExclusive::defer(&self.data);
        let that = DeferredShared::defer(&other.data);
        lock_many(&[&this, &that]);
        // SAFETY: `lock_many` just locked both handles.
        let mut this_guard = unsafe { this.into_guard() };
        // SAFETY: `lock_many` just locked both handles.
        let that_guard = unsafe { that.into_guard() };

        this_guard.clone_from(&*that_guard);
    }

    /// Exchanges contents with `other` without ever holding a lock on only one side
    /// visibly for longer than the other.
    pub fn swap(&self, other: &Self) {
        if std::ptr::eq(self, other) {
            return;
        }

        let this = DeferredExclusive::defer(&self.data);
        let that = DeferredExclusive::defer(&other.data);
        lock_many(&[&this, &that]);
        // SAFETY: `lock_many` just locked both handles.
        let mut this_guard = unsafe { this.into_guard() };
        // SAFETY: `lock_many` just locked both handles.
        let mut that_guard = unsafe { that.into_guard() };

        std::mem::swap(&mut *this_guard, &mut *that_guard);
    }

    /// Averages `self` and `other` element-wise, writing the result into both.
    ///
    /// `self` is locked exclusively throughout; `other` starts out locked in upgrade
    /// mode (compatible with concurrent readers of `other` while the average is
    /// computed) and is only promoted to exclusive once `self` has been downgraded to
    /// shared, so the two ledgers are never both exclusively held past the point the
    /// averaged values are computed.
    ///
    /// # Panics
    ///
    /// Panics if `other` is the same ledger as `self`, or if the two ledgers don't hold
    /// the same number of readings.
    pub fn average(&self, other: &Self) {
        assert!(!std::ptr::eq(self, other), "cannot average a ledger with itself");

        let this = DeferredExclusive::defer(&self.data);
        let that = DeferredUpgrade::defer(&other.data);
        lock_many(&[&this, &that]);
        // SAFETY: `lock_many` just locked both handles.
        let mut this_excl = unsafe { this.into_guard() };
        // SAFETY: `lock_many` just locked both handles.
        let that_upgrade = unsafe { that.into_guard() };

        assert_eq!(this_excl.len(), that_upgrade.len(), "ledgers must be the same length to average");
        for (mine, theirs) in this_excl.iter_mut().zip(that_upgrade.iter()) {
            *mine = (*mine + *theirs) / 2.0;
        }

        // Downgrade self to shared: readers of `self` can now see the averaged value,
        // while this call still holds a read lock that blocks a concurrent writer of
        // `self` until the copy below has landed in `other` too.
        let this_shared = this_excl.downgrade();
        // Promote the upgrade lock on `other` to exclusive -- the ownership-transfer
        // conversion this crate's guards support natively, replacing the upstream
        // source's workaround for the same move.
        let mut that_excl = that_upgrade.upgrade();
        that_excl.clone_from(&*this_shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_independent() {
        let a = Ledger::new(vec![1.0, 2.0]);
        let b = a.duplicate();
        *a.data.write() = vec![9.0];
        assert_eq!(b.snapshot(), vec![1.0, 2.0]);
    }

    #[test]
    fn assign_copies_contents() {
        let a = Ledger::new(vec![0.0]);
        let b = Ledger::new(vec![1.0, 2.0, 3.0]);
        a.assign(&b);
        assert_eq!(a.snapshot(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn swap_exchanges_contents() {
        let a = Ledger::new(vec![1.0]);
        let b = Ledger::new(vec![2.0]);
        a.swap(&b);
        assert_eq!(a.snapshot(), vec![2.0]);
        assert_eq!(b.snapshot(), vec![1.0]);
    }

    #[test]
    fn average_updates_both_ledgers() {
        let a = Ledger::new(vec![1.0, 2.0, 3.0]);
        let b = Ledger::new(vec![3.0, 4.0, 5.0]);
        a.average(&b);
        assert_eq!(a.snapshot(), vec![2.0, 3.0, 4.0]);
        assert_eq!(b.snapshot(), vec![2.0, 3.0, 4.0]);
    }
}
