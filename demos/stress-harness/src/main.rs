// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stress-harness binary exercising every access mode and transition of
//! [`upgrade_mutex::UpgradeMutex`] under concurrent load.
//!
//! Each worker below is the direct analogue of a free function from the original
//! upgrade-mutex stress test: threads repeatedly acquire the lock in some mode,
//! assert on a shared `state` flag that the lock is expected to make impossible to
//! observe mid-transition, and count successful iterations.

use std::io::Write as _;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use upgrade_mutex::UpgradeMutex;

mod ledger;

use ledger::Ledger;

/// The two observable values of the shared `state` flag, mirroring the original
/// `enum {reading, writing}`. Unlike the original (a bare global `int`), this value
/// lives *inside* the mutex it is guarded by, so the compiler -- not a stress test --
/// enforces that it is never touched without holding the appropriate access mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Reading,
    Writing,
}

fn stdout_mutex() -> &'static Mutex<()> {
    static MUTEX: Mutex<()> = Mutex::new(());
    &MUTEX
}

/// Serializes a `"<name> = <count>"` line to stdout through a single mutex, mirroring
/// `cout_mut()`/`print()` in the original harness.
fn print_count(name: &str, count: u64) {
    let _guard = stdout_mutex().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut out = std::io::stdout().lock();
    // A short write to a locked stdout handle does not fail in practice; if it ever
    // did there is nothing more useful this binary could do than ignore it.
    let _ = writeln!(out, "{name} = {count}");
}

struct Config {
    duration: Duration,
    timeout: Duration,
}

impl Config {
    fn from_args() -> Result<Self, String> {
        let mut duration_ms: u64 = 3000;
        let mut timeout_us: u64 = 5;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--duration-ms" => {
                    let value = args.next().ok_or("--duration-ms requires a value")?;
                    duration_ms = value.parse().map_err(|_| format!("invalid --duration-ms value: {value}"))?;
                }
                "--timeout-us" => {
                    let value = args.next().ok_or("--timeout-us requires a value")?;
                    timeout_us = value.parse().map_err(|_| format!("invalid --timeout-us value: {value}"))?;
                }
                other => return Err(format!("unrecognized argument: {other}")),
            }
        }

        Ok(Self {
            duration: Duration::from_millis(duration_ms),
            timeout: Duration::from_micros(timeout_us),
        })
    }
}

fn reader(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        let guard = mutex.read();
        assert_eq!(*guard, State::Reading);
        count += 1;
    }
    count
}

fn writer(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        let mut guard = mutex.write();
        *guard = State::Writing;
        assert_eq!(*guard, State::Writing);
        *guard = State::Reading;
        count += 1;
    }
    count
}

fn try_reader(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        if let Some(guard) = mutex.try_read() {
            assert_eq!(*guard, State::Reading);
            count += 1;
        }
    }
    count
}

fn try_writer(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        if let Some(mut guard) = mutex.try_write() {
            *guard = State::Writing;
            assert_eq!(*guard, State::Writing);
            *guard = State::Reading;
            count += 1;
        }
    }
    count
}

fn try_for_reader(mutex: &UpgradeMutex<State>, until: Instant, timeout: Duration) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        if let Some(guard) = mutex.try_read_for(timeout) {
            assert_eq!(*guard, State::Reading);
            count += 1;
        }
    }
    count
}

fn try_for_writer(mutex: &UpgradeMutex<State>, until: Instant, timeout: Duration) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        if let Some(mut guard) = mutex.try_write_for(timeout) {
            *guard = State::Writing;
            assert_eq!(*guard, State::Writing);
            *guard = State::Reading;
            count += 1;
        }
    }
    count
}

fn upgradable(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        let guard = mutex.upgradable_read();
        assert_eq!(*guard, State::Reading);
        count += 1;
    }
    count
}

fn try_upgradable(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        if let Some(guard) = mutex.try_upgradable_read() {
            assert_eq!(*guard, State::Reading);
            count += 1;
        }
    }
    count
}

fn try_for_upgradable(mutex: &UpgradeMutex<State>, until: Instant, timeout: Duration) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        if let Some(guard) = mutex.try_upgradable_read_for(timeout) {
            assert_eq!(*guard, State::Reading);
            count += 1;
        }
    }
    count
}

/// `shared -> exclusive -> upgrade -> shared`, going through whichever of the two
/// shared-to-exclusive paths succeeds first (direct try, or via upgrade mode).
fn clockwise(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    'outer: while Instant::now() < until {
        let shared = mutex.read();
        assert_eq!(*shared, State::Reading);

        let mut exclusive = match shared.try_upgrade() {
            Ok(exclusive) => exclusive,
            Err(shared) => match shared.try_upgrade_to_upgradable() {
                Ok(upgrade) => {
                    assert_eq!(*upgrade, State::Reading);
                    upgrade.upgrade()
                }
                Err(_shared) => continue 'outer,
            },
        };

        *exclusive = State::Writing;
        assert_eq!(*exclusive, State::Writing);
        *exclusive = State::Reading;

        let upgrade = exclusive.downgrade_to_upgradable();
        assert_eq!(*upgrade, State::Reading);
        let shared = upgrade.downgrade();
        assert_eq!(*shared, State::Reading);
        drop(shared);

        count += 1;
    }
    count
}

/// `upgrade -> exclusive -> shared`, the only path to exclusive that needs no retry
/// since the upgrade holder is always unique.
fn counter_clockwise(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        let upgrade = mutex.upgradable_read();
        assert_eq!(*upgrade, State::Reading);

        let mut exclusive = upgrade.upgrade();
        assert_eq!(*exclusive, State::Reading);
        *exclusive = State::Writing;
        assert_eq!(*exclusive, State::Writing);
        *exclusive = State::Reading;

        let shared = exclusive.downgrade();
        assert_eq!(*shared, State::Reading);
        drop(shared);

        count += 1;
    }
    count
}

fn try_clockwise(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        let Some(shared) = mutex.try_read() else { continue };
        assert_eq!(*shared, State::Reading);

        let mut exclusive = match shared.try_upgrade() {
            Ok(exclusive) => exclusive,
            Err(shared) => match shared.try_upgrade_to_upgradable() {
                Ok(upgrade) => {
                    assert_eq!(*upgrade, State::Reading);
                    upgrade.upgrade()
                }
                Err(_shared) => continue,
            },
        };

        *exclusive = State::Writing;
        assert_eq!(*exclusive, State::Writing);
        *exclusive = State::Reading;

        let upgrade = exclusive.downgrade_to_upgradable();
        assert_eq!(*upgrade, State::Reading);
        let shared = upgrade.downgrade();
        assert_eq!(*shared, State::Reading);
        drop(shared);

        count += 1;
    }
    count
}

/// The compound timed transition the upstream source left disabled (see the crate's
/// design notes for why it is safe here): `shared -> exclusive` is attempted via the
/// timed try-upgrade first, falling back to the upgrade-mode path on failure.
fn try_for_clockwise(mutex: &UpgradeMutex<State>, until: Instant, timeout: Duration) -> u64 {
    let mut count = 0;
    'outer: while Instant::now() < until {
        let Some(shared) = mutex.try_read_for(timeout) else { continue };
        assert_eq!(*shared, State::Reading);

        let mut exclusive = match shared.try_upgrade_for(timeout) {
            Ok(exclusive) => exclusive,
            Err(shared) => match shared.try_upgrade_to_upgradable_for(timeout) {
                Ok(upgrade) => {
                    assert_eq!(*upgrade, State::Reading);
                    upgrade.upgrade()
                }
                Err(_shared) => continue 'outer,
            },
        };

        *exclusive = State::Writing;
        assert_eq!(*exclusive, State::Writing);
        *exclusive = State::Reading;

        let upgrade = exclusive.downgrade_to_upgradable();
        assert_eq!(*upgrade, State::Reading);
        let shared = upgrade.downgrade();
        assert_eq!(*shared, State::Reading);
        drop(shared);

        count += 1;
    }
    count
}

fn try_counter_clockwise(mutex: &UpgradeMutex<State>, until: Instant) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        let Some(upgrade) = mutex.try_upgradable_read() else { continue };
        assert_eq!(*upgrade, State::Reading);

        match upgrade.try_upgrade() {
            Ok(mut exclusive) => {
                assert_eq!(*exclusive, State::Reading);
                *exclusive = State::Writing;
                assert_eq!(*exclusive, State::Writing);
                *exclusive = State::Reading;
                let shared = exclusive.downgrade();
                assert_eq!(*shared, State::Reading);
                drop(shared);
                count += 1;
            }
            Err(_upgrade) => {}
        }
    }
    count
}

fn try_for_counter_clockwise(mutex: &UpgradeMutex<State>, until: Instant, timeout: Duration) -> u64 {
    let mut count = 0;
    while Instant::now() < until {
        let Some(upgrade) = mutex.try_upgradable_read_for(timeout) else { continue };
        assert_eq!(*upgrade, State::Reading);

        match upgrade.try_upgrade_for(timeout) {
            Ok(mut exclusive) => {
                assert_eq!(*exclusive, State::Reading);
                *exclusive = State::Writing;
                assert_eq!(*exclusive, State::Writing);
                *exclusive = State::Reading;
                let shared = exclusive.downgrade();
                assert_eq!(*shared, State::Reading);
                drop(shared);
                count += 1;
            }
            Err(_upgrade) => {}
        }
    }
    count
}

fn until_from_now(duration: Duration) -> Instant {
    Instant::now() + duration
}

/// S1: one writer, two readers, blocking acquisitions only.
fn scenario_s1(mutex: &UpgradeMutex<State>, duration: Duration) {
    let until = until_from_now(duration);
    thread::scope(|scope| {
        let t1 = scope.spawn(|| reader(mutex, until));
        let t2 = scope.spawn(|| writer(mutex, until));
        let t3 = scope.spawn(|| reader(mutex, until));
        print_count("reader", t1.join().unwrap_or(0));
        print_count("writer", t2.join().unwrap_or(0));
        print_count("reader", t3.join().unwrap_or(0));
    });
}

/// S2: same as S1 but with non-blocking try-variants.
fn scenario_s2(mutex: &UpgradeMutex<State>, duration: Duration) {
    let until = until_from_now(duration);
    thread::scope(|scope| {
        let t1 = scope.spawn(|| try_reader(mutex, until));
        let t2 = scope.spawn(|| try_writer(mutex, until));
        let t3 = scope.spawn(|| try_reader(mutex, until));
        print_count("try_reader", t1.join().unwrap_or(0));
        print_count("try_writer", t2.join().unwrap_or(0));
        print_count("try_reader", t3.join().unwrap_or(0));
    });
}

/// S3: same as S1 but with timed try-variants at the configured timeout.
fn scenario_s3(mutex: &UpgradeMutex<State>, duration: Duration, timeout: Duration) {
    let until = until_from_now(duration);
    thread::scope(|scope| {
        let t1 = scope.spawn(|| try_for_reader(mutex, until, timeout));
        let t2 = scope.spawn(|| try_for_writer(mutex, until, timeout));
        let t3 = scope.spawn(|| try_for_reader(mutex, until, timeout));
        print_count("try_for_reader", t1.join().unwrap_or(0));
        print_count("try_for_writer", t2.join().unwrap_or(0));
        print_count("try_for_reader", t3.join().unwrap_or(0));
    });
}

/// Reader/writer/upgrader coexistence, in its three forms (blocking, try, timed try).
fn scenario_upgrade_coexistence(mutex: &UpgradeMutex<State>, duration: Duration, timeout: Duration) {
    {
        let until = until_from_now(duration);
        thread::scope(|scope| {
            let t1 = scope.spawn(|| reader(mutex, until));
            let t2 = scope.spawn(|| writer(mutex, until));
            let t3 = scope.spawn(|| upgradable(mutex, until));
            print_count("reader", t1.join().unwrap_or(0));
            print_count("writer", t2.join().unwrap_or(0));
            print_count("upgradable", t3.join().unwrap_or(0));
        });
    }
    {
        let until = until_from_now(duration);
        thread::scope(|scope| {
            let t1 = scope.spawn(|| reader(mutex, until));
            let t2 = scope.spawn(|| writer(mutex, until));
            let t3 = scope.spawn(|| try_upgradable(mutex, until));
            print_count("reader", t1.join().unwrap_or(0));
            print_count("writer", t2.join().unwrap_or(0));
            print_count("try_upgradable", t3.join().unwrap_or(0));
        });
    }
    {
        let until = until_from_now(duration);
        thread::scope(|scope| {
            let t1 = scope.spawn(|| reader(mutex, until));
            let t2 = scope.spawn(|| writer(mutex, until));
            let t3 = scope.spawn(|| try_for_upgradable(mutex, until, timeout));
            print_count("reader", t1.join().unwrap_or(0));
            print_count("writer", t2.join().unwrap_or(0));
            print_count("try_for_upgradable", t3.join().unwrap_or(0));
        });
    }
}

/// S4: two clockwise, two counter-clockwise rotators, all blocking/retrying.
fn scenario_s4(mutex: &UpgradeMutex<State>, duration: Duration) {
    *mutex.write() = State::Reading;
    let until = until_from_now(duration);
    thread::scope(|scope| {
        let t1 = scope.spawn(|| clockwise(mutex, until));
        let t2 = scope.spawn(|| counter_clockwise(mutex, until));
        let t3 = scope.spawn(|| clockwise(mutex, until));
        let t4 = scope.spawn(|| counter_clockwise(mutex, until));
        print_count("clockwise", t1.join().unwrap_or(0));
        print_count("counter_clockwise", t2.join().unwrap_or(0));
        print_count("clockwise", t3.join().unwrap_or(0));
        print_count("counter_clockwise", t4.join().unwrap_or(0));
    });
}

/// S5: one try_clockwise, one try_counter_clockwise.
fn scenario_s5(mutex: &UpgradeMutex<State>, duration: Duration) {
    *mutex.write() = State::Reading;
    let until = until_from_now(duration);
    thread::scope(|scope| {
        let t1 = scope.spawn(|| try_clockwise(mutex, until));
        let t2 = scope.spawn(|| try_counter_clockwise(mutex, until));
        print_count("try_clockwise", t1.join().unwrap_or(0));
        print_count("try_counter_clockwise", t2.join().unwrap_or(0));
    });
}

/// S6: solo `try_for_counter_clockwise`, no contending writer.
fn scenario_s6(mutex: &UpgradeMutex<State>, duration: Duration, timeout: Duration) {
    *mutex.write() = State::Reading;
    let until = until_from_now(duration);
    let count = try_for_counter_clockwise(mutex, until, timeout);
    print_count("try_for_counter_clockwise", count);
}

/// The demo binary's analogue of `Assignment::A`'s usage in the distilled spec: two
/// ledgers averaged together via a deadlock-free exclusive+upgrade acquisition.
fn demonstrate_ledger() {
    let a = Ledger::new(vec![1.0, 2.0, 3.0]);
    let b = Ledger::new(vec![3.0, 4.0, 5.0]);

    let c = a.duplicate();
    c.assign(&b);
    assert_eq!(c.snapshot(), b.snapshot());

    a.average(&b);
    assert_eq!(a.snapshot(), vec![2.0, 3.0, 4.0]);
    assert_eq!(b.snapshot(), vec![2.0, 3.0, 4.0]);

    let d = Ledger::new(vec![9.0]);
    a.swap(&d);
    assert_eq!(a.snapshot(), vec![9.0]);
}

fn main() -> Result<(), String> {
    tracing_subscriber::fmt::try_init().ok();

    let config = Config::from_args()?;
    let mutex = UpgradeMutex::new(State::Reading);

    scenario_s1(&mutex, config.duration);
    scenario_s2(&mutex, config.duration);
    scenario_s3(&mutex, config.duration, config.timeout);
    scenario_upgrade_coexistence(&mutex, config.duration, config.timeout);
    scenario_s4(&mutex, config.duration);
    scenario_s5(&mutex, config.duration);
    scenario_s6(&mutex, config.duration, config.timeout);

    let until = until_from_now(config.duration);
    let count = try_for_clockwise(&mutex, until, config.timeout);
    print_count("try_for_clockwise", count);

    demonstrate_ledger();

    Ok(())
}
