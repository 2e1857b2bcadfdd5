//! Accelerated virtual time driver for Embassy.
//!
//! Implements a global `embassy_time_driver::Driver` that maps real (host)
//! time to a virtual clock running at a configurable multiple of real
//! time, so a ten-minute simulation can finish in seconds. The scale is
//! fixed once at startup (before the executor runs); all scheduled
//! deadlines are therefore stable and no rebasing is ever needed.
//!
//! A dedicated scheduler thread sleeps until the earliest virtual
//! deadline and wakes the registered tasks. Lock ordering: CLOCK is
//! always acquired before SCHED, and never both at once.

use core::task::Waker;
use embassy_time_driver::{Driver, TICK_HZ, time_driver_impl};
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant as StdInstant};

#[derive(Debug)]
struct ScaledClock {
    /// Host time corresponding to virtual tick zero.
    origin_real: StdInstant,
    /// Virtual ticks advanced per real tick, in percent.
    scale_percent: u64,
}

#[derive(Default)]
struct SchedulerState {
    // Map of virtual-tick deadline -> wakers waiting on it.
    queue: BTreeMap<u64, Vec<Waker>>,
}

static CLOCK: OnceLock<Mutex<ScaledClock>> = OnceLock::new();
static SCHED: OnceLock<Mutex<SchedulerState>> = OnceLock::new();
static CV: OnceLock<Condvar> = OnceLock::new();
static SCHEDULER_STARTED: OnceLock<()> = OnceLock::new();

fn clock() -> &'static Mutex<ScaledClock> {
    CLOCK.get_or_init(|| {
        Mutex::new(ScaledClock {
            origin_real: StdInstant::now(),
            scale_percent: 100,
        })
    })
}

fn sched() -> &'static Mutex<SchedulerState> {
    SCHED.get_or_init(|| Mutex::new(SchedulerState::default()))
}

fn cv() -> &'static Condvar {
    CV.get_or_init(Condvar::new)
}

fn tick_hz() -> u64 {
    TICK_HZ as u64
}

/// Fix the virtual clock speed, in percent of real time (100 = realtime).
///
/// Must be called before the executor starts; the virtual origin is reset
/// to "now", so calling it with timers pending would strand them.
pub fn set_time_scale_percent(percent: u32) {
    let percent = percent.clamp(1, 10_000);
    let mut clock_lock = clock().lock().unwrap();
    clock_lock.origin_real = StdInstant::now();
    clock_lock.scale_percent = u64::from(percent);
}

/// Map a host timestamp to virtual Embassy ticks.
fn map_real_to_virtual(real: StdInstant) -> u64 {
    let clock_lock = clock().lock().unwrap();
    let real_dt = real.saturating_duration_since(clock_lock.origin_real);
    let real_ticks = (real_dt.as_nanos() * tick_hz() as u128 / 1_000_000_000u128) as u64;
    (real_ticks as u128 * clock_lock.scale_percent as u128 / 100) as u64
}

/// Map a virtual tick deadline back to a host timestamp.
fn map_virtual_to_real(virtual_ticks: u64) -> StdInstant {
    let clock_lock = clock().lock().unwrap();
    let real_ticks = virtual_ticks as u128 * 100 / clock_lock.scale_percent as u128;
    let real_ns = real_ticks * 1_000_000_000u128 / tick_hz() as u128;
    clock_lock.origin_real + Duration::from_nanos(real_ns.min(u64::MAX as u128) as u64)
}

/// Start the dedicated scheduler thread once. Safe to call repeatedly.
fn ensure_scheduler_thread() {
    SCHEDULER_STARTED.get_or_init(|| {
        std::thread::Builder::new()
            .name("virtual-time-scheduler".into())
            .spawn(scheduler_thread)
            .expect("failed to start virtual-time scheduler thread");
    });
}

/// Sleep until the earliest virtual deadline, then wake its tasks.
///
/// Waits are sliced so a missed notify cannot stall the queue for long.
/// Respects the CLOCK-before-SCHED ordering: the deadline is extracted
/// from SCHED and the lock dropped before any CLOCK access.
fn scheduler_thread() {
    const MAX_WAIT_SLICE: Duration = Duration::from_millis(25);
    loop {
        let next_at = loop {
            let guard = sched().lock().unwrap();
            if guard.queue.is_empty() {
                let guard = cv().wait(guard).unwrap();
                drop(guard);
                continue;
            }
            let (&next_at, _) = guard.queue.iter().next().unwrap();
            break next_at;
        };

        let real_target = map_virtual_to_real(next_at);
        let now_real = StdInstant::now();

        if real_target > now_real {
            let wait = (real_target - now_real).min(MAX_WAIT_SLICE);
            let guard = sched().lock().unwrap();
            let (guard, _timeout) = cv().wait_timeout(guard, wait).unwrap();
            drop(guard);
            continue;
        }

        // Drain all due wakers. Virtual "now" is computed before taking
        // SCHED so CLOCK is never held across the SCHED acquisition.
        let now_virtual = map_real_to_virtual(StdInstant::now());
        let mut ready: Vec<Waker> = Vec::new();
        {
            let mut guard = sched().lock().unwrap();
            let due: Vec<u64> = guard
                .queue
                .range(..=now_virtual)
                .map(|(&at, _)| at)
                .collect();
            for at in due {
                if let Some(wakers) = guard.queue.remove(&at) {
                    ready.extend(wakers);
                }
            }
        }

        for waker in ready {
            waker.wake();
        }
    }
}

struct ScaledDriver;

impl Driver for ScaledDriver {
    fn now(&self) -> u64 {
        map_real_to_virtual(StdInstant::now())
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        ensure_scheduler_thread();
        let mut guard = sched().lock().unwrap();
        guard.queue.entry(at).or_default().push(waker.clone());
        drop(guard);
        cv().notify_all();
    }
}

time_driver_impl!(static DRIVER: ScaledDriver = ScaledDriver);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Serialize tests touching the global clock.
    static TEST_GUARD: StdMutex<()> = StdMutex::new(());

    #[test]
    fn virtual_time_advances_with_the_scale() {
        let _guard = TEST_GUARD.lock().unwrap();
        set_time_scale_percent(400);
        let anchor = StdInstant::now();
        let later = anchor + Duration::from_millis(100);
        let delta = map_real_to_virtual(later) - map_real_to_virtual(anchor);
        // 100 ms of real time is 400 ms of virtual time at 400%.
        let expected = tick_hz() * 400 / 1000;
        let tolerance = tick_hz() / 100;
        assert!(
            delta.abs_diff(expected) <= tolerance,
            "delta {delta} expected ~{expected}"
        );
        set_time_scale_percent(100);
    }

    #[test]
    fn virtual_to_real_is_the_inverse_mapping() {
        let _guard = TEST_GUARD.lock().unwrap();
        set_time_scale_percent(200);
        let target_virtual = tick_hz(); // one virtual second
        let real = map_virtual_to_real(target_virtual);
        let origin = clock().lock().unwrap().origin_real;
        let real_dt = real.duration_since(origin);
        // One virtual second at 200% is half a real second.
        assert!((real_dt.as_secs_f64() - 0.5).abs() < 0.01, "{real_dt:?}");
        set_time_scale_percent(100);
    }

    #[test]
    fn scale_is_clamped() {
        let _guard = TEST_GUARD.lock().unwrap();
        set_time_scale_percent(0);
        assert_eq!(clock().lock().unwrap().scale_percent, 1);
        set_time_scale_percent(1_000_000);
        assert_eq!(clock().lock().unwrap().scale_percent, 10_000);
        set_time_scale_percent(100);
    }
}
