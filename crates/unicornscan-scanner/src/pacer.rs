//! TSC-calibrated clock and token-bucket packet pacing
//!
//! The sender's only blocking point is here. A [`TscClock`] is calibrated
//! once per process: the time-stamp counter is sampled against a wall-clock
//! reference to derive a ticks-per-microsecond constant, after which reading
//! the clock costs one `rdtsc`. On non-x86 targets the monotonic clock backs
//! the same interface.
//!
//! [`Pacer`] runs a token bucket at the workunit's rate. Waits are split:
//! sleep while more than one token period remains, then spin on the clock so
//! no sleep ever exceeds one token period and the long-run rate holds to the
//! configured packets per second.

use std::time::{Duration, Instant};
use tracing::debug;

/// Microsecond clock over the TSC, calibrated once at construction.
#[derive(Debug, Clone)]
pub struct TscClock {
    /// TSC ticks per microsecond; 0 means the Instant fallback is in use.
    ticks_per_us: u64,
    base_tsc: u64,
    base_instant: Instant,
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn read_tsc() -> u64 {
    // Safe on every x86_64 we run on; constant_tsc has been universal for a
    // long time and calibration absorbs the actual frequency.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn read_tsc() -> u64 {
    0
}

impl TscClock {
    /// Calibrate against the monotonic clock over a short window.
    pub fn calibrate() -> Self {
        let base_instant = Instant::now();
        let base_tsc = read_tsc();

        if cfg!(target_arch = "x86_64") {
            // 20ms is enough to pin ticks/µs to well under 0.1% error.
            let window = Duration::from_millis(20);
            let start = Instant::now();
            while start.elapsed() < window {
                std::hint::spin_loop();
            }
            let elapsed_us = base_instant.elapsed().as_micros() as u64;
            let ticks = read_tsc().wrapping_sub(base_tsc);
            if elapsed_us > 0 && ticks > 0 {
                let ticks_per_us = ticks / elapsed_us;
                debug!(ticks_per_us, "TSC calibrated");
                return Self {
                    ticks_per_us,
                    base_tsc,
                    base_instant,
                };
            }
        }

        debug!("TSC unavailable, using monotonic clock");
        Self {
            ticks_per_us: 0,
            base_tsc,
            base_instant,
        }
    }

    /// Microseconds since calibration.
    #[inline]
    pub fn now_us(&self) -> u64 {
        if self.ticks_per_us > 0 {
            read_tsc().wrapping_sub(self.base_tsc) / self.ticks_per_us
        } else {
            self.base_instant.elapsed().as_micros() as u64
        }
    }
}

/// Token bucket emitting at a fixed packets-per-second rate.
pub struct Pacer {
    clock: TscClock,
    /// One token period, in microseconds.
    period_us: u64,
    /// Time the next token becomes available.
    next_due_us: u64,
    /// Tokens that may accumulate while we run behind (small burst cap keeps
    /// the 1-second window bound tight).
    burst_cap: u64,
}

impl Pacer {
    /// A pacer at `pps` packets per second on a fresh calibrated clock.
    pub fn new(pps: u32) -> Self {
        Self::with_clock(pps, TscClock::calibrate())
    }

    /// A pacer sharing an already calibrated clock.
    pub fn with_clock(pps: u32, clock: TscClock) -> Self {
        let pps = pps.max(1);
        let period_us = (1_000_000 / pps as u64).max(1);
        let next_due_us = clock.now_us();
        Self {
            clock,
            period_us,
            next_due_us,
            burst_cap: 8,
        }
    }

    /// Block until the next token is available.
    ///
    /// Sleeps in whole token periods while far from the deadline, then spins
    /// out the remainder; the longest single sleep is one token period.
    pub fn acquire(&mut self) {
        let now = self.clock.now_us();

        if now >= self.next_due_us {
            // Running behind: cap how far the bucket back-fills.
            let behind = now - self.next_due_us;
            let max_backlog = self.period_us * self.burst_cap;
            if behind > max_backlog {
                self.next_due_us = now - max_backlog;
            }
            self.next_due_us += self.period_us;
            return;
        }

        loop {
            let now = self.clock.now_us();
            if now >= self.next_due_us {
                break;
            }
            let wait = self.next_due_us - now;
            if wait > self.period_us {
                std::thread::sleep(Duration::from_micros(self.period_us));
            } else if wait > 50 {
                std::thread::sleep(Duration::from_micros(wait - 25));
            } else {
                std::hint::spin_loop();
            }
        }
        self.next_due_us += self.period_us;
    }

    /// The configured token period in microseconds.
    pub fn period_us(&self) -> u64 {
        self.period_us
    }
}
