use std::thread;
use std::time::{Duration, Instant};

/// Monotonic millisecond clock abstraction for control and timing across
/// the stack.
///
/// The counter is deliberately 32 bits wide: deadlines are compared with
/// `wrapping_sub` so timing stays correct across counter wraparound
/// (~49.7 days of uptime). Never compare `now_ms()` values with `<`/`>`.
pub trait Clock {
    /// Milliseconds since an arbitrary epoch, wrapping at `u32::MAX`.
    fn now_ms(&self) -> u32;

    /// Sleep for the given number of milliseconds (implementations may
    /// simulate by advancing their counter).
    fn sleep_ms(&self, ms: u32);

    /// Wraparound-safe elapsed time since `start_ms`.
    #[inline]
    fn elapsed_since(&self, start_ms: u32) -> u32 {
        self.now_ms().wrapping_sub(start_ms)
    }
}

/// Default, real-time monotonic clock backed by `std::time::Instant`,
/// truncated to the 32-bit millisecond domain.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_ms(&self) -> u32 {
        (self.origin.elapsed().as_millis() & u128::from(u32::MAX)) as u32
    }

    #[inline]
    fn sleep_ms(&self, ms: u32) {
        if ms == 0 {
            return;
        }
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}
