//! Per-session input rate limiting: over-limit messages are dropped,
//! not buffered. No pack example rate-limits input, so this is grounded
//! on `governor`'s standard single-keyed limiter usage rather than a
//! hand-rolled bucket.

use std::num::NonZeroU32;

use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};

pub struct InputRateLimiter {
    inner: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl InputRateLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(rate_per_sec.max(1)).expect("clamped to at least 1");
        let burst = NonZeroU32::new(burst.max(1)).expect("clamped to at least 1");
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            inner: RateLimiter::direct(quota),
        }
    }

    /// Returns `true` if the message is allowed; a denied message must
    /// be dropped by the caller, not queued.
    pub fn allow(&self) -> bool {
        self.inner.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allows_up_to_configured_count() {
        let limiter = InputRateLimiter::new(100, 5);
        let allowed = (0..5).filter(|_| limiter.allow()).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn frame_past_burst_is_denied() {
        let limiter = InputRateLimiter::new(100, 3);
        for _ in 0..3 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
    }
}
