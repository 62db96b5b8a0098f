//! Adaptive send-rate backoff driven by transient-overload signals.

use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::config::ThrottleParams;

/// AIMD-style controller, intentionally approximate: overloaded exchanges
/// grow a sleep applied between cycles, clean exchanges shrink it back to
/// zero. Steps are jittered so parallel workers do not synchronize.
pub struct GatewayThrottler {
    params: ThrottleParams,
    current: Duration,
}

impl GatewayThrottler {
    pub fn new(params: ThrottleParams) -> Self {
        Self {
            params,
            current: Duration::ZERO,
        }
    }

    /// Fold in the transient-error count of one completed exchange.
    pub fn on_exchange(&mut self, transient_errors: usize) {
        let factor = rand::rng().random_range(0.5..1.5);
        if transient_errors > 0 {
            let step = self.params.base_step.mul_f64(factor);
            self.current = (self.current + step).min(self.params.max_sleep);
        } else {
            let step = self.params.decrease_step.mul_f64(factor);
            self.current = self.current.saturating_sub(step);
        }
    }

    /// Sleep the accumulated backoff; no-op at zero.
    pub fn apply_backoff(&self) {
        if !self.current.is_zero() {
            thread::sleep(self.current);
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ThrottleParams {
        ThrottleParams {
            base_step: Duration::from_millis(10),
            decrease_step: Duration::from_millis(4),
            max_sleep: Duration::from_millis(60),
        }
    }

    #[test]
    fn overloaded_exchanges_strictly_increase_up_to_cap() {
        let mut throttler = GatewayThrottler::new(params());
        let mut previous = throttler.current();
        for _ in 0..10 {
            throttler.on_exchange(3);
            let now = throttler.current();
            assert!(
                now > previous || now == params().max_sleep,
                "backoff must grow until capped"
            );
            assert!(now <= params().max_sleep);
            previous = now;
        }
        assert_eq!(throttler.current(), params().max_sleep);
    }

    #[test]
    fn clean_exchanges_strictly_decrease_to_zero() {
        let mut throttler = GatewayThrottler::new(params());
        for _ in 0..12 {
            throttler.on_exchange(1);
        }
        let mut previous = throttler.current();
        assert!(previous > Duration::ZERO);

        for _ in 0..60 {
            throttler.on_exchange(0);
            let now = throttler.current();
            assert!(
                now < previous || now.is_zero(),
                "backoff must shrink until zero"
            );
            previous = now;
        }
        assert_eq!(throttler.current(), Duration::ZERO);
    }

    #[test]
    fn apply_backoff_is_noop_at_zero() {
        let throttler = GatewayThrottler::new(params());
        let start = std::time::Instant::now();
        throttler.apply_backoff();
        assert!(start.elapsed() < Duration::from_millis(5));
    }
}
