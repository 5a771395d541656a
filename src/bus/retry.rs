/***************************************/
/*        3rd party libraries          */
/***************************************/
use log::warn;
use rand::Rng;
use std::thread::sleep;
use std::time::Duration;

/***************************************/
/*           Local modules             */
/***************************************/
use crate::config::RetryConfig;
use crate::shared::BusError;

/**
 * Bounded exponential backoff with jitter.
 *
 * Attempt `n` (1-based) waits `min(base * factor^(n-1), max)` spread by
 * `±jitter_ratio` before the next try. Only retryable errors are retried.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> RetryPolicy {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            factor: config.factor.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = attempt.saturating_sub(1) as i32;
        let scaled = (self.base_delay.as_millis() as f64) * self.factor.powi(exp);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        capped.max(0.0) as u64
    }

    pub fn jittered_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay_ms(attempt);
        if base == 0 || self.jitter_ratio == 0.0 {
            return Duration::from_millis(base);
        }

        let spread = (base as f64 * self.jitter_ratio).max(1.0);
        let lower = (base as f64 - spread).max(0.0);
        let upper = base as f64 + spread;

        Duration::from_millis(rng.gen_range(lower..=upper).round() as u64)
    }

    /// Runs `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Exhaustion yields `BusError::ConnectionLost`.
    pub fn run<T, F>(&self, operation: &'static str, mut f: F) -> Result<T, BusError>
    where
        F: FnMut() -> Result<T, BusError>,
    {
        let mut rng = rand::thread_rng();
        let mut attempt = 1;

        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(BusError::ConnectionLost {
                        operation,
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.jittered_delay(attempt, &mut rng);
                    warn!(
                        "retrying: operation={}, attempt={}/{}, delay_ms={}, error={}",
                        operation,
                        attempt,
                        self.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(&RetryConfig::default())
    }
}
