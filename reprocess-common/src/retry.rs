use std::time;

use rand::Rng;

#[derive(Copy, Clone, Debug)]
/// Exponential backoff shared by the publisher and the chunk processor.
pub struct RetryPolicy {
    /// Factor to multiply initial_interval with for every past attempt.
    backoff_coefficient: f64,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: f64,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Calculate the capped delay before retry number `attempt` (0-indexed).
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let pow = self
            .backoff_coefficient
            .powi(attempt.min(i32::MAX as u32) as i32);
        let candidate_secs = (self.initial_interval.as_secs_f64() * pow).max(0.0);

        if !candidate_secs.is_finite() || candidate_secs >= self.maximum_interval.as_secs_f64() {
            return self.maximum_interval;
        }
        time::Duration::from_secs_f64(candidate_secs)
    }

    /// Sample a full-jitter delay, uniformly in `[0, time_until_next_retry(attempt)]`.
    pub fn jittered(&self, attempt: u32) -> time::Duration {
        let ceiling = self.time_until_next_retry(attempt);
        sample_up_to(&mut rand::thread_rng(), ceiling)
    }

    pub fn maximum_interval(&self) -> time::Duration {
        self.maximum_interval
    }
}

fn sample_up_to<R: Rng>(rng: &mut R, ceiling: time::Duration) -> time::Duration {
    if ceiling.is_zero() {
        return ceiling;
    }
    ceiling.mul_f64(rng.gen_range(0.0..=1.0)).min(ceiling)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2.0,
            initial_interval: time::Duration::from_millis(500),
            maximum_interval: time::Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_progression_and_cap() {
        let p = RetryPolicy::default();

        // attempt -> expected millis (cap at 10s)
        let cases = vec![
            (0, 500),
            (1, 1000),
            (2, 2000),
            (3, 4000),
            (4, 8000),
            (5, 10000), // 16000 capped to 10000
            (30, 10000),
            (u32::MAX, 10000),
        ];

        for (attempt, expected_ms) in cases {
            let d = p.time_until_next_retry(attempt);
            assert_eq!(d.as_millis(), expected_ms, "attempt {attempt}");
        }
    }

    #[test]
    fn test_jitter_stays_within_computed_delay() {
        let p = RetryPolicy::new(
            3.0,
            time::Duration::from_millis(250),
            time::Duration::from_secs(5),
        );

        for attempt in 0..12 {
            let ceiling = p.time_until_next_retry(attempt);
            assert!(ceiling <= p.maximum_interval());
            for _ in 0..50 {
                let sampled = p.jittered(attempt);
                assert!(sampled <= ceiling, "attempt {attempt}: {sampled:?} > {ceiling:?}");
            }
        }
    }

    #[test]
    fn test_zero_interval_never_sleeps() {
        let p = RetryPolicy::new(2.0, time::Duration::ZERO, time::Duration::ZERO);
        assert_eq!(p.jittered(0), time::Duration::ZERO);
        assert_eq!(p.jittered(7), time::Duration::ZERO);
    }
}
