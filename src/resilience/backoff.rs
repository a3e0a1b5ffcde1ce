//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Upper bound of the random jitter, as a fraction of the capped delay.
pub const MAX_JITTER_RATIO: f64 = 0.4;

/// Delay before jitter: `min(max, base * 2^retry_count)`.
pub fn exponential_delay(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.min(31));
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Calculate exponential backoff delay with 0–40% positive jitter.
pub fn calculate_backoff(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let capped = exponential_delay(retry_count, base, max);
    let jitter = rand::thread_rng().gen_range(0.0..MAX_JITTER_RATIO);
    capped.mul_f64(1.0 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exponential_sequence() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let expected = [1, 2, 4, 8, 16];
        for (attempt, secs) in expected.iter().enumerate() {
            assert_eq!(exponential_delay(attempt as u32, base, max), Duration::from_secs(*secs));
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        for attempt in 0..5 {
            let floor = exponential_delay(attempt, base, max);
            for _ in 0..50 {
                let delay = calculate_backoff(attempt, base, max);
                assert!(delay >= floor);
                assert!(delay <= floor.mul_f64(1.0 + MAX_JITTER_RATIO));
            }
        }
    }

    #[test]
    fn test_saturates_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(exponential_delay(6, base, max), max);
        assert_eq!(exponential_delay(40, base, max), max);
        assert_eq!(exponential_delay(u32::MAX, base, max), max);

        let delay = calculate_backoff(100, base, max);
        assert!(delay >= max && delay <= max.mul_f64(1.4));
    }

    #[test]
    fn test_jitter_varies() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let distinct: HashSet<_> = (0..20).map(|_| calculate_backoff(2, base, max)).collect();
        assert!(distinct.len() > 1);
    }
}
