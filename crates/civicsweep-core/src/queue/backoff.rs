use std::time::Duration;

use rand::Rng;

/// First retry delay in milliseconds.
const BASE_DELAY_MS: u64 = 2000;

/// Longest retry delay before jitter.
const MAX_DELAY_MS: u64 = 60_000;

/// Upper bound (exclusive) of the random jitter added to each delay.
const MAX_JITTER_MS: u64 = 400;

/// Retry counter ceiling. 2s * 2^6 already exceeds the maximum delay.
pub const MAX_RETRY_COUNT: u32 = 6;

/// Delay before jitter for the given number of consecutive network failures.
pub fn base_delay(retry_count: u32) -> Duration {
    let exponent = retry_count.min(MAX_RETRY_COUNT);
    Duration::from_millis((BASE_DELAY_MS << exponent).min(MAX_DELAY_MS))
}

/// Delay before the next flush attempt, with jitter applied.
pub fn retry_delay(retry_count: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
    base_delay(retry_count) + Duration::from_millis(jitter)
}

/// Next retry counter after a network failure.
pub fn next_retry_count(retry_count: u32) -> u32 {
    retry_count.saturating_add(1).min(MAX_RETRY_COUNT)
}
