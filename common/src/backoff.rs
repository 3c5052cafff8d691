use std::{cmp::min, time::Duration};

const INITIAL_WAIT_MS: u64 = 250;
const MAXIMUM_WAIT_MS: u64 = 32_000;
const EXP_BASE: u64 = 2;

/// Get an iterator of [`Duration`]s which can be passed into e.g.
/// [`tokio::time::sleep`] to observe time-based exponential backoff.
///
/// ```
/// # use common::backoff;
/// # async fn backoff_example() {
/// let mut backoff_durations = backoff::get_backoff_iter();
/// for _ in 0..10 {
///     tokio::time::sleep(backoff_durations.next().unwrap()).await;
/// }
/// # }
/// ```
pub fn get_backoff_iter() -> impl Iterator<Item = Duration> {
    iter_with_bounds(INITIAL_WAIT_MS, MAXIMUM_WAIT_MS)
}

/// An exponential backoff iterator with custom initial and maximum waits.
/// The relay reservation retry path uses 30s doubling up to 5min.
pub fn iter_with_bounds(
    initial_wait_ms: u64,
    max_wait_ms: u64,
) -> impl Iterator<Item = Duration> {
    debug_assert!(initial_wait_ms != 0);
    (0u32..).map(move |index| {
        let factor = EXP_BASE.saturating_pow(index);
        let wait_ms = initial_wait_ms.saturating_mul(factor);
        let bounded_wait_ms = min(wait_ms, max_wait_ms);
        Duration::from_millis(bounded_wait_ms)
    })
}
