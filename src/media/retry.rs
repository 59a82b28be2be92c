#![forbid(unsafe_code)]

// Exponential backoff for engine creation calls (routers, transports)

use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Maximum number of retries after the first attempt
pub const MAX_RETRIES: usize = 3;

fn backoff() -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(MAX_RETRIES)
        .with_jitter()
        .build()
}

/// Runs `op` until it succeeds or the backoff schedule is exhausted.
/// The last error is returned when every attempt fails.
pub async fn with_backoff<T, E, F, Fut>(what: &str, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = backoff();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!("{} failed: {} - retrying in {:?}", what, e, delay);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}
