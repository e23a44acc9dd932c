//! Bounded-attempt backoff wrapper for coordination-store writes that must
//! not be lost.
//!
//! The component table describes this loosely as "exponential-backoff";
//! the error-handling section pins concrete numbers (10 attempts, 1s base,
//! linear). This module follows the concrete numbers — see DESIGN.md.

use std::time::Duration;

use tracing::warn;

use crate::store::StoreError;

/// Attempts before a transient store error is treated as fatal and the
/// node crashes.
pub const MAX_ATTEMPTS: u32 = 10;

/// Base delay; attempt `n` (1-indexed) waits `n * BASE_DELAY`.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Retries `op` up to [`MAX_ATTEMPTS`] times with linear backoff. Returns
/// the last error if every attempt fails.
///
/// Callers that cannot tolerate losing the write (every coordination-store
/// write that advances protocol state) must go through this helper rather
/// than calling the store directly.
pub async fn retry_write<F, Fut>(what: &str, mut op: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, what, error = %e, "coordination store write failed, retrying");
                last_err = Some(e);
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(BASE_DELAY * attempt).await;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}
