use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Retry an async operation, sleeping `delays[i]` before attempt `i + 2`.
///
/// Makes `delays.len() + 1` attempts at most and gives up immediately on
/// errors for which `retryable` returns false. Returns the last error.
pub async fn retry_if<F, Fut, T, E, P>(
    mut operation: F,
    delays: &[Duration],
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let total = delays.len() + 1;
    let mut attempt = 0usize;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let Some(delay) = delays.get(attempt) else {
                    return Err(e);
                };
                if !retryable(&e) {
                    return Err(e);
                }
                attempt += 1;
                warn!(
                    "Operation failed (attempt {attempt}/{total}): {e}. Retrying after {}ms...",
                    delay.as_millis()
                );
                sleep(*delay).await;
            }
        }
    }
}
