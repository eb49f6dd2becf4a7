//! Bounded retry combinator shared by the acquisition paths

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Longest wait between two attempts
pub const MAX_DELAY: Duration = Duration::from_secs(300);

/// Delay between two attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Retry immediately
    None,
    /// Fixed delay
    Fixed(Duration),
    /// `base^attempt` seconds, attempt counted from zero, capped at [`MAX_DELAY`]
    Exponential { base: f64 },
}

impl Backoff {
    /// Delay to wait after the failed attempt with the given zero-based index
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed(d) => d,
            Self::Exponential { base } => {
                let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
                let secs = base.max(1.0).powi(exp);
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(MAX_DELAY)
                    .min(MAX_DELAY)
            }
        }
    }
}

/// Attempt count and backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Backoff) -> Self {
        Self { attempts, backoff }
    }

    /// Single attempt, no backoff
    pub const fn once() -> Self {
        Self::new(1, Backoff::None)
    }
}

/// All attempts failed
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

/// Run `op` until it succeeds or `policy.attempts` attempts have failed.
///
/// `op` receives the zero-based attempt index. The backoff delay is applied
/// only between attempts, never after the last one. A policy of zero attempts
/// still runs the operation once.
pub async fn with_retries<T, E, F, Fut>(
    policy: RetryPolicy,
    mut op: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!("Attempt {}/{} failed: {}", attempt + 1, attempts, e);
                if attempt + 1 >= attempts {
                    return Err(RetryError {
                        attempts,
                        last: e,
                    });
                }
                sleep(policy.backoff.delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}
