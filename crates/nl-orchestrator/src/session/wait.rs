//! Cancellable fixed-interval polling

use std::future::pending;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How a poll loop ended
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check produced a value
    Ready(T),
    /// The cancellation token fired
    Cancelled,
    /// The deadline passed
    TimedOut,
}

/// Run `check` every `interval` until it returns `Some`.
///
/// The first check runs immediately. Cancellation wins over a check that
/// would succeed on the same wakeup, and unblocks the wait without waiting
/// for the next tick. Without a `deadline` the wait is unbounded.
pub async fn poll_until<T, F>(
    interval: Duration,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
    mut check: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Option<T>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let expires_at = deadline.map(|d| Instant::now() + d);
    let expired = async move {
        match expires_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => pending::<()>().await,
        }
    };
    tokio::pin!(expired);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = &mut expired => return PollOutcome::TimedOut,
            _ = ticker.tick() => {
                if let Some(value) = check() {
                    return PollOutcome::Ready(value);
                }
            }
        }
    }
}
