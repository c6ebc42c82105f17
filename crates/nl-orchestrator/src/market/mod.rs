//! Market connection and offer negotiation

mod backoff;
mod negotiate;

pub use backoff::ExponentialBackoff;
pub use negotiate::negotiate;

use tokio_util::sync::CancellationToken;

use nl_core::config::MarketConfig;
use nl_core::traits::{Market, MarketConnection};
use nl_core::{SessionError, SessionState};

/// Connect to the market, retrying with backoff.
///
/// Gives up with [`SessionError::Connect`] after `connect_attempts` failures.
pub async fn connect_with_retry(
    market: &dyn Market,
    config: &MarketConfig,
    cancel: &CancellationToken,
) -> Result<Box<dyn MarketConnection>, SessionError> {
    let mut backoff = ExponentialBackoff::from_config(&config.backoff);
    let attempts = config.connect_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(SessionError::Cancelled { stage: SessionState::Connecting });
            }
            result = market.connect() => result,
        };

        match result {
            Ok(connection) => {
                tracing::info!("Connected to market (attempt {}/{})", attempt, attempts);
                return Ok(connection);
            }
            Err(source) if attempt >= attempts => {
                return Err(SessionError::Connect { attempts, source });
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Market connection attempt {}/{} failed: {} (retrying in {:?})",
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SessionError::Cancelled { stage: SessionState::Connecting });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
