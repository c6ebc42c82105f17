//! Offer negotiation

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use nl_core::traits::{MarketConnection, Rental};
use nl_core::{RentalSpec, SessionError, SessionState};

/// Rent the first offer `spec` accepts within `window`.
///
/// Offers are evaluated in arrival order. If renting an accepted offer
/// fails, negotiation moves on to the next candidate. Running out of
/// candidates or time yields [`SessionError::NoCapacity`].
pub async fn negotiate(
    connection: &dyn MarketConnection,
    spec: &RentalSpec,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<Box<dyn Rental>, SessionError> {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    let mut evaluated = 0;
    let mut rejected = 0;
    let no_capacity = |evaluated, rejected| SessionError::NoCapacity {
        window,
        evaluated,
        rejected,
    };
    let cancelled = || SessionError::Cancelled {
        stage: SessionState::Negotiating,
    };

    let mut offers = tokio::select! {
        _ = cancel.cancelled() => return Err(cancelled()),
        _ = &mut deadline => return Err(no_capacity(0, 0)),
        result = connection.offers(spec) => match result {
            Ok(offers) => offers,
            Err(e) => {
                tracing::error!("Market refused the demand: {}", e);
                return Err(no_capacity(0, 0));
            }
        },
    };

    loop {
        let offer = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = &mut deadline => {
                tracing::warn!("Negotiation window of {:?} elapsed", window);
                return Err(no_capacity(evaluated, rejected));
            }
            offer = offers.recv() => match offer {
                Some(offer) => offer,
                None => {
                    tracing::warn!("Market has no more offers");
                    return Err(no_capacity(evaluated, rejected));
                }
            },
        };

        evaluated += 1;
        tracing::info!("Evaluating provider: {}", offer.provider.name);

        if !spec.accepts(&offer) {
            rejected += 1;
            tracing::debug!(
                "Rejected offer {} from {} (memory {} GiB, pricing {:?})",
                offer.id,
                offer.provider.name,
                offer.memory_gib,
                offer.pricing
            );
            continue;
        }

        let provider = offer.provider.name.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = &mut deadline => return Err(no_capacity(evaluated, rejected)),
            result = connection.rent(offer, spec) => result,
        };

        match result {
            Ok(rental) => {
                tracing::info!("Rented node from provider {}", provider);
                return Ok(rental);
            }
            Err(e) => {
                tracing::warn!("Failed to rent from {}: {}", provider, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use nl_core::traits::ExeUnit;
    use nl_core::{MarketError, OfferPricing, OfferProposal, ProviderInfo};

    fn offer(id: &str, memory_gib: f64) -> OfferProposal {
        OfferProposal {
            id: id.to_string(),
            provider: ProviderInfo {
                id: format!("0x{}", id),
                name: format!("provider-{}", id),
            },
            memory_gib,
            pricing: OfferPricing {
                start: 0.0,
                cpu_per_hour: 1.0,
                env_per_hour: 1.0,
            },
        }
    }

    struct Leased(ProviderInfo);

    #[async_trait]
    impl Rental for Leased {
        fn provider(&self) -> &ProviderInfo {
            &self.0
        }

        async fn exe_unit(&self) -> Result<Arc<dyn ExeUnit>, MarketError> {
            Err(MarketError::Revoked("not used".to_string()))
        }

        async fn stop_and_finalize(&self) -> Result<(), MarketError> {
            Ok(())
        }
    }

    /// Delivers `offers` and keeps the channel open while `hold_open` is set
    struct ScriptedConnection {
        offers: Vec<OfferProposal>,
        failing: Vec<String>,
        hold_open: bool,
        rented: Mutex<Vec<String>>,
        sender: Mutex<Option<mpsc::Sender<OfferProposal>>>,
    }

    impl ScriptedConnection {
        fn new(offers: Vec<OfferProposal>) -> Self {
            Self {
                offers,
                failing: Vec::new(),
                hold_open: false,
                rented: Mutex::new(Vec::new()),
                sender: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl MarketConnection for ScriptedConnection {
        async fn offers(
            &self,
            _spec: &RentalSpec,
        ) -> Result<mpsc::Receiver<OfferProposal>, MarketError> {
            let (tx, rx) = mpsc::channel(self.offers.len().max(1));
            for offer in &self.offers {
                tx.try_send(offer.clone()).unwrap();
            }
            if self.hold_open {
                *self.sender.lock().unwrap() = Some(tx);
            }
            Ok(rx)
        }

        async fn rent(
            &self,
            offer: OfferProposal,
            _spec: &RentalSpec,
        ) -> Result<Box<dyn Rental>, MarketError> {
            self.rented.lock().unwrap().push(offer.id.clone());
            if self.failing.contains(&offer.id) {
                return Err(MarketError::Rejected("offer withdrawn".to_string()));
            }
            Ok(Box::new(Leased(offer.provider)))
        }

        async fn disconnect(&self) -> Result<(), MarketError> {
            Ok(())
        }
    }

    fn spec() -> RentalSpec {
        RentalSpec::new("image").with_min_mem_gib(16.0)
    }

    #[tokio::test]
    async fn test_rents_first_acceptable_offer() {
        let connection = ScriptedConnection::new(vec![offer("a", 8.0), offer("b", 32.0), offer("c", 64.0)]);
        let rental = negotiate(&connection, &spec(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rental.provider().name, "provider-b");
        assert_eq!(*connection.rented.lock().unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_failed_rent_moves_to_next_offer() {
        let mut connection = ScriptedConnection::new(vec![offer("a", 32.0), offer("b", 32.0)]);
        connection.failing.push("a".to_string());

        let rental = negotiate(&connection, &spec(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rental.provider().name, "provider-b");
        assert_eq!(*connection.rented.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_exhausted_offers_mean_no_capacity() {
        let connection = ScriptedConnection::new(vec![offer("a", 8.0), offer("b", 4.0)]);
        let err = negotiate(&connection, &spec(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(
            err,
            SessionError::NoCapacity {
                evaluated: 2,
                rejected: 2,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_elapses_without_offers() {
        let mut connection = ScriptedConnection::new(Vec::new());
        connection.hold_open = true;

        let err = negotiate(&connection, &spec(), Duration::from_secs(180), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::NoCapacity { evaluated: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_negotiation() {
        let mut connection = ScriptedConnection::new(Vec::new());
        connection.hold_open = true;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = negotiate(&connection, &spec(), Duration::from_secs(180), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SessionError::Cancelled {
                stage: SessionState::Negotiating
            }
        ));
    }
}
