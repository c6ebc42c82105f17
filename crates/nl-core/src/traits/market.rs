//! Marketplace traits

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::ExeUnit;
use crate::error::MarketError;
use crate::rental::{OfferProposal, ProviderInfo, RentalSpec};

/// Entry point to a resource marketplace
#[async_trait]
pub trait Market: Send + Sync {
    /// Establish the network context used for every later call
    async fn connect(&self) -> Result<Box<dyn MarketConnection>, MarketError>;
}

/// An established connection to the marketplace
#[async_trait]
pub trait MarketConnection: Send + Sync {
    /// Publish a demand for `spec` and receive candidate offers.
    ///
    /// The channel closes when the market has no further candidates.
    async fn offers(&self, spec: &RentalSpec)
        -> Result<mpsc::Receiver<OfferProposal>, MarketError>;

    /// Rent the node behind an accepted offer
    async fn rent(
        &self,
        offer: OfferProposal,
        spec: &RentalSpec,
    ) -> Result<Box<dyn Rental>, MarketError>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), MarketError>;
}

/// A lease on one remote node
#[async_trait]
pub trait Rental: Send + Sync {
    /// Provider of the rented node
    fn provider(&self) -> &ProviderInfo;

    /// Obtain an execution context on the node
    async fn exe_unit(&self) -> Result<Arc<dyn ExeUnit>, MarketError>;

    /// Stop everything running on the node and settle the lease
    async fn stop_and_finalize(&self) -> Result<(), MarketError>;
}
