//! Rental requests and market offers

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RentalConfig;

/// Provider advertising an offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
}

/// Linear pricing of an offer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OfferPricing {
    pub start: f64,
    pub cpu_per_hour: f64,
    pub env_per_hour: f64,
}

/// A candidate offer received during negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferProposal {
    pub id: String,
    pub provider: ProviderInfo,
    pub memory_gib: f64,
    pub pricing: OfferPricing,
}

/// Upper bounds on each price component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingLimits {
    pub max_start_price: f64,
    pub max_cpu_per_hour_price: f64,
    pub max_env_per_hour_price: f64,
}

impl PricingLimits {
    /// Whether every component of `pricing` is within the limits
    pub fn allows(&self, pricing: &OfferPricing) -> bool {
        pricing.start <= self.max_start_price
            && pricing.cpu_per_hour <= self.max_cpu_per_hour_price
            && pricing.env_per_hour <= self.max_env_per_hour_price
    }
}

impl Default for PricingLimits {
    fn default() -> Self {
        Self {
            max_start_price: 10.0,
            max_cpu_per_hour_price: 10.0,
            max_env_per_hour_price: 10.0,
        }
    }
}

/// User predicate applied to offers that pass the hard constraints
pub type OfferFilter = Arc<dyn Fn(&OfferProposal) -> bool + Send + Sync>;

/// Immutable description of the node to rent.
///
/// Built once before negotiation and only ever shared by reference.
#[derive(Clone)]
pub struct RentalSpec {
    /// Image the node must run
    pub image_hash: String,
    /// Execution engine ("vm")
    pub engine: String,
    /// Minimum memory in GiB
    pub min_mem_gib: f64,
    /// How long the node is leased for
    pub rent_duration: Duration,
    /// Maximum acceptable prices
    pub pricing: PricingLimits,
    /// Private network the node joins
    pub network: Option<String>,
    filter: OfferFilter,
}

impl RentalSpec {
    /// Create a spec for `image_hash` with default constraints that accepts any provider
    pub fn new(image_hash: impl Into<String>) -> Self {
        Self {
            image_hash: image_hash.into(),
            engine: "vm".to_string(),
            min_mem_gib: 0.0,
            rent_duration: Duration::from_secs(3600),
            pricing: PricingLimits::default(),
            network: None,
            filter: Arc::new(|_| true),
        }
    }

    /// Build a spec from configuration.
    ///
    /// An empty `preferred_providers` list accepts every provider; otherwise
    /// only offers from listed provider names are accepted.
    pub fn from_config(config: &RentalConfig) -> Self {
        let preferred = config.preferred_providers.clone();
        Self {
            image_hash: config.image_hash.clone(),
            engine: config.engine.clone(),
            min_mem_gib: config.min_mem_gib,
            rent_duration: Duration::from_secs(config.rent_hours.saturating_mul(3600)),
            pricing: config.pricing,
            network: config.network.clone(),
            filter: Arc::new(move |offer: &OfferProposal| {
                preferred.is_empty() || preferred.iter().any(|name| *name == offer.provider.name)
            }),
        }
    }

    /// Replace the acceptance predicate
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&OfferProposal) -> bool + Send + Sync + 'static,
    {
        self.filter = Arc::new(filter);
        self
    }

    /// Set the minimum memory
    pub fn with_min_mem_gib(mut self, min_mem_gib: f64) -> Self {
        self.min_mem_gib = min_mem_gib;
        self
    }

    /// Set the pricing limits
    pub fn with_pricing(mut self, pricing: PricingLimits) -> Self {
        self.pricing = pricing;
        self
    }

    /// Whether `offer` satisfies the memory and price constraints and the predicate
    pub fn accepts(&self, offer: &OfferProposal) -> bool {
        offer.memory_gib >= self.min_mem_gib
            && self.pricing.allows(&offer.pricing)
            && (self.filter)(offer)
    }
}

impl fmt::Debug for RentalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RentalSpec")
            .field("image_hash", &self.image_hash)
            .field("engine", &self.engine)
            .field("min_mem_gib", &self.min_mem_gib)
            .field("rent_duration", &self.rent_duration)
            .field("pricing", &self.pricing)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}
