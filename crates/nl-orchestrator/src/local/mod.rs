//! Loopback market backend
//!
//! Treats the local machine as the only node on offer. Renting it yields an
//! execution context that runs commands as local child processes and
//! forwards tunnel connections to `127.0.0.1:<remote_port>`. Useful for
//! running the orchestrator end to end without a marketplace.

mod exec;

pub use exec::{LocalEndpoint, LocalExeUnit, ProcessRegistry};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nl_core::traits::{ExeUnit, Market, MarketConnection, Rental};
use nl_core::{MarketError, OfferPricing, OfferProposal, ProviderInfo, RentalSpec};

/// Offer id of the single local offer
const LOCAL_OFFER_ID: &str = "local-0";

/// Market with exactly one free offer: this machine
pub struct LocalMarket {
    provider: ProviderInfo,
    memory_gib: f64,
    target_host: String,
    processes: ProcessRegistry,
}

impl LocalMarket {
    /// Create a loopback market
    pub fn new() -> Self {
        Self {
            provider: ProviderInfo {
                id: "local".to_string(),
                name: "localhost".to_string(),
            },
            memory_gib: f64::MAX,
            target_host: "127.0.0.1".to_string(),
            processes: ProcessRegistry::default(),
        }
    }

    /// Advertise a specific amount of memory
    pub fn with_memory_gib(mut self, memory_gib: f64) -> Self {
        self.memory_gib = memory_gib;
        self
    }

    /// Number of launched processes that have not been reaped
    pub fn running_processes(&self) -> usize {
        self.processes.len()
    }

    /// Kill every process launched through this market without waiting.
    ///
    /// For a forced exit, where the runtime will not get to reap them.
    pub fn kill_all(&self) {
        self.processes.kill_all();
    }
}

impl Default for LocalMarket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Market for LocalMarket {
    async fn connect(&self) -> Result<Box<dyn MarketConnection>, MarketError> {
        tracing::debug!("Connected to loopback market");
        Ok(Box::new(LocalConnection {
            provider: self.provider.clone(),
            memory_gib: self.memory_gib,
            target_host: self.target_host.clone(),
            processes: self.processes.clone(),
            network: CancellationToken::new(),
        }))
    }
}

struct LocalConnection {
    provider: ProviderInfo,
    memory_gib: f64,
    target_host: String,
    processes: ProcessRegistry,
    /// Cancelled on disconnect; parent of every rental's activity
    network: CancellationToken,
}

#[async_trait]
impl MarketConnection for LocalConnection {
    async fn offers(
        &self,
        spec: &RentalSpec,
    ) -> Result<mpsc::Receiver<OfferProposal>, MarketError> {
        if self.network.is_cancelled() {
            return Err(MarketError::Disconnected);
        }
        if let Some(network) = &spec.network {
            tracing::debug!("Loopback market ignores network {}", network);
        }

        let (tx, rx) = mpsc::channel(1);
        let offer = OfferProposal {
            id: LOCAL_OFFER_ID.to_string(),
            provider: self.provider.clone(),
            memory_gib: self.memory_gib,
            pricing: OfferPricing {
                start: 0.0,
                cpu_per_hour: 0.0,
                env_per_hour: 0.0,
            },
        };
        tx.try_send(offer)
            .map_err(|e| MarketError::Unavailable(e.to_string()))?;
        Ok(rx)
    }

    async fn rent(
        &self,
        offer: OfferProposal,
        _spec: &RentalSpec,
    ) -> Result<Box<dyn Rental>, MarketError> {
        if self.network.is_cancelled() {
            return Err(MarketError::Disconnected);
        }
        if offer.id != LOCAL_OFFER_ID {
            return Err(MarketError::Rejected(format!("unknown offer {}", offer.id)));
        }

        let activity = self.network.child_token();
        let exe = LocalExeUnit::new(
            self.provider.clone(),
            self.target_host.clone(),
            activity.clone(),
            self.processes.clone(),
        );
        Ok(Box::new(LocalRental {
            provider: self.provider.clone(),
            activity,
            exe: Arc::new(exe),
        }))
    }

    async fn disconnect(&self) -> Result<(), MarketError> {
        self.network.cancel();
        tracing::debug!("Disconnected from loopback market");
        Ok(())
    }
}

struct LocalRental {
    provider: ProviderInfo,
    activity: CancellationToken,
    exe: Arc<LocalExeUnit>,
}

#[async_trait]
impl Rental for LocalRental {
    fn provider(&self) -> &ProviderInfo {
        &self.provider
    }

    async fn exe_unit(&self) -> Result<Arc<dyn ExeUnit>, MarketError> {
        if self.activity.is_cancelled() {
            return Err(MarketError::Revoked("rental already stopped".to_string()));
        }
        Ok(Arc::clone(&self.exe) as Arc<dyn ExeUnit>)
    }

    async fn stop_and_finalize(&self) -> Result<(), MarketError> {
        self.activity.cancel();
        self.exe.wait_for_processes().await;
        Ok(())
    }
}
