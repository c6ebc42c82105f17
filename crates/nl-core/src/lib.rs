//! nl-core: Core abstractions and configuration for NodeLease
//!
//! This crate provides the shared domain types, the traits describing the
//! marketplace and remote-execution collaborators, error types, and the
//! configuration structures used by the orchestrator.

pub mod config;
pub mod error;
pub mod rental;
pub mod traits;
pub mod types;

pub use error::{ConfigError, ErrorKind, ForwardingError, MarketError, SessionError};
pub use rental::{OfferPricing, OfferProposal, PricingLimits, ProviderInfo, RentalSpec};
pub use types::{
    LineEvent, LineSource, ProcessStatus, SessionId, SessionState, ShutdownReason,
    ShutdownRequest, TunnelBinding,
};
