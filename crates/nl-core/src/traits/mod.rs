//! Collaborator trait definitions
//!
//! The marketplace and the remote-execution service are external systems.
//! The orchestrator only talks to them through these traits.

mod exec;
mod market;

pub use exec::{AsyncReadWrite, ExeUnit, RemoteEndpoint, RemoteProcess, RemoteStream};
pub use market::{Market, MarketConnection, Rental};
