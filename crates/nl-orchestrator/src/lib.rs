//! nl-orchestrator: Rents a node, runs a server on it and tunnels it locally
//!
//! One session connects to the market, negotiates a rental, launches the
//! configured command, waits for its readiness marker and then exposes the
//! remote port on a local TCP listener until the command ends or a shutdown
//! is requested. Every acquired resource is released on the way out.

pub mod local;
pub mod market;
pub mod process;
pub mod readiness;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod tunnel;

pub use local::LocalMarket;
pub use readiness::ReadinessDetector;
pub use session::{Orchestrator, SessionOutcome, SessionReport};
pub use shutdown::{listen_for_signals, ShutdownCoordinator};
pub use state::SessionFlags;
pub use tunnel::{Tunnel, TunnelEvent};
