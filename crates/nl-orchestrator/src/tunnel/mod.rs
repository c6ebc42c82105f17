//! Local TCP tunnel to a port on the rented node
//!
//! A listener on the local machine accepts connections and relays each one,
//! byte for byte, to a fixed remote port. A broken forwarded connection is
//! reported on the event channel and ends only that connection.

mod forward;
mod listener;

pub use listener::Tunnel;

use std::net::SocketAddr;

use nl_core::ForwardingError;

/// Channel capacity for tunnel events.
///
/// Events are sent with `try_send`; when the consumer falls behind, events
/// are dropped rather than slowing down forwarding.
pub const TUNNEL_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened to a forwarded connection
#[derive(Debug)]
pub enum TunnelEvent {
    /// A local client connected
    Opened { id: u64, peer: SocketAddr },

    /// A forwarded connection finished cleanly
    Closed {
        id: u64,
        peer: SocketAddr,
        to_remote: u64,
        to_local: u64,
    },

    /// A forwarded connection broke
    Failed { id: u64, error: ForwardingError },
}
