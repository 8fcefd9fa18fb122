//! Tunnel module
//!
//! This module implements the TCP tunnel relay: listen-rule tunnels
//! that forward accepted connections to a fixed destination, and the
//! rendezvous registry that pairs independently-connecting peers into
//! bridged streams.

mod manager;
mod rendezvous;
mod stream;
mod tunnel;

pub use manager::{TunnelManager, TunnelRequest};
pub use rendezvous::RendezvousKey;
pub use stream::TunnelStream;
pub use tunnel::Tunnel;
