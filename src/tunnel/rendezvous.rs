//! Rendezvous pairing state
//!
//! A rendezvous tunnel forms when two independently-connecting peers
//! declare the same `(tunnel_id, stream_nr)` key under opposite roles.
//! Each key owns one slot holding up to two parked sockets; a filled
//! slot is bridged once and then terminal.

use std::sync::{Arc, Weak};

use log::warn;
use tokio::net::TcpStream;

use super::stream::TunnelStream;
use crate::message::TunnelRole;

/// Pairing key of one tunnel stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendezvousKey {
    /// Tunnel the stream belongs to
    pub tunnel_id: u32,
    /// Stream number within the tunnel
    pub stream_nr: u32,
}

impl std::fmt::Display for RendezvousKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tunnel {} stream {}", self.tunnel_id, self.stream_nr)
    }
}

/// Pairing state for one key: Empty, one side parked, or Bridged
#[derive(Default)]
pub(crate) struct RendezvousSlot {
    server: Option<TcpStream>,
    client: Option<TcpStream>,
    bridged: Option<Weak<TunnelStream>>,
}

impl RendezvousSlot {
    /// Whether this slot has produced its bridged stream
    pub fn is_bridged(&self) -> bool {
        self.bridged.is_some()
    }

    /// Whether both roles are parked and ready to bridge
    pub fn is_complete(&self) -> bool {
        self.server.is_some() && self.client.is_some()
    }

    /// A bridged slot whose stream has ended; ready for compaction
    pub fn is_dead(&self) -> bool {
        self.bridged
            .as_ref()
            .map(|weak| weak.strong_count() == 0)
            .unwrap_or(false)
    }

    /// The bridged stream, while it lives
    pub fn bridged_stream(&self) -> Option<Arc<TunnelStream>> {
        self.bridged.as_ref().and_then(Weak::upgrade)
    }

    /// Park a socket under its role
    ///
    /// A stale occupant (socket already dead) is cleared first; a live
    /// occupant of the same role rejects the newcomer untouched. A
    /// bridged slot accepts nothing.
    pub fn occupy(&mut self, role: TunnelRole, stream: TcpStream) -> bool {
        if self.is_bridged() {
            return false;
        }

        let slot = match role {
            TunnelRole::Server => &mut self.server,
            TunnelRole::Client => &mut self.client,
        };

        if let Some(existing) = slot {
            if socket_alive(existing) {
                return false;
            }
            // Dead occupant replaced by the newcomer
        }

        *slot = Some(stream);
        true
    }

    /// Take both parked sockets for bridging
    pub fn take_pair(&mut self) -> Option<(TcpStream, TcpStream)> {
        if self.is_complete() {
            Some((self.server.take().unwrap(), self.client.take().unwrap()))
        } else {
            None
        }
    }

    /// Record the bridged stream; the slot is terminal afterwards
    pub fn mark_bridged(&mut self, stream: Weak<TunnelStream>) {
        self.bridged = Some(stream);
    }
}

/// Probe whether a parked socket's peer is still there
///
/// Rendezvous peers send nothing between Identify and
/// TunnelEstablished, so a readable socket means either a close or a
/// protocol violation.
fn socket_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Ok(0) => false,
        Ok(_) => {
            warn!("Rendezvous peer sent data before pairing completed");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_slot_state_machine() {
        let mut slot = RendezvousSlot::default();
        assert!(!slot.is_complete());
        assert!(!slot.is_bridged());

        let (server, _server_peer) = socket_pair().await;
        assert!(slot.occupy(TunnelRole::Server, server));
        assert!(!slot.is_complete());

        // Same live role again is rejected, occupant untouched
        let (second, _second_peer) = socket_pair().await;
        assert!(!slot.occupy(TunnelRole::Server, second));

        let (client, _client_peer) = socket_pair().await;
        assert!(slot.occupy(TunnelRole::Client, client));
        assert!(slot.is_complete());

        assert!(slot.take_pair().is_some());
        assert!(!slot.is_complete());
    }

    #[tokio::test]
    async fn test_stale_occupant_replaced() {
        let mut slot = RendezvousSlot::default();

        let (server, server_peer) = socket_pair().await;
        assert!(slot.occupy(TunnelRole::Server, server));

        // Kill the parked occupant's peer; give the stack a moment
        drop(server_peer);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (replacement, _replacement_peer) = socket_pair().await;
        assert!(
            slot.occupy(TunnelRole::Server, replacement),
            "Dead occupant should be cleared for the newcomer"
        );
    }
}
