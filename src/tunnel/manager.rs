//! Tunnel orchestration
//!
//! The manager owns every listen-rule tunnel and the rendezvous
//! registry pairing independently-connecting peers into bridged
//! streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::rendezvous::{RendezvousKey, RendezvousSlot};
use super::stream::TunnelStream;
use super::tunnel::Tunnel;
use crate::common::buffer_pool::BufferPool;
use crate::common::error::{ProxyError, Result};
use crate::common::net;
use crate::config::ProxyConfig;
use crate::message::{codec, Envelope, Identity, TunnelRole};

/// Request to create or remove a listen-rule tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// Remove the tunnel on `src_port` instead of creating one
    pub remove: bool,
    /// Port to listen on (0 selects an ephemeral port on creation)
    pub src_port: u16,
    /// Destination host, literal address or DNS name
    pub dest_host: String,
    /// Destination port
    pub dest_port: u16,
}

impl TunnelRequest {
    /// Request a new tunnel from `src_port` to `dest_host:dest_port`
    pub fn add(src_port: u16, dest_host: impl Into<String>, dest_port: u16) -> Self {
        Self {
            remove: false,
            src_port,
            dest_host: dest_host.into(),
            dest_port,
        }
    }

    /// Request removal of the tunnel on `src_port`
    pub fn remove(src_port: u16) -> Self {
        Self {
            remove: true,
            src_port,
            dest_host: String::new(),
            dest_port: 0,
        }
    }
}

/// Owner of all tunnels and rendezvous state for one proxy instance
pub struct TunnelManager {
    pool: BufferPool,
    /// Listen port -> tunnel; serialized request processing
    tunnels: Mutex<HashMap<u16, Arc<Tunnel>>>,
    /// Pairing key -> slot; lock guards table access only
    registry: StdMutex<HashMap<RendezvousKey, RendezvousSlot>>,
    down: AtomicBool,
}

impl TunnelManager {
    /// Create a manager with a bridge-buffer pool sized from the configuration
    pub fn new(config: Arc<ProxyConfig>) -> Arc<Self> {
        let pool = BufferPool::new(config.max_tunnel_buffers, config.buffer_size);

        Arc::new(Self {
            pool,
            tunnels: Mutex::new(HashMap::new()),
            registry: StdMutex::new(HashMap::new()),
            down: AtomicBool::new(false),
        })
    }

    /// Create or remove a tunnel
    ///
    /// Creation rejects a port that already has a tunnel, resolves the
    /// destination (literal or DNS), binds the listeners, and arms the
    /// accept loop; bind failure is raised to the requester. Removal
    /// shuts the tunnel down and erases it. Dead-stream bookkeeping is
    /// compacted before and after.
    ///
    /// # Returns
    ///
    /// The listen port of the tunnel created or removed.
    pub async fn process_request(&self, request: TunnelRequest) -> Result<u16> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ProxyError::Tunnel("Tunnel manager is shut down".to_string()));
        }

        self.cleanup_streams().await;

        let result = if request.remove {
            self.remove_tunnel(request.src_port).await
        } else {
            self.add_tunnel(&request).await
        };

        self.cleanup_streams().await;
        result
    }

    /// Park a socket for rendezvous pairing
    ///
    /// The identity must be a tunnel role carrying the pairing key. The
    /// first arrival per role is parked (a dead occupant is cleared
    /// first); a second arrival for an occupied role is rejected
    /// without disturbing the occupant. When both roles are present,
    /// each peer is sent its role-tailored TunnelEstablished message
    /// and the pair is bridged.
    ///
    /// # Returns
    ///
    /// Whether the socket was accepted (parked or bridged).
    pub async fn add_socket(&self, identity: &Identity, stream: TcpStream) -> bool {
        if self.down.load(Ordering::SeqCst) {
            return false;
        }

        let (key, role) = match *identity {
            Identity::TunnelServer { tunnel_id, stream_nr } => (
                RendezvousKey { tunnel_id, stream_nr },
                TunnelRole::Server,
            ),
            Identity::TunnelClient { tunnel_id, stream_nr } => (
                RendezvousKey { tunnel_id, stream_nr },
                TunnelRole::Client,
            ),
            ref other => {
                warn!("Not a tunnel identity: {:?}", other);
                return false;
            }
        };

        // Park or reject under the lock, never across I/O
        let pair = {
            let mut registry = self.registry.lock().unwrap();
            let slot = registry.entry(key).or_default();

            if !slot.occupy(role, stream) {
                debug!("Rendezvous {}: {} slot already occupied", key, role);
                return false;
            }

            if !slot.is_complete() {
                debug!("Rendezvous {}: parked {} side", key, role);
                return true;
            }

            let pair = slot.take_pair();
            // Terminal from here on; no second pair can form for this key
            slot.mark_bridged(std::sync::Weak::new());
            pair
        };

        let Some((server, client)) = pair else {
            return true;
        };

        self.bridge_pair(key, server, client).await
    }

    /// Tunnel listening on `port`, if any
    pub async fn tunnel(&self, port: u16) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().await.get(&port).cloned()
    }

    /// Number of active tunnels
    pub async fn tunnel_count(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    /// Number of rendezvous slots currently tracked
    pub fn rendezvous_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Shut down every tunnel and drop all rendezvous state
    ///
    /// Parked sockets are closed; bridged streams are destroyed.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down tunnel manager");

        let tunnels: Vec<_> = self.tunnels.lock().await.drain().collect();
        for (_, tunnel) in tunnels {
            tunnel.shutdown().await;
        }

        let slots: Vec<_> = {
            let mut registry = self.registry.lock().unwrap();
            registry.drain().collect()
        };
        for (_, slot) in slots {
            // Parked sockets drop with the slot; live bridges close here
            if let Some(stream) = slot.bridged_stream() {
                stream.destroy().await;
            }
        }

        info!("Tunnel manager shutdown complete");
    }

    async fn add_tunnel(&self, request: &TunnelRequest) -> Result<u16> {
        let mut tunnels = self.tunnels.lock().await;

        if request.src_port != 0 && tunnels.contains_key(&request.src_port) {
            return Err(ProxyError::Tunnel(format!(
                "Port {} already has a tunnel",
                request.src_port
            )));
        }

        let dest = net::resolve_host_port(&request.dest_host, request.dest_port).await?;
        let tunnel = Tunnel::new(request.src_port, dest, self.pool.clone())?;
        tunnel.start_accept();

        let port = tunnel.listen_port();
        tunnels.insert(port, tunnel);
        info!("Created tunnel from port {} to {}", port, dest);
        Ok(port)
    }

    async fn remove_tunnel(&self, port: u16) -> Result<u16> {
        let tunnel = self.tunnels.lock().await.remove(&port);

        match tunnel {
            Some(tunnel) => {
                tunnel.shutdown().await;
                info!("Removed tunnel on port {}", port);
                Ok(port)
            }
            None => Err(ProxyError::Tunnel(format!("No tunnel on port {}", port))),
        }
    }

    /// Notify both rendezvous peers and bridge them
    async fn bridge_pair(&self, key: RendezvousKey, mut server: TcpStream, mut client: TcpStream) -> bool {
        let established = |role: TunnelRole| Envelope::tunnel_established(role);

        let notify_server = async {
            codec::send_message(&mut server, &established(TunnelRole::Server)?).await
        };
        let notify_client = async {
            codec::send_message(&mut client, &established(TunnelRole::Client)?).await
        };

        if let Err(e) = futures::try_join!(notify_server, notify_client) {
            warn!("Rendezvous {}: peer notification failed: {}", key, e);
            return false;
        }

        let Some(buf_a) = self.pool.try_get_buffer() else {
            warn!("Rendezvous {}: buffer pool exhausted", key);
            return false;
        };
        let Some(buf_b) = self.pool.try_get_buffer() else {
            warn!("Rendezvous {}: buffer pool exhausted", key);
            return false;
        };

        let stream = TunnelStream::new(server, client, buf_a, buf_b);
        stream.start();

        self.registry
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .mark_bridged(Arc::downgrade(&stream));
        info!("Rendezvous {}: bridged as stream {}", key, stream.id());
        true
    }

    async fn cleanup_streams(&self) {
        {
            let tunnels = self.tunnels.lock().await;
            for tunnel in tunnels.values() {
                tunnel.prune_streams();
            }
        }

        self.registry
            .lock()
            .unwrap()
            .retain(|_, slot| !slot.is_dead());
    }
}
