//! Bulk-data distribution proxy
//!
//! Accepts bulk-data connections from local ranks and remote hubs,
//! establishes their role via the Identify handshake, and forwards
//! object messages between them by logical address. Remote hubs are
//! reached through pools of parallel sockets to amortize per-connection
//! throughput ceilings.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

use super::router::{DataConnection, Router};
use crate::common::error::{ProxyError, Result};
use crate::common::net;
use crate::common::types::{HubId, INVALID_HUB};
use crate::config::ProxyConfig;
use crate::directory::{num_ranks_or_one, HubDirectory};
use crate::message::{codec, Envelope, Identity, MessageKind};
use crate::tunnel::TunnelManager;

/// Which way messages read from a socket are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDirection {
    /// Socket belongs to a local rank; destinations resolve to remote hub pools
    ToRemote,
    /// Socket belongs to a remote hub; destinations resolve to local ranks
    ToLocal,
}

/// How a forwarded socket is registered in the routing table
#[derive(Debug, Clone, Copy)]
enum Registration {
    Local(i32),
    Remote(HubId),
}

/// Bulk-data distribution proxy for one hub
///
/// Construction binds the listener; [`DataProxy::set_hub_id`] activates
/// the accept loop. All spawned work is tracked and joined by
/// [`DataProxy::shutdown`].
pub struct DataProxy {
    config: Arc<ProxyConfig>,
    directory: Arc<dyn HubDirectory>,
    router: Router,
    /// Bound listener, parked until the accept loop takes it
    listener: StdMutex<Option<TcpListener>>,
    listen_port: u16,
    hub_id: AtomicI32,
    /// Sink for connections identifying as tunnel peers
    tunnel_manager: StdMutex<Option<Arc<TunnelManager>>>,
    shutdown_tx: watch::Sender<bool>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    down: AtomicBool,
}

impl DataProxy {
    /// Create a proxy and bind its listener
    ///
    /// The proxy only listens at this point; connections are not
    /// accepted until [`DataProxy::set_hub_id`] is called. When
    /// `port_increment` is configured, a busy base port moves binding
    /// to the next free port.
    ///
    /// # Parameters
    ///
    /// * `config` - Proxy configuration
    /// * `directory` - Hub address book used to resolve destinations
    pub async fn new(
        config: Arc<ProxyConfig>,
        directory: Arc<dyn HubDirectory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (listener, listen_port) =
            net::bind_with_increment(config.data_port, config.port_increment).await?;
        info!("Data proxy bound on port {}, not yet accepting", listen_port);

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            directory,
            router: Router::new(),
            listener: StdMutex::new(Some(listener)),
            listen_port,
            hub_id: AtomicI32::new(INVALID_HUB),
            tunnel_manager: StdMutex::new(None),
            shutdown_tx,
            handles: StdMutex::new(Vec::new()),
            accepting: AtomicBool::new(false),
            down: AtomicBool::new(false),
        }))
    }

    /// Port the proxy is listening on
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Hub id of this proxy, once assigned
    pub fn hub_id(&self) -> Option<HubId> {
        let id = self.hub_id.load(Ordering::SeqCst);
        (id != INVALID_HUB).then_some(id)
    }

    /// Routing table of this proxy
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Hand connections identifying as tunnel peers to a tunnel manager
    pub fn attach_tunnel_manager(&self, manager: Arc<TunnelManager>) {
        *self.tunnel_manager.lock().unwrap() = Some(manager);
    }

    /// Assign the hub id and activate the accept loop
    ///
    /// The first call arms the accept loop; later calls only update the
    /// advertised id.
    pub fn set_hub_id(self: &Arc<Self>, id: HubId) {
        self.hub_id.store(id, Ordering::SeqCst);

        if self.down.load(Ordering::SeqCst) {
            return;
        }

        if !self.accepting.swap(true, Ordering::SeqCst) {
            if let Some(listener) = self.listener.lock().unwrap().take() {
                info!("Data proxy for hub {} accepting on port {}", id, self.listen_port);
                let this = Arc::clone(self);
                self.spawn_task(async move { this.run_accept_loop(listener).await });
            }
        }
    }

    /// Open the bulk-data connection pool to a remote hub
    ///
    /// Resolves the hub through the directory and opens outbound
    /// sockets in parallel until the pool reaches its target size, each
    /// completing the Identify handshake. The whole batch is bounded by
    /// the configured connect deadline; attempts still in flight when
    /// it expires are cancelled.
    ///
    /// # Returns
    ///
    /// `Ok(true)` iff the pool is non-empty afterwards.
    pub async fn connect_remote_data(self: &Arc<Self>, hub: HubId) -> Result<bool> {
        let own = self
            .hub_id()
            .ok_or_else(|| ProxyError::Config("Hub id not assigned yet".to_string()))?;

        let data = match self.directory.hub_data(hub) {
            Some(data) => data,
            None => {
                warn!("Hub {} is not in the directory", hub);
                return Ok(false);
            }
        };

        let local_ranks = num_ranks_or_one(&*self.directory, own);
        let target = Router::target_pool_size(local_ranks, data.num_ranks);
        let existing = self.router.pool_size(hub);
        if existing >= target {
            return Ok(true);
        }

        let addr = net::resolve_host_port(&data.address, data.data_port).await?;
        debug!(
            "Opening {} bulk-data connections to hub {} at {}",
            target - existing,
            hub,
            addr
        );

        let attempts: Vec<_> = (existing..target)
            .map(|attempt| {
                let this = Arc::clone(self);
                async move {
                    if let Err(e) = this.connect_one(addr, hub).await {
                        warn!("Bulk-data connect {} to hub {} failed: {}", attempt, hub, e);
                    }
                }
            })
            .collect();

        let deadline = Duration::from_secs(self.config.connect_timeout);
        if timeout(deadline, join_all(attempts)).await.is_err() {
            warn!(
                "Connect deadline of {}s to hub {} expired, cancelling remaining attempts",
                self.config.connect_timeout, hub
            );
        }

        let pool = self.router.pool_size(hub);
        info!("Bulk-data pool for hub {}: {} of {} connections", hub, pool, target);
        Ok(pool > 0)
    }

    /// Exact-match lookup of the local rank socket for a message
    pub fn get_local_data_sock(&self, envelope: &Envelope) -> Option<DataConnection> {
        self.router.local_data_sock(envelope.header.dest_rank)
    }

    /// Pool lookup of the remote hub socket for a message
    ///
    /// The destination id resolves to a hub through the directory; the
    /// pool member is picked by destination rank.
    pub fn get_remote_data_sock(&self, envelope: &Envelope) -> Option<DataConnection> {
        let hub = self.directory.resolve_hub(envelope.header.dest_id)?;
        self.router.remote_data_sock(hub, envelope.header.dest_rank)
    }

    /// Stop accepting, tear down every connection, and join all tasks
    ///
    /// Idempotent; concurrent and repeated calls are no-ops.
    pub async fn shutdown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down data proxy on port {}", self.listen_port);
        let _ = self.shutdown_tx.send(true);

        // The listener may still be parked if the accept loop never started
        self.listener.lock().unwrap().take();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }

        self.router.clear();
        info!("Data proxy shutdown complete");
    }

    fn spawn_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);

        if self.down.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }

        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn check_version(&self, peer_version: u32, peer: SocketAddr) {
        if peer_version != self.config.protocol_version {
            warn!(
                "Serialization version mismatch with {}: local {}, peer {}",
                peer, self.config.protocol_version, peer_version
            );
        }
    }

    async fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted data connection from {}", peer);
                        let this = Arc::clone(&self);
                        tasks.spawn(async move {
                            if let Err(e) = this.serve_socket(stream, peer).await {
                                debug!("Connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Error accepting connection: {}", e),
                },

                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        error!("Connection task error: {}", e);
                    }
                }
            }
        }

        drop(listener);
        tasks.shutdown().await;
    }

    /// Establish an accepted connection's role and service it
    ///
    /// Sends an Identify request and waits for the single reply. A
    /// connection that stays silent past the connect deadline is
    /// dropped rather than held open.
    async fn serve_socket(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let own = self
            .hub_id()
            .ok_or_else(|| ProxyError::Config("Hub id not assigned yet".to_string()))?;
        let version = self.config.protocol_version;

        codec::send_message(&mut stream, &Envelope::identify(Identity::Request, version)?).await?;

        let idle = Duration::from_secs(self.config.connect_timeout);
        let reply = match timeout(idle, codec::recv_message(&mut stream)).await {
            Ok(received) => received?,
            Err(_) => {
                return Err(ProxyError::Protocol(format!(
                    "{} completed no Identify within {}s",
                    peer, self.config.connect_timeout
                )))
            }
        };

        let body = reply.decode_identify()?;
        self.check_version(body.protocol_version, peer);

        match body.identity {
            Identity::LocalBulkData { rank } => {
                let answer = Envelope::identify(Identity::RemoteBulkData { hub_id: own }, version)?;
                codec::send_message(&mut stream, &answer).await?;
                info!("Local rank {} connected from {}", rank, peer);

                let (rd, wr) = stream.into_split();
                let conn = DataConnection::new(wr, peer);
                if self.router.insert_local(rank, conn.clone()).is_some() {
                    warn!("Replaced existing bulk-data connection of rank {}", rank);
                }

                self.forward_loop(rd, conn, ForwardDirection::ToRemote, Registration::Local(rank))
                    .await;
                Ok(())
            }
            Identity::RemoteBulkData { hub_id } => {
                let answer = Envelope::identify(Identity::RemoteBulkData { hub_id: own }, version)?;
                codec::send_message(&mut stream, &answer).await?;
                info!("Remote hub {} connected from {}", hub_id, peer);

                let (rd, wr) = stream.into_split();
                let conn = DataConnection::new(wr, peer);
                self.router.insert_remote(hub_id, conn.clone());

                self.forward_loop(rd, conn, ForwardDirection::ToLocal, Registration::Remote(hub_id))
                    .await;
                Ok(())
            }
            identity @ (Identity::TunnelServer { .. } | Identity::TunnelClient { .. }) => {
                let manager = self.tunnel_manager.lock().unwrap().clone();
                match manager {
                    Some(manager) => {
                        if !manager.add_socket(&identity, stream).await {
                            warn!("Tunnel rendezvous rejected {:?} from {}", identity, peer);
                        }
                        Ok(())
                    }
                    None => Err(ProxyError::Protocol(format!(
                        "No tunnel manager attached, dropping {:?} from {}",
                        identity, peer
                    ))),
                }
            }
            Identity::Request => Err(ProxyError::Protocol(format!(
                "{} answered the Identify request with a request",
                peer
            ))),
        }
    }

    /// Open one outbound pool connection to a remote hub
    async fn connect_one(self: &Arc<Self>, addr: SocketAddr, hub: HubId) -> Result<()> {
        let own = self
            .hub_id()
            .ok_or_else(|| ProxyError::Config("Hub id not assigned yet".to_string()))?;
        let version = self.config.protocol_version;

        let mut stream = TcpStream::connect(addr).await.map_err(ProxyError::Io)?;
        let peer = stream.peer_addr().map_err(ProxyError::Io)?;

        // The acceptor speaks first with an Identify request
        let request = codec::recv_message(&mut stream).await?;
        let body = request.decode_identify()?;
        if body.identity != Identity::Request {
            return Err(ProxyError::Protocol(format!(
                "Expected Identify request from {}, got {:?}",
                peer, body.identity
            )));
        }
        self.check_version(body.protocol_version, peer);

        let identify = Envelope::identify(Identity::RemoteBulkData { hub_id: own }, version)?;
        codec::send_message(&mut stream, &identify).await?;

        // Return handshake from the acceptor completes the exchange
        let answer = codec::recv_message(&mut stream).await?;
        match answer.decode_identify()?.identity {
            Identity::RemoteBulkData { hub_id } if hub_id == hub => {}
            other => warn!(
                "Hub {} at {} answered handshake as {:?}",
                hub, peer, other
            ),
        }

        let (rd, wr) = stream.into_split();
        let conn = DataConnection::new(wr, peer);
        self.router.insert_remote(hub, conn.clone());

        let this = Arc::clone(self);
        self.spawn_task(async move {
            this.forward_loop(rd, conn, ForwardDirection::ToLocal, Registration::Remote(hub))
                .await;
        });

        Ok(())
    }

    /// Per-socket read/route loop
    ///
    /// One read is outstanding at a time, re-armed after each dispatch,
    /// preserving per-peer message order. Exits on read error, peer
    /// close, or proxy shutdown; the socket's table entry is removed on
    /// the way out.
    async fn forward_loop(
        self: Arc<Self>,
        mut rd: OwnedReadHalf,
        conn: DataConnection,
        direction: ForwardDirection,
        registration: Registration,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let peer = conn.peer();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,

                received = codec::recv_message(&mut rd) => match received {
                    Ok(envelope) => self.dispatch(envelope, direction, &conn).await,
                    Err(ProxyError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        debug!("Bulk-data peer {} closed the connection", peer);
                        break;
                    }
                    Err(e) => {
                        warn!("Read error on bulk-data connection {}: {}", peer, e);
                        break;
                    }
                }
            }
        }

        match registration {
            Registration::Local(rank) => self.router.remove_local(rank, peer),
            Registration::Remote(hub) => self.router.remove_remote(hub, peer),
        }
    }

    /// Dispatch one received message
    ///
    /// Identify requests are answered in place; everything else is
    /// routed by destination, with unrecognized types forwarded
    /// unchanged.
    async fn dispatch(&self, envelope: Envelope, direction: ForwardDirection, reply: &DataConnection) {
        match envelope.kind() {
            MessageKind::Identify => match envelope.decode_identify() {
                Ok(body) if body.identity == Identity::Request => {
                    self.check_version(body.protocol_version, reply.peer());
                    let Some(own) = self.hub_id() else { return };
                    let answer = Envelope::identify(
                        Identity::RemoteBulkData { hub_id: own },
                        self.config.protocol_version,
                    );
                    match answer {
                        Ok(answer) => {
                            if let Err(e) = reply.send(&answer).await {
                                warn!("Failed to answer identify from {}: {}", reply.peer(), e);
                            }
                        }
                        Err(e) => warn!("Failed to encode identify answer: {}", e),
                    }
                }
                Ok(body) => {
                    debug!("Ignoring identify {:?} from {}", body.identity, reply.peer())
                }
                Err(e) => warn!("Malformed identify from {}: {}", reply.peer(), e),
            },
            kind => {
                if let MessageKind::Unknown(tag) = kind {
                    debug!("Forwarding message of unknown type {} unchanged", tag);
                }
                self.route(envelope, direction).await;
            }
        }
    }

    /// Route one message to its destination socket
    ///
    /// A missing destination drops the message; a failed write tears
    /// down only the destination connection.
    async fn route(&self, envelope: Envelope, direction: ForwardDirection) {
        let header = envelope.header;

        let dest = match direction {
            ForwardDirection::ToLocal => self
                .router
                .local_data_sock(header.dest_rank)
                .map(|conn| (conn, None)),
            ForwardDirection::ToRemote => match self.directory.resolve_hub(header.dest_id) {
                Some(hub) => self
                    .router
                    .remote_data_sock(hub, header.dest_rank)
                    .map(|conn| (conn, Some(hub))),
                None => None,
            },
        };

        match dest {
            Some((conn, hub)) => {
                if let Err(e) = conn.send(&envelope).await {
                    warn!(
                        "Write to bulk-data peer {} failed, dropping it: {}",
                        conn.peer(),
                        e
                    );
                    match hub {
                        Some(hub) => self.router.remove_remote(hub, conn.peer()),
                        None => self.router.remove_local(header.dest_rank, conn.peer()),
                    }
                }
            }
            None => warn!(
                "No route for message type {} to id {} rank {}, dropping payload",
                header.msg_type, header.dest_id, header.dest_rank
            ),
        }
    }
}
