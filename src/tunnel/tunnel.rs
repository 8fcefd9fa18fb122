//! Single listen-rule tunnel
//!
//! A [`Tunnel`] listens on one port (IPv4 and IPv6) and bridges every
//! accepted connection to a fixed destination address.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::stream::TunnelStream;
use crate::common::buffer_pool::BufferPool;
use crate::common::error::Result;
use crate::common::net;

/// One listen-rule: accept on a port, forward to a fixed destination
pub struct Tunnel {
    listen_port: u16,
    dest: SocketAddr,
    /// Bound listeners, parked until `start_accept` takes them
    listeners: StdMutex<Option<(Option<TcpListener>, Option<TcpListener>)>>,
    /// Weak handles to live bridged streams; compacted by the owner
    streams: StdMutex<Vec<Weak<TunnelStream>>>,
    pool: BufferPool,
    shutdown_tx: watch::Sender<bool>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    down: AtomicBool,
}

impl Tunnel {
    /// Bind the tunnel's listeners
    ///
    /// Binds IPv4 and IPv6 on `listen_port` (0 selects an ephemeral
    /// port shared by both families). Failure to bind any family at all
    /// is raised to the requester.
    pub fn new(listen_port: u16, dest: SocketAddr, pool: BufferPool) -> Result<Arc<Self>> {
        let (v4, v6, port) = net::bind_dual_stack(listen_port)?;
        info!("Tunnel on port {} forwarding to {}", port, dest);

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            listen_port: port,
            dest,
            listeners: StdMutex::new(Some((v4, v6))),
            streams: StdMutex::new(Vec::new()),
            pool,
            shutdown_tx,
            handles: StdMutex::new(Vec::new()),
            down: AtomicBool::new(false),
        }))
    }

    /// Port the tunnel listens on
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Fixed destination of this tunnel
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Arm the accept loop on every bound listener
    pub fn start_accept(self: &Arc<Self>) {
        let listeners = match self.listeners.lock().unwrap().take() {
            Some((v4, v6)) => [v4, v6],
            None => return,
        };

        for listener in listeners.into_iter().flatten() {
            let this = Arc::clone(self);
            self.track(tokio::spawn(this.run_accept(listener)));
        }
    }

    /// Drop bookkeeping for streams that have ended
    pub fn prune_streams(&self) {
        self.streams
            .lock()
            .unwrap()
            .retain(|weak| weak.strong_count() > 0);
    }

    /// Currently live bridged streams
    pub fn live_streams(&self) -> Vec<Arc<TunnelStream>> {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Stop accepting and tear down every bridged stream
    ///
    /// Accepted-but-unbridged sockets are closed as their bridge tasks
    /// unwind. Idempotent.
    pub async fn shutdown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down tunnel on port {}", self.listen_port);
        let _ = self.shutdown_tx.send(true);

        // Listeners are still parked if accept never started
        self.listeners.lock().unwrap().take();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }

        let streams = self.live_streams();
        for stream in streams {
            stream.destroy().await;
        }
        self.streams.lock().unwrap().clear();
    }

    fn track(&self, handle: JoinHandle<()>) {
        if self.down.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }

        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    async fn run_accept(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Tunnel port {}: accepted {}", self.listen_port, peer);
                        // Bridge in its own task so the listener re-arms immediately
                        let this = Arc::clone(&self);
                        self.track(tokio::spawn(this.bridge(stream, peer)));
                    }
                    Err(e) => error!("Tunnel port {}: accept error: {}", self.listen_port, e),
                }
            }
        }
    }

    /// Connect the outbound side and bridge the pair
    ///
    /// A failed outbound connect closes the accepted socket too; no
    /// stream is created.
    async fn bridge(self: Arc<Self>, inbound: TcpStream, peer: SocketAddr) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return;
        }

        let outbound = tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("Tunnel port {}: dropping {} during shutdown", self.listen_port, peer);
                return;
            }
            connected = TcpStream::connect(self.dest) => match connected {
                Ok(outbound) => outbound,
                Err(e) => {
                    warn!(
                        "Tunnel port {}: connect to {} failed, closing {}: {}",
                        self.listen_port, self.dest, peer, e
                    );
                    return;
                }
            }
        };

        let Some(buf_a) = self.pool.try_get_buffer() else {
            warn!("Tunnel port {}: buffer pool exhausted, closing {}", self.listen_port, peer);
            return;
        };
        let Some(buf_b) = self.pool.try_get_buffer() else {
            warn!("Tunnel port {}: buffer pool exhausted, closing {}", self.listen_port, peer);
            return;
        };

        let stream = TunnelStream::new(inbound, outbound, buf_a, buf_b);
        stream.start();
        self.streams.lock().unwrap().push(Arc::downgrade(&stream));
        debug!(
            "Tunnel port {}: bridged {} to {} as stream {}",
            self.listen_port,
            peer,
            self.dest,
            stream.id()
        );
    }
}
