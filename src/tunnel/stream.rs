//! Bridged socket pair
//!
//! A [`TunnelStream`] shuttles bytes between two sockets, one fixed
//! buffer per direction. Each direction runs a strict read, write,
//! read cycle, so at most one buffer of unacknowledged bytes is in
//! flight per direction. Teardown is all-or-nothing: an error on
//! either side closes both.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::common::buffer_pool::PooledBuffer;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

struct StreamParts {
    a: TcpStream,
    b: TcpStream,
    buf_a: PooledBuffer,
    buf_b: PooledBuffer,
}

/// One bridged pair of sockets
///
/// The stream is kept alive by its own pump tasks; external holders
/// keep weak references and observe liveness through them and
/// [`TunnelStream::good`].
pub struct TunnelStream {
    id: u64,
    good: AtomicBool,
    started: AtomicBool,
    close_tx: watch::Sender<bool>,
    /// Sockets and buffers, consumed by `start`
    parts: StdMutex<Option<StreamParts>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl TunnelStream {
    /// Create a stream over a pair of sockets
    ///
    /// Each side gets one of the supplied buffers for its read
    /// direction. The stream does nothing until `start` is called.
    pub fn new(a: TcpStream, b: TcpStream, buf_a: PooledBuffer, buf_b: PooledBuffer) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);

        Arc::new(Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            good: AtomicBool::new(true),
            started: AtomicBool::new(false),
            close_tx,
            parts: StdMutex::new(Some(StreamParts { a, b, buf_a, buf_b })),
            handles: StdMutex::new(Vec::new()),
        })
    }

    /// Identifier for log correlation
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the bridge is still intact
    pub fn good(&self) -> bool {
        self.good.load(Ordering::SeqCst)
    }

    /// Start both pump directions
    ///
    /// Must be called exactly once; repeated calls are ignored with a
    /// warning.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Stream {} started more than once", self.id);
            return;
        }

        let parts = match self.parts.lock().unwrap().take() {
            Some(parts) => parts,
            None => return,
        };

        let (a_rd, a_wr) = parts.a.into_split();
        let (b_rd, b_wr) = parts.b.into_split();

        let mut handles = self.handles.lock().unwrap();
        let this = Arc::clone(self);
        handles.push(tokio::spawn(this.pump("a->b", a_rd, b_wr, parts.buf_a)));
        let this = Arc::clone(self);
        handles.push(tokio::spawn(this.pump("b->a", b_rd, a_wr, parts.buf_b)));
    }

    /// Tear the bridge down
    ///
    /// Closes both sockets together and waits for the pumps to finish.
    /// Safe to call repeatedly and on streams that never started.
    pub async fn destroy(&self) {
        self.good.store(false, Ordering::SeqCst);
        let _ = self.close_tx.send(true);

        // Sockets of a never-started stream are dropped here
        self.parts.lock().unwrap().take();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// One direction of the bridge
    ///
    /// Reads into the fixed buffer, writes the bytes just read to the
    /// opposite side, then re-arms the read. Any error, or the peer
    /// closing, tears down both directions.
    async fn pump(
        self: Arc<Self>,
        label: &'static str,
        mut rd: OwnedReadHalf,
        mut wr: OwnedWriteHalf,
        mut buf: PooledBuffer,
    ) {
        let mut close_rx = self.close_tx.subscribe();
        let capacity = buf.buffer.capacity().max(1);
        buf.buffer.resize(capacity, 0);

        loop {
            if *close_rx.borrow() {
                break;
            }

            let n = tokio::select! {
                _ = close_rx.changed() => break,
                read = rd.read(&mut buf.buffer[..]) => match read {
                    Ok(0) => {
                        debug!("Stream {} {}: peer closed", self.id, label);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Stream {} {}: read error: {}", self.id, label, e);
                        break;
                    }
                }
            };

            tokio::select! {
                _ = close_rx.changed() => break,
                written = wr.write_all(&buf.buffer[..n]) => {
                    if let Err(e) = written {
                        debug!("Stream {} {}: write error: {}", self.id, label, e);
                        break;
                    }
                }
            }
        }

        // All-or-nothing: either direction ending closes both sides
        self.good.store(false, Ordering::SeqCst);
        let _ = self.close_tx.send(true);
        let _ = wr.shutdown().await;
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.id)
            .field("good", &self.good())
            .finish()
    }
}
