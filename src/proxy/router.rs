//! Routing table
//!
//! Maps destinations to bulk-data sockets: remote hubs to pools of
//! connections, local ranks to single connections. The table is an
//! owned object with internal synchronization; the lock guards table
//! access only and is never held across I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::net::tcp::OwnedWriteHalf;

use crate::common::error::Result;
use crate::common::types::{HubId, Rank, MAX_POOL_SIZE};
use crate::message::{codec, Envelope};

/// Write side of a registered bulk-data connection
///
/// Cloning shares the underlying socket; writes from concurrent
/// forwarders serialize on the inner lock so frames never interleave.
#[derive(Clone)]
pub struct DataConnection {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    peer: SocketAddr,
}

impl DataConnection {
    pub(crate) fn new(writer: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            peer,
        }
    }

    /// Peer address of the underlying socket
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one message on this connection
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let mut writer = self.writer.lock().await;
        codec::send_message(&mut *writer, envelope).await
    }
}

impl std::fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConnection")
            .field("peer", &self.peer)
            .finish()
    }
}

#[derive(Default)]
struct RouterState {
    /// Remote hub id -> pool of bulk-data connections
    hub_pools: HashMap<HubId, Vec<DataConnection>>,
    /// Local rank -> its single bulk-data connection
    local_ranks: HashMap<Rank, DataConnection>,
}

/// Routing table for one proxy instance
#[derive(Default)]
pub struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    /// Create an empty routing table
    pub fn new() -> Self {
        Self::default()
    }

    /// Target pool size for a remote hub
    ///
    /// One connection per rank on the larger side, at least one,
    /// capped at [`MAX_POOL_SIZE`].
    pub fn target_pool_size(local_ranks: usize, remote_ranks: usize) -> usize {
        local_ranks.max(remote_ranks).max(1).min(MAX_POOL_SIZE)
    }

    /// Register the connection of a local rank
    ///
    /// # Returns
    ///
    /// The previously registered connection for that rank, if any.
    pub fn insert_local(&self, rank: Rank, conn: DataConnection) -> Option<DataConnection> {
        debug!("Registering local rank {} from {}", rank, conn.peer());
        self.state.lock().unwrap().local_ranks.insert(rank, conn)
    }

    /// Add a connection to a remote hub's pool
    pub fn insert_remote(&self, hub: HubId, conn: DataConnection) {
        debug!("Adding connection to hub {} pool from {}", hub, conn.peer());
        self.state
            .lock()
            .unwrap()
            .hub_pools
            .entry(hub)
            .or_default()
            .push(conn);
    }

    /// Remove a local rank's connection if it still refers to `peer`
    pub fn remove_local(&self, rank: Rank, peer: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        if state
            .local_ranks
            .get(&rank)
            .map(|conn| conn.peer() == peer)
            .unwrap_or(false)
        {
            state.local_ranks.remove(&rank);
            debug!("Removed local rank {} ({})", rank, peer);
        }
    }

    /// Remove a connection from a remote hub's pool
    pub fn remove_remote(&self, hub: HubId, peer: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        if let Some(pool) = state.hub_pools.get_mut(&hub) {
            pool.retain(|conn| conn.peer() != peer);
            if pool.is_empty() {
                state.hub_pools.remove(&hub);
            }
            debug!("Removed {} from hub {} pool", peer, hub);
        }
    }

    /// Exact-match lookup of a local rank's connection
    pub fn local_data_sock(&self, dest_rank: Rank) -> Option<DataConnection> {
        self.state
            .lock()
            .unwrap()
            .local_ranks
            .get(&dest_rank)
            .cloned()
    }

    /// Pick a connection from a remote hub's pool
    ///
    /// Selection is `max(0, dest_rank) % pool_size`, spreading rank
    /// traffic across the pool deterministically.
    pub fn remote_data_sock(&self, hub: HubId, dest_rank: Rank) -> Option<DataConnection> {
        let state = self.state.lock().unwrap();
        let pool = state.hub_pools.get(&hub)?;
        if pool.is_empty() {
            return None;
        }

        let index = dest_rank.max(0) as usize % pool.len();
        Some(pool[index].clone())
    }

    /// Current pool size for a remote hub
    pub fn pool_size(&self, hub: HubId) -> usize {
        self.state
            .lock()
            .unwrap()
            .hub_pools
            .get(&hub)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of registered local ranks
    pub fn local_count(&self) -> usize {
        self.state.lock().unwrap().local_ranks.len()
    }

    /// Drop every registered connection
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.hub_pools.clear();
        state.local_ranks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_connection() -> DataConnection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        // Keep the accepted side alive for the duration of the test
        std::mem::forget(accepted.unwrap());
        let peer = stream.as_ref().unwrap().local_addr().unwrap();
        let (_rd, wr) = stream.unwrap().into_split();
        DataConnection::new(wr, peer)
    }

    #[test]
    fn test_target_pool_size() {
        assert_eq!(Router::target_pool_size(0, 0), 1);
        assert_eq!(Router::target_pool_size(1, 4), 4);
        assert_eq!(Router::target_pool_size(8, 2), 8);
        assert_eq!(Router::target_pool_size(64, 3), MAX_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_rank_mod_selection_is_stable() {
        let router = Router::new();
        for _ in 0..3 {
            router.insert_remote(-2, test_connection().await);
        }
        let pool_size = router.pool_size(-2) as Rank;
        assert_eq!(pool_size, 3);

        // Ranks r and r + pool_size map to the same socket
        for rank in 0..pool_size {
            let a = router.remote_data_sock(-2, rank).unwrap();
            let b = router.remote_data_sock(-2, rank + pool_size).unwrap();
            assert_eq!(a.peer(), b.peer());
        }

        // Negative ranks clamp to index zero
        let neg = router.remote_data_sock(-2, -1).unwrap();
        let zero = router.remote_data_sock(-2, 0).unwrap();
        assert_eq!(neg.peer(), zero.peer());
    }

    #[tokio::test]
    async fn test_local_exact_match() {
        let router = Router::new();
        let conn = test_connection().await;
        let peer = conn.peer();
        assert!(router.insert_local(1, conn).is_none());

        assert_eq!(router.local_data_sock(1).unwrap().peer(), peer);
        assert!(router.local_data_sock(2).is_none());

        // Removal guarded by peer identity
        let other = test_connection().await;
        router.remove_local(1, other.peer());
        assert!(router.local_data_sock(1).is_some());
        router.remove_local(1, peer);
        assert!(router.local_data_sock(1).is_none());
    }

    #[tokio::test]
    async fn test_pool_shrinks_on_removal() {
        let router = Router::new();
        let conn = test_connection().await;
        let peer = conn.peer();
        router.insert_remote(-3, conn);
        router.insert_remote(-3, test_connection().await);
        assert_eq!(router.pool_size(-3), 2);

        router.remove_remote(-3, peer);
        assert_eq!(router.pool_size(-3), 1);
        assert!(router.remote_data_sock(-3, 5).is_some());
    }
}
