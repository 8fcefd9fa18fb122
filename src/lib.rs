//! Hub Proxy: bulk-data distribution and TCP tunnelling for hub networks
//!
//! This library multiplexes, routes, and bridges byte streams between
//! processes that may not have direct network reachability. It provides
//! two cooperating cores:
//!
//! # Main Features
//!
//! - [`DataProxy`]: accepts bulk-data connections from local ranks and
//!   remote hubs, establishes their role with the Identify handshake,
//!   and forwards object messages by logical address over per-hub
//!   connection pools
//! - [`TunnelManager`]: listen-rule tunnels bridging accepted
//!   connections to a fixed destination, and rendezvous pairing of
//!   independently-connecting peers into bridged [`TunnelStream`]s
//! - Connection-pool fan-out with a bounded connect deadline
//! - All-or-nothing stream teardown and idempotent shutdown
//!
//! # Example
//!
//! ```no_run
//! use hub_proxy::{DataProxy, TunnelManager, Result};
//! use hub_proxy::config::ProxyConfig;
//! use hub_proxy::directory::{HubData, StaticDirectory};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Arc::new(ProxyConfig::default());
//!
//!     let directory = Arc::new(StaticDirectory::new());
//!     directory.add_hub(-2, HubData {
//!         address: "hub-b.example.net".to_string(),
//!         data_port: 31094,
//!         num_ranks: 4,
//!     });
//!
//!     // Bind, then activate the accept loop under our hub id
//!     let proxy = DataProxy::new(Arc::clone(&config), directory).await?;
//!     proxy.set_hub_id(-1);
//!
//!     // Tunnel peers arriving on the data port are handed over
//!     let tunnels = TunnelManager::new(config);
//!     proxy.attach_tunnel_manager(Arc::clone(&tunnels));
//!
//!     // Open the bulk-data pool to hub -2
//!     if !proxy.connect_remote_data(-2).await? {
//!         eprintln!("no connection to hub -2");
//!     }
//!
//!     // ... run until told otherwise ...
//!
//!     tunnels.shutdown().await;
//!     proxy.shutdown().await;
//!     Ok(())
//! }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod directory;
pub mod message;
pub mod proxy;
pub mod tunnel;

// Re-export commonly used structures and functions for convenience
pub use common::{init_logger, parse_socket_addr, HubId, ProxyError, Rank, Result};
pub use proxy::{DataProxy, ForwardDirection, Router};
pub use tunnel::{Tunnel, TunnelManager, TunnelRequest, TunnelStream};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
