//! Data proxy module
//!
//! This module implements the bulk-data distribution proxy: the routing
//! table mapping logical addresses to sockets, and the proxy that
//! accepts, identifies, and forwards between them.

pub mod router;

mod data_proxy;

pub use data_proxy::{DataProxy, ForwardDirection};
pub use router::{DataConnection, Router};
