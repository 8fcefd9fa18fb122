//! Shared types module
//!
//! This module contains shared data types used throughout the application.

/// Identifier of a distributed process group (hub)
///
/// Hub ids are non-positive; positive ids denote modules hosted on a hub.
pub type HubId = i32;

/// MPI process index within a hub's local group
pub type Rank = i32;

/// Sentinel for an unset hub id
pub const INVALID_HUB: HubId = i32::MIN;

/// Upper bound on the number of bulk-data sockets kept per remote hub
pub const MAX_POOL_SIZE: usize = 12;
