//! Hub directory collaborator
//!
//! The proxy resolves hub addresses and message destinations through a
//! read-only directory maintained elsewhere (the hub's address book).
//! This module defines the seam and a map-backed implementation for
//! embedding and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::common::types::HubId;

/// Connection parameters of a hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubData {
    /// Host the hub's data proxy listens on
    pub address: String,
    /// Port of the hub's bulk-data listener
    pub data_port: u16,
    /// Number of ranks the hub hosts
    pub num_ranks: usize,
}

/// Read-only hub address book
pub trait HubDirectory: Send + Sync + 'static {
    /// Look up connection parameters for a hub
    fn hub_data(&self, hub: HubId) -> Option<HubData>;

    /// Map a message destination id to the hub hosting it
    ///
    /// Non-positive ids are hub ids; positive ids are module ids and
    /// resolve through the module table.
    fn resolve_hub(&self, dest_id: i32) -> Option<HubId>;
}

/// Map-backed [`HubDirectory`]
///
/// Entries are added as hubs and modules become known; lookups clone
/// out small records so no lock is held by callers.
#[derive(Default)]
pub struct StaticDirectory {
    hubs: RwLock<HashMap<HubId, HubData>>,
    modules: RwLock<HashMap<i32, HubId>>,
}

impl StaticDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hub's connection parameters
    pub fn add_hub(&self, hub: HubId, data: HubData) {
        self.hubs.write().unwrap().insert(hub, data);
    }

    /// Record which hub hosts a module id
    pub fn map_module(&self, module_id: i32, hub: HubId) {
        self.modules.write().unwrap().insert(module_id, hub);
    }

    /// Number of known hubs
    pub fn hub_count(&self) -> usize {
        self.hubs.read().unwrap().len()
    }
}

impl HubDirectory for StaticDirectory {
    fn hub_data(&self, hub: HubId) -> Option<HubData> {
        self.hubs.read().unwrap().get(&hub).cloned()
    }

    fn resolve_hub(&self, dest_id: i32) -> Option<HubId> {
        if dest_id <= 0 {
            return Some(dest_id);
        }

        self.modules.read().unwrap().get(&dest_id).copied()
    }
}

/// Number of ranks a hub hosts, defaulting to one when unknown
pub fn num_ranks_or_one(directory: &dyn HubDirectory, hub: HubId) -> usize {
    directory
        .hub_data(hub)
        .map(|data| data.num_ranks.max(1))
        .unwrap_or(1)
}
