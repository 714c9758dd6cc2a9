// CHAIN NODE RECORD
// Per-ledger connection state: ordered endpoint pool, failover cursor,
// observed height and sync status.
//
// INVARIANTS:
// 1. A chain node is never removed; it degrades to Unreachable instead
// 2. The endpoint cursor only moves forward until an explicit recovery
// 3. The fallback endpoint is used only after every ordered endpoint failed

use crate::error::ConfigurationError;
use crate::types::{ChainId, ShardId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sync status of a chain as observed by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Connected, height not yet confirmed on the current endpoint
    Syncing,
    /// Height observed and not regressing
    Synced,
    /// Every endpoint, fallback included, has failed
    Unreachable,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Syncing => write!(f, "SYNCING"),
            SyncStatus::Synced => write!(f, "SYNCED"),
            SyncStatus::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// Result of reporting an endpoint failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAdvance {
    /// Moved to the next endpoint of the ordered list
    Advanced { endpoint: String },
    /// Ordered list exhausted, now on the designated fallback
    Degraded { endpoint: String },
    /// Fallback failed too (or none configured)
    Unreachable,
    /// The reported endpoint is no longer the active one
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub name: String,
    pub chain_id: ChainId,
    /// Primary first, then backups in failover order
    pub endpoints: Vec<String>,
    pub fallback_endpoint: Option<String>,
    /// Index into `endpoints` while not on the fallback
    pub active_index: usize,
    pub on_fallback: bool,
    pub degraded: bool,
    pub height: u64,
    pub status: SyncStatus,
    pub shards: Vec<ShardId>,
}

impl ChainNode {
    pub fn new(
        name: impl Into<String>,
        endpoints: Vec<String>,
        fallback_endpoint: Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if endpoints.is_empty() {
            return Err(ConfigurationError::EmptyEndpoints { chain: name });
        }

        Ok(ChainNode {
            chain_id: ChainId::new(name.clone()),
            name,
            endpoints,
            fallback_endpoint,
            active_index: 0,
            on_fallback: false,
            degraded: false,
            height: 0,
            status: SyncStatus::Syncing,
            shards: Vec::new(),
        })
    }

    /// The endpoint calls should currently go to, if any.
    pub fn current_endpoint(&self) -> Option<&str> {
        if self.status == SyncStatus::Unreachable {
            return None;
        }
        if self.on_fallback {
            return self.fallback_endpoint.as_deref();
        }
        self.endpoints.get(self.active_index).map(String::as_str)
    }

    pub fn primary_endpoint(&self) -> &str {
        // endpoints is non-empty by construction
        &self.endpoints[0]
    }

    pub fn is_reachable(&self) -> bool {
        self.status != SyncStatus::Unreachable
    }

    /// Advance the failover cursor past `failed`.
    ///
    /// Reports for an endpoint that is no longer active are ignored so that
    /// concurrent failures on the same endpoint advance the cursor only once.
    pub fn advance_endpoint(&mut self, failed: &str) -> EndpointAdvance {
        match self.current_endpoint() {
            Some(current) if current == failed => {}
            _ => return EndpointAdvance::Stale,
        }

        if !self.on_fallback && self.active_index + 1 < self.endpoints.len() {
            self.active_index += 1;
            self.status = SyncStatus::Syncing;
            return EndpointAdvance::Advanced {
                endpoint: self.endpoints[self.active_index].clone(),
            };
        }

        if !self.on_fallback {
            if let Some(fallback) = self.fallback_endpoint.clone() {
                self.on_fallback = true;
                self.degraded = true;
                self.status = SyncStatus::Syncing;
                return EndpointAdvance::Degraded { endpoint: fallback };
            }
        }

        self.status = SyncStatus::Unreachable;
        EndpointAdvance::Unreachable
    }

    /// Record a successful height observation on the current endpoint.
    pub fn observe_height(&mut self, height: u64) {
        if height >= self.height {
            self.height = height;
            self.status = SyncStatus::Synced;
        } else {
            self.status = SyncStatus::Syncing;
        }
    }

    /// Reset to the primary endpoint after it answered a health poll again.
    pub fn recover(&mut self) {
        self.active_index = 0;
        self.on_fallback = false;
        self.degraded = false;
        self.status = SyncStatus::Syncing;
    }
}

impl fmt::Display for ChainNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chain {} (status={}, height={}, endpoint={})",
            self.chain_id,
            self.status,
            self.height,
            self.current_endpoint().unwrap_or("-")
        )
    }
}
