//! Peer record storage
//!
//! The store is the only owner of peer records and the single place where the
//! identifier and address uniqueness rules are enforced. Callers always get
//! copies back.
//!
//! Two backends share the same in-memory table:
//! - [`MemoryStore`] keeps records for the life of the process
//! - [`JsonFileStore`] writes every change through to a JSON document

mod memory;
mod persistence;

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::config::Hooks;
use crate::crypto::KeyPair;
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use persistence::{JsonFileStore, PeerStoreFile, SCHEMA_VERSION};
pub(crate) use persistence::write_private_file;

/// A provisioned peer
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Surrogate key, assigned by the store
    #[serde(default)]
    pub id: u64,
    /// Caller-facing identifier; unique and never changed after creation
    pub user_id: String,
    pub public_key: String,
    pub private_key: String,
    /// Tunnel address; unique across peers
    pub ip: Ipv4Addr,
    /// `AllowedIPs` the peer routes into the tunnel
    pub allowed_ips: String,
    /// Hub `host:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Seconds, 0 disables
    #[serde(default)]
    pub persistent_keepalive: u16,
    #[serde(flatten)]
    pub hooks: Hooks,
    /// Network this peer offers to the rest of the overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_routes: Option<String>,
    /// Comma-joined routes this peer sends into the tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_routes: Option<String>,
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("ip", &self.ip)
            .field("allowed_ips", &self.allowed_ips)
            .field("endpoint", &self.endpoint)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .field("hooks", &self.hooks)
            .field("advertise_routes", &self.advertise_routes)
            .field("accept_routes", &self.accept_routes)
            .finish()
    }
}

impl PeerRecord {
    /// The peer's address as a single-host CIDR, as the hub sees it
    pub fn host_cidr(&self) -> String {
        format!("{}/32", self.ip)
    }

    /// The advertised route, if one is set
    pub fn advertised_route(&self) -> Option<&str> {
        non_blank(&self.advertise_routes)
    }

    /// The accepted routes, if any are set
    pub fn accepted_routes(&self) -> Option<&str> {
        non_blank(&self.accept_routes)
    }
}

/// Partial update for a peer record
///
/// `None` leaves a field alone. For optional text fields, an empty string clears
/// the field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerPatch {
    pub ip: Option<Ipv4Addr>,
    #[serde(skip)]
    pub keys: Option<KeyPair>,
    pub allowed_ips: Option<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<u16>,
    pub pre_up: Option<String>,
    pub post_up: Option<String>,
    pub pre_down: Option<String>,
    pub post_down: Option<String>,
    pub advertise_routes: Option<String>,
    pub accept_routes: Option<String>,
}

impl PeerPatch {
    pub fn is_empty(&self) -> bool {
        *self == PeerPatch::default()
    }

    fn apply(&self, peer: &mut PeerRecord) {
        if let Some(ip) = self.ip {
            peer.ip = ip;
        }
        if let Some(keys) = &self.keys {
            peer.private_key = keys.private_key.clone();
            peer.public_key = keys.public_key.clone();
        }
        if let Some(allowed_ips) = &self.allowed_ips {
            let allowed_ips = allowed_ips.trim();
            if !allowed_ips.is_empty() {
                peer.allowed_ips = allowed_ips.to_string();
            }
        }
        if let Some(keepalive) = self.persistent_keepalive {
            peer.persistent_keepalive = keepalive;
        }
        set_or_clear(&mut peer.endpoint, &self.endpoint);
        set_or_clear(&mut peer.hooks.pre_up, &self.pre_up);
        set_or_clear(&mut peer.hooks.post_up, &self.post_up);
        set_or_clear(&mut peer.hooks.pre_down, &self.pre_down);
        set_or_clear(&mut peer.hooks.post_down, &self.post_down);
        set_or_clear(&mut peer.advertise_routes, &self.advertise_routes);
        set_or_clear(&mut peer.accept_routes, &self.accept_routes);
    }
}

fn set_or_clear(field: &mut Option<String>, value: &Option<String>) {
    if let Some(value) = value {
        let value = value.trim();
        *field = (!value.is_empty()).then(|| value.to_string());
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Persistent collection of peer records
pub trait PeerStore: Send + Sync {
    /// Insert a new record; its `id` is assigned by the store
    fn create(&self, peer: PeerRecord) -> Result<PeerRecord, StoreError>;

    fn get(&self, user_id: &str) -> Result<Option<PeerRecord>, StoreError>;

    /// All records, ordered by identifier
    fn list(&self) -> Result<Vec<PeerRecord>, StoreError>;

    fn update(&self, user_id: &str, patch: &PeerPatch) -> Result<PeerRecord, StoreError>;

    /// Remove a record, returning what was removed
    fn delete(&self, user_id: &str) -> Result<PeerRecord, StoreError>;

    /// Non-empty advertised routes across all peers
    fn find_routes(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .list()?
            .iter()
            .filter_map(|p| p.advertised_route().map(str::to_string))
            .collect())
    }

    /// Addresses currently assigned to peers
    fn used_addresses(&self) -> Result<HashSet<Ipv4Addr>, StoreError> {
        Ok(self.list()?.into_iter().map(|p| p.ip).collect())
    }
}

/// Records keyed by identifier, plus the next surrogate id
#[derive(Debug, Clone, Default)]
pub(crate) struct PeerTable {
    peers: BTreeMap<String, PeerRecord>,
    next_id: u64,
}

impl PeerTable {
    pub(crate) fn from_records(records: Vec<PeerRecord>, next_id: u64) -> Result<Self, StoreError> {
        let mut table = PeerTable {
            peers: BTreeMap::new(),
            next_id,
        };
        for peer in records {
            table.check_unique(&peer.user_id, peer.ip)?;
            table.next_id = table.next_id.max(peer.id + 1);
            table.peers.insert(peer.user_id.clone(), peer);
        }
        Ok(table)
    }

    pub(crate) fn records(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id
    }

    pub(crate) fn get(&self, user_id: &str) -> Option<PeerRecord> {
        self.peers.get(user_id).cloned()
    }

    fn check_unique(&self, user_id: &str, ip: Ipv4Addr) -> Result<(), StoreError> {
        if self.peers.contains_key(user_id) {
            return Err(StoreError::DuplicateIdentifier {
                user_id: user_id.to_string(),
            });
        }
        if self.peers.values().any(|p| p.ip == ip) {
            return Err(StoreError::DuplicateAddress { ip });
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, mut peer: PeerRecord) -> Result<PeerRecord, StoreError> {
        self.check_unique(&peer.user_id, peer.ip)?;
        self.next_id = self.next_id.max(1);
        peer.id = self.next_id;
        self.next_id += 1;
        self.peers.insert(peer.user_id.clone(), peer.clone());
        Ok(peer)
    }

    pub(crate) fn update(&mut self, user_id: &str, patch: &PeerPatch) -> Result<PeerRecord, StoreError> {
        if let Some(ip) = patch.ip {
            if self.peers.values().any(|p| p.ip == ip && p.user_id != user_id) {
                return Err(StoreError::DuplicateAddress { ip });
            }
        }

        let peer = self
            .peers
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound {
                user_id: user_id.to_string(),
            })?;
        patch.apply(peer);
        Ok(peer.clone())
    }

    pub(crate) fn remove(&mut self, user_id: &str) -> Result<PeerRecord, StoreError> {
        self.peers.remove(user_id).ok_or_else(|| StoreError::NotFound {
            user_id: user_id.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_peer(user_id: &str, ip: [u8; 4]) -> PeerRecord {
    PeerRecord {
        id: 0,
        user_id: user_id.to_string(),
        public_key: format!("{}-public", user_id),
        private_key: format!("{}-private", user_id),
        ip: Ipv4Addr::from(ip),
        allowed_ips: format!("{}/24", Ipv4Addr::from(ip)),
        endpoint: None,
        persistent_keepalive: 0,
        hooks: Hooks::default(),
        advertise_routes: None,
        accept_routes: None,
    }
}
