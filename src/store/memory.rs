//! In-memory peer store

use std::sync::RwLock;

use super::{PeerPatch, PeerRecord, PeerStore, PeerTable};
use crate::error::StoreError;

/// Peer store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<PeerTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Corrupt {
            message: "peer table lock poisoned".to_string(),
        }
    }
}

impl PeerStore for MemoryStore {
    fn create(&self, peer: PeerRecord) -> Result<PeerRecord, StoreError> {
        let mut table = self.table.write().map_err(|_| Self::poisoned())?;
        table.insert(peer)
    }

    fn get(&self, user_id: &str) -> Result<Option<PeerRecord>, StoreError> {
        let table = self.table.read().map_err(|_| Self::poisoned())?;
        Ok(table.get(user_id))
    }

    fn list(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let table = self.table.read().map_err(|_| Self::poisoned())?;
        Ok(table.records())
    }

    fn update(&self, user_id: &str, patch: &PeerPatch) -> Result<PeerRecord, StoreError> {
        let mut table = self.table.write().map_err(|_| Self::poisoned())?;
        table.update(user_id, patch)
    }

    fn delete(&self, user_id: &str) -> Result<PeerRecord, StoreError> {
        let mut table = self.table.write().map_err(|_| Self::poisoned())?;
        table.remove(user_id)
    }
}
