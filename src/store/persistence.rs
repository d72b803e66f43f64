//! JSON file peer store
//!
//! All records live in one JSON document:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "next_id": 3,
//!   "peers": [ { "id": 1, "user_id": "alice", "ip": "10.8.0.3", ... } ]
//! }
//! ```
//!
//! The file is opened once, kept in memory, and rewritten after every change.
//! A change is only applied in memory once the new file is on disk, so a
//! failed write leaves both copies as they were.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::{PeerPatch, PeerRecord, PeerStore, PeerTable};
use crate::error::StoreError;

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 1;

/// On-disk layout of the peer store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStoreFile {
    /// Schema version for future migrations
    pub schema_version: u32,
    /// Next surrogate id to hand out
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub peers: Vec<PeerRecord>,
}

impl Default for PeerStoreFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            next_id: 1,
            peers: Vec::new(),
        }
    }
}

/// Peer store backed by a JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    table: Mutex<PeerTable>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating an empty one if the file does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let table = match std::fs::read_to_string(&path) {
            Ok(json) => {
                let file: PeerStoreFile = serde_json::from_str(&json)?;
                if file.schema_version > SCHEMA_VERSION {
                    return Err(StoreError::Corrupt {
                        message: format!(
                            "schema version {} is newer than supported version {}",
                            file.schema_version, SCHEMA_VERSION
                        ),
                    });
                }
                let count = file.peers.len();
                let table = PeerTable::from_records(file.peers, file.next_id)?;
                tracing::info!("Opened peer store {:?} ({} peers)", path, count);
                table
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let table = PeerTable::default();
                save_table(&path, &table)?;
                tracing::info!("Created peer store {:?}", path);
                table
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the table, persist it, then commit it
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut PeerTable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Corrupt {
            message: "peer table lock poisoned".to_string(),
        })?;

        let mut next = table.clone();
        let result = change(&mut next)?;
        save_table(&self.path, &next)?;
        *table = next;
        Ok(result)
    }

    fn read<T>(&self, view: impl FnOnce(&PeerTable) -> T) -> Result<T, StoreError> {
        let table = self.table.lock().map_err(|_| StoreError::Corrupt {
            message: "peer table lock poisoned".to_string(),
        })?;
        Ok(view(&table))
    }
}

impl PeerStore for JsonFileStore {
    fn create(&self, peer: PeerRecord) -> Result<PeerRecord, StoreError> {
        self.mutate(|table| table.insert(peer))
    }

    fn get(&self, user_id: &str) -> Result<Option<PeerRecord>, StoreError> {
        self.read(|table| table.get(user_id))
    }

    fn list(&self) -> Result<Vec<PeerRecord>, StoreError> {
        self.read(PeerTable::records)
    }

    fn update(&self, user_id: &str, patch: &PeerPatch) -> Result<PeerRecord, StoreError> {
        self.mutate(|table| table.update(user_id, patch))
    }

    fn delete(&self, user_id: &str) -> Result<PeerRecord, StoreError> {
        self.mutate(|table| table.remove(user_id))
    }
}

/// Write the table next to its final path, then rename over it
fn save_table(path: &Path, table: &PeerTable) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = PeerStoreFile {
        schema_version: SCHEMA_VERSION,
        next_id: table.next_id(),
        peers: table.records(),
    };
    let json = serde_json::to_string_pretty(&file)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    // Records carry private keys
    write_private_file(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    tracing::debug!("Saved peer store to {:?}", path);
    Ok(())
}

/// Write `contents` to a file only its owner can read, creating it that way
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;

    // `mode` only applies on creation; tighten a file that already existed
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents)?;
    file.sync_all()
}
