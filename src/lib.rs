//! TunnelHub - WireGuard peer provisioning
//!
//! Allocates tunnel addresses from a pool, mints key pairs, tracks advertised
//! routes, and renders the `[Interface]`/`[Peer]` files both the hub and each
//! peer install. Stored peers can also be matched against live interface
//! counters.
//!
//! # Features
//!
//! - Deterministic lowest-free address allocation
//! - In-memory and JSON-file peer stores
//! - In-process X25519 or `wg` tool key generation
//! - Route advertisement with conflict detection
//! - Traffic report from `wg show all dump`
//! - CLI and REST front ends
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunnelhub::{load_hub_config, JsonFileStore, PeerRequest, PeerService};
//! use tunnelhub::crypto::X25519Provisioner;
//! use tunnelhub::traffic::WgShowReader;
//!
//! fn main() -> tunnelhub::Result<()> {
//!     let hub = load_hub_config("server.yaml")?;
//!     let store = Arc::new(JsonFileStore::open("peers.json")?);
//!     let service = PeerService::new(
//!         hub,
//!         store,
//!         Box::new(X25519Provisioner),
//!         Box::new(WgShowReader::default()),
//!     )?;
//!
//!     let peer = service.provision(PeerRequest::new("alice"))?;
//!     println!("{}", service.render_peer(&peer.user_id)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod daemon;
pub mod error;
pub mod ledger;
pub mod pool;
pub mod render;
pub mod service;
pub mod store;
pub mod traffic;

pub use config::{load_hub_config, HubConfig};
pub use error::{Result, TunnelHubError};
pub use pool::{AddressPool, PoolMode};
pub use service::{PeerRequest, PeerService};
pub use store::{JsonFileStore, MemoryStore, PeerPatch, PeerRecord, PeerStore};
pub use traffic::{TrafficReport, TrafficSample};
