//! Hub configuration
//!
//! The hub's own settings (keys, listen port, address pool, interface hooks) are
//! kept in a YAML file and loaded once at startup.

mod hub;

pub use hub::{load_hub_config, Hooks, HubConfig};
