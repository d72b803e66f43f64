//! WireGuard config text for the hub and for individual peers
//!
//! Both renderers are pure: they read the hub settings and peer records and
//! return the file contents. Optional keys are written only when set, and keys
//! always appear in the same order so the output is stable across runs.

use std::fmt::Display;

use crate::config::{Hooks, HubConfig};
use crate::error::RenderError;
use crate::store::PeerRecord;

/// Line-oriented builder for `[Section]` / `Key = Value` text
#[derive(Default)]
struct ConfigWriter {
    out: String,
}

impl ConfigWriter {
    fn section(&mut self, name: &str) {
        self.out.push('[');
        self.out.push_str(name);
        self.out.push_str("]\n");
    }

    fn field(&mut self, key: &str, value: impl Display) {
        self.out.push_str(&format!("{} = {}\n", key, value));
    }

    fn optional(&mut self, key: &str, value: Option<&str>) {
        if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.field(key, value);
        }
    }

    fn hooks(&mut self, hooks: &Hooks) {
        for (key, command) in hooks.entries() {
            self.field(key, command);
        }
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn finish(self) -> String {
        self.out
    }
}

/// Render the hub's interface file with one `[Peer]` block per peer
pub fn render_hub_config(hub: &HubConfig, peers: &[PeerRecord]) -> Result<String, RenderError> {
    let private_key = hub.private_key.trim();
    if private_key.is_empty() {
        return Err(RenderError::MissingHubKey {
            field: "private_key".to_string(),
        });
    }

    let mut w = ConfigWriter::default();
    w.section("Interface");
    w.field("PrivateKey", private_key);
    w.field("Address", hub.ip.trim());
    w.field("ListenPort", hub.port);
    w.optional("DNS", hub.dns.as_deref());
    w.optional("Table", hub.table.as_deref());
    if hub.mtu != 0 {
        w.field("MTU", hub.mtu);
    }
    w.hooks(&hub.hooks);

    for peer in peers {
        w.section("Peer");
        w.field("PublicKey", &peer.public_key);
        match peer.advertised_route() {
            Some(route) => w.field("AllowedIPs", format!("{}, {}", peer.host_cidr(), route)),
            None => w.field("AllowedIPs", peer.host_cidr()),
        }
    }

    Ok(w.finish())
}

/// Render the config file a single peer installs
pub fn render_peer_config(hub: &HubConfig, peer: &PeerRecord) -> Result<String, RenderError> {
    let hub_public_key = hub
        .resolved_public_key()
        .ok_or_else(|| RenderError::MissingHubKey {
            field: "public_key".to_string(),
        })?;

    let mut w = ConfigWriter::default();
    w.section("Interface");
    w.field("PrivateKey", &peer.private_key);
    w.field("Address", peer.host_cidr());
    w.hooks(&peer.hooks);
    w.blank();

    w.section("Peer");
    w.field("PublicKey", hub_public_key);
    match peer.accepted_routes() {
        Some(routes) => w.field("AllowedIPs", format!("{}, {}", peer.allowed_ips, routes)),
        None => w.field("AllowedIPs", &peer.allowed_ips),
    }
    w.optional("Endpoint", peer.endpoint.as_deref());
    if peer.persistent_keepalive != 0 {
        w.field("PersistentKeepalive", peer.persistent_keepalive);
    }

    Ok(w.finish())
}
