//! Peer provisioning engine
//!
//! [`PeerService`] ties the pool, store, key source, route ledger, renderers and
//! live-state reader together. It is what both front ends (CLI and HTTP) call.
//!
//! Every operation that writes to the store runs under one lock. Allocation
//! picks an address from a snapshot of the store, so without the lock two
//! concurrent requests could be offered the same one. The store still rejects
//! duplicate addresses on insert; that error is the only retryable one.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::config::{Hooks, HubConfig};
use crate::crypto::KeyProvisioner;
use crate::error::{Result, StoreError, TunnelHubError};
use crate::ledger::{join_routes, split_routes, RouteLedger};
use crate::pool::AddressPool;
use crate::render::{render_hub_config, render_peer_config};
use crate::store::{PeerPatch, PeerRecord, PeerStore};
use crate::traffic::{correlate, LiveStateReader, TrafficSample};

/// Subnet written into a peer's own `AllowedIPs` when the caller gives none
const DEFAULT_PEER_PREFIX: u8 = 24;

/// Caller input for provisioning a peer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerRequest {
    pub user_id: String,
    /// Specific address to assign instead of the lowest free one
    pub ip: Option<Ipv4Addr>,
    pub allowed_ips: Option<String>,
    pub advertise_routes: Option<String>,
    pub accept_routes: Vec<String>,
    #[serde(flatten)]
    pub hooks: Hooks,
}

impl PeerRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

/// The provisioning engine
pub struct PeerService {
    hub: HubConfig,
    hub_address: Ipv4Addr,
    pool: AddressPool,
    store: Arc<dyn PeerStore>,
    keys: Box<dyn KeyProvisioner>,
    live: Box<dyn LiveStateReader>,
    write_lock: Mutex<()>,
}

impl PeerService {
    /// Build the engine; fails if the hub config is unusable
    pub fn new(
        hub: HubConfig,
        store: Arc<dyn PeerStore>,
        keys: Box<dyn KeyProvisioner>,
        live: Box<dyn LiveStateReader>,
    ) -> Result<Self> {
        hub.validate()?;
        let pool = hub.pool()?;
        let hub_address = hub.tunnel_address()?;

        Ok(Self {
            hub,
            hub_address,
            pool,
            store,
            keys,
            live,
            write_lock: Mutex::new(()),
        })
    }

    pub fn hub(&self) -> &HubConfig {
        &self.hub
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Addresses no new peer may take: every stored peer's plus the hub's own
    fn taken_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let mut used = self.store.used_addresses()?;
        used.insert(self.hub_address);
        Ok(used)
    }

    /// Create a peer: allocate an address, mint keys, check its route, persist
    ///
    /// Nothing is written unless every step succeeds.
    pub fn provision(&self, request: PeerRequest) -> Result<PeerRecord> {
        let user_id = request.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(TunnelHubError::invalid_input("user id must not be empty"));
        }
        let allowed_ips = request
            .allowed_ips
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(validate_cidr_list)
            .transpose()?;
        let advertise_route = request
            .advertise_routes
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(validate_cidr)
            .transpose()?;
        let accept_routes = join_routes(&request.accept_routes);

        let _guard = self.lock();

        if self.store.get(&user_id)?.is_some() {
            return Err(StoreError::DuplicateIdentifier { user_id }.into());
        }

        let used = self.taken_addresses()?;
        let ip = match request.ip {
            Some(ip) => {
                self.pool.claim(ip)?;
                if used.contains(&ip) {
                    return Err(StoreError::DuplicateAddress { ip }.into());
                }
                ip
            }
            None => self.pool.allocate(&used)?,
        };

        let keys = self.keys.generate_keypair()?;

        let ledger = RouteLedger::new(self.store.as_ref());
        if let Some(route) = &advertise_route {
            ledger.register_route(&user_id, route)?;
        }
        if let Some(accepted) = &accept_routes {
            for route in ledger.unadvertised(accepted)? {
                tracing::warn!(
                    "Peer {} accepts route {} which no peer advertises",
                    user_id,
                    route
                );
            }
        }

        let record = PeerRecord {
            id: 0,
            user_id,
            public_key: keys.public_key,
            private_key: keys.private_key,
            ip,
            allowed_ips: allowed_ips.unwrap_or_else(|| default_allowed_ips(ip)),
            endpoint: Some(self.hub.endpoint()),
            persistent_keepalive: self.hub.persistent_keepalive,
            hooks: request.hooks,
            advertise_routes: advertise_route,
            accept_routes,
        };

        let record = self.store.create(record)?;
        tracing::info!("Provisioned peer {} at {}", record.user_id, record.ip);
        Ok(record)
    }

    pub fn list(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.store.list()?)
    }

    pub fn get(&self, user_id: &str) -> Result<PeerRecord> {
        self.store.get(user_id)?.ok_or_else(|| {
            StoreError::NotFound {
                user_id: user_id.to_string(),
            }
            .into()
        })
    }

    /// Delete a peer, freeing its address and advertised route
    pub fn remove(&self, user_id: &str) -> Result<PeerRecord> {
        let _guard = self.lock();
        let removed = self.store.delete(user_id)?;
        tracing::info!("Removed peer {} ({})", removed.user_id, removed.ip);
        Ok(removed)
    }

    /// Apply a partial update, re-checking the address range and route ownership
    pub fn update(&self, user_id: &str, patch: PeerPatch) -> Result<PeerRecord> {
        let mut patch = patch;
        if let Some(allowed) = patch.allowed_ips.as_deref().map(str::trim) {
            if !allowed.is_empty() {
                patch.allowed_ips = Some(validate_cidr_list(allowed)?);
            }
        }
        if let Some(route) = patch.advertise_routes.as_deref().map(str::trim) {
            if !route.is_empty() {
                patch.advertise_routes = Some(validate_cidr(route)?);
            }
        }
        if let Some(accepted) = patch.accept_routes.take() {
            patch.accept_routes = Some(join_routes(&split_routes(&accepted)).unwrap_or_default());
        }

        let _guard = self.lock();

        if let Some(ip) = patch.ip {
            self.pool.claim(ip)?;
            if ip == self.hub_address {
                return Err(StoreError::DuplicateAddress { ip }.into());
            }
            if patch.allowed_ips.is_none() {
                if let Some(current) = self.store.get(user_id)? {
                    // A default subnet follows the address; a chosen one stays
                    if current.allowed_ips == default_allowed_ips(current.ip) {
                        patch.allowed_ips = Some(default_allowed_ips(ip));
                    }
                }
            }
        }
        if let Some(route) = patch.advertise_routes.as_deref() {
            RouteLedger::new(self.store.as_ref()).register_route(user_id, route)?;
        }

        let updated = self.store.update(user_id, &patch)?;
        tracing::info!("Updated peer {}", updated.user_id);
        Ok(updated)
    }

    /// Point every peer at the hub's current `server_ip:port`
    ///
    /// Returns how many records changed. Records are saved one at a time, so a
    /// failed save leaves the peers before it already rotated; the error is
    /// logged with that count and a rerun finishes the rest.
    pub fn rotate_endpoints(&self) -> Result<usize> {
        let endpoint = self.hub.endpoint();
        let _guard = self.lock();

        let patch = PeerPatch {
            endpoint: Some(endpoint.clone()),
            ..Default::default()
        };

        let mut changed = 0;
        for peer in self.store.list()? {
            if peer.endpoint.as_deref() == Some(endpoint.as_str()) {
                continue;
            }
            if let Err(e) = self.store.update(&peer.user_id, &patch) {
                tracing::warn!(
                    "Endpoint rotation stopped at {} after updating {} peer(s): {}",
                    peer.user_id,
                    changed,
                    e
                );
                return Err(e.into());
            }
            tracing::debug!("Endpoint of {} set to {}", peer.user_id, endpoint);
            changed += 1;
        }

        tracing::info!("Rotated endpoints of {} peer(s) to {}", changed, endpoint);
        Ok(changed)
    }

    /// Replace a peer's key pair
    pub fn rekey(&self, user_id: &str) -> Result<PeerRecord> {
        let _guard = self.lock();

        if self.store.get(user_id)?.is_none() {
            return Err(StoreError::NotFound {
                user_id: user_id.to_string(),
            }
            .into());
        }

        let patch = PeerPatch {
            keys: Some(self.keys.generate_keypair()?),
            ..Default::default()
        };
        let updated = self.store.update(user_id, &patch)?;
        tracing::info!("Rekeyed peer {}", updated.user_id);
        Ok(updated)
    }

    /// Routes currently advertised by any peer
    pub fn find_routes(&self) -> Result<Vec<String>> {
        Ok(RouteLedger::new(self.store.as_ref()).advertised_routes()?)
    }

    /// The hub's interface file covering every stored peer
    pub fn render_hub(&self) -> Result<String> {
        let peers = self.store.list()?;
        Ok(render_hub_config(&self.hub, &peers)?)
    }

    /// Render the hub config and write it to `path`, returning the text
    pub fn write_hub_config(&self, path: &Path) -> Result<String> {
        let config = self.render_hub()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Holds the hub private key
        crate::store::write_private_file(path, config.as_bytes())?;

        tracing::info!("Wrote hub config to {:?}", path);
        Ok(config)
    }

    /// The config file for one peer
    pub fn render_peer(&self, user_id: &str) -> Result<String> {
        let peer = self.get(user_id)?;
        Ok(render_peer_config(&self.hub, &peer)?)
    }

    /// Live counters for stored peers that appear on a running interface
    pub fn traffic_report(&self) -> Result<Vec<TrafficSample>> {
        let peers = self.store.list()?;
        let devices = self.live.list_devices()?;
        Ok(correlate(&peers, &devices))
    }
}

fn default_allowed_ips(ip: Ipv4Addr) -> String {
    format!("{}/{}", ip, DEFAULT_PEER_PREFIX)
}

fn validate_cidr(value: &str) -> Result<String> {
    let value = value.trim();
    value
        .parse::<IpNet>()
        .map_err(|_| TunnelHubError::invalid_input(format!("not a valid CIDR: {}", value)))?;
    Ok(value.to_string())
}

/// Validate a comma-joined CIDR list, returning it in `a, b` form
fn validate_cidr_list(value: &str) -> Result<String> {
    let entries = split_routes(value);
    if entries.is_empty() {
        return Err(TunnelHubError::invalid_input("allowed IPs must not be empty"));
    }
    for entry in &entries {
        validate_cidr(entry)?;
    }
    Ok(entries.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::error::{CollaboratorError, PoolError, RouteError};
    use crate::store::MemoryStore;
    use crate::traffic::{LiveDevice, LivePeer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out numbered keys
    #[derive(Default)]
    struct CountingKeys {
        issued: AtomicUsize,
    }

    impl KeyProvisioner for CountingKeys {
        fn generate_keypair(&self) -> std::result::Result<KeyPair, CollaboratorError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(KeyPair {
                private_key: format!("private-{}", n),
                public_key: format!("public-{}", n),
            })
        }
    }

    struct BrokenKeys;

    impl KeyProvisioner for BrokenKeys {
        fn generate_keypair(&self) -> std::result::Result<KeyPair, CollaboratorError> {
            Err(CollaboratorError::KeyGeneration {
                reason: "wg: command not found".to_string(),
            })
        }
    }

    struct FixedLive(Vec<LiveDevice>);

    impl LiveStateReader for FixedLive {
        fn list_devices(&self) -> std::result::Result<Vec<LiveDevice>, CollaboratorError> {
            Ok(self.0.clone())
        }
    }

    const HUB_YAML: &str = "server_ip: 203.0.113.10\n\
port: 51820\n\
private_key: UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n\
public_key: YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n\
ip: 10.0.0.1/24\n\
ip_pool: 10.0.0.0/29\n";

    fn hub() -> HubConfig {
        HubConfig::from_yaml_str(HUB_YAML).unwrap()
    }

    fn service_with(keys: Box<dyn KeyProvisioner>, live: Vec<LiveDevice>) -> PeerService {
        PeerService::new(
            hub(),
            Arc::new(MemoryStore::new()),
            keys,
            Box::new(FixedLive(live)),
        )
        .unwrap()
    }

    fn service() -> PeerService {
        service_with(Box::<CountingKeys>::default(), Vec::new())
    }

    fn service_for(hub: HubConfig) -> PeerService {
        PeerService::new(
            hub,
            Arc::new(MemoryStore::new()),
            Box::<CountingKeys>::default(),
            Box::new(FixedLive(Vec::new())),
        )
        .unwrap()
    }

    /// Fails every update of one peer
    struct FailingUpdates {
        inner: MemoryStore,
        fail_for: &'static str,
    }

    impl PeerStore for FailingUpdates {
        fn create(&self, peer: PeerRecord) -> std::result::Result<PeerRecord, StoreError> {
            self.inner.create(peer)
        }

        fn get(&self, user_id: &str) -> std::result::Result<Option<PeerRecord>, StoreError> {
            self.inner.get(user_id)
        }

        fn list(&self) -> std::result::Result<Vec<PeerRecord>, StoreError> {
            self.inner.list()
        }

        fn update(
            &self,
            user_id: &str,
            patch: &PeerPatch,
        ) -> std::result::Result<PeerRecord, StoreError> {
            if user_id == self.fail_for {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.update(user_id, patch)
        }

        fn delete(&self, user_id: &str) -> std::result::Result<PeerRecord, StoreError> {
            self.inner.delete(user_id)
        }
    }

    #[test]
    fn test_provision_defaults() {
        let svc = service();
        let peer = svc.provision(PeerRequest::new("  alice ")).unwrap();

        assert_eq!(peer.user_id, "alice");
        assert_eq!(peer.id, 1);
        // Hub mode skips .0, .1 and .2
        assert_eq!(peer.ip, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(peer.allowed_ips, "10.0.0.3/24");
        assert_eq!(peer.endpoint.as_deref(), Some("203.0.113.10:51820"));
        assert_eq!(peer.persistent_keepalive, 25);
        assert_eq!(peer.public_key, "public-1");

        let bob = svc.provision(PeerRequest::new("bob")).unwrap();
        assert_eq!(bob.ip, Ipv4Addr::new(10, 0, 0, 4));
    }

    #[test]
    fn test_standard_mode_skips_hub_address() {
        let mut hub = hub();
        hub.pool_mode = crate::pool::PoolMode::Standard;
        let svc = service_for(hub);

        // .1 is the hub's own address
        let alice = svc.provision(PeerRequest::new("alice")).unwrap();
        assert_eq!(alice.ip, Ipv4Addr::new(10, 0, 0, 2));

        let hub_ip = PeerRequest {
            ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..PeerRequest::new("bob")
        };
        assert!(matches!(
            svc.provision(hub_ip).unwrap_err(),
            TunnelHubError::Store(StoreError::DuplicateAddress { .. })
        ));
    }

    #[test]
    fn test_hub_address_inside_peer_range_is_reserved() {
        let mut hub = hub();
        hub.ip = "10.0.0.3/24".to_string();
        let svc = service_for(hub);

        let alice = svc.provision(PeerRequest::new("alice")).unwrap();
        assert_eq!(alice.ip, Ipv4Addr::new(10, 0, 0, 4));

        let onto_hub = PeerPatch {
            ip: Some(Ipv4Addr::new(10, 0, 0, 3)),
            ..Default::default()
        };
        assert!(matches!(
            svc.update("alice", onto_hub).unwrap_err(),
            TunnelHubError::Store(StoreError::DuplicateAddress { .. })
        ));
        assert_eq!(svc.get("alice").unwrap().ip, Ipv4Addr::new(10, 0, 0, 4));
    }

    #[test]
    fn test_provision_rejects_blank_id() {
        let svc = service();
        let err = svc.provision(PeerRequest::new("   ")).unwrap_err();
        assert!(matches!(err, TunnelHubError::InvalidInput { .. }));
        assert!(svc.list().unwrap().is_empty());
    }

    #[test]
    fn test_provision_duplicate_id() {
        let svc = service();
        svc.provision(PeerRequest::new("alice")).unwrap();
        let err = svc.provision(PeerRequest::new("alice")).unwrap_err();
        assert!(matches!(
            err,
            TunnelHubError::Store(StoreError::DuplicateIdentifier { .. })
        ));
    }

    #[test]
    fn test_pool_exhaustion_and_reuse() {
        let svc = service();
        // 10.0.0.0/29 in hub mode: .3 through .6
        for name in ["a", "b", "c", "d"] {
            svc.provision(PeerRequest::new(name)).unwrap();
        }

        let err = svc.provision(PeerRequest::new("e")).unwrap_err();
        assert!(matches!(
            err,
            TunnelHubError::Pool(PoolError::PoolExhausted { .. })
        ));

        svc.remove("b").unwrap();
        let e = svc.provision(PeerRequest::new("e")).unwrap();
        assert_eq!(e.ip, Ipv4Addr::new(10, 0, 0, 4));
    }

    #[test]
    fn test_requested_address() {
        let svc = service();
        let request = PeerRequest {
            ip: Some(Ipv4Addr::new(10, 0, 0, 5)),
            ..PeerRequest::new("alice")
        };
        assert_eq!(svc.provision(request).unwrap().ip, Ipv4Addr::new(10, 0, 0, 5));

        let taken = PeerRequest {
            ip: Some(Ipv4Addr::new(10, 0, 0, 5)),
            ..PeerRequest::new("bob")
        };
        let err = svc.provision(taken).unwrap_err();
        assert!(err.is_retryable());

        let outside = PeerRequest {
            ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..PeerRequest::new("bob")
        };
        assert!(matches!(
            svc.provision(outside).unwrap_err(),
            TunnelHubError::Pool(PoolError::OutOfPool { .. })
        ));
    }

    #[test]
    fn test_key_failure_leaves_no_record() {
        let svc = service_with(Box::new(BrokenKeys), Vec::new());
        let err = svc.provision(PeerRequest::new("alice")).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Collaborator failure: Key generation failed: wg: command not found"
        );
        assert!(svc.list().unwrap().is_empty());
    }

    #[test]
    fn test_route_conflict() {
        let svc = service();
        let alice = PeerRequest {
            advertise_routes: Some("192.168.1.0/24".to_string()),
            ..PeerRequest::new("alice")
        };
        svc.provision(alice).unwrap();

        let bob = PeerRequest {
            advertise_routes: Some("192.168.1.0/24".to_string()),
            ..PeerRequest::new("bob")
        };
        let err = svc.provision(bob).unwrap_err();
        assert!(matches!(
            err,
            TunnelHubError::Route(RouteError::Conflict { ref owner, .. }) if owner == "alice"
        ));
        assert_eq!(svc.list().unwrap().len(), 1);

        // Two peers without a route are fine
        svc.provision(PeerRequest::new("carol")).unwrap();
        svc.provision(PeerRequest::new("dave")).unwrap();
        assert_eq!(svc.find_routes().unwrap(), vec!["192.168.1.0/24"]);
    }

    #[test]
    fn test_invalid_cidrs_rejected() {
        let svc = service();
        let bad_route = PeerRequest {
            advertise_routes: Some("192.168.1.0/99".to_string()),
            ..PeerRequest::new("alice")
        };
        assert!(matches!(
            svc.provision(bad_route).unwrap_err(),
            TunnelHubError::InvalidInput { .. }
        ));

        let bad_allowed = PeerRequest {
            allowed_ips: Some("10.0.0.0/8, nonsense".to_string()),
            ..PeerRequest::new("alice")
        };
        assert!(matches!(
            svc.provision(bad_allowed).unwrap_err(),
            TunnelHubError::InvalidInput { .. }
        ));
    }

    #[test]
    fn test_accept_routes_are_free_text() {
        let svc = service();
        let request = PeerRequest {
            allowed_ips: Some("10.0.0.0/24,0.0.0.0/0".to_string()),
            accept_routes: vec!["192.168.1.0/24".to_string(), "172.16.0.0/16".to_string()],
            ..PeerRequest::new("alice")
        };
        let peer = svc.provision(request).unwrap();

        assert_eq!(peer.allowed_ips, "10.0.0.0/24, 0.0.0.0/0");
        assert_eq!(
            peer.accept_routes.as_deref(),
            Some("192.168.1.0/24,172.16.0.0/16")
        );
    }

    #[test]
    fn test_update_checks_route_and_range() {
        let svc = service();
        svc.provision(PeerRequest {
            advertise_routes: Some("192.168.1.0/24".to_string()),
            ..PeerRequest::new("alice")
        })
        .unwrap();
        svc.provision(PeerRequest::new("bob")).unwrap();

        let steal = PeerPatch {
            advertise_routes: Some("192.168.1.0/24".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            svc.update("bob", steal).unwrap_err(),
            TunnelHubError::Route(_)
        ));

        let outside = PeerPatch {
            ip: Some(Ipv4Addr::new(10, 0, 0, 7)),
            ..Default::default()
        };
        assert!(matches!(
            svc.update("bob", outside).unwrap_err(),
            TunnelHubError::Pool(PoolError::OutOfPool { .. })
        ));

        let patch = PeerPatch {
            ip: Some(Ipv4Addr::new(10, 0, 0, 6)),
            post_up: Some("echo up".to_string()),
            ..Default::default()
        };
        let bob = svc.update("bob", patch).unwrap();
        assert_eq!(bob.ip, Ipv4Addr::new(10, 0, 0, 6));
        assert_eq!(bob.hooks.post_up.as_deref(), Some("echo up"));

        assert!(matches!(
            svc.update("nobody", PeerPatch::default()).unwrap_err(),
            TunnelHubError::Store(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_update_moves_default_allowed_ips_with_address() {
        let mut hub = hub();
        hub.ip_pool = "10.0.0.0/16".to_string();
        let svc = service_for(hub);
        svc.provision(PeerRequest::new("alice")).unwrap();

        let moved = PeerPatch {
            ip: Some(Ipv4Addr::new(10, 0, 5, 9)),
            ..Default::default()
        };
        let alice = svc.update("alice", moved).unwrap();
        assert_eq!(alice.ip, Ipv4Addr::new(10, 0, 5, 9));
        assert_eq!(alice.allowed_ips, "10.0.5.9/24");

        let conf = svc.render_peer("alice").unwrap();
        assert!(conf.contains("Address = 10.0.5.9/32\n"));
        assert!(conf.contains("AllowedIPs = 10.0.5.9/24\n"));
    }

    #[test]
    fn test_update_keeps_chosen_allowed_ips() {
        let mut hub = hub();
        hub.ip_pool = "10.0.0.0/16".to_string();
        let svc = service_for(hub);
        svc.provision(PeerRequest {
            allowed_ips: Some("0.0.0.0/0".to_string()),
            ..PeerRequest::new("alice")
        })
        .unwrap();
        svc.provision(PeerRequest::new("bob")).unwrap();

        let alice = svc
            .update(
                "alice",
                PeerPatch {
                    ip: Some(Ipv4Addr::new(10, 0, 5, 9)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(alice.allowed_ips, "0.0.0.0/0");

        let bob = svc
            .update(
                "bob",
                PeerPatch {
                    ip: Some(Ipv4Addr::new(10, 0, 6, 1)),
                    allowed_ips: Some("10.0.0.0/16".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(bob.allowed_ips, "10.0.0.0/16");
    }

    #[test]
    fn test_rotate_endpoints_stops_at_failed_save() {
        let store = Arc::new(FailingUpdates {
            inner: MemoryStore::new(),
            fail_for: "bob",
        });
        let svc = PeerService::new(
            hub(),
            store.clone(),
            Box::<CountingKeys>::default(),
            Box::new(FixedLive(Vec::new())),
        )
        .unwrap();
        svc.provision(PeerRequest::new("alice")).unwrap();
        svc.provision(PeerRequest::new("bob")).unwrap();

        let mut moved = hub();
        moved.port = 443;
        let svc = PeerService::new(
            moved,
            store,
            Box::<CountingKeys>::default(),
            Box::new(FixedLive(Vec::new())),
        )
        .unwrap();

        let err = svc.rotate_endpoints().unwrap_err();
        assert!(matches!(err, TunnelHubError::Store(StoreError::Io(_))));
        assert_eq!(
            svc.get("alice").unwrap().endpoint.as_deref(),
            Some("203.0.113.10:443")
        );
        assert_eq!(
            svc.get("bob").unwrap().endpoint.as_deref(),
            Some("203.0.113.10:51820")
        );
    }

    #[test]
    fn test_rotate_endpoints() {
        let store: Arc<dyn PeerStore> = Arc::new(MemoryStore::new());
        let old = PeerService::new(
            hub(),
            store.clone(),
            Box::<CountingKeys>::default(),
            Box::new(FixedLive(Vec::new())),
        )
        .unwrap();
        old.provision(PeerRequest::new("alice")).unwrap();
        old.provision(PeerRequest::new("bob")).unwrap();

        let mut moved = hub();
        moved.server_ip = "198.51.100.20".to_string();
        moved.port = 443;
        let svc = PeerService::new(
            moved,
            store,
            Box::<CountingKeys>::default(),
            Box::new(FixedLive(Vec::new())),
        )
        .unwrap();

        assert_eq!(svc.rotate_endpoints().unwrap(), 2);
        for peer in svc.list().unwrap() {
            assert_eq!(peer.endpoint.as_deref(), Some("198.51.100.20:443"));
        }
        assert_eq!(svc.rotate_endpoints().unwrap(), 0);
    }

    #[test]
    fn test_rekey() {
        let svc = service();
        let before = svc.provision(PeerRequest::new("alice")).unwrap();
        let after = svc.rekey("alice").unwrap();

        assert_ne!(before.public_key, after.public_key);
        assert_eq!(after.private_key, "private-2");
        assert_eq!(after.ip, before.ip);

        assert!(matches!(
            svc.rekey("nobody").unwrap_err(),
            TunnelHubError::Store(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_render_through_service() {
        let svc = service();
        svc.provision(PeerRequest::new("alice")).unwrap();

        let peer_conf = svc.render_peer("alice").unwrap();
        assert!(peer_conf.starts_with("[Interface]\nPrivateKey = private-1\nAddress = 10.0.0.3/32\n"));
        assert!(peer_conf.contains("Endpoint = 203.0.113.10:51820\n"));
        assert!(peer_conf.ends_with("PersistentKeepalive = 25\n"));

        let hub_conf = svc.render_hub().unwrap();
        assert!(hub_conf.contains("[Peer]\nPublicKey = public-1\nAllowedIPs = 10.0.0.3/32\n"));

        assert!(matches!(
            svc.render_peer("nobody").unwrap_err(),
            TunnelHubError::Store(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_write_hub_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("wg").join("wg0.conf");

        let svc = service();
        svc.provision(PeerRequest::new("alice")).unwrap();
        let text = svc.write_hub_config(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
        assert!(text.starts_with("[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_traffic_report() {
        let live = vec![LiveDevice {
            name: "wg0".to_string(),
            peers: vec![LivePeer {
                public_key: "public-1".to_string(),
                allowed_ips: vec!["10.0.0.3/32".to_string()],
                rx_bytes: 100,
                tx_bytes: 200,
                last_handshake: 1_700_000_000,
            }],
        }];
        let svc = service_with(Box::<CountingKeys>::default(), live);
        svc.provision(PeerRequest::new("alice")).unwrap();
        svc.provision(PeerRequest::new("bob")).unwrap();

        let samples = svc.traffic_report().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].user_id, "alice");
        assert_eq!(samples[0].rx_bytes, 100);
    }

    #[test]
    fn test_concurrent_provisioning_never_shares_addresses() {
        let store: Arc<dyn PeerStore> = Arc::new(MemoryStore::new());
        let mut hub = hub();
        hub.ip_pool = "10.0.0.0/24".to_string();
        let svc = Arc::new(
            PeerService::new(
                hub,
                store,
                Box::<CountingKeys>::default(),
                Box::new(FixedLive(Vec::new())),
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let svc = Arc::clone(&svc);
                std::thread::spawn(move || svc.provision(PeerRequest::new(format!("peer-{}", i))))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let mut ips: Vec<_> = svc.list().unwrap().into_iter().map(|p| p.ip).collect();
        ips.sort();
        ips.dedup();
        assert_eq!(ips.len(), 16);
    }
}
