//! Route advertisement bookkeeping
//!
//! Each peer may advertise at most one route, and no two peers may advertise
//! the same one. The ledger has no storage of its own: the advertised route is
//! a field of the peer record, so every check reads through the store.
//!
//! Accepted routes are free text. They are never checked for conflicts, and
//! the ledger only reports (does not reject) accepted routes that nobody
//! advertises.

use crate::error::{RouteError, StoreError, TunnelHubError};
use crate::store::PeerStore;

/// Read-only view of advertised routes over a peer store
pub struct RouteLedger<'a> {
    store: &'a dyn PeerStore,
}

impl<'a> RouteLedger<'a> {
    pub fn new(store: &'a dyn PeerStore) -> Self {
        Self { store }
    }

    /// Check that `peer_id` may advertise `route`
    ///
    /// Blank routes always pass. A route already advertised by `peer_id` itself
    /// passes, so re-registering on update is harmless.
    pub fn register_route(&self, peer_id: &str, route: &str) -> Result<(), TunnelHubError> {
        let route = route.trim();
        if route.is_empty() {
            return Ok(());
        }

        if let Some(owner) = self.owner_of(route)? {
            if owner != peer_id {
                return Err(RouteError::Conflict {
                    route: route.to_string(),
                    owner,
                }
                .into());
            }
        }

        tracing::debug!("Route {} available for {}", route, peer_id);
        Ok(())
    }

    /// The peer currently advertising `route`, if any
    pub fn owner_of(&self, route: &str) -> Result<Option<String>, StoreError> {
        let route = route.trim();
        Ok(self
            .store
            .list()?
            .into_iter()
            .find(|p| p.advertised_route() == Some(route))
            .map(|p| p.user_id))
    }

    /// All non-empty advertised routes
    pub fn advertised_routes(&self) -> Result<Vec<String>, StoreError> {
        self.store.find_routes()
    }

    /// Entries of `accepted` that no peer currently advertises
    pub fn unadvertised(&self, accepted: &str) -> Result<Vec<String>, StoreError> {
        let advertised = self.advertised_routes()?;
        Ok(split_routes(accepted)
            .into_iter()
            .filter(|r| !advertised.contains(r))
            .collect())
    }
}

/// Split a comma-joined route list, dropping blanks
pub fn split_routes(routes: &str) -> Vec<String> {
    routes
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join routes the way they are stored, `None` when there are none
pub fn join_routes<S: AsRef<str>>(routes: &[S]) -> Option<String> {
    let routes: Vec<&str> = routes
        .iter()
        .map(|r| r.as_ref().trim())
        .filter(|r| !r.is_empty())
        .collect();
    (!routes.is_empty()).then(|| routes.join(","))
}
