//! Peer Directory & Routing Table
//!
//! Server-side registry of overlay nodes and the routes they advertise.
//! All state lives behind one directory-wide read/write lock and callers only
//! ever receive clones, so a peer evicted by the sweeper never disappears out
//! from under a reader.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::DirectoryError;
use crate::task::spawn_periodic;

/// Metric value meaning "no route"
pub const NO_ROUTE: u8 = 255;

/// An advertised path to a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination subnet or peer identifier
    pub destination: String,
    /// Peer id to forward through
    pub next_hop: String,
    /// Cost, lower is better (0..=254)
    pub metric: u8,
}

impl Route {
    pub fn new(destination: impl Into<String>, next_hop: impl Into<String>, metric: u8) -> Self {
        Self {
            destination: destination.into(),
            next_hop: next_hop.into(),
            metric,
        }
    }
}

/// A node participating in the overlay
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub public_endpoint: SocketAddr,
    pub private_endpoint: SocketAddr,
    /// Refreshed on every Handshake/KeepAlive
    pub last_seen: Instant,
    /// When this id first registered
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub routes: Vec<Route>,
}

impl Peer {
    /// Create a peer record with no routes
    pub fn new(id: impl Into<String>, public_endpoint: SocketAddr, private_endpoint: SocketAddr) -> Self {
        Self {
            id: id.into(),
            public_endpoint,
            private_endpoint,
            last_seen: Instant::now(),
            registered_at: chrono::Utc::now(),
            routes: Vec::new(),
        }
    }

    /// Time since this peer was last heard from
    pub fn idle(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Registry of known peers
pub struct PeerDirectory {
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or fully overwrite a peer, stamping it as seen now
    pub async fn upsert_peer(&self, mut peer: Peer) {
        let mut peers = self.peers.write().await;
        peer.last_seen = Instant::now();
        match peers.get(&peer.id) {
            Some(existing) => {
                peer.registered_at = existing.registered_at;
                tracing::debug!("Refreshed peer {} at {}", peer.id, peer.public_endpoint);
            }
            None => {
                tracing::info!(
                    "Registered peer {} (public {}, private {})",
                    peer.id, peer.public_endpoint, peer.private_endpoint
                );
            }
        }
        peers.insert(peer.id.clone(), peer);
    }

    /// Refresh a peer's liveness. Unknown ids are ignored.
    pub async fn touch(&self, peer_id: &str) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = Instant::now();
                true
            }
            None => {
                tracing::debug!("Keepalive from unknown peer {}", peer_id);
                false
            }
        }
    }

    /// Snapshot of a single peer
    pub async fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Snapshot of every peer, ordered by id
    pub async fn peers(&self) -> Vec<Peer> {
        let mut all: Vec<Peer> = self.peers.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Routes advertised through a peer
    pub async fn routes(&self, peer_id: &str) -> Vec<Route> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|p| p.routes.clone())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Remove a peer and every route it carried
    pub async fn remove_peer(&self, peer_id: &str) -> Option<Peer> {
        self.peers.write().await.remove(peer_id)
    }

    /// Attach a route to the peer that advertised it. A route with the same
    /// destination and next hop replaces the earlier one.
    pub async fn advertise_route(&self, owner: &str, route: Route) -> Result<(), DirectoryError> {
        if route.metric == NO_ROUTE {
            return Err(DirectoryError::InvalidMetric(route.metric));
        }

        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(owner)
            .ok_or_else(|| DirectoryError::UnknownPeer(owner.to_string()))?;

        match peer
            .routes
            .iter_mut()
            .find(|r| r.destination == route.destination && r.next_hop == route.next_hop)
        {
            Some(existing) => existing.metric = route.metric,
            None => {
                tracing::info!(
                    "Route {} via {} (metric {}) advertised by {}",
                    route.destination, route.next_hop, route.metric, owner
                );
                peer.routes.push(route);
            }
        }
        Ok(())
    }

    /// Best route to a destination: lowest metric, then the freshest owner,
    /// then the smallest owner id and next hop.
    pub async fn resolve(&self, destination: &str) -> Option<Route> {
        let peers = self.peers.read().await;

        let mut best: Option<(&Route, &Peer)> = None;
        for peer in peers.values() {
            for route in peer.routes.iter().filter(|r| r.destination == destination) {
                let better = match best {
                    None => true,
                    Some((best_route, best_owner)) => {
                        route
                            .metric
                            .cmp(&best_route.metric)
                            .then_with(|| best_owner.last_seen.cmp(&peer.last_seen))
                            .then_with(|| peer.id.cmp(&best_owner.id))
                            .then_with(|| route.next_hop.cmp(&best_route.next_hop))
                            .is_lt()
                    }
                };
                if better {
                    best = Some((route, peer));
                }
            }
        }

        best.map(|(route, _)| route.clone())
    }

    /// Evict every peer not seen within `timeout`, returning their ids
    pub async fn sweep(&self, timeout: Duration) -> Vec<String> {
        let mut peers = self.peers.write().await;
        let now = Instant::now();
        let mut evicted = Vec::new();

        peers.retain(|id, peer| {
            if now.duration_since(peer.last_seen) > timeout {
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });

        for id in &evicted {
            tracing::info!("Evicted stale peer {}", id);
        }
        evicted
    }

    /// Run `sweep(timeout)` every `interval` until shutdown
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        spawn_periodic("peer-sweeper", interval, shutdown, move || {
            let directory = Arc::clone(&directory);
            async move {
                directory.sweep(timeout).await;
            }
        })
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> Peer {
        Peer::new(
            id,
            "192.0.2.9:51000".parse().unwrap(),
            "10.0.0.2:51000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("node-1")).await;

        let got = dir.get("node-1").await.unwrap();
        assert_eq!(got.public_endpoint, "192.0.2.9:51000".parse().unwrap());
        assert_eq!(got.private_endpoint, "10.0.0.2:51000".parse().unwrap());
        assert!(got.idle() < Duration::from_secs(1));
        assert!(dir.get("node-2").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_is_idempotent() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("node-1")).await;
        let first = dir.get("node-1").await.unwrap();

        tokio::time::advance(Duration::from_millis(10)).await;
        dir.upsert_peer(peer("node-1")).await;
        let second = dir.get("node-1").await.unwrap();

        assert_eq!(dir.len().await, 1);
        assert_eq!(first.public_endpoint, second.public_endpoint);
        assert_eq!(first.private_endpoint, second.private_endpoint);
        assert_eq!(first.routes, second.routes);
        assert_eq!(first.registered_at, second.registered_at);
        assert!(second.last_seen >= first.last_seen);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_routes() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("node-1")).await;
        dir.advertise_route("node-1", Route::new("10.0.1.0", "node-1", 1)).await.unwrap();
        dir.upsert_peer(peer("node-1")).await;
        assert!(dir.routes("node-1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("node-1")).await;
        let before = dir.get("node-1").await.unwrap().last_seen;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(dir.touch("node-1").await);
        assert!(dir.get("node-1").await.unwrap().last_seen > before);

        // Unknown peers are not an error
        assert!(!dir.touch("ghost").await);
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn test_advertise_unknown_owner() {
        let dir = PeerDirectory::new();
        let err = dir
            .advertise_route("ghost", Route::new("10.0.1.0", "ghost", 1))
            .await
            .unwrap_err();
        assert_eq!(err, DirectoryError::UnknownPeer("ghost".into()));
        assert!(dir.resolve("10.0.1.0").await.is_none());
    }

    #[tokio::test]
    async fn test_advertise_rejects_no_route_metric() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("node-1")).await;
        let err = dir
            .advertise_route("node-1", Route::new("10.0.1.0", "node-1", NO_ROUTE))
            .await
            .unwrap_err();
        assert_eq!(err, DirectoryError::InvalidMetric(255));
    }

    #[tokio::test]
    async fn test_readvertise_replaces_metric() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("node-1")).await;
        dir.advertise_route("node-1", Route::new("10.0.1.0", "node-1", 7)).await.unwrap();
        dir.advertise_route("node-1", Route::new("10.0.1.0", "node-1", 3)).await.unwrap();
        dir.advertise_route("node-1", Route::new("10.0.2.0", "node-1", 3)).await.unwrap();

        let routes = dir.routes("node-1").await;
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0], Route::new("10.0.1.0", "node-1", 3));
    }

    #[tokio::test]
    async fn test_resolve_scenario() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("node-2")).await;
        dir.advertise_route("node-2", Route::new("10.0.1.0", "node-2", 2)).await.unwrap();

        let route = dir.resolve("10.0.1.0").await.unwrap();
        assert_eq!(route.next_hop, "node-2");
        assert_eq!(route.metric, 2);
        assert!(dir.resolve("10.0.9.0").await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_lowest_metric() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("a")).await;
        dir.upsert_peer(peer("b")).await;
        dir.advertise_route("a", Route::new("d", "a", 9)).await.unwrap();
        dir.advertise_route("b", Route::new("d", "b", 4)).await.unwrap();
        assert_eq!(dir.resolve("d").await.unwrap().next_hop, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_tie_prefers_fresher_owner() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("p1")).await;
        dir.upsert_peer(peer("p2")).await;
        dir.advertise_route("p1", Route::new("D", "p1", 5)).await.unwrap();
        dir.advertise_route("p2", Route::new("D", "p2", 5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        dir.touch("p1").await;
        for _ in 0..20 {
            assert_eq!(dir.resolve("D").await.unwrap().next_hop, "p1");
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        dir.touch("p2").await;
        assert_eq!(dir.resolve("D").await.unwrap().next_hop, "p2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_full_tie_is_deterministic() {
        let dir = PeerDirectory::new();
        for id in ["zeta", "alpha", "mid"] {
            dir.upsert_peer(peer(id)).await;
            dir.advertise_route(id, Route::new("D", id, 1)).await.unwrap();
        }
        // Paused clock: every owner has the same last_seen
        assert_eq!(dir.resolve("D").await.unwrap().next_hop, "alpha");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_stale_peers() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("stale")).await;
        dir.advertise_route("stale", Route::new("10.0.5.0", "stale", 1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        dir.upsert_peer(peer("fresh")).await;
        tokio::time::advance(Duration::from_secs(40)).await;

        let evicted = dir.sweep(Duration::from_secs(90)).await;
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(dir.get("stale").await.is_none());
        assert!(dir.get("fresh").await.is_some());
        assert!(dir.resolve("10.0.5.0").await.is_none());
        assert_eq!(dir.peers().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_survives_eviction() {
        let dir = PeerDirectory::new();
        dir.upsert_peer(peer("node-1")).await;
        let snapshot = dir.get("node-1").await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        dir.sweep(Duration::from_secs(1)).await;
        assert!(dir.is_empty().await);
        assert_eq!(snapshot.id, "node-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let dir = Arc::new(PeerDirectory::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = dir.spawn_sweeper(Duration::from_secs(1), Duration::from_secs(3), shutdown_rx);

        dir.upsert_peer(peer("node-1")).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(dir.get("node-1").await.is_none());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
