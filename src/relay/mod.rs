//! Relay Connection Manager
//!
//! When a datagram cannot be delivered straight to a peer's public endpoint it
//! goes through a relay server instead. Each target peer gets its own session:
//! an ephemeral local UDP socket that has announced the target to the relay.
//!
//! Relay wire format (text tags, one per datagram):
//!
//! ```text
//! session -> relay   CONNECT:<target_id>:<target_ip>:<target_port>
//! relay   -> session OK
//! both directions    DATA:<bytes>
//! ```

pub mod server;

pub use server::RelayServer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::error::RelayError;
use crate::task::spawn_periodic;

/// Prefix of a session announcement
pub const CONNECT_TAG: &[u8] = b"CONNECT:";

/// Prefix of every relayed data frame
pub const DATA_TAG: &[u8] = b"DATA:";

/// Relay acknowledgment of a CONNECT
pub const RELAY_ACK: &[u8] = b"OK";

/// Largest relayed datagram
const MAX_DATAGRAM: usize = 65_535;

/// Build a CONNECT request for a target
pub fn connect_request(target_id: &str, target_endpoint: SocketAddr) -> Vec<u8> {
    format!("CONNECT:{}:{}", target_id, target_endpoint).into_bytes()
}

/// Parse a CONNECT request into (target_id, target_endpoint)
pub fn parse_connect(frame: &[u8]) -> Option<(String, SocketAddr)> {
    let rest = std::str::from_utf8(frame.strip_prefix(CONNECT_TAG)?).ok()?;
    let (target_id, endpoint) = rest.split_once(':')?;
    if target_id.is_empty() {
        return None;
    }
    Some((target_id.to_string(), endpoint.parse().ok()?))
}

/// Tag bytes as a relayed data frame
pub fn data_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DATA_TAG.len() + data.len());
    frame.extend_from_slice(DATA_TAG);
    frame.extend_from_slice(data);
    frame
}

/// Strip the data tag, if present
pub fn parse_data(frame: &[u8]) -> Option<&[u8]> {
    frame.strip_prefix(DATA_TAG)
}

/// Relay manager settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay server used by `open`
    pub relay_addr: SocketAddr,
    /// How long `open` waits for the relay's acknowledgment
    pub handshake_timeout: Duration,
    /// How long `receive` waits for a relayed datagram
    pub read_timeout: Duration,
}

impl RelayConfig {
    pub fn new(relay_addr: SocketAddr) -> Self {
        Self {
            relay_addr,
            handshake_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// A relayed session toward one target peer
struct RelayConnection {
    target_endpoint: SocketAddr,
    relay_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    last_activity: Instant,
}

/// Public view of an open session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub target_id: String,
    pub target_endpoint: SocketAddr,
    pub relay_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Owns every relayed session, keyed by target peer id
pub struct RelayManager {
    config: RelayConfig,
    sessions: Mutex<HashMap<String, RelayConnection>>,
}

impl RelayManager {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Default relay server address
    pub fn relay_addr(&self) -> SocketAddr {
        self.config.relay_addr
    }

    /// Open a session to `target_id` through the configured relay
    pub async fn open(&self, target_id: &str, target_endpoint: SocketAddr) -> Result<SessionInfo, RelayError> {
        self.open_via(target_id, target_endpoint, self.config.relay_addr).await
    }

    /// Open a session to `target_id` through a specific relay
    pub async fn open_via(
        &self,
        target_id: &str,
        target_endpoint: SocketAddr,
        relay_addr: SocketAddr,
    ) -> Result<SessionInfo, RelayError> {
        if self.sessions.lock().await.contains_key(target_id) {
            return Err(RelayError::AlreadyConnected(target_id.to_string()));
        }

        let bind_addr = if relay_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;

        socket
            .send_to(&connect_request(target_id, target_endpoint), relay_addr)
            .await
            .map_err(RelayError::RelaySendError)?;

        let reply = self.await_ack(&socket, relay_addr).await.map_err(|e| match e {
            RelayError::Timeout(_) => RelayError::RelayTimeout {
                target: target_id.to_string(),
                relay: relay_addr.to_string(),
            },
            other => other,
        })?;
        if reply != RELAY_ACK {
            return Err(RelayError::Rejected {
                target: target_id.to_string(),
                reply: String::from_utf8_lossy(&reply).into_owned(),
            });
        }

        let local_addr = socket.local_addr()?;
        let mut sessions = self.sessions.lock().await;
        // Another open for the same target may have completed while we waited
        if sessions.contains_key(target_id) {
            return Err(RelayError::AlreadyConnected(target_id.to_string()));
        }
        sessions.insert(
            target_id.to_string(),
            RelayConnection {
                target_endpoint,
                relay_addr,
                socket: Arc::new(socket),
                last_activity: Instant::now(),
            },
        );

        tracing::info!(
            "Relay session to {} ({}) opened via {} on {}",
            target_id, target_endpoint, relay_addr, local_addr
        );
        Ok(SessionInfo {
            target_id: target_id.to_string(),
            target_endpoint,
            relay_addr,
            local_addr,
        })
    }

    async fn await_ack(&self, socket: &UdpSocket, relay_addr: SocketAddr) -> Result<Vec<u8>, RelayError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut buf = [0u8; 512];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, src))) if src == relay_addr => return Ok(buf[..len].to_vec()),
                Ok(Ok((_, src))) => {
                    tracing::debug!("Ignoring datagram from {} while awaiting relay ack", src);
                }
                Ok(Err(e)) => return Err(RelayError::Io(e)),
                Err(_) => return Err(RelayError::Timeout(relay_addr.to_string())),
            }
        }
    }

    /// Forward `data` to `target_id` through its relay session
    pub async fn send(&self, target_id: &str, data: &[u8]) -> Result<(), RelayError> {
        let (socket, relay_addr) = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(target_id)
                .ok_or_else(|| RelayError::NoSuchConnection(target_id.to_string()))?;
            session.last_activity = Instant::now();
            (Arc::clone(&session.socket), session.relay_addr)
        };

        socket
            .send_to(&data_frame(data), relay_addr)
            .await
            .map_err(RelayError::RelaySendError)?;
        tracing::trace!("Relayed {} bytes to {} via {}", data.len(), target_id, relay_addr);
        Ok(())
    }

    /// Wait for the next relayed datagram addressed to the `target_id` session
    pub async fn receive(&self, target_id: &str) -> Result<Vec<u8>, RelayError> {
        let (socket, relay_addr) = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(target_id)
                .ok_or_else(|| RelayError::NoSuchConnection(target_id.to_string()))?;
            (Arc::clone(&session.socket), session.relay_addr)
        };

        let deadline = Instant::now() + self.config.read_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, src))) if src == relay_addr => break len,
                Ok(Ok((_, src))) => tracing::debug!("Dropping datagram from non-relay {}", src),
                Ok(Err(e)) => return Err(RelayError::Io(e)),
                Err(_) => return Err(RelayError::Timeout(target_id.to_string())),
            }
        };

        let data = parse_data(&buf[..len])
            .ok_or(RelayError::MalformedFrame(len))?
            .to_vec();

        if let Some(session) = self.sessions.lock().await.get_mut(target_id) {
            session.last_activity = Instant::now();
        }
        Ok(data)
    }

    /// Release the session to `target_id`
    pub async fn close(&self, target_id: &str) -> Result<(), RelayError> {
        match self.sessions.lock().await.remove(target_id) {
            Some(session) => {
                tracing::info!("Relay session to {} ({}) closed", target_id, session.target_endpoint);
                Ok(())
            }
            None => Err(RelayError::NoSuchConnection(target_id.to_string())),
        }
    }

    /// Release every session
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        sessions.clear();
        if count > 0 {
            tracing::info!("Closed {} relay session(s)", count);
        }
    }

    pub async fn contains(&self, target_id: &str) -> bool {
        self.sessions.lock().await.contains_key(target_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Ids of every open session, sorted
    pub async fn target_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every session idle for longer than `idle`, returning their ids
    pub async fn reclaim_idle(&self, idle: Duration) -> Vec<String> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let mut reclaimed = Vec::new();

        sessions.retain(|target_id, session| {
            if now.duration_since(session.last_activity) > idle {
                reclaimed.push(target_id.clone());
                false
            } else {
                true
            }
        });

        for target_id in &reclaimed {
            tracing::info!("Reclaimed idle relay session to {}", target_id);
        }
        reclaimed
    }

    /// Run `reclaim_idle(idle)` every `interval` until shutdown
    pub fn spawn_reclaimer(
        self: &Arc<Self>,
        interval: Duration,
        idle: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        spawn_periodic("relay-reclaimer", interval, shutdown, move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.reclaim_idle(idle).await;
            }
        })
    }
}
