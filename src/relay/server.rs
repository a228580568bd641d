//! Relay Server
//!
//! UDP relay for peers that cannot reach each other directly. A session
//! announces its target with CONNECT; afterwards DATA frames from the session
//! are unwrapped and forwarded to the target, and datagrams arriving from the
//! target are wrapped in DATA and sent back to the session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{data_frame, parse_connect, parse_data, CONNECT_TAG, RELAY_ACK};
use crate::error::Result;
use crate::task::spawn_periodic;

/// Reply sent for a CONNECT the relay could not parse
const REJECT_REPLY: &[u8] = b"ERR malformed CONNECT";

struct Binding {
    target_id: String,
    target: SocketAddr,
    last_activity: Instant,
}

#[derive(Default)]
struct Bindings {
    /// session address -> binding
    sessions: HashMap<SocketAddr, Binding>,
    /// target address -> session address
    targets: HashMap<SocketAddr, SocketAddr>,
}

impl Bindings {
    fn bind(&mut self, session: SocketAddr, target_id: String, target: SocketAddr) {
        if let Some(old) = self.sessions.remove(&session) {
            if self.targets.get(&old.target) == Some(&session) {
                self.targets.remove(&old.target);
            }
        }
        self.targets.insert(target, session);
        self.sessions.insert(
            session,
            Binding {
                target_id,
                target,
                last_activity: Instant::now(),
            },
        );
    }

    fn reclaim(&mut self, idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, b)| now.duration_since(b.last_activity) > idle)
            .map(|(addr, _)| *addr)
            .collect();

        for session in &stale {
            if let Some(binding) = self.sessions.remove(session) {
                if self.targets.get(&binding.target) == Some(session) {
                    self.targets.remove(&binding.target);
                }
                tracing::info!("Released idle relay binding {} -> {}", session, binding.target_id);
            }
        }
        stale.len()
    }
}

/// Forwards datagrams between relay sessions and their targets
pub struct RelayServer {
    socket: Arc<UdpSocket>,
    idle_timeout: Duration,
    bindings: Arc<Mutex<Bindings>>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Bind the relay socket
    pub async fn bind(bind_address: &str, idle_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(bind_address).await?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::new(socket),
            idle_timeout,
            bindings: Arc::new(Mutex::new(Bindings::default())),
            shutdown: shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of active bindings
    pub async fn binding_count(&self) -> usize {
        self.bindings.lock().await.sessions.len()
    }

    /// Serve until `stop` is called
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Relay server listening on {}", self.local_addr()?);

        let reclaimer = self.spawn_reclaimer();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut buf = vec![0u8; 65_535];

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            if let Err(e) = self.handle_datagram(&buf[..len], src).await {
                                tracing::warn!("Relay error for {}: {}", src, e);
                            }
                        }
                        Err(e) => tracing::warn!("Relay receive error: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = reclaimer.await;
        tracing::info!("Relay server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    fn spawn_reclaimer(&self) -> JoinHandle<()> {
        let bindings = Arc::clone(&self.bindings);
        let idle = self.idle_timeout;
        let interval = (idle / 2).max(Duration::from_millis(10));
        spawn_periodic("relay-binding-reclaimer", interval, self.shutdown.subscribe(), move || {
            let bindings = Arc::clone(&bindings);
            async move {
                bindings.lock().await.reclaim(idle);
            }
        })
    }

    async fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) -> Result<()> {
        if datagram.starts_with(CONNECT_TAG) {
            let reply = match parse_connect(datagram) {
                Some((target_id, target)) => {
                    tracing::info!("Relay binding {} -> {} ({})", src, target_id, target);
                    self.bindings.lock().await.bind(src, target_id, target);
                    RELAY_ACK
                }
                None => REJECT_REPLY,
            };
            self.socket.send_to(reply, src).await?;
            return Ok(());
        }

        let route = {
            let mut bindings = self.bindings.lock().await;
            if let Some(binding) = bindings.sessions.get_mut(&src) {
                binding.last_activity = Instant::now();
                parse_data(datagram).map(|data| (binding.target, data.to_vec()))
            } else if let Some(session) = bindings.targets.get(&src).copied() {
                if let Some(binding) = bindings.sessions.get_mut(&session) {
                    binding.last_activity = Instant::now();
                }
                Some((session, data_frame(datagram)))
            } else {
                None
            }
        };

        match route {
            Some((dest, frame)) => {
                self.socket.send_to(&frame, dest).await?;
                tracing::trace!("Relayed {} bytes {} -> {}", frame.len(), src, dest);
            }
            None => tracing::debug!("Dropping {} bytes from unbound {}", datagram.len(), src),
        }
        Ok(())
    }
}
