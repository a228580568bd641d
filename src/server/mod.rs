//! Control Loop
//!
//! The control server owns one UDP socket. Every datagram is decoded and
//! dispatched by type: Handshake, KeepAlive, RouteAdvertise and NATRequest
//! update state and are acknowledged with `OK`; Data packets are routed to
//! the peer advertising their destination, directly when possible and through
//! the relay otherwise. Relay handshakes run on their own tasks so a silent
//! relay never stalls the receive loop.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};

use crate::config::{resolve_address, SdwanConfig};
use crate::directory::{Peer, PeerDirectory, Route};
use crate::error::{ProtocolError, RelayError, Result};
use crate::protocol::{
    HandshakePayload, Message, MessageType, NatRequestPayload, Protocol, RouteAdvertisePayload,
};
use crate::relay::{RelayConfig, RelayManager};
use crate::tun::{dest_ipv4, network_address, src_ipv4};

/// Largest datagram the control socket accepts
const MAX_DATAGRAM: usize = 65_535;

/// Control server tuning
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Prefix used to map a packet's destination to a subnet route
    pub route_prefix_len: u8,
    /// How often stale peers are swept
    pub sweep_interval: Duration,
    /// Silence after which a peer is evicted
    pub peer_timeout: Duration,
    /// Relay used as the fallback path
    pub relay: RelayConfig,
    pub relay_idle_timeout: Duration,
    pub relay_reclaim_interval: Duration,
}

impl ServerSettings {
    pub fn new(relay_addr: SocketAddr) -> Self {
        Self {
            route_prefix_len: 24,
            sweep_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(90),
            relay: RelayConfig::new(relay_addr),
            relay_idle_timeout: Duration::from_secs(300),
            relay_reclaim_interval: Duration::from_secs(60),
        }
    }

    /// Settings derived from the configuration file
    pub async fn from_config(config: &SdwanConfig) -> Result<Self> {
        let relay_addr = resolve_address(&config.relay_address()).await?;
        Ok(Self {
            route_prefix_len: config.network.route_prefix_len,
            sweep_interval: config.keep_alive_interval(),
            peer_timeout: config.peer_timeout(),
            relay: RelayConfig {
                relay_addr,
                handshake_timeout: config.relay_handshake_timeout(),
                read_timeout: config.relay_read_timeout(),
            },
            relay_idle_timeout: config.relay_idle_timeout(),
            relay_reclaim_interval: config.relay_reclaim_interval(),
        })
    }
}

/// The overlay control server
pub struct ControlServer {
    socket: Arc<UdpSocket>,
    protocol: Protocol,
    directory: Arc<PeerDirectory>,
    relay: Arc<RelayManager>,
    /// Targets with a relay handshake in flight
    opening: Arc<Mutex<HashSet<String>>>,
    settings: ServerSettings,
    shutdown: watch::Sender<bool>,
}

impl ControlServer {
    /// Bind the control socket
    pub async fn bind(bind_address: &str, protocol: Protocol, settings: ServerSettings) -> Result<Self> {
        let socket = UdpSocket::bind(bind_address).await?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::new(socket),
            protocol,
            directory: Arc::new(PeerDirectory::new()),
            relay: Arc::new(RelayManager::new(settings.relay.clone())),
            opening: Arc::new(Mutex::new(HashSet::new())),
            settings,
            shutdown: shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn relay(&self) -> &Arc<RelayManager> {
        &self.relay
    }

    /// Serve until `stop` is called
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            "Control server listening on {} (encryption {})",
            self.local_addr()?,
            if self.protocol.crypto().is_enabled() { "on" } else { "off" }
        );

        let sweeper = self.directory.spawn_sweeper(
            self.settings.sweep_interval,
            self.settings.peer_timeout,
            self.shutdown.subscribe(),
        );
        let reclaimer = self.relay.spawn_reclaimer(
            self.settings.relay_reclaim_interval,
            self.settings.relay_idle_timeout,
            self.shutdown.subscribe(),
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            if let Err(e) = self.handle_datagram(&buf[..len], src).await {
                                if e.is_per_datagram() {
                                    tracing::warn!("Dropped datagram from {}: {}", src, e);
                                } else {
                                    tracing::warn!("Error handling datagram from {}: {}", src, e);
                                }
                            }
                        }
                        Err(e) => tracing::warn!("Receive error: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = tokio::join!(sweeper, reclaimer);
        self.relay.close_all().await;
        tracing::info!("Control server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) -> Result<()> {
        let message = self.protocol.decode(datagram)?;
        tracing::trace!("Received {} ({} bytes) from {}", message.msg_type, message.length, src);

        match message.msg_type {
            MessageType::Handshake => self.handle_handshake(&message, src).await,
            MessageType::KeepAlive => self.handle_keepalive(&message, src).await,
            MessageType::RouteAdvertise => self.handle_route_advertise(&message, src).await,
            MessageType::NatRequest => self.handle_nat_request(&message, src).await,
            MessageType::Data => self.forward(&message.payload).await,
        }
    }

    async fn reply_ack(&self, msg_type: MessageType, dest: SocketAddr) -> Result<()> {
        let wire = self.protocol.encode(&Message::ack(msg_type))?;
        self.socket.send_to(&wire, dest).await?;
        Ok(())
    }

    async fn handle_handshake(&self, message: &Message, src: SocketAddr) -> Result<()> {
        let handshake = HandshakePayload::from_message(message)?;
        let public_endpoint = if handshake.public_endpoint.ip().is_unspecified() {
            src
        } else {
            handshake.public_endpoint
        };

        self.directory
            .upsert_peer(Peer::new(handshake.node_id, public_endpoint, handshake.private_endpoint))
            .await;
        self.reply_ack(MessageType::Handshake, src).await
    }

    async fn handle_keepalive(&self, message: &Message, src: SocketAddr) -> Result<()> {
        let sender = message.keepalive_sender()?;
        if self.directory.touch(sender).await {
            return self.reply_ack(MessageType::KeepAlive, src).await;
        }

        tracing::info!("Asking unknown peer {} at {} to rejoin", sender, src);
        let wire = self.protocol.encode(&Message::rejoin())?;
        self.socket.send_to(&wire, src).await?;
        Ok(())
    }

    async fn handle_route_advertise(&self, message: &Message, src: SocketAddr) -> Result<()> {
        let advert = RouteAdvertisePayload::from_message(message)?;
        // The advertised next hop owns the route
        let owner = advert.next_hop.clone();
        self.directory
            .advertise_route(&owner, Route::new(advert.destination, advert.next_hop, advert.metric))
            .await?;
        self.reply_ack(MessageType::RouteAdvertise, src).await
    }

    async fn handle_nat_request(&self, message: &Message, src: SocketAddr) -> Result<()> {
        let request = NatRequestPayload::from_message(message)?;
        if self.relay.contains(&request.target_id).await {
            tracing::debug!("Relay session to {} already open", request.target_id);
            return self.reply_ack(MessageType::NatRequest, src).await;
        }

        let socket = Arc::clone(&self.socket);
        let protocol = self.protocol.clone();
        self.spawn_relay_open(
            request.target_id,
            request.target_endpoint,
            request.relay_endpoint,
            move |_| async move {
                match protocol.encode(&Message::ack(MessageType::NatRequest)) {
                    Ok(wire) => {
                        if let Err(e) = socket.send_to(&wire, src).await {
                            tracing::warn!("NATRequest ack to {} failed: {}", src, e);
                        }
                    }
                    Err(e) => tracing::warn!("NATRequest ack to {} failed: {}", src, e),
                }
            },
        )
        .await;
        Ok(())
    }

    /// Open a relay session on its own task, then run `on_open`. Requests for
    /// a target whose handshake is already in flight are dropped.
    async fn spawn_relay_open<F, Fut>(
        &self,
        target_id: String,
        target_endpoint: SocketAddr,
        relay_addr: SocketAddr,
        on_open: F,
    ) where
        F: FnOnce(Arc<RelayManager>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if !self.opening.lock().await.insert(target_id.clone()) {
            tracing::debug!("Relay session to {} still opening, dropping request", target_id);
            return;
        }

        let relay = Arc::clone(&self.relay);
        let opening = Arc::clone(&self.opening);
        tokio::spawn(async move {
            let result = relay.open_via(&target_id, target_endpoint, relay_addr).await;
            opening.lock().await.remove(&target_id);
            match result {
                Ok(_) | Err(RelayError::AlreadyConnected(_)) => on_open(relay).await,
                Err(e) => tracing::warn!("Relay session to {} via {} failed: {}", target_id, relay_addr, e),
            }
        });
    }

    /// Route a Data packet toward the peer advertising its destination
    async fn forward(&self, packet: &[u8]) -> Result<()> {
        let dest_ip = dest_ipv4(packet).ok_or_else(|| ProtocolError::InvalidPayload {
            kind: "Data",
            reason: "not an IPv4 packet".into(),
        })?;

        let host = dest_ip.to_string();
        let subnet = network_address(dest_ip, self.settings.route_prefix_len).to_string();
        let route = match self.directory.resolve(&host).await {
            Some(route) => route,
            None => match self.directory.resolve(&subnet).await {
                Some(route) => route,
                None => {
                    tracing::debug!("No route to {} ({}), dropping packet", host, subnet);
                    return Ok(());
                }
            },
        };

        let peer = match self.directory.get(&route.next_hop).await {
            Some(peer) => peer,
            None => {
                tracing::debug!("Next hop {} for {} is gone, dropping packet", route.next_hop, host);
                return Ok(());
            }
        };

        let wire = self.protocol.encode(&Message::data(packet))?;
        let sent = self.socket.send_to(&wire, peer.public_endpoint).await;
        match sent {
            Ok(_) => {
                tracing::trace!(
                    "Forwarded {} bytes {} -> {} to {}",
                    packet.len(),
                    src_ipv4(packet).map(|ip| ip.to_string()).unwrap_or_default(),
                    host,
                    peer.id
                );
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Direct send to {} failed ({}), using relay", peer.id, e);
                self.relay_send(peer, wire).await
            }
        }
    }

    /// Send through the peer's relay session, opening one in the background
    /// when none exists. The packet that triggers the open is sent once it
    /// completes; packets arriving meanwhile are dropped.
    async fn relay_send(&self, peer: Peer, wire: Vec<u8>) -> Result<()> {
        if self.relay.contains(&peer.id).await {
            self.relay.send(&peer.id, &wire).await?;
            return Ok(());
        }

        let relay_addr = self.relay.relay_addr();
        let target_id = peer.id.clone();
        self.spawn_relay_open(peer.id, peer.public_endpoint, relay_addr, move |relay| async move {
            if let Err(e) = relay.send(&target_id, &wire).await {
                tracing::warn!("Relay send to {} failed: {}", target_id, e);
            }
        })
        .await;
        Ok(())
    }
}
