//! Tunnel Loop
//!
//! An edge node joins the overlay with a Handshake, advertises its routes,
//! then pumps packets: TUN reads go to the control server as Data envelopes,
//! Data envelopes arriving from the server are written to the TUN device.
//! A background task keeps the node alive in the server's directory.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};

use crate::config::{resolve_address, AdvertisedRoute, SdwanConfig};
use crate::error::{Error, Result};
use crate::protocol::{HandshakePayload, Message, MessageType, Protocol, RouteAdvertisePayload};
use crate::task::spawn_periodic;
use crate::tun::TunDevice;

const MAX_DATAGRAM: usize = 65_535;

/// Client tuning
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Stable for the life of the process
    pub node_id: String,
    pub server_addr: SocketAddr,
    /// Reported public endpoint; the server substitutes the observed one when unset
    pub public_endpoint: Option<SocketAddr>,
    pub keep_alive: Duration,
    /// How long to wait for each join acknowledgment
    pub ack_timeout: Duration,
    pub advertise: Vec<AdvertisedRoute>,
}

impl ClientSettings {
    pub fn new(node_id: impl Into<String>, server_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            server_addr,
            public_endpoint: None,
            keep_alive: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5),
            advertise: Vec::new(),
        }
    }

    /// Settings derived from the configuration file
    pub async fn from_config(config: &mut SdwanConfig) -> Result<Self> {
        let node_id = config.ensure_node_id();
        let server_addr = resolve_address(&config.client.server_address).await?;
        let public_endpoint = match &config.client.public_address {
            Some(addr) => Some(resolve_address(addr).await?),
            None => None,
        };

        Ok(Self {
            node_id,
            server_addr,
            public_endpoint,
            keep_alive: config.keep_alive_interval(),
            ack_timeout: config.relay_handshake_timeout(),
            advertise: config.client.advertise.clone(),
        })
    }
}

/// An overlay edge node
pub struct TunnelClient {
    settings: ClientSettings,
    socket: Arc<UdpSocket>,
    protocol: Protocol,
    tun: Arc<dyn TunDevice>,
    shutdown: watch::Sender<bool>,
}

impl TunnelClient {
    /// Bind the client socket
    pub async fn new(settings: ClientSettings, protocol: Protocol, tun: Arc<dyn TunDevice>) -> Result<Self> {
        let bind_addr = if settings.server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            settings,
            socket: Arc::new(socket),
            protocol,
            tun,
            shutdown: shutdown_tx,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Handshake with the server and advertise every configured route
    pub async fn join(&self) -> Result<()> {
        self.request(&self.handshake()?).await?;
        tracing::info!("Joined overlay at {} as {}", self.settings.server_addr, self.settings.node_id);

        for (route, advert) in self.settings.advertise.iter().zip(self.advertisements()?) {
            self.request(&advert).await?;
            tracing::info!("Advertised route {} (metric {})", route.destination, route.metric);
        }
        Ok(())
    }

    fn handshake(&self) -> Result<Message> {
        let port = self.local_addr()?.port();
        let handshake = HandshakePayload {
            node_id: self.settings.node_id.clone(),
            public_endpoint: self
                .settings
                .public_endpoint
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
            private_endpoint: SocketAddr::new(IpAddr::V4(self.tun.local_overlay_address()), port),
        };
        Ok(handshake.to_message()?)
    }

    fn advertisements(&self) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(self.settings.advertise.len());
        for route in &self.settings.advertise {
            let advert = RouteAdvertisePayload {
                destination: route.destination.clone(),
                next_hop: self.settings.node_id.clone(),
                metric: route.metric,
            };
            messages.push(advert.to_message()?);
        }
        Ok(messages)
    }

    /// Send a control message without waiting for its reply
    async fn send(&self, message: &Message) -> Result<()> {
        let wire = self.protocol.encode(message)?;
        self.socket.send_to(&wire, self.settings.server_addr).await?;
        Ok(())
    }

    /// Send a control message and wait for its acknowledgment
    async fn request(&self, message: &Message) -> Result<()> {
        let wire = self.protocol.encode(message)?;
        self.socket.send_to(&wire, self.settings.server_addr).await?;

        let deadline = Instant::now() + self.settings.ack_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (len, src) = timeout(remaining, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "{} acknowledgment from {}",
                        message.msg_type, self.settings.server_addr
                    ))
                })??;
            if src != self.settings.server_addr {
                continue;
            }
            match self.protocol.decode(&buf[..len]) {
                Ok(reply) if reply.msg_type == message.msg_type && reply.is_ack() => return Ok(()),
                Ok(reply) => tracing::debug!("Ignoring {} while awaiting {} ack", reply.msg_type, message.msg_type),
                Err(e) => tracing::warn!("Dropped reply from {}: {}", src, e),
            }
        }
    }

    /// Join, then tunnel packets until `stop` is called or the device fails
    pub async fn run(&self) -> Result<()> {
        if !self.join_with_retry().await? {
            self.tun.close().await?;
            return Ok(());
        }

        let keepalive = self.spawn_keepalive();
        let result = tokio::try_join!(self.outbound_loop(), self.inbound_loop());

        self.stop();
        let _ = keepalive.await;
        self.tun.close().await?;
        tracing::info!("Tunnel for {} stopped", self.settings.node_id);
        result.map(|_| ())
    }

    /// Stop the client
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Join, retrying every keepalive period while the failure is transient.
    /// Returns false when stopped before joining.
    async fn join_with_retry(&self) -> Result<bool> {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                return Ok(false);
            }
            match self.join().await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Join failed: {}; retrying in {:?}", e, self.settings.keep_alive);
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.keep_alive) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_keepalive(&self) -> tokio::task::JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let protocol = self.protocol.clone();
        let server_addr = self.settings.server_addr;
        let node_id = self.settings.node_id.clone();

        spawn_periodic("keepalive", self.settings.keep_alive, self.shutdown.subscribe(), move || {
            let socket = Arc::clone(&socket);
            let protocol = protocol.clone();
            let node_id = node_id.clone();
            async move {
                let sent = match protocol.encode(&Message::keepalive(&node_id)) {
                    Ok(wire) => socket.send_to(&wire, server_addr).await.map(|_| ()).map_err(Error::from),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    tracing::warn!("Keepalive to {} failed: {}", server_addr, e);
                }
            }
        })
    }

    /// TUN -> server
    async fn outbound_loop(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                packet = self.tun.read() => {
                    let packet = packet?;
                    let wire = match self.protocol.encode(&Message::data(&packet)) {
                        Ok(wire) => wire,
                        Err(e) => {
                            tracing::warn!("Dropped {} byte packet: {}", packet.len(), e);
                            continue;
                        }
                    };
                    if let Err(e) = self.socket.send_to(&wire, self.settings.server_addr).await {
                        tracing::warn!("Send to {} failed: {}", self.settings.server_addr, e);
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// server -> TUN
    async fn inbound_loop(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, src) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("Receive error: {}", e);
                            continue;
                        }
                    };
                    let message = match self.protocol.decode(&buf[..len]) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!("Dropped datagram from {}: {}", src, e);
                            continue;
                        }
                    };
                    match message.msg_type {
                        MessageType::Data => {
                            tracing::trace!("Delivering {} bytes from {}", message.payload.len(), src);
                            if let Err(e) = self.tun.write(&message.payload).await {
                                tracing::warn!("Dropped {} byte packet from {}: {}", message.payload.len(), src, e);
                            }
                        }
                        _ if message.is_rejoin() && src == self.settings.server_addr => {
                            tracing::info!("Server {} lost {}, rejoining", src, self.settings.node_id);
                            if let Err(e) = self.send(&self.handshake()?).await {
                                tracing::warn!("Rejoin handshake to {} failed: {}", src, e);
                            }
                        }
                        // A handshake ack outside `join` completes a rejoin
                        MessageType::Handshake if message.is_ack() && src == self.settings.server_addr => {
                            for advert in self.advertisements()? {
                                if let Err(e) = self.send(&advert).await {
                                    tracing::warn!("Route advertisement to {} failed: {}", src, e);
                                }
                            }
                            tracing::info!("Rejoined overlay as {}", self.settings.node_id);
                        }
                        other if message.is_ack() => tracing::debug!("{} acknowledged by {}", other, src),
                        other => tracing::debug!("Ignoring {} from {}", other, src),
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ControlServer, ServerSettings};
    use crate::tun::{dest_ipv4, ipv4_packet, ChannelTun, ChannelTunHandle};
    use async_trait::async_trait;
    use tokio::task::JoinHandle;

    /// Rejects writes that are not IPv4 packets, the way the kernel does
    struct StrictTun(ChannelTun);

    #[async_trait]
    impl TunDevice for StrictTun {
        async fn read(&self) -> Result<Vec<u8>> {
            self.0.read().await
        }

        async fn write(&self, packet: &[u8]) -> Result<()> {
            if dest_ipv4(packet).is_none() {
                return Err(Error::Device("invalid argument".into()));
            }
            self.0.write(packet).await
        }

        async fn close(&self) -> Result<()> {
            self.0.close().await
        }

        fn local_overlay_address(&self) -> Ipv4Addr {
            self.0.local_overlay_address()
        }
    }

    async fn start_server() -> (Arc<ControlServer>, SocketAddr, JoinHandle<()>) {
        let settings = ServerSettings::new("127.0.0.1:9".parse().unwrap());
        let server = Arc::new(
            ControlServer::bind("127.0.0.1:0", Protocol::plaintext(), settings)
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            runner.run().await.unwrap();
        });
        (server, addr, handle)
    }

    async fn start_client(
        settings: ClientSettings,
        address: Ipv4Addr,
    ) -> (Arc<TunnelClient>, ChannelTunHandle, JoinHandle<Result<()>>) {
        let (tun, host) = ChannelTun::pair(address, 16);
        let client = Arc::new(
            TunnelClient::new(settings, Protocol::plaintext(), Arc::new(tun))
                .await
                .unwrap(),
        );
        let runner = Arc::clone(&client);
        let handle = tokio::spawn(async move { runner.run().await });
        (client, host, handle)
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_join_registers_node_and_routes() {
        let (server, addr, handle) = start_server().await;

        let mut settings = ClientSettings::new("node-2", addr);
        settings.advertise.push(AdvertisedRoute {
            destination: "10.0.1.0".into(),
            metric: 2,
        });
        let (tun, _host) = ChannelTun::pair(Ipv4Addr::new(10, 0, 1, 1), 4);
        let client = TunnelClient::new(settings, Protocol::plaintext(), Arc::new(tun))
            .await
            .unwrap();
        client.join().await.unwrap();

        let peer = server.directory().get("node-2").await.unwrap();
        assert_eq!(peer.private_endpoint.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)));
        assert_eq!(peer.public_endpoint.port(), client.local_addr().unwrap().port());
        let route = server.directory().resolve("10.0.1.0").await.unwrap();
        assert_eq!(route.next_hop, "node-2");
        assert_eq!(route.metric, 2);

        server.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_times_out_without_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut settings = ClientSettings::new("node-1", silent.local_addr().unwrap());
        settings.ack_timeout = Duration::from_millis(100);

        let (tun, _host) = ChannelTun::pair(Ipv4Addr::new(10, 0, 0, 2), 4);
        let client = TunnelClient::new(settings, Protocol::plaintext(), Arc::new(tun))
            .await
            .unwrap();
        assert!(matches!(client.join().await, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_packets_cross_the_overlay() {
        let (server, addr, handle) = start_server().await;

        let mut b_settings = ClientSettings::new("node-b", addr);
        b_settings.advertise.push(AdvertisedRoute {
            destination: "10.0.1.0".into(),
            metric: 1,
        });
        let (b, mut b_host, b_handle) = start_client(b_settings, Ipv4Addr::new(10, 0, 1, 7)).await;
        let (a, a_host, a_handle) =
            start_client(ClientSettings::new("node-a", addr), Ipv4Addr::new(10, 0, 0, 2)).await;

        let directory = Arc::clone(server.directory());
        wait_for(|| {
            let directory = Arc::clone(&directory);
            async move { directory.resolve("10.0.1.0").await.is_some() && directory.get("node-a").await.is_some() }
        })
        .await;

        let packet = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 1, 7), b"hello b");
        a_host.to_device.send(packet.clone()).await.unwrap();

        let delivered = timeout(Duration::from_secs(2), b_host.from_device.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, packet);

        a.stop();
        b.stop();
        a_handle.await.unwrap().unwrap();
        b_handle.await.unwrap().unwrap();
        server.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejoins_after_eviction() {
        let (server, addr, handle) = start_server().await;

        let mut settings = ClientSettings::new("node-1", addr);
        settings.keep_alive = Duration::from_millis(50);
        settings.advertise.push(AdvertisedRoute {
            destination: "10.0.0.0".into(),
            metric: 1,
        });
        let (client, _host, client_handle) = start_client(settings, Ipv4Addr::new(10, 0, 0, 2)).await;

        let directory = Arc::clone(server.directory());
        let registered = || {
            let directory = Arc::clone(&directory);
            async move { directory.get("node-1").await.is_some() && directory.resolve("10.0.0.0").await.is_some() }
        };
        wait_for(registered).await;

        server.directory().remove_peer("node-1").await;
        assert!(server.directory().resolve("10.0.0.0").await.is_none());

        wait_for(registered).await;
        assert_eq!(server.directory().resolve("10.0.0.0").await.unwrap().next_hop, "node-1");

        client.stop();
        client_handle.await.unwrap().unwrap();
        server.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_tun_write_is_dropped() {
        let (server, addr, handle) = start_server().await;

        let (tun, mut host) = ChannelTun::pair(Ipv4Addr::new(10, 0, 0, 2), 4);
        let client = Arc::new(
            TunnelClient::new(ClientSettings::new("node-1", addr), Protocol::plaintext(), Arc::new(StrictTun(tun)))
                .await
                .unwrap(),
        );
        let runner = Arc::clone(&client);
        let client_handle = tokio::spawn(async move { runner.run().await });

        let directory = Arc::clone(server.directory());
        wait_for(|| {
            let directory = Arc::clone(&directory);
            async move { directory.get("node-1").await.is_some() }
        })
        .await;

        let client_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), client.local_addr().unwrap().port());
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let protocol = Protocol::plaintext();
        sender
            .send_to(&protocol.encode(&Message::data(b"not a packet")).unwrap(), client_addr)
            .await
            .unwrap();

        let packet = ipv4_packet(Ipv4Addr::new(10, 0, 1, 7), Ipv4Addr::new(10, 0, 0, 2), b"still here");
        sender
            .send_to(&protocol.encode(&Message::data(&packet)).unwrap(), client_addr)
            .await
            .unwrap();

        let delivered = timeout(Duration::from_secs(2), host.from_device.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, packet);
        assert!(!client_handle.is_finished());

        client.stop();
        client_handle.await.unwrap().unwrap();
        server.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_retries_until_stopped() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut settings = ClientSettings::new("node-1", silent.local_addr().unwrap());
        settings.ack_timeout = Duration::from_millis(30);
        settings.keep_alive = Duration::from_millis(30);
        let (client, _host, client_handle) = start_client(settings, Ipv4Addr::new(10, 0, 0, 2)).await;

        // Several handshakes arrive while the server stays silent
        let mut buf = vec![0u8; MAX_DATAGRAM];
        for _ in 0..3 {
            let (len, _) = timeout(Duration::from_secs(2), silent.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let message = Protocol::plaintext().decode(&buf[..len]).unwrap();
            assert_eq!(message.msg_type, MessageType::Handshake);
        }
        assert!(!client_handle.is_finished());

        client.stop();
        client_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_refreshes_peer() {
        let (server, addr, handle) = start_server().await;

        let mut settings = ClientSettings::new("node-1", addr);
        settings.keep_alive = Duration::from_millis(50);
        let (client, _host, client_handle) = start_client(settings, Ipv4Addr::new(10, 0, 0, 2)).await;

        let directory = Arc::clone(server.directory());
        wait_for(|| {
            let directory = Arc::clone(&directory);
            async move { directory.get("node-1").await.is_some() }
        })
        .await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let peer = server.directory().get("node-1").await.unwrap();
            assert!(peer.idle() < Duration::from_millis(200));
        }

        client.stop();
        client_handle.await.unwrap().unwrap();
        server.stop();
        handle.await.unwrap();
    }
}
