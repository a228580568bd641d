//! In-memory TUN device

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::TunDevice;
use crate::error::{Error, Result};

/// A TUN device whose packets travel over channels
pub struct ChannelTun {
    address: Ipv4Addr,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
}

/// The host side of a [`ChannelTun`]
pub struct ChannelTunHandle {
    /// Packets sent here are returned by the device's `read`
    pub to_device: mpsc::Sender<Vec<u8>>,
    /// Packets passed to the device's `write` arrive here
    pub from_device: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTun {
    /// Create a device and its host handle
    pub fn pair(address: Ipv4Addr, capacity: usize) -> (Self, ChannelTunHandle) {
        let (to_device, inbound) = mpsc::channel(capacity);
        let (outbound, from_device) = mpsc::channel(capacity);
        let device = Self {
            address,
            inbound: Mutex::new(inbound),
            outbound,
            closed: AtomicBool::new(false),
        };
        (device, ChannelTunHandle { to_device, from_device })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Device("device closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TunDevice for ChannelTun {
    async fn read(&self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Device("host handle dropped".into()))
    }

    async fn write(&self, packet: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| Error::Device("host handle dropped".into()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.lock().await.close();
        Ok(())
    }

    fn local_overlay_address(&self) -> Ipv4Addr {
        self.address
    }
}
