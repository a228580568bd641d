//! TUN device abstraction
//!
//! The tunnel loop only needs to read and write whole IP packets, so the
//! device sits behind a small async trait. [`LinuxTun`] drives a kernel TUN
//! interface; [`ChannelTun`] is an in-memory device backed by channels.

mod channel;
#[cfg(target_os = "linux")]
mod linux;

pub use channel::{ChannelTun, ChannelTunHandle};
#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::Result;

/// A virtual network interface carrying raw IP packets
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Wait for the next outbound packet
    async fn read(&self) -> Result<Vec<u8>>;

    /// Inject a packet toward the local host
    async fn write(&self, packet: &[u8]) -> Result<()>;

    /// Stop the device. Later reads and writes fail.
    async fn close(&self) -> Result<()>;

    /// Address assigned to this node inside the overlay
    fn local_overlay_address(&self) -> Ipv4Addr;
}

/// Extract the destination IPv4 address from a raw IP packet
pub fn dest_ipv4(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || (packet[0] >> 4) != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// Extract the source IPv4 address from a raw IP packet
pub fn src_ipv4(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || (packet[0] >> 4) != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]))
}

/// Network address of `addr` under a `/prefix_len` mask
pub fn network_address(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let mask = match prefix_len {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    };
    Ipv4Addr::from(u32::from(addr) & mask)
}

#[cfg(test)]
pub(crate) fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&((20 + body.len()) as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet.extend_from_slice(body);
    packet
}
