//! Linux TUN device
//!
//! Opens `/dev/net/tun`, configures the interface with `ip`, and drives the
//! non-blocking descriptor through tokio's reactor.

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use super::TunDevice;
use crate::error::{Error, Result};

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the write direction as 4
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Owned TUN descriptor, closed on drop
struct TunFd(RawFd);

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// A kernel TUN interface
pub struct LinuxTun {
    fd: AsyncFd<TunFd>,
    name: String,
    address: Ipv4Addr,
    mtu: u16,
    closed: AtomicBool,
}

impl LinuxTun {
    /// Create the interface, assign `address/prefix_len`, set the MTU and
    /// bring it up. Requires CAP_NET_ADMIN.
    pub fn create(name: &str, address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<Self> {
        let raw = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if raw < 0 {
            return Err(Error::Device(format!(
                "Failed to open /dev/net/tun: {}",
                io::Error::last_os_error()
            )));
        }
        let tun_fd = TunFd(raw);

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        if unsafe { libc::ioctl(tun_fd.0, TUNSETIFF as _, &mut req as *mut _) } < 0 {
            return Err(Error::Device(format!(
                "ioctl TUNSETIFF failed: {}",
                io::Error::last_os_error()
            )));
        }

        let flags = unsafe { libc::fcntl(tun_fd.0, libc::F_GETFL) };
        if unsafe { libc::fcntl(tun_fd.0, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::Device(format!(
                "Failed to set O_NONBLOCK: {}",
                io::Error::last_os_error()
            )));
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();

        let device = Self {
            fd: AsyncFd::new(tun_fd)?,
            name: actual_name,
            address,
            mtu,
            closed: AtomicBool::new(false),
        };
        device.configure(prefix_len)?;

        tracing::info!(
            "TUN device {} up with {}/{} (mtu {})",
            device.name, address, prefix_len, mtu
        );
        Ok(device)
    }

    /// Interface name assigned by the kernel
    pub fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, prefix_len: u8) -> Result<()> {
        run_ip(&["addr", "add", &format!("{}/{}", self.address, prefix_len), "dev", &self.name])?;

        if let Err(e) = run_ip(&["link", "set", "dev", &self.name, "mtu", &self.mtu.to_string()]) {
            tracing::warn!("Failed to set MTU on {}: {}", self.name, e);
        }

        run_ip(&["link", "set", "dev", &self.name, "up"])
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Device(format!("{} is closed", self.name)));
        }
        Ok(())
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(Error::Device(format!("`ip {}` failed with {}", args.join(" "), status)));
    }
    Ok(())
}

#[async_trait]
impl TunDevice for LinuxTun {
    async fn read(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.mtu as usize + 64];
        loop {
            self.ensure_open()?;
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(inner.get_ref().0, buf.as_mut_ptr() as *mut _, buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, packet: &[u8]) -> Result<()> {
        loop {
            self.ensure_open()?;
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(inner.get_ref().0, packet.as_ptr() as *const _, packet.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
            match result {
                Ok(r) => return r.map_err(Error::from),
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("TUN device {} closed", self.name);
        }
        Ok(())
    }

    fn local_overlay_address(&self) -> Ipv4Addr {
        self.address
    }
}
