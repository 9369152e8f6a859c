//! TUN device contract and the Linux implementation.
//!
//! The forwarding engine only needs packet reads and writes on a layer-3
//! interface; everything else about device provisioning stays behind
//! [`LinuxTun::create`]. Tests substitute an in-memory device through the
//! [`TunDevice`] trait. Creating a real device requires CAP_NET_ADMIN.

use std::io;
use std::net::Ipv4Addr;

use ipnet::IpNet;
use tun::{AbstractDevice, AsyncDevice, Configuration};

/// Minimal device surface the engine drives: one IP packet per read/write.
#[allow(async_fn_in_trait)]
pub trait TunDevice {
    /// Read one IP packet into `buf`, returning its length.
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one IP packet to the device.
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;

    /// Interface name, for logging.
    fn name(&self) -> &str;
}

/// Linux tun device backed by the `tun` crate's async wrapper.
pub struct LinuxTun {
    device: AsyncDevice,
    name: String,
}

impl LinuxTun {
    /// Create the interface with the given address, bring it up.
    ///
    /// `name` may be empty to let the kernel pick one. The wire layer is
    /// IPv4 only, so an IPv6 address is rejected here rather than at the
    /// first packet.
    pub fn create(name: &str, ip: IpNet, mtu: u16) -> io::Result<Self> {
        let addr = match ip.addr() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "tunnel addresses are IPv4 only",
                ))
            }
        };

        let mut config = Configuration::default();
        if !name.is_empty() {
            config.tun_name(name);
        }
        config.address(addr);
        config.netmask(prefix_to_netmask(ip.prefix_len()));
        config.mtu(mtu);
        config.up();

        let device = tun::create_as_async(&config)
            .map_err(|e| io::Error::other(format!("failed to create tun device: {e}")))?;
        let name = device
            .tun_name()
            .map_err(|e| io::Error::other(format!("failed to get tun name: {e}")))?;

        Ok(Self { device, name })
    }
}

impl TunDevice for LinuxTun {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.device.send(packet).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(mask)
}

#[cfg(test)]
mod tests {
    use super::{prefix_to_netmask, LinuxTun};
    use std::net::Ipv4Addr;

    #[test]
    fn netmask_from_prefix() {
        assert_eq!(prefix_to_netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_netmask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(prefix_to_netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_netmask(0), Ipv4Addr::new(0, 0, 0, 0));
    }

    #[test]
    fn ipv6_address_is_rejected() {
        let result = LinuxTun::create("", "fd00::1/64".parse().unwrap(), 1500);
        assert!(result.is_err());
    }

    #[test]
    #[ignore = "requires CAP_NET_ADMIN"]
    fn create_real_device() {
        let ip = "10.42.42.1/24".parse().unwrap();
        match LinuxTun::create("mtun-test0", ip, 1500) {
            Ok(dev) => assert!(!dev.name.is_empty()),
            Err(e) => panic!("tun create failed: {e}"),
        }
    }
}
