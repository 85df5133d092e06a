//! Address derivation for user-mode networks.
//!
//! Gateway and DNS addresses are fixed offsets from the subnet base: +1 is
//! reserved, +2 is the gateway, +3 is the DNS server. MAC addresses are
//! derived deterministically from a stable per-instance seed so an instance
//! keeps its address across restarts.

use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Gateway address for a subnet: base + 2.
pub fn gateway_ip(subnet: Ipv4Addr) -> Ipv4Addr {
    offset_ip(subnet, 2)
}

/// DNS address for a subnet: base + 3.
pub fn dns_ip(subnet: Ipv4Addr) -> Ipv4Addr {
    offset_ip(subnet, 3)
}

fn offset_ip(base: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).wrapping_add(offset))
}

/// Big-endian increment with wraparound, uniform over v4 and v6.
pub fn increment_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            increment_bytes(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            increment_bytes(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

fn increment_bytes(bytes: &mut [u8]) {
    for b in bytes.iter_mut().rev() {
        let (next, carry) = b.overflowing_add(1);
        *b = next;
        if !carry {
            return;
        }
    }
}

/// Derive a stable MAC address from a per-instance seed such as the
/// instance directory path. The locally-administered bit is set and the
/// multicast bit cleared; these addresses are not globally registered.
pub fn derive_mac(seed: &str) -> [u8; 6] {
    let digest = Sha256::digest(seed.as_bytes());
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&digest[..6]);
    mac[0] = (mac[0] | 0x02) & 0xfe;
    mac
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_and_dns_offsets() {
        let subnet = Ipv4Addr::new(192, 168, 5, 0);
        assert_eq!(gateway_ip(subnet), Ipv4Addr::new(192, 168, 5, 2));
        assert_eq!(dns_ip(subnet), Ipv4Addr::new(192, 168, 5, 3));
    }

    #[test]
    fn increment_v4() {
        let a: IpAddr = "10.0.0.255".parse().unwrap();
        assert_eq!(increment_addr(a), "10.0.1.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn increment_wraps_v4() {
        let a: IpAddr = "255.255.255.255".parse().unwrap();
        assert_eq!(increment_addr(a), "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn increment_wraps_v6() {
        let a: IpAddr = "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap();
        assert_eq!(increment_addr(a), "::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn increment_v6() {
        let a: IpAddr = "fd00::ff".parse().unwrap();
        assert_eq!(increment_addr(a), "fd00::100".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn mac_is_stable_and_locally_administered() {
        let a = derive_mac("/home/alice/.skiff/default");
        let b = derive_mac("/home/alice/.skiff/default");
        let c = derive_mac("/home/alice/.skiff/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a[0] & 0x02, 0x02, "locally administered bit");
        assert_eq!(a[0] & 0x01, 0, "unicast");
    }

    #[test]
    fn mac_formatting() {
        let mac = [0x02, 0xab, 0x00, 0x01, 0x02, 0x03];
        assert_eq!(format_mac(&mac), "02:ab:00:01:02:03");
    }
}
