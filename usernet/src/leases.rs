//! DHCP lease table keyed by client MAC.

use crate::UsernetError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// First and last host octet handed out dynamically. Addresses below the
/// range are reserved for the gateway and static seeds.
const DYNAMIC_FIRST: u8 = 10;
const DYNAMIC_LAST: u8 = 254;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Lease {
    pub mac: String,
    pub ip: Ipv4Addr,
    #[serde(rename = "static")]
    pub is_static: bool,
}

#[derive(Debug)]
pub struct LeaseTable {
    subnet: Ipv4Addr,
    static_leases: BTreeMap<String, Ipv4Addr>,
    dynamic: BTreeMap<String, Ipv4Addr>,
}

impl LeaseTable {
    pub fn new(subnet: Ipv4Addr, static_leases: &BTreeMap<String, Ipv4Addr>) -> Self {
        let static_leases = static_leases
            .iter()
            .map(|(mac, ip)| (mac.to_ascii_lowercase(), *ip))
            .collect();
        LeaseTable {
            subnet,
            static_leases,
            dynamic: BTreeMap::new(),
        }
    }

    pub fn lookup(&self, mac: &str) -> Option<Ipv4Addr> {
        let mac = mac.to_ascii_lowercase();
        self.static_leases
            .get(&mac)
            .or_else(|| self.dynamic.get(&mac))
            .copied()
    }

    /// Assign an address for `mac`, reusing any existing lease. Static
    /// seeds always win over dynamic allocation.
    pub fn allocate(&mut self, mac: &str) -> Result<Ipv4Addr, UsernetError> {
        let mac = mac.to_ascii_lowercase();
        if let Some(ip) = self.static_leases.get(&mac) {
            return Ok(*ip);
        }
        if let Some(ip) = self.dynamic.get(&mac) {
            return Ok(*ip);
        }
        let taken: Vec<Ipv4Addr> = self
            .static_leases
            .values()
            .chain(self.dynamic.values())
            .copied()
            .collect();
        let base = self.subnet.octets();
        for host in DYNAMIC_FIRST..=DYNAMIC_LAST {
            let candidate = Ipv4Addr::new(base[0], base[1], base[2], host);
            if !taken.contains(&candidate) {
                tracing::info!(mac = %mac, ip = %candidate, "allocated lease");
                self.dynamic.insert(mac, candidate);
                return Ok(candidate);
            }
        }
        Err(UsernetError::LeaseExhausted(self.subnet))
    }

    pub fn leases(&self) -> Vec<Lease> {
        let mut out: Vec<Lease> = self
            .static_leases
            .iter()
            .map(|(mac, ip)| Lease {
                mac: mac.clone(),
                ip: *ip,
                is_static: true,
            })
            .chain(self.dynamic.iter().map(|(mac, ip)| Lease {
                mac: mac.clone(),
                ip: *ip,
                is_static: false,
            }))
            .collect();
        out.sort_by(|a, b| a.ip.cmp(&b.ip));
        out
    }
}

pub fn parse_mac(s: &str) -> Result<[u8; 6], UsernetError> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        let part = parts
            .next()
            .ok_or_else(|| UsernetError::InvalidMac(s.to_string()))?;
        *byte =
            u8::from_str_radix(part, 16).map_err(|_| UsernetError::InvalidMac(s.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(UsernetError::InvalidMac(s.to_string()));
    }
    Ok(mac)
}

pub fn format_hw(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LeaseTable {
        let mut statics = BTreeMap::new();
        statics.insert(
            "52:55:55:00:00:01".to_string(),
            Ipv4Addr::new(192, 168, 104, 5),
        );
        LeaseTable::new(Ipv4Addr::new(192, 168, 104, 0), &statics)
    }

    #[test]
    fn static_seed_wins() {
        let mut t = table();
        let ip = t.allocate("52:55:55:00:00:01").unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 104, 5));
        // Case-insensitive on the MAC.
        assert_eq!(t.lookup("52:55:55:00:00:01"), Some(ip));
        assert_eq!(t.allocate("52:55:55:00:00:01").unwrap(), ip);
    }

    #[test]
    fn dynamic_allocation_is_stable_per_mac() {
        let mut t = table();
        let a = t.allocate("aa:bb:cc:dd:ee:01").unwrap();
        let b = t.allocate("aa:bb:cc:dd:ee:02").unwrap();
        assert_ne!(a, b);
        assert_eq!(t.allocate("aa:bb:cc:dd:ee:01").unwrap(), a);
        assert_eq!(a, Ipv4Addr::new(192, 168, 104, 10));
    }

    #[test]
    fn leases_are_sorted_by_ip() {
        let mut t = table();
        t.allocate("aa:bb:cc:dd:ee:01").unwrap();
        let leases = t.leases();
        assert_eq!(leases.len(), 2);
        assert!(leases[0].is_static);
        assert!(leases[0].ip < leases[1].ip);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut t = LeaseTable::new(Ipv4Addr::new(10, 0, 0, 0), &BTreeMap::new());
        for i in 0..245u32 {
            t.allocate(&format!("02:00:00:00:{:02x}:{:02x}", i / 256, i % 256))
                .unwrap();
        }
        assert!(matches!(
            t.allocate("02:00:00:00:ff:ff"),
            Err(UsernetError::LeaseExhausted(_))
        ));
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("52:55:55:00:00:01").unwrap(),
            [0x52, 0x55, 0x55, 0, 0, 1]
        );
        assert!(parse_mac("not-a-mac").is_err());
        assert!(parse_mac("52:55:55:00:00").is_err());
        assert!(parse_mac("52:55:55:00:00:01:02").is_err());
        assert_eq!(format_hw(&[0x52, 0x55, 0x55, 0, 0, 1]), "52:55:55:00:00:01");
    }
}
