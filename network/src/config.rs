//! Host-wide network configuration.
//!
//! Persisted as YAML under the skiff config directory, shared by every
//! instance. Loaded at most once per process; config edits require
//! `invalidate()` (tests) or a process restart.

use crate::NetworkError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DEFAULT_SUBNET: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 0);
pub const USERNET_SUBNET: Ipv4Addr = Ipv4Addr::new(192, 168, 104, 0);

/// Candidate install locations probed for the bridge daemon binary.
const BRIDGE_CANDIDATES: &[&str] = &[
    "/opt/skiff/bin/skiff-bridge",
    "/usr/local/bin/skiff-bridge",
    "/opt/homebrew/bin/skiff-bridge",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    UserV2,
    Host,
    Shared,
    Bridged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDef {
    pub mode: NetworkMode,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dhcp_end: Option<Ipv4Addr>,
    #[serde(default)]
    pub netmask: Option<Ipv4Addr>,
}

/// Switch-level tuning for a vmnet-style network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmnetDef {
    #[serde(default)]
    pub mode: Option<NetworkMode>,
    #[serde(default)]
    pub dhcp: Option<bool>,
    #[serde(default)]
    pub dns_proxy: Option<bool>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub nat44: Option<bool>,
    #[serde(default)]
    pub nat66: Option<bool>,
    #[serde(default)]
    pub router_advertisement: Option<bool>,
    #[serde(default)]
    pub subnet: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonPaths {
    pub switch_daemon: PathBuf,
    pub bridge_daemon: PathBuf,
    pub var_run: PathBuf,
    pub sudoers: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub paths: DaemonPaths,
    /// Group the daemons run under.
    pub group: String,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkDef>,
    #[serde(default)]
    pub vmnet: BTreeMap<String, VmnetDef>,
}

impl NetworkConfig {
    pub fn defaults() -> Self {
        let bridge = BRIDGE_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from(BRIDGE_CANDIDATES[0]));
        let mut networks = BTreeMap::new();
        networks.insert(
            "user-v2".to_string(),
            NetworkDef {
                mode: NetworkMode::UserV2,
                interface: None,
                gateway: Some(crate::addr::gateway_ip(USERNET_SUBNET)),
                dhcp_end: Some(Ipv4Addr::new(192, 168, 104, 254)),
                netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            },
        );
        networks.insert(
            "shared".to_string(),
            NetworkDef {
                mode: NetworkMode::Shared,
                interface: None,
                gateway: Some(Ipv4Addr::new(192, 168, 105, 1)),
                dhcp_end: Some(Ipv4Addr::new(192, 168, 105, 254)),
                netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            },
        );
        NetworkConfig {
            paths: DaemonPaths {
                switch_daemon: PathBuf::from("/opt/skiff/bin/skiff-switch"),
                bridge_daemon: bridge,
                var_run: PathBuf::from("/private/var/run/skiff"),
                sudoers: PathBuf::from("/etc/sudoers.d/skiff"),
            },
            group: "staff".to_string(),
            networks,
            vmnet: BTreeMap::new(),
        }
    }

    /// Load from `path`, creating it with computed defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self, NetworkError> {
        if !path.exists() {
            let config = Self::defaults();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_yaml::to_string(&config)?)?;
            tracing::info!(path = %path.display(), "wrote default network config");
            return Ok(config);
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Effective subnet of a user-v2 network, from the configured gateway.
    pub fn usernet_subnet(&self, name: &str) -> Option<Ipv4Addr> {
        let def = self.networks.get(name)?;
        if def.mode != NetworkMode::UserV2 {
            return None;
        }
        let gateway = def.gateway?;
        Some(Ipv4Addr::from(u32::from(gateway) & 0xffff_ff00))
    }
}

static CACHE: Mutex<Option<Arc<NetworkConfig>>> = Mutex::new(None);

/// Process-wide memoized load. Concurrent readers share one value.
pub fn load(path: &Path) -> Result<Arc<NetworkConfig>, NetworkError> {
    let mut cache = CACHE.lock().expect("network config cache poisoned");
    if let Some(config) = cache.as_ref() {
        return Ok(config.clone());
    }
    let config = Arc::new(NetworkConfig::load_from(path)?);
    *cache = Some(config.clone());
    Ok(config)
}

/// Drop the memoized config so the next `load` rereads from disk.
pub fn invalidate() {
    *CACHE.lock().expect("network config cache poisoned") = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_defaults_when_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("networks.yaml");
        let config = NetworkConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert!(config.networks.contains_key("user-v2"));
        // Round-trips.
        let again = NetworkConfig::load_from(&path).unwrap();
        assert_eq!(again.group, config.group);
    }

    #[test]
    fn usernet_subnet_from_gateway() {
        let config = NetworkConfig::defaults();
        assert_eq!(
            config.usernet_subnet("user-v2"),
            Some(Ipv4Addr::new(192, 168, 104, 0))
        );
        assert_eq!(config.usernet_subnet("shared"), None);
        assert_eq!(config.usernet_subnet("nope"), None);
    }

    #[test]
    fn cache_memoizes_until_invalidated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("networks.yaml");
        invalidate();
        let first = load(&path).unwrap();
        // A second load returns the same Arc even if the file changes.
        std::fs::write(&path, "garbage: [").unwrap();
        let second = load(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        invalidate();
        assert!(load(&path).is_err());
        invalidate();
    }
}
