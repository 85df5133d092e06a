//! Instance configuration types shared between the boot-data compiler and
//! the network control plane.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

/// VM backend used to run the instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    #[default]
    Qemu,
    /// macOS Virtualization.framework style backend. Its virtual switch
    /// answers DNS at the gateway address itself.
    Vz,
}

/// Transport used to expose host directories to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountType {
    #[default]
    #[serde(rename = "reverse-sshfs")]
    ReverseSshfs,
    #[serde(rename = "9p")]
    NineP,
    #[serde(rename = "virtiofs")]
    Virtiofs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
}

/// 9p protocol tuning knobs. Ignored by the other transports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NinePOptions {
    #[serde(default)]
    pub protocol_version: Option<String>,
    /// Human-readable size, e.g. "128KiB".
    #[serde(default)]
    pub msize: Option<String>,
    #[serde(default)]
    pub cache: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountConfig {
    /// Host path, `~`-expandable.
    pub location: String,
    /// Absolute guest path. Defaults to `location` when omitted.
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default, rename = "9p")]
    pub nine_p: NinePOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    pub name: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub fs_args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRef {
    /// Reference to a named network in the host-wide network config.
    #[serde(default)]
    pub skiff: Option<String>,
    /// Direct socket path to a running switch daemon.
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub metric: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostResolver {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaCertificates {
    /// Certificate files on the host, `~`-expandable.
    #[serde(default)]
    pub files: Vec<String>,
    /// Inline PEM blocks.
    #[serde(default)]
    pub certs: Vec<String>,
    #[serde(default)]
    pub remove_defaults: bool,
}

/// How a provisioning entry is consumed by the guest.
///
/// Unknown modes fail YAML deserialization, which is the earliest possible
/// hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionMode {
    System,
    User,
    Dependency,
    Boot,
    Data,
    Ansible,
}

impl std::fmt::Display for ProvisionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionMode::System => "system",
            ProvisionMode::User => "user",
            ProvisionMode::Dependency => "dependency",
            ProvisionMode::Boot => "boot",
            ProvisionMode::Data => "data",
            ProvisionMode::Ansible => "ansible",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provision {
    pub mode: ProvisionMode,
    /// Script text for script-like modes.
    #[serde(default)]
    pub script: Option<String>,
    /// Literal file content for data mode.
    #[serde(default)]
    pub content: Option<String>,
    /// Guest path for data mode.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub permissions: Option<String>,
    #[serde(default)]
    pub overwrite: Option<bool>,
    /// Dependency mode only: skip the default dependency resolution the
    /// base template would otherwise run.
    #[serde(default)]
    pub skip_default_dependency_resolution: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub vm_type: VmType,
    #[serde(default)]
    pub mount_type: MountType,
    #[serde(default)]
    pub user: UserConfig,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub additional_disks: Vec<DiskConfig>,
    #[serde(default)]
    pub networks: Vec<NetworkRef>,
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    #[serde(default)]
    pub host_resolver: HostResolver,
    #[serde(default)]
    pub ca_certificates: CaCertificates,
    #[serde(default)]
    pub provision: Vec<Provision>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub propagate_proxy_env: bool,
    #[serde(default)]
    pub containerd: bool,
}

/// Seed configuration used when an instance has no config file of its own.
pub const DEFAULT_TEMPLATE: &str = include_str!("../default.yaml");

impl InstanceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn default_template() -> Result<Self, ConfigError> {
        Self::parse(DEFAULT_TEMPLATE)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: InstanceConfig = serde_yaml::from_str(text)?;
        crate::validate(&config)?;
        Ok(config)
    }
}

/// Expand a leading `~/` against the current home directory.
pub fn expand_home(path: &str, home: &str) -> String {
    if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{}/{}", home.trim_end_matches('/'), rest)
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config = InstanceConfig::parse("user:\n  name: alice\n").unwrap();
        assert_eq!(config.user.name.as_deref(), Some("alice"));
        assert_eq!(config.vm_type, VmType::Qemu);
        assert_eq!(config.mount_type, MountType::ReverseSshfs);
    }

    #[test]
    fn unknown_provision_mode_is_rejected() {
        let err = InstanceConfig::parse("provision:\n  - mode: sideload\n    script: echo hi\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn default_template_parses() {
        let config = InstanceConfig::default_template().unwrap();
        assert_eq!(config.vm_type, VmType::Qemu);
        assert_eq!(config.mounts.len(), 2);
        assert_eq!(config.networks[0].skiff.as_deref(), Some("user-v2"));
    }

    #[test]
    fn mount_type_names() {
        let config = InstanceConfig::parse("mount_type: 9p\n").unwrap();
        assert_eq!(config.mount_type, MountType::NineP);
        let config = InstanceConfig::parse("mount_type: virtiofs\n").unwrap();
        assert_eq!(config.mount_type, MountType::Virtiofs);
    }

    #[test]
    fn expand_home_variants() {
        assert_eq!(expand_home("~/work", "/home/alice"), "/home/alice/work");
        assert_eq!(expand_home("~", "/home/alice"), "/home/alice");
        assert_eq!(expand_home("/tmp/x", "/home/alice"), "/tmp/x");
    }
}
