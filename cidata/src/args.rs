//! Template args assembly and validation.
//!
//! `TemplateArgs` is the fully-resolved snapshot everything downstream
//! renders from. It is built once per boot-data generation, immutable
//! after validation, and re-validated immediately before rendering since
//! it is the last line of defense before data reaches shell/YAML
//! templates.

use crate::env::{Resolve, merge_proxy_env};
use crate::sshkeys::collect_ssh_keys;
use crate::CidataError;
use skiff_config::{
    InstanceConfig, MountType, ProvisionMode, VmType, expand_home,
};
use skiff_network::addr::{derive_mac, dns_ip, format_mac, gateway_ip};
use skiff_network::config::{DEFAULT_SUBNET, NetworkConfig, NetworkMode};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub name: String,
    pub uid: u32,
    pub comment: String,
    pub home: String,
    pub shell: String,
}

impl ResolvedUser {
    /// Identity of the invoking host user. Root is substituted with a
    /// plain fallback user; the guest user is never root.
    pub fn from_host() -> Result<Self, CidataError> {
        let uid = nix::unistd::geteuid();
        let user = nix::unistd::User::from_uid(uid)
            .map_err(|e| std::io::Error::other(e))?
            .ok_or_else(|| std::io::Error::other("current uid has no passwd entry"))?;
        let mut resolved = ResolvedUser {
            name: user.name,
            uid: uid.as_raw(),
            comment: user.gecos.to_string_lossy().into_owned(),
            home: String::new(),
            shell: "/bin/bash".to_string(),
        };
        if resolved.name == "root" || resolved.uid == 0 {
            resolved.name = "skiff".to_string();
            resolved.uid = 501;
        }
        resolved.home = format!("/home/{}.linux", resolved.name);
        Ok(resolved)
    }
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub tag: String,
    /// Host location after `~` expansion.
    pub location: String,
    /// Absolute guest path.
    pub mount_point: String,
    pub fs_type: String,
    pub options: Vec<String>,
    pub writable: bool,
    /// True when the location is the host home directory; provisioning
    /// scripts special-case the home mount.
    pub is_home: bool,
}

#[derive(Debug, Clone)]
pub struct Disk {
    pub name: String,
    /// `vdb`, `vdc`, ... in disk order; `vda` is the boot disk.
    pub device: String,
}

#[derive(Debug, Clone)]
pub struct NetIface {
    pub mac_address: String,
    pub interface: String,
    pub metric: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CaBundle {
    pub remove_defaults: bool,
    /// Each certificate as trimmed non-empty lines, so whitespace in the
    /// source never changes the rendered cloud-config.
    pub certs: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct DataFile {
    pub path: String,
    pub owner: String,
    pub permissions: String,
    pub overwrite: bool,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct TemplateArgs {
    pub name: String,
    pub hostname: String,
    /// Regenerated every boot so the guest recomputes its network config.
    pub instance_id: String,
    pub user: ResolvedUser,
    pub ssh_keys: Vec<String>,
    pub mount_type: MountType,
    pub mounts: Vec<Mount>,
    pub disks: Vec<Disk>,
    pub networks: Vec<NetIface>,
    pub env: BTreeMap<String, String>,
    pub dns: Vec<IpAddr>,
    pub host_resolver_ports: Option<(u16, u16)>,
    pub ca: CaBundle,
    pub boot_cmds: Vec<Vec<String>>,
    pub data_files: Vec<DataFile>,
    pub skip_default_dependency_resolution: bool,
    pub gateway: Ipv4Addr,
    pub dns_addr: Ipv4Addr,
    pub vsock_port: u32,
    pub containerd: bool,
}

/// Host-side inputs that are not part of the instance config. Everything
/// here is injectable so args assembly is testable offline.
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub home_dir: PathBuf,
    pub config_dir: PathBuf,
    pub collect_host_ssh_keys: bool,
    pub host_user: ResolvedUser,
    pub network_config: Option<Arc<NetworkConfig>>,
    pub udp_dns_local_port: u16,
    pub tcp_dns_local_port: u16,
    pub vsock_port: u32,
    pub resolv_conf: PathBuf,
    pub process_env: BTreeMap<String, String>,
    /// Result of `env::host_proxy_settings()`; its lookup error propagates
    /// from the caller, not from here.
    pub system_proxy_env: BTreeMap<String, String>,
}

impl TemplateArgs {
    pub fn build(
        instance_dir: &Path,
        name: &str,
        config: &InstanceConfig,
        params: &BuildParams,
        resolver: &dyn Resolve,
    ) -> Result<Self, CidataError> {
        // 1. Schema validation, even if the caller already parsed.
        skiff_config::validate(config)?;

        // 2. Default NAT addresses. A usernet-mode first network overrides
        // the fixed default subnet; the VZ backend answers DNS at the
        // gateway itself.
        let first_usernet = first_usernet_network(config, params);
        let subnet = first_usernet
            .as_ref()
            .and_then(|name| {
                params
                    .network_config
                    .as_ref()
                    .and_then(|nc| nc.usernet_subnet(name))
            })
            .unwrap_or(DEFAULT_SUBNET);
        let gateway = gateway_ip(subnet);
        let dns_addr = if config.vm_type == VmType::Vz {
            gateway
        } else {
            dns_ip(subnet)
        };

        // 3. Fresh instance id.
        let instance_id = fresh_instance_id();

        // 4. SSH keys.
        let ssh_keys = collect_ssh_keys(
            &params.config_dir,
            &params.home_dir,
            params.collect_host_ssh_keys,
        )?;

        // 5. Mounts.
        let home = params.home_dir.display().to_string();
        let mut mounts = Vec::with_capacity(config.mounts.len());
        for (i, m) in config.mounts.iter().enumerate() {
            let location = expand_home(&m.location, &home);
            let mount_point = m
                .mount_point
                .as_ref()
                .map(|p| expand_home(p, &home))
                .unwrap_or_else(|| location.clone());
            let (fs_type, options) = mount_options(config.mount_type, m)?;
            mounts.push(Mount {
                tag: format!("mount{}", i),
                is_home: location == home,
                location,
                mount_point,
                fs_type,
                options,
                writable: m.writable,
            });
        }

        // 6. Deterministic disk device letters; vda is the boot disk.
        let disks = config
            .additional_disks
            .iter()
            .enumerate()
            .map(|(i, d)| Disk {
                name: d.name.clone(),
                device: format!("vd{}", (b'b' + i as u8) as char),
            })
            .collect::<Vec<_>>();

        // 7. Network table; slot 0 is always the default NAT interface.
        let instance_seed = instance_dir.display().to_string();
        let mut networks = vec![NetIface {
            mac_address: format_mac(&derive_mac(&instance_seed)),
            interface: "skiff0".to_string(),
            metric: 100,
        }];
        for (i, net) in config.networks.iter().enumerate() {
            if i == 0 && first_usernet.is_some() {
                // Already represented by slot 0.
                continue;
            }
            let slot = networks.len();
            networks.push(NetIface {
                mac_address: net
                    .mac_address
                    .clone()
                    .unwrap_or_else(|| format_mac(&derive_mac(&format!("{}#{}", instance_seed, slot)))),
                interface: net
                    .interface
                    .clone()
                    .unwrap_or_else(|| format!("skiff{}", slot)),
                metric: net.metric.unwrap_or(100 + slot as u32),
            });
        }

        // 8. DNS precedence: explicit list, then usernet/VZ derived
        // address, then host-resolver forwarding, then the host OS
        // resolvers.
        let mut host_resolver_ports = None;
        let dns = if !config.dns.is_empty() {
            config.dns.clone()
        } else if first_usernet.is_some() || config.vm_type == VmType::Vz {
            vec![IpAddr::V4(dns_addr)]
        } else if config.host_resolver.enabled {
            host_resolver_ports = Some((params.udp_dns_local_port, params.tcp_dns_local_port));
            vec![IpAddr::V4(dns_addr)]
        } else {
            system_nameservers(&params.resolv_conf)
        };

        // 9. CA trust bundle.
        let mut certs = Vec::new();
        for file in &config.ca_certificates.files {
            let path = expand_home(file, &home);
            let text = std::fs::read_to_string(&path)?;
            certs.push(split_cert_lines(&text));
        }
        for cert in &config.ca_certificates.certs {
            certs.push(split_cert_lines(cert));
        }
        let ca = if certs.is_empty() && !config.ca_certificates.remove_defaults {
            // No explicit trust changes: omit the whole section.
            CaBundle::default()
        } else {
            CaBundle {
                remove_defaults: config.ca_certificates.remove_defaults,
                certs,
            }
        };

        // 10. Boot commands run inline from the rendered cloud-config.
        let boot_cmds = config
            .provision
            .iter()
            .filter(|p| p.mode == ProvisionMode::Boot)
            .filter_map(|p| p.script.as_ref())
            .map(|script| {
                script
                    .lines()
                    .map(str::trim_end)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let data_files = config
            .provision
            .iter()
            .filter(|p| p.mode == ProvisionMode::Data)
            .map(|p| DataFile {
                path: p.path.clone().unwrap_or_default(),
                owner: p.owner.clone().unwrap_or_else(|| "root:root".to_string()),
                permissions: p.permissions.clone().unwrap_or_else(|| "644".to_string()),
                overwrite: p.overwrite.unwrap_or(true),
                content: p.content.clone().unwrap_or_default(),
            })
            .collect::<Vec<_>>();

        // 11. Dependency-mode scripts may opt out of default dependency
        // resolution.
        let skip_default_dependency_resolution = config
            .provision
            .iter()
            .any(|p| p.mode == ProvisionMode::Dependency && p.skip_default_dependency_resolution);

        let user = resolve_user(config, params);
        let env = merge_proxy_env(
            &params.system_proxy_env,
            &config.env,
            config.propagate_proxy_env,
            &params.process_env,
            gateway,
            resolver,
        );

        let args = TemplateArgs {
            name: name.to_string(),
            hostname: hostname_for(name),
            instance_id,
            user,
            ssh_keys,
            mount_type: config.mount_type,
            mounts,
            disks,
            networks,
            env,
            dns,
            host_resolver_ports,
            ca,
            boot_cmds,
            data_files,
            skip_default_dependency_resolution,
            gateway,
            dns_addr,
            vsock_port: params.vsock_port,
            containerd: config.containerd,
        };
        args.validate()?;
        Ok(args)
    }

    /// Structural validation. Checked at construction and again right
    /// before rendering.
    pub fn validate(&self) -> Result<(), CidataError> {
        if !safe_identifier(&self.name) {
            return Err(invalid("name", format!("{:?} is not identifier-safe", self.name)));
        }
        if !safe_identifier(&self.user.name) {
            return Err(invalid(
                "user.name",
                format!("{:?} is not identifier-safe", self.user.name),
            ));
        }
        if self.user.name == "root" {
            return Err(invalid("user.name", "must not be root".into()));
        }
        if self.user.uid == 0 {
            return Err(invalid("user.uid", "must not be 0".into()));
        }
        if self.user.home.is_empty() {
            return Err(invalid("user.home", "must not be empty".into()));
        }
        if self.user.shell.is_empty() {
            return Err(invalid("user.shell", "must not be empty".into()));
        }
        if self.ssh_keys.is_empty() {
            return Err(invalid("ssh_keys", "at least one key is required".into()));
        }
        for mount in &self.mounts {
            if !mount.mount_point.starts_with('/') {
                return Err(invalid(
                    "mounts",
                    format!("mount point {:?} is not absolute", mount.mount_point),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> CidataError {
    CidataError::InvalidTemplateArgs { field, reason }
}

fn hostname_for(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("skiff-{}", sanitized)
}

fn fresh_instance_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("iid-{:x}", nanos)
}

/// Name of the first configured network when it refers to a usernet
/// (user-v2) definition.
fn first_usernet_network(config: &InstanceConfig, params: &BuildParams) -> Option<String> {
    let first = config.networks.first()?;
    let name = first.skiff.as_ref()?;
    let nc = params.network_config.as_ref()?;
    let def = nc.networks.get(name)?;
    (def.mode == NetworkMode::UserV2).then(|| name.clone())
}

fn resolve_user(config: &InstanceConfig, params: &BuildParams) -> ResolvedUser {
    let mut user = params.host_user.clone();
    if let Some(name) = &config.user.name {
        user.name = name.clone();
        user.home = format!("/home/{}.linux", name);
    }
    if let Some(uid) = config.user.uid {
        user.uid = uid;
    }
    if let Some(comment) = &config.user.comment {
        user.comment = comment.clone();
    }
    if let Some(home) = &config.user.home {
        user.home = home.clone();
    }
    if let Some(shell) = &config.user.shell {
        user.shell = shell.clone();
    }
    user
}

fn safe_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn mount_options(
    mount_type: MountType,
    m: &skiff_config::MountConfig,
) -> Result<(String, Vec<String>), CidataError> {
    let rw = if m.writable { "rw" } else { "ro" };
    match mount_type {
        MountType::NineP => {
            let version = m
                .nine_p
                .protocol_version
                .clone()
                .unwrap_or_else(|| "9p2000.L".to_string());
            let msize = parse_size(m.nine_p.msize.as_deref().unwrap_or("128KiB"))
                .map_err(|reason| invalid("mounts.9p.msize", reason))?;
            let cache = m
                .nine_p
                .cache
                .clone()
                .unwrap_or_else(|| if m.writable { "mmap" } else { "loose" }.to_string());
            Ok((
                "9p".to_string(),
                vec![
                    "trans=virtio".to_string(),
                    format!("version={}", version),
                    format!("msize={}", msize),
                    format!("cache={}", cache),
                    rw.to_string(),
                    // Boot must not block on a missing transport.
                    "nofail".to_string(),
                ],
            ))
        }
        MountType::Virtiofs => Ok((
            "virtiofs".to_string(),
            vec![rw.to_string(), "nofail".to_string()],
        )),
        MountType::ReverseSshfs => Ok(("sshfs".to_string(), Vec::new())),
    }
}

/// Parse a human-readable byte size such as "128KiB" or "1M".
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("{:?} is not a size", s))?;
    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        other => return Err(format!("unknown size suffix {:?}", other)),
    };
    Ok(value * multiplier)
}

fn split_cert_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Nameservers currently configured on the host. Best-effort: an
/// unreadable resolv.conf degrades to an empty list with a warning.
pub fn system_nameservers(resolv_conf: &Path) -> Vec<IpAddr> {
    let text = match std::fs::read_to_string(resolv_conf) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %resolv_conf.display(), error = %e, "cannot read resolv.conf");
            return Vec::new();
        }
    };
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("nameserver")?;
            rest.trim().parse().ok()
        })
        .collect()
}
