//! Schema validation for instance configs.
//!
//! This runs before any boot-data is compiled. Failures here are fatal to
//! the current operation and never retried automatically.

use crate::{ConfigError, InstanceConfig, ProvisionMode};

/// Validate an instance config against its schema.
pub fn validate(config: &InstanceConfig) -> Result<(), ConfigError> {
    if let Some(uid) = config.user.uid {
        if uid == 0 {
            return Err(ConfigError::Validation("user.uid must not be 0".into()));
        }
    }
    if config.user.name.as_deref() == Some("root") {
        return Err(ConfigError::Validation("user.name must not be root".into()));
    }

    for (i, mount) in config.mounts.iter().enumerate() {
        if mount.location.is_empty() {
            return Err(ConfigError::Validation(format!(
                "mounts[{}].location must not be empty",
                i
            )));
        }
        if let Some(point) = &mount.mount_point {
            if !point.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "mounts[{}].mount_point {:?} is not an absolute path",
                    i, point
                )));
            }
        }
    }

    for (i, disk) in config.additional_disks.iter().enumerate() {
        if disk.name.is_empty() {
            return Err(ConfigError::Validation(format!(
                "additional_disks[{}].name must not be empty",
                i
            )));
        }
    }

    for (i, net) in config.networks.iter().enumerate() {
        if net.skiff.is_none() && net.socket.is_none() {
            return Err(ConfigError::Validation(format!(
                "networks[{}] must reference a named network or a socket",
                i
            )));
        }
        if net.skiff.is_some() && net.socket.is_some() {
            return Err(ConfigError::Validation(format!(
                "networks[{}] must not set both a named network and a socket",
                i
            )));
        }
        if let Some(mac) = &net.mac_address {
            if !valid_mac(mac) {
                return Err(ConfigError::Validation(format!(
                    "networks[{}].mac_address {:?} is not a valid MAC address",
                    i, mac
                )));
            }
        }
    }

    for (i, p) in config.provision.iter().enumerate() {
        match p.mode {
            ProvisionMode::Data => {
                if p.path.is_none() || p.content.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "provision[{}]: data mode requires path and content",
                        i
                    )));
                }
            }
            _ => {
                if p.script.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "provision[{}]: {} mode requires a script",
                        i, p.mode
                    )));
                }
            }
        }
    }

    Ok(())
}

fn valid_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstanceConfig;

    #[test]
    fn rejects_root_user() {
        let err = InstanceConfig::parse("user:\n  name: root\n").unwrap_err();
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn rejects_uid_zero() {
        let err = InstanceConfig::parse("user:\n  uid: 0\n").unwrap_err();
        assert!(err.to_string().contains("uid"));
    }

    #[test]
    fn rejects_relative_mount_point() {
        let err =
            InstanceConfig::parse("mounts:\n  - location: /tmp/x\n    mount_point: rel/path\n")
                .unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn rejects_network_without_reference() {
        let err = InstanceConfig::parse("networks:\n  - interface: skiff0\n").unwrap_err();
        assert!(err.to_string().contains("named network"));
    }

    #[test]
    fn rejects_bad_mac() {
        let err = InstanceConfig::parse(
            "networks:\n  - skiff: shared\n    mac_address: not-a-mac\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("MAC"));
    }

    #[test]
    fn data_mode_requires_path_and_content() {
        let err = InstanceConfig::parse("provision:\n  - mode: data\n").unwrap_err();
        assert!(err.to_string().contains("data mode"));
    }

    #[test]
    fn accepts_full_config() {
        let text = r#"
vm_type: qemu
mount_type: 9p
user:
  name: alice
  uid: 501
mounts:
  - location: "~"
    writable: true
additional_disks:
  - name: scratch
networks:
  - skiff: shared
provision:
  - mode: system
    script: |
      #!/bin/sh
      echo hello
"#;
        InstanceConfig::parse(text).unwrap();
    }
}
