//! SSH public key collection.

use crate::CidataError;
use std::path::Path;

/// Union of the managed keypair's public half and, optionally, every
/// `*.pub` under the host's `~/.ssh`. Order is stable: the managed key
/// first, host keys sorted by file name.
pub fn collect_ssh_keys(
    config_dir: &Path,
    home_dir: &Path,
    include_host_keys: bool,
) -> Result<Vec<String>, CidataError> {
    let mut keys = Vec::new();

    let managed = config_dir.join("user.pub");
    if let Ok(text) = std::fs::read_to_string(&managed) {
        let text = text.trim();
        if !text.is_empty() {
            keys.push(text.to_string());
        }
    }

    if include_host_keys {
        let ssh_dir = home_dir.join(".ssh");
        let mut host_keys = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&ssh_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("pub") {
                    continue;
                }
                match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        let text = text.trim();
                        if !text.is_empty() {
                            host_keys.push((path.clone(), text.to_string()));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable key");
                    }
                }
            }
        }
        host_keys.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, key) in host_keys {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }

    if keys.is_empty() {
        return Err(CidataError::NoSshKey);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fails_when_no_keys_exist() {
        let dir = TempDir::new().unwrap();
        let err = collect_ssh_keys(dir.path(), dir.path(), true).unwrap_err();
        assert!(matches!(err, CidataError::NoSshKey));
    }

    #[test]
    fn managed_key_comes_first_and_duplicates_collapse() {
        let config = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        std::fs::write(config.path().join("user.pub"), "ssh-ed25519 AAAA managed\n").unwrap();
        let ssh = home.path().join(".ssh");
        std::fs::create_dir(&ssh).unwrap();
        std::fs::write(ssh.join("id_ed25519.pub"), "ssh-ed25519 BBBB host\n").unwrap();
        std::fs::write(ssh.join("id_rsa.pub"), "ssh-ed25519 AAAA managed\n").unwrap();
        std::fs::write(ssh.join("id_rsa"), "PRIVATE KEY, NOT COLLECTED").unwrap();

        let keys = collect_ssh_keys(config.path(), home.path(), true).unwrap();
        assert_eq!(
            keys,
            vec![
                "ssh-ed25519 AAAA managed".to_string(),
                "ssh-ed25519 BBBB host".to_string(),
            ]
        );
    }

    #[test]
    fn host_keys_excluded_unless_requested() {
        let config = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        std::fs::write(config.path().join("user.pub"), "ssh-ed25519 AAAA managed\n").unwrap();
        let ssh = home.path().join(".ssh");
        std::fs::create_dir(&ssh).unwrap();
        std::fs::write(ssh.join("id_ed25519.pub"), "ssh-ed25519 BBBB host\n").unwrap();

        let keys = collect_ssh_keys(config.path(), home.path(), false).unwrap();
        assert_eq!(keys.len(), 1);
    }
}
