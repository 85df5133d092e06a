//! Unix socket path construction.
//!
//! A silently truncated sun_path makes the daemon bind a different socket
//! with no error, so the length ceiling is enforced on every construction
//! rather than at call sites.

use crate::NetworkError;
use std::path::{Path, PathBuf};

/// Platform sun_path ceiling. Paths of this length or longer are rejected.
#[cfg(target_os = "linux")]
pub const SOCKET_PATH_MAX: usize = 108;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub const SOCKET_PATH_MAX: usize = 104;
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
pub const SOCKET_PATH_MAX: usize = 108;

/// The socket a given daemon binds for one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// The virtual switch all instances of a network attach to.
    Switch,
    /// The helper bridging the switch onto a host interface.
    Bridge,
    /// The usernet HTTP control plane.
    Control,
}

impl SocketKind {
    pub fn label(self) -> &'static str {
        match self {
            SocketKind::Switch => "switch",
            SocketKind::Bridge => "bridge",
            SocketKind::Control => "control",
        }
    }
}

/// Build the socket path for `(network, kind)` under `base_dir`. An empty
/// network name falls back to `"default"`.
pub fn socket_path(
    base_dir: &Path,
    network: &str,
    kind: SocketKind,
) -> Result<PathBuf, NetworkError> {
    let network = if network.is_empty() { "default" } else { network };
    let path = base_dir.join(format!("{}_{}.sock", network, kind.label()));
    let len = path.as_os_str().len();
    if len >= SOCKET_PATH_MAX {
        return Err(NetworkError::PathTooLong {
            path,
            len,
            max: SOCKET_PATH_MAX,
        });
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Base dir sized so that the full path lands exactly on `target` chars.
    fn base_for_len(network: &str, kind: SocketKind, target: usize) -> PathBuf {
        let suffix = format!("/{}_{}.sock", network, kind.label());
        PathBuf::from("x".repeat(target - suffix.len()))
    }

    #[test]
    fn builds_expected_name() {
        let path = socket_path(Path::new("/run/skiff"), "shared", SocketKind::Switch).unwrap();
        assert_eq!(path, PathBuf::from("/run/skiff/shared_switch.sock"));
    }

    #[test]
    fn empty_network_defaults() {
        let path = socket_path(Path::new("/run/skiff"), "", SocketKind::Bridge).unwrap();
        assert_eq!(path, PathBuf::from("/run/skiff/default_bridge.sock"));
    }

    #[test]
    fn at_max_fails_below_max_succeeds() {
        let base = base_for_len("net", SocketKind::Switch, SOCKET_PATH_MAX);
        let err = socket_path(&base, "net", SocketKind::Switch).unwrap_err();
        assert!(matches!(err, NetworkError::PathTooLong { len, .. } if len == SOCKET_PATH_MAX));

        let base = base_for_len("net", SocketKind::Switch, SOCKET_PATH_MAX - 1);
        let path = socket_path(&base, "net", SocketKind::Switch).unwrap();
        assert_eq!(path.as_os_str().len(), SOCKET_PATH_MAX - 1);
    }
}
