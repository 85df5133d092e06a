//! Reconciliation between desired and actual daemon state.
//!
//! Desired state: the set of named networks referenced by running
//! instances plus the instance about to start. Actual state: which daemons
//! hold a live PID file. Convergence is per-network; one network's failure
//! never blocks the others.

use crate::config::NetworkConfig;
use crate::daemon::{self, DaemonKind};
use std::collections::BTreeSet;
use std::path::Path;

/// One instance as seen on disk.
#[derive(Debug, Clone)]
pub struct InstanceRef {
    pub name: String,
    pub running: bool,
    pub networks: Vec<String>,
}

/// Scan `instances_dir` for instance directories. An instance is running
/// when its `vm.pid` file holds a live PID. Unreadable entries are skipped
/// with a warning; a broken instance must not block reconciliation.
pub fn scan_instances(instances_dir: &Path) -> Vec<InstanceRef> {
    let mut instances = Vec::new();
    let entries = match std::fs::read_dir(instances_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %instances_dir.display(), error = %e, "cannot read instances dir");
            return instances;
        }
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let config = match skiff_config::InstanceConfig::load(&dir.join("skiff.yaml")) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(instance = %name, error = %e, "skipping unreadable instance");
                continue;
            }
        };
        let running = crate::daemon::read_pid(&dir.join("vm.pid"))
            .map(|pid| nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok())
            .unwrap_or(false);
        let networks = config
            .networks
            .iter()
            .filter_map(|n| n.skiff.clone())
            .collect();
        instances.push(InstanceRef {
            name,
            running,
            networks,
        });
    }
    instances
}

/// Networks that must be up: those referenced by a running instance or by
/// the candidate about to start.
pub fn desired_networks(instances: &[InstanceRef], candidate: Option<&str>) -> BTreeSet<String> {
    let mut desired = BTreeSet::new();
    for instance in instances {
        if instance.running || Some(instance.name.as_str()) == candidate {
            desired.extend(instance.networks.iter().cloned());
        }
    }
    desired
}

/// Converge daemon state for every configured network. Start order is
/// switch then bridge (the bridge dials the switch socket); stop order is
/// the reverse so sockets are released cleanly.
pub fn reconcile(
    config: &NetworkConfig,
    instances_dir: &Path,
    candidate: Option<&str>,
) -> Vec<(String, crate::NetworkError)> {
    let instances = scan_instances(instances_dir);
    let desired = desired_networks(&instances, candidate);

    for name in &desired {
        if !config.networks.contains_key(name.as_str()) {
            // Stale reference; skip without failing the rest.
            tracing::warn!(network = %name, "referenced network is not defined, skipping");
        }
    }

    let mut failures = Vec::new();
    for name in config.networks.keys() {
        let result = if desired.contains(name) {
            daemon::start(config, name, DaemonKind::Switch)
                .and_then(|()| daemon::start(config, name, DaemonKind::Bridge))
        } else {
            daemon::stop(config, name, DaemonKind::Bridge)
                .and_then(|()| daemon::stop(config, name, DaemonKind::Switch))
        };
        if let Err(e) = result {
            tracing::error!(network = %name, error = %e, "reconciliation failed for network");
            failures.push((name.clone(), e));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn instance(name: &str, running: bool, networks: &[&str]) -> InstanceRef {
        InstanceRef {
            name: name.into(),
            running,
            networks: networks.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn desired_includes_running_and_candidate() {
        let instances = vec![
            instance("a1", true, &["A"]),
            instance("a2", true, &["A"]),
            instance("b1", false, &["B"]),
        ];
        let desired = desired_networks(&instances, Some("a1"));
        assert!(desired.contains("A"));
        assert!(!desired.contains("B"));

        // A stopped instance counts once named as the candidate.
        let desired = desired_networks(&instances, Some("b1"));
        assert!(desired.contains("A"));
        assert!(desired.contains("B"));
    }

    #[test]
    fn desired_empty_when_nothing_runs() {
        let instances = vec![instance("x", false, &["A", "B"])];
        assert!(desired_networks(&instances, None).is_empty());
    }

    #[test]
    fn scan_skips_broken_instances() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good");
        std::fs::create_dir(&good).unwrap();
        std::fs::write(good.join("skiff.yaml"), "networks:\n  - skiff: shared\n").unwrap();
        let broken = dir.path().join("broken");
        std::fs::create_dir(&broken).unwrap();
        std::fs::write(broken.join("skiff.yaml"), "networks: [").unwrap();

        let instances = scan_instances(dir.path());
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].name, "good");
        assert_eq!(instances[0].networks, vec!["shared".to_string()]);
        assert!(!instances[0].running);
    }
}
