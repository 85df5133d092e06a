//! Per-network daemon lifecycle.
//!
//! Each named network is served by up to two daemons: the virtual switch,
//! and a bridge helper attaching the switch to a host interface. The PID
//! file is the source of truth for liveness; starting is fire-and-forget
//! with the PID file as the async-readiness signal.

use crate::config::{NetworkConfig, NetworkDef, NetworkMode};
use crate::socket::{SocketKind, socket_path};
use crate::NetworkError;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonKind {
    Switch,
    Bridge,
}

impl DaemonKind {
    pub fn label(self) -> &'static str {
        match self {
            DaemonKind::Switch => "switch",
            DaemonKind::Bridge => "bridge",
        }
    }

    fn socket_kind(self) -> SocketKind {
        match self {
            DaemonKind::Switch => SocketKind::Switch,
            DaemonKind::Bridge => SocketKind::Bridge,
        }
    }
}

/// Filesystem footprint of one (network, kind) daemon.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    pub network: String,
    pub kind: DaemonKind,
    var_run: PathBuf,
}

impl DaemonHandle {
    pub fn new(config: &NetworkConfig, network: &str, kind: DaemonKind) -> Self {
        DaemonHandle {
            network: network.to_string(),
            kind,
            var_run: config.paths.var_run.clone(),
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.var_run
            .join(format!("{}_{}.pid", self.network, self.kind.label()))
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.var_run
            .join(format!("{}_{}.stdout.log", self.network, self.kind.label()))
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.var_run
            .join(format!("{}_{}.stderr.log", self.network, self.kind.label()))
    }

    pub fn socket(&self) -> Result<PathBuf, NetworkError> {
        socket_path(&self.var_run, &self.network, self.kind.socket_kind())
    }
}

/// Read a PID file. Missing file or a recorded PID of 0 means not running.
pub fn read_pid(path: &Path) -> Option<i32> {
    let text = std::fs::read_to_string(path).ok()?;
    let pid: i32 = text.trim().parse().ok()?;
    if pid == 0 { None } else { Some(pid) }
}

/// Liveness by PID file plus a signal-0 probe for orphaned files. The
/// process identity is not verified; a recycled PID is misreported as
/// running (known limitation).
pub fn is_running(handle: &DaemonHandle) -> bool {
    let Some(pid) = read_pid(&handle.pid_file()) else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Expected content of the privilege-escalation policy file. The on-disk
/// file must match this byte-for-byte.
pub fn sudoers_content(config: &NetworkConfig) -> String {
    format!(
        "# Generated by skiff. Do not edit.\n\
         %{group} ALL=(root:{group}) NOPASSWD:NOSETENV: {switch} *\n\
         %{group} ALL=(root:{group}) NOPASSWD:NOSETENV: {bridge} *\n\
         %{group} ALL=(root:{group}) NOPASSWD:NOSETENV: /usr/bin/pkill -F {run}/*.pid\n\
         %{group} ALL=(root:{group}) NOPASSWD:NOSETENV: /bin/mkdir -m 775 -p {run}\n",
        group = config.group,
        switch = config.paths.switch_daemon.display(),
        bridge = config.paths.bridge_daemon.display(),
        run = config.paths.var_run.display(),
    )
}

static SUDOERS_CHECK: OnceLock<Result<(), String>> = OnceLock::new();

/// Verify the sudoers file matches the generated content exactly.
/// Cached for the process lifetime; a mismatch is never auto-repaired
/// because silently rewriting privilege-escalation policy is how hosts get
/// owned.
fn check_sudoers(config: &NetworkConfig) -> Result<(), NetworkError> {
    let result = SUDOERS_CHECK.get_or_init(|| {
        let expected = sudoers_content(config);
        match std::fs::read_to_string(&config.paths.sudoers) {
            Ok(actual) if actual == expected => Ok(()),
            Ok(_) => Err(config.paths.sudoers.display().to_string()),
            Err(e) => Err(format!("{}: {}", config.paths.sudoers.display(), e)),
        }
    });
    match result {
        Ok(()) => Ok(()),
        Err(_) => Err(NetworkError::PrivilegePolicyMismatch(
            config.paths.sudoers.clone(),
        )),
    }
}

fn daemon_binary(config: &NetworkConfig, kind: DaemonKind) -> &PathBuf {
    match kind {
        DaemonKind::Switch => &config.paths.switch_daemon,
        DaemonKind::Bridge => &config.paths.bridge_daemon,
    }
}

/// `sudo` prefix for a command run as root in the configured group. The
/// sudoers policy forbids quoted arguments, so no argument may need
/// quoting.
fn sudo_prefix(config: &NetworkConfig) -> Vec<String> {
    vec![
        "sudo".into(),
        "--user".into(),
        "root".into(),
        "--group".into(),
        config.group.clone(),
        "--non-interactive".into(),
    ]
}

/// mkdir command ensuring the run directory exists with group-writable
/// permissions.
pub fn mkdir_cmd(config: &NetworkConfig) -> Vec<String> {
    let mut cmd = sudo_prefix(config);
    cmd.extend([
        "/bin/mkdir".into(),
        "-m".into(),
        "775".into(),
        "-p".into(),
        config.paths.var_run.display().to_string(),
    ]);
    cmd
}

/// Start command for a (network, kind) daemon.
pub fn start_cmd(
    config: &NetworkConfig,
    def: &NetworkDef,
    handle: &DaemonHandle,
) -> Result<Vec<String>, NetworkError> {
    let mut cmd = sudo_prefix(config);
    cmd.push(daemon_binary(config, handle.kind).display().to_string());
    cmd.extend([
        "--pidfile".into(),
        handle.pid_file().display().to_string(),
        "--socket".into(),
        handle.socket()?.display().to_string(),
        "--socket-group".into(),
        config.group.clone(),
    ]);
    match handle.kind {
        DaemonKind::Switch => match def.mode {
            NetworkMode::Host | NetworkMode::Shared => {
                if let Some(gateway) = def.gateway {
                    cmd.extend(["--gateway".into(), gateway.to_string()]);
                }
                if let Some(end) = def.dhcp_end {
                    cmd.extend(["--dhcp-end".into(), end.to_string()]);
                }
                if let Some(mask) = def.netmask {
                    cmd.extend(["--netmask".into(), mask.to_string()]);
                }
            }
            NetworkMode::Bridged => {
                if let Some(interface) = &def.interface {
                    cmd.extend(["--interface".into(), interface.clone()]);
                }
            }
            NetworkMode::UserV2 => {
                if let Some(gateway) = def.gateway {
                    let subnet = std::net::Ipv4Addr::from(u32::from(gateway) & 0xffff_ff00);
                    cmd.extend(["--subnet".into(), subnet.to_string()]);
                }
            }
        },
        DaemonKind::Bridge => {
            let switch = DaemonHandle::new(config, &handle.network, DaemonKind::Switch);
            cmd.extend([
                "--switch-socket".into(),
                switch.socket()?.display().to_string(),
            ]);
            if let Some(interface) = &def.interface {
                cmd.extend(["--interface".into(), interface.clone()]);
            }
        }
    }
    Ok(cmd)
}

/// Stop command: signal-based termination through the same privilege path.
pub fn stop_cmd(config: &NetworkConfig, handle: &DaemonHandle) -> Vec<String> {
    let mut cmd = sudo_prefix(config);
    cmd.extend([
        "/usr/bin/pkill".into(),
        "-F".into(),
        handle.pid_file().display().to_string(),
    ]);
    cmd
}

/// Start the daemon if it is not already live. Fire-and-forget: the daemon
/// writes its own PID file once ready.
pub fn start(
    config: &NetworkConfig,
    network: &str,
    kind: DaemonKind,
) -> Result<(), NetworkError> {
    let def = config
        .networks
        .get(network)
        .ok_or_else(|| NetworkError::UndefinedNetwork(network.to_string()))?;
    let handle = DaemonHandle::new(config, network, kind);
    if is_running(&handle) {
        tracing::debug!(network, kind = kind.label(), "daemon already running");
        return Ok(());
    }

    let binary = daemon_binary(config, kind);
    if !binary.exists() {
        return Err(NetworkError::DaemonUnavailable(binary.clone()));
    }
    // Every path that ends up in a privilege-escalated command is checked
    // first: run dir, sudoers file, and the daemon binary itself.
    crate::paths::validate_secure_path(&config.paths.var_run, true)?;
    crate::paths::validate_secure_path(&config.paths.sudoers, true)?;
    crate::paths::validate_secure_path(binary, true)?;
    check_sudoers(config)?;

    run_foreground(&mkdir_cmd(config))?;

    // Old logs are truncated; each start gets fresh output.
    let stdout = File::create(handle.stdout_log())?;
    let stderr = File::create(handle.stderr_log())?;
    let cmd = start_cmd(config, def, &handle)?;
    tracing::info!(network, kind = kind.label(), cmd = %cmd.join(" "), "starting daemon");
    Command::new(&cmd[0])
        .args(&cmd[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()?;
    Ok(())
}

/// Stop the daemon if it is live.
pub fn stop(config: &NetworkConfig, network: &str, kind: DaemonKind) -> Result<(), NetworkError> {
    let handle = DaemonHandle::new(config, network, kind);
    if !is_running(&handle) {
        tracing::debug!(network, kind = kind.label(), "daemon already stopped");
        return Ok(());
    }
    let cmd = stop_cmd(config, &handle);
    tracing::info!(network, kind = kind.label(), cmd = %cmd.join(" "), "stopping daemon");
    run_foreground(&cmd)
}

fn run_foreground(cmd: &[String]) -> Result<(), NetworkError> {
    let status = Command::new(&cmd[0]).args(&cmd[1..]).status()?;
    if !status.success() {
        return Err(NetworkError::Io(std::io::Error::other(format!(
            "command {:?} exited with {}",
            cmd.join(" "),
            status
        ))));
    }
    Ok(())
}
