//! User-mode guest networking.
//!
//! One process per network serves three unix-socket listeners: the raw
//! guest-frame datagram protocol, an fd-passing stream endpoint for VMMs
//! that expect to receive their datagram end, and an HTTP control plane
//! for leases, port forwards, and SSH readiness.

mod arp;
mod dhcp;
mod dns;
mod error;
mod eth;
mod fdpass;
pub mod http;
pub mod leases;
mod nat;
mod switch;

pub use error::UsernetError;
pub use http::RESOLVE_TIMEOUT_ENV;
pub use switch::HANDSHAKE_MAGIC;

use crate::dns::ResolvConf;
use crate::leases::LeaseTable;
use crate::switch::SwitchParams;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, bind, socket};
use skiff_network::addr::gateway_ip;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Locally administered MAC the gateway answers from.
pub const GATEWAY_MAC: [u8; 6] = [0x02, 0x53, 0x4b, 0x46, 0x46, 0x01];

#[derive(Debug, Clone)]
pub struct UsernetConfig {
    pub subnet: Ipv4Addr,
    pub mtu: u16,
    pub static_leases: BTreeMap<String, Ipv4Addr>,
    /// Host resolver configuration consulted for upstream nameservers
    /// and search domains.
    pub resolv_conf: PathBuf,
}

impl Default for UsernetConfig {
    fn default() -> Self {
        UsernetConfig {
            subnet: skiff_network::config::USERNET_SUBNET,
            mtu: 1500,
            static_leases: BTreeMap::new(),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

impl UsernetConfig {
    /// The gateway answers DHCP, DNS, and NAT at this single address.
    pub fn gateway(&self) -> Ipv4Addr {
        gateway_ip(self.subnet)
    }
}

/// Socket paths the runtime serves on. Stale files are replaced.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub datagram_socket: PathBuf,
    pub fd_socket: PathBuf,
    pub http_socket: PathBuf,
}

pub struct Runtime {
    leases: Arc<Mutex<LeaseTable>>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    threads: Vec<std::thread::JoinHandle<()>>,
    http_task: tokio::task::JoinHandle<()>,
    endpoints: Endpoints,
    _datagram_fd: OwnedFd,
}

impl Runtime {
    /// Bind all three listeners and start serving. The caller keeps the
    /// handle to shut down cleanly.
    pub async fn start(config: UsernetConfig, endpoints: Endpoints) -> Result<Self, UsernetError> {
        let resolv = ResolvConf::load(&config.resolv_conf);
        let gateway = config.gateway();
        let params = SwitchParams {
            subnet: config.subnet.octets(),
            gateway_ip: gateway.octets(),
            gateway_mac: GATEWAY_MAC,
            netmask: [255, 255, 255, 0],
            mtu: config.mtu,
            upstreams: resolv.nameservers.clone(),
            search_domain: resolv.search_domains.first().cloned(),
        };
        let leases = Arc::new(Mutex::new(LeaseTable::new(
            config.subnet,
            &config.static_leases,
        )));
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut threads = Vec::new();

        // Datagram endpoint: one session at a time, for the VMM that
        // connects directly. When a guest goes away the socket is
        // un-connected again and the next guest can handshake.
        let datagram_fd = bind_datagram(&endpoints.datagram_socket)?;
        {
            let fd = datagram_fd.as_raw_fd();
            let params = params.clone();
            let leases = Arc::clone(&leases);
            let flag = Arc::clone(&shutdown_flag);
            threads.push(
                std::thread::Builder::new()
                    .name("usernet-switch".to_string())
                    .spawn(move || {
                        while !flag.load(Ordering::Relaxed) {
                            switch::run_session(fd, &params, Arc::clone(&leases), Arc::clone(&flag));
                            switch::dissolve_peer(fd);
                        }
                    })?,
            );
        }

        // Fd-passing endpoint.
        remove_stale(&endpoints.fd_socket)?;
        let fd_listener = std::os::unix::net::UnixListener::bind(&endpoints.fd_socket)?;
        {
            let params = params.clone();
            let leases = Arc::clone(&leases);
            let flag = Arc::clone(&shutdown_flag);
            threads.push(
                std::thread::Builder::new()
                    .name("usernet-fdpass".to_string())
                    .spawn(move || fdpass::run_listener(fd_listener, params, leases, flag))?,
            );
        }

        // HTTP control plane.
        remove_stale(&endpoints.http_socket)?;
        let http_listener = tokio::net::UnixListener::bind(&endpoints.http_socket)?;
        let router = http::router(http::ControlState::new(Arc::clone(&leases)));
        let mut rx = shutdown_rx.clone();
        let http_task = tokio::spawn(async move {
            let serve = axum::serve(http_listener, router).with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "control plane exited");
            }
        });

        tracing::info!(
            subnet = %config.subnet,
            gateway = %gateway,
            datagram = %endpoints.datagram_socket.display(),
            http = %endpoints.http_socket.display(),
            "usernet running",
        );
        Ok(Runtime {
            leases,
            shutdown_flag,
            shutdown_tx,
            threads,
            http_task,
            endpoints,
            _datagram_fd: datagram_fd,
        })
    }

    pub fn leases(&self) -> Arc<Mutex<LeaseTable>> {
        Arc::clone(&self.leases)
    }

    /// Signal every listener and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        let _ = self.http_task.await;
        let threads = self.threads;
        let _ = tokio::task::spawn_blocking(move || {
            for handle in threads {
                let _ = handle.join();
            }
        })
        .await;
        for path in [
            &self.endpoints.datagram_socket,
            &self.endpoints.fd_socket,
            &self.endpoints.http_socket,
        ] {
            let _ = std::fs::remove_file(path);
        }
        tracing::info!("usernet stopped");
    }
}

fn bind_datagram(path: &Path) -> Result<OwnedFd, UsernetError> {
    remove_stale(path)?;
    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .map_err(std::io::Error::from)?;
    // Generous buffers: the guest can burst far faster than the NAT
    // drains during TCP slow start.
    for opt in [libc::SO_RCVBUF, libc::SO_SNDBUF] {
        let size: libc::c_int = 8 * 1024 * 1024;
        unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                opt,
                std::ptr::addr_of!(size).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    let addr = UnixAddr::new(path).map_err(std::io::Error::from)?;
    bind(fd.as_raw_fd(), &addr).map_err(std::io::Error::from)?;
    Ok(fd)
}

fn remove_stale(path: &Path) -> Result<(), UsernetError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
