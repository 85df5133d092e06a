//! Guest-network datagram session: one connected peer speaking raw
//! ethernet frames over a unix datagram socket, answered by the
//! in-process ARP/DHCP/DNS/NAT engine.

use crate::arp::handle_arp;
use crate::dhcp::{DhcpParams, handle_dhcp};
use crate::dns::DnsForwarder;
use crate::eth::{ETHERTYPE_ARP, ETHERTYPE_IPV4, IP_PROTO_ICMP, IP_PROTO_TCP, IP_PROTO_UDP, parse_ipv4};
use crate::leases::LeaseTable;
use crate::nat::Nat;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Magic bytes some VMMs send before their first frame to locate the
/// datagram peer.
pub const HANDSHAKE_MAGIC: [u8; 4] = *b"VFKT";

const MAX_FRAME: usize = 65535;
const OUTBOX_MAX: usize = 8192;

#[derive(Debug, Clone)]
pub struct SwitchParams {
    pub subnet: [u8; 4],
    pub gateway_ip: [u8; 4],
    pub gateway_mac: [u8; 6],
    pub netmask: [u8; 4],
    pub mtu: u16,
    pub upstreams: Vec<IpAddr>,
    pub search_domain: Option<String>,
}

impl SwitchParams {
    fn dhcp(&self) -> DhcpParams {
        DhcpParams {
            gateway_ip: self.gateway_ip,
            gateway_mac: self.gateway_mac,
            netmask: self.netmask,
            mtu: self.mtu,
            search_domain: self.search_domain.clone(),
        }
    }
}

/// Blocking session loop. Waits for the peer handshake, then shuttles
/// frames until shutdown or disconnect. Runs on a dedicated thread; the
/// caller owns the fd.
pub fn run_session(
    fd: RawFd,
    params: &SwitchParams,
    leases: Arc<Mutex<LeaseTable>>,
    shutdown: Arc<AtomicBool>,
) {
    set_nonblocking(fd);
    if !await_peer(fd, &shutdown) {
        return;
    }
    tracing::info!("guest connected");

    let mut nat = Nat::new(params.gateway_ip, params.gateway_mac, params.subnet);
    let mut dns = DnsForwarder::new(&params.upstreams, params.gateway_ip, params.gateway_mac);
    let mut buf = [0u8; MAX_FRAME];
    let mut outbox: VecDeque<Vec<u8>> = VecDeque::new();
    let mut nat_frames: Vec<Vec<u8>> = Vec::new();
    let mut idle = 0u32;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if !flush(fd, &mut outbox) {
            tracing::debug!("guest went away");
            return;
        }

        let mut busy = false;
        loop {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n > 0 {
                busy = true;
                let frame = &buf[..n as usize];
                if let Some(reply) = process_frame(frame, params, &leases, &mut nat, &mut dns) {
                    if !deliver(fd, &mut outbox, &mut nat, reply) {
                        tracing::debug!("guest went away");
                        return;
                    }
                }
            } else if n == 0 {
                tracing::debug!("guest closed the session");
                return;
            } else {
                let err = std::io::Error::last_os_error();
                match err.kind() {
                    std::io::ErrorKind::WouldBlock => break,
                    std::io::ErrorKind::ConnectionReset => {
                        tracing::debug!("guest disconnected");
                        return;
                    }
                    _ => {
                        tracing::error!(error = %err, "session recv failed");
                        return;
                    }
                }
            }
        }

        nat.poll(&mut nat_frames);
        dns.poll(&mut nat_frames);
        busy |= !nat_frames.is_empty();
        for frame in nat_frames.drain(..) {
            if !deliver(fd, &mut outbox, &mut nat, frame) {
                tracing::debug!("guest went away");
                return;
            }
        }

        if busy {
            idle = 0;
        } else {
            idle = idle.saturating_add(1);
            if idle > 1000 {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                std::thread::yield_now();
            }
        }
    }
    tracing::debug!("session stopped");
}

/// Disconnect a connected datagram socket so `await_peer` can adopt the
/// next guest on the same fd.
pub(crate) fn dissolve_peer(fd: RawFd) {
    let mut addr: libc::sockaddr = unsafe { std::mem::zeroed() };
    addr.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
    unsafe {
        libc::connect(
            fd,
            std::ptr::addr_of!(addr),
            std::mem::size_of::<libc::sockaddr>() as libc::socklen_t,
        );
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

/// Wait for the first datagram and connect the socket to its sender.
/// A magic-only datagram is a handshake; anything else is treated as the
/// peer's first frame (already-connected socketpair transports skip the
/// magic).
fn await_peer(fd: RawFd, shutdown: &AtomicBool) -> bool {
    let mut buf = [0u8; MAX_FRAME];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        let mut addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                libc::MSG_PEEK,
                std::ptr::addr_of_mut!(addr).cast(),
                &mut addr_len,
            )
        };
        if n < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::WouldBlock {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            return false;
        }
        if addr_len > std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t {
            unsafe {
                libc::connect(fd, std::ptr::addr_of!(addr).cast(), addr_len);
            }
        }
        if n as usize == HANDSHAKE_MAGIC.len() && buf[..4] == HANDSHAKE_MAGIC {
            // Consume the magic datagram.
            unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        }
        return true;
    }
}

enum SendState {
    Sent,
    Busy,
    Gone,
}

enum Delivery {
    Done,
    Rejected(Vec<u8>),
    PeerGone,
}

/// Queue a guest-bound frame. An undeliverable frame aborts the TCP flow
/// it belongs to, so the guest sees a reset instead of a silent hole in
/// the sequence space. Returns false once the peer is gone.
fn deliver(fd: RawFd, outbox: &mut VecDeque<Vec<u8>>, nat: &mut Nat, frame: Vec<u8>) -> bool {
    match enqueue(fd, outbox, frame) {
        Delivery::Done => true,
        Delivery::Rejected(frame) => {
            if let Some(rst) = nat.abort_undelivered(&frame) {
                // Best effort. If the reset does not fit either, the
                // guest's next segment hits the unknown-flow reset path.
                let _ = enqueue(fd, outbox, rst);
            }
            true
        }
        Delivery::PeerGone => false,
    }
}

fn enqueue(fd: RawFd, outbox: &mut VecDeque<Vec<u8>>, frame: Vec<u8>) -> Delivery {
    if outbox.is_empty() {
        match try_send(fd, &frame) {
            SendState::Sent => return Delivery::Done,
            SendState::Gone => return Delivery::PeerGone,
            SendState::Busy => {}
        }
    }
    if outbox.len() < OUTBOX_MAX {
        outbox.push_back(frame);
        Delivery::Done
    } else {
        // Stalling the loop is worse than rejecting; the caller tears
        // down whatever flow the frame belonged to.
        Delivery::Rejected(frame)
    }
}

/// Drain the outbox. Returns false when the peer is gone.
fn flush(fd: RawFd, outbox: &mut VecDeque<Vec<u8>>) -> bool {
    while let Some(frame) = outbox.front() {
        match try_send(fd, frame) {
            SendState::Sent => {
                outbox.pop_front();
            }
            SendState::Busy => break,
            SendState::Gone => return false,
        }
    }
    true
}

fn try_send(fd: RawFd, frame: &[u8]) -> SendState {
    loop {
        let rc = unsafe { libc::send(fd, frame.as_ptr().cast(), frame.len(), 0) };
        if rc >= 0 {
            return SendState::Sent;
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::Interrupted => continue,
            std::io::ErrorKind::WouldBlock => return SendState::Busy,
            _ => {
                tracing::debug!(error = %err, "send failed, peer gone");
                return SendState::Gone;
            }
        }
    }
}

fn process_frame(
    frame: &[u8],
    params: &SwitchParams,
    leases: &Arc<Mutex<LeaseTable>>,
    nat: &mut Nat,
    dns: &mut DnsForwarder,
) -> Option<Vec<u8>> {
    if frame.len() < 14 {
        return None;
    }
    let mut src_mac = [0u8; 6];
    src_mac.copy_from_slice(&frame[6..12]);
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let payload = &frame[14..];

    match ethertype {
        ETHERTYPE_ARP => handle_arp(payload, &src_mac, params.gateway_ip, params.gateway_mac),
        ETHERTYPE_IPV4 => {
            let ip = parse_ipv4(payload)?;
            match ip.proto {
                IP_PROTO_ICMP => nat.handle_icmp(ip.payload, &src_mac, ip.src_ip, ip.dst_ip),
                IP_PROTO_UDP => {
                    if ip.payload.len() < 8 {
                        return None;
                    }
                    let src_port = u16::from_be_bytes([ip.payload[0], ip.payload[1]]);
                    let dst_port = u16::from_be_bytes([ip.payload[2], ip.payload[3]]);
                    if dst_port == 67 {
                        let mut table = leases.lock().ok()?;
                        handle_dhcp(&ip.payload[8..], &mut table, &params.dhcp())
                    } else if dst_port == 53 && ip.dst_ip == params.gateway_ip {
                        dns.handle_query(&ip.payload[8..], &src_mac, ip.src_ip, src_port);
                        None
                    } else {
                        nat.handle_udp(ip.payload, &src_mac, ip.src_ip, ip.dst_ip)
                    }
                }
                IP_PROTO_TCP => nat.handle_tcp(ip.payload, &src_mac, ip.src_ip, ip.dst_ip),
                _ => None,
            }
        }
        _ => None,
    }
}
