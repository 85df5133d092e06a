//! DNS forwarding. Queries for the gateway address are relayed to the
//! host's upstream resolvers over plain UDP. The forwarder never blocks:
//! queries go out on per-query nonblocking sockets and the answers are
//! collected by `poll` from the session loop.

use crate::eth::{ETHERTYPE_IPV4, IP_PROTO_UDP, eth_header, ip_header, l4_checksum};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::Path;
use std::time::{Duration, Instant};

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_UDP_DNS: usize = 4096;
const MAX_IN_FLIGHT: usize = 64;

/// Upstream resolvers and search domains read from the host resolver
/// configuration. An unreadable file degrades to defaults.
#[derive(Debug, Clone)]
pub struct ResolvConf {
    pub nameservers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
}

impl ResolvConf {
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read resolver config");
                String::new()
            }
        };
        let mut conf = ResolvConf {
            nameservers: Vec::new(),
            search_domains: Vec::new(),
        };
        for line in text.lines() {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => {
                    if let Some(addr) = words.next().and_then(|w| w.parse().ok()) {
                        conf.nameservers.push(addr);
                    }
                }
                Some("search") | Some("domain") => {
                    conf.search_domains.extend(words.map(String::from));
                }
                _ => {}
            }
        }
        if conf.nameservers.is_empty() {
            conf.nameservers.push(IpAddr::from([8, 8, 8, 8]));
        }
        conf
    }
}

struct PendingQuery {
    socket: UdpSocket,
    query: Vec<u8>,
    upstream: usize,
    sent_at: Instant,
    client_mac: [u8; 6],
    client_ip: [u8; 4],
    client_port: u16,
}

/// Per-session forwarder tracking in-flight upstream queries.
pub struct DnsForwarder {
    upstreams: Vec<SocketAddr>,
    gateway_ip: [u8; 4],
    gateway_mac: [u8; 6],
    pending: Vec<PendingQuery>,
}

impl DnsForwarder {
    pub fn new(upstreams: &[IpAddr], gateway_ip: [u8; 4], gateway_mac: [u8; 6]) -> Self {
        Self::with_servers(
            upstreams.iter().map(|ip| SocketAddr::new(*ip, 53)).collect(),
            gateway_ip,
            gateway_mac,
        )
    }

    fn with_servers(upstreams: Vec<SocketAddr>, gateway_ip: [u8; 4], gateway_mac: [u8; 6]) -> Self {
        DnsForwarder {
            upstreams,
            gateway_ip,
            gateway_mac,
            pending: Vec::new(),
        }
    }

    /// Dispatch one query to the first upstream. Returns immediately; the
    /// answer frame surfaces in a later `poll`.
    pub fn handle_query(
        &mut self,
        query: &[u8],
        client_mac: &[u8; 6],
        client_ip: [u8; 4],
        client_port: u16,
    ) {
        if query.len() < 12 || self.upstreams.is_empty() {
            return;
        }
        if self.pending.len() >= MAX_IN_FLIGHT {
            tracing::debug!("too many dns queries in flight, dropping");
            return;
        }
        let socket = match UdpSocket::bind("0.0.0.0:0")
            .and_then(|s| s.set_nonblocking(true).map(|()| s))
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "dns query socket unavailable");
                return;
            }
        };
        // Send failures fall back to the timeout path in poll.
        let _ = socket.send_to(query, self.upstreams[0]);
        self.pending.push(PendingQuery {
            socket,
            query: query.to_vec(),
            upstream: 0,
            sent_at: Instant::now(),
            client_mac: *client_mac,
            client_ip,
            client_port,
        });
    }

    /// Collect arrived answers into guest-bound frames. A timed-out query
    /// moves to the next upstream and is dropped once all are exhausted.
    pub fn poll(&mut self, out: &mut Vec<Vec<u8>>) {
        let upstreams = &self.upstreams;
        let gateway_ip = self.gateway_ip;
        let gateway_mac = self.gateway_mac;
        let mut buf = [0u8; MAX_UDP_DNS];
        self.pending.retain_mut(|q| {
            let mut failed = false;
            loop {
                match q.socket.recv_from(&mut buf) {
                    Ok((len, from)) if from == upstreams[q.upstream] => {
                        tracing::trace!(upstream = %from, len, "dns answer");
                        out.push(udp_frame(
                            &q.client_mac,
                            q.client_ip,
                            q.client_port,
                            gateway_ip,
                            gateway_mac,
                            &buf[..len],
                        ));
                        return false;
                    }
                    Ok(_) => continue, // stray sender
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::debug!(upstream = %upstreams[q.upstream], error = %e,
                            "dns upstream failed");
                        failed = true;
                        break;
                    }
                }
            }
            if failed || q.sent_at.elapsed() >= QUERY_TIMEOUT {
                q.upstream += 1;
                if q.upstream >= upstreams.len() {
                    tracing::debug!("dns upstreams exhausted, dropping query");
                    return false;
                }
                q.sent_at = Instant::now();
                let _ = q.socket.send_to(&q.query, upstreams[q.upstream]);
            }
            true
        });
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn udp_frame(
    dst_mac: &[u8; 6],
    dst_ip: [u8; 4],
    dst_port: u16,
    src_ip: [u8; 4],
    src_mac: [u8; 6],
    data: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + data.len();
    let mut udp = Vec::with_capacity(udp_len);
    udp.extend_from_slice(&53u16.to_be_bytes());
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&(udp_len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(data);
    let cksum = l4_checksum(src_ip, dst_ip, IP_PROTO_UDP, &udp);
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    let mut frame = Vec::with_capacity(14 + 20 + udp_len);
    frame.extend_from_slice(&eth_header(dst_mac, &src_mac, ETHERTYPE_IPV4));
    frame.extend_from_slice(&ip_header(src_ip, dst_ip, IP_PROTO_UDP, udp_len));
    frame.extend_from_slice(&udp);
    frame
}
