//! Userspace NAT for guest traffic.
//!
//! Guest TCP connections are terminated locally and proxied over host
//! sockets; the guest-facing side speaks a deliberately simple TCP (no
//! window scaling, no SACK, fixed 64k window). UDP flows map onto
//! connected host sockets. ICMP echo is answered locally.

use crate::eth::{
    ETHERTYPE_IPV4, IP_PROTO_ICMP, IP_PROTO_TCP, IP_PROTO_UDP, eth_header, ip_header,
    l4_checksum, parse_ipv4,
};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

const MAX_SEGMENT: usize = 1460;
const OUR_WINDOW: u16 = 0xffff;
const OUR_ISN: u32 = 0x0001_0000;
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_PSH: u8 = 0x08;
const FLAG_ACK: u8 = 0x10;

/// Host octet aliased to the host loopback, so guests can reach
/// services bound only to 127.0.0.1 on the host.
const HOST_ALIAS_OCTET: u8 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    guest_port: u16,
    dst_ip: [u8; 4],
    dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpPhase {
    /// Host connect in flight; SYN-ACK not yet sent.
    Connecting,
    Established,
    /// We sent our FIN, waiting for the guest to ack it.
    FinSent,
}

struct TcpFlow {
    stream: TcpStream,
    phase: TcpPhase,
    guest_mac: [u8; 6],
    guest_ip: [u8; 4],
    /// IP the guest addressed, before any loopback aliasing.
    wire_dst_ip: [u8; 4],
    /// Next sequence number we will send.
    seq: u32,
    /// Next guest byte we expect (their seq + consumed payload).
    ack: u32,
    last_activity: Instant,
}

struct UdpFlow {
    socket: UdpSocket,
    guest_mac: [u8; 6],
    guest_ip: [u8; 4],
    wire_dst_ip: [u8; 4],
    last_activity: Instant,
}

pub struct Nat {
    gateway_ip: [u8; 4],
    gateway_mac: [u8; 6],
    subnet: [u8; 4],
    tcp: HashMap<FlowKey, TcpFlow>,
    udp: HashMap<FlowKey, UdpFlow>,
}

impl Nat {
    pub fn new(gateway_ip: [u8; 4], gateway_mac: [u8; 6], subnet: [u8; 4]) -> Self {
        Nat {
            gateway_ip,
            gateway_mac,
            subnet,
            tcp: HashMap::new(),
            udp: HashMap::new(),
        }
    }

    /// Translate the wire destination into the host address we dial.
    fn host_target(&self, dst_ip: [u8; 4], port: u16) -> SocketAddr {
        let ip = if dst_ip[..3] == self.subnet[..3] && dst_ip[3] == HOST_ALIAS_OCTET {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::from(dst_ip)
        };
        SocketAddr::from((ip, port))
    }

    pub fn handle_icmp(
        &self,
        payload: &[u8],
        src_mac: &[u8; 6],
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
    ) -> Option<Vec<u8>> {
        if payload.len() < 8 || payload[0] != 8 {
            return None; // echo request only
        }
        let mut icmp = payload.to_vec();
        icmp[0] = 0; // echo reply
        icmp[2..4].copy_from_slice(&[0, 0]);
        let cksum = crate::eth::checksum(&icmp);
        icmp[2..4].copy_from_slice(&cksum.to_be_bytes());

        let mut frame = Vec::with_capacity(14 + 20 + icmp.len());
        frame.extend_from_slice(&eth_header(src_mac, &self.gateway_mac, ETHERTYPE_IPV4));
        frame.extend_from_slice(&ip_header(dst_ip, src_ip, IP_PROTO_ICMP, icmp.len()));
        frame.extend_from_slice(&icmp);
        Some(frame)
    }

    pub fn handle_udp(
        &mut self,
        segment: &[u8],
        src_mac: &[u8; 6],
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
    ) -> Option<Vec<u8>> {
        if segment.len() < 8 {
            return None;
        }
        let guest_port = u16::from_be_bytes([segment[0], segment[1]]);
        let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
        let data = &segment[8..];
        let key = FlowKey {
            guest_port,
            dst_ip,
            dst_port,
        };
        let target = self.host_target(dst_ip, dst_port);

        let flow = match self.udp.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let socket = match UdpSocket::bind("0.0.0.0:0")
                    .and_then(|s| s.connect(target).map(|()| s))
                {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::debug!(target = %target, error = %e, "udp nat connect failed");
                        return None;
                    }
                };
                if let Err(e) = socket.set_nonblocking(true) {
                    tracing::debug!(error = %e, "udp nonblocking failed");
                    return None;
                }
                v.insert(UdpFlow {
                    socket,
                    guest_mac: *src_mac,
                    guest_ip: src_ip,
                    wire_dst_ip: dst_ip,
                    last_activity: Instant::now(),
                })
            }
        };
        flow.last_activity = Instant::now();
        if let Err(e) = flow.socket.send(data) {
            tracing::debug!(error = %e, "udp nat send failed");
        }
        None
    }

    pub fn handle_tcp(
        &mut self,
        segment: &[u8],
        src_mac: &[u8; 6],
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
    ) -> Option<Vec<u8>> {
        if segment.len() < 20 {
            return None;
        }
        let guest_port = u16::from_be_bytes([segment[0], segment[1]]);
        let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
        let seq = u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]);
        let data_offset = ((segment[12] >> 4) as usize) * 4;
        let flags = segment[13];
        if segment.len() < data_offset {
            return None;
        }
        let payload = &segment[data_offset..];
        let key = FlowKey {
            guest_port,
            dst_ip,
            dst_port,
        };
        let gateway_mac = self.gateway_mac;

        if flags & FLAG_RST != 0 {
            self.tcp.remove(&key);
            return None;
        }

        if flags & FLAG_SYN != 0 {
            return self.tcp_open(key, seq, src_mac, src_ip, dst_ip);
        }

        let Some(flow) = self.tcp.get_mut(&key) else {
            // No flow: tell the guest to go away.
            return Some(tcp_frame(
                &gateway_mac,
                src_mac,
                dst_ip,
                src_ip,
                dst_port,
                guest_port,
                0,
                seq.wrapping_add(1),
                FLAG_RST | FLAG_ACK,
                &[],
            ));
        };
        flow.last_activity = Instant::now();

        let mut reply_flags = 0u8;
        if !payload.is_empty() && flow.phase == TcpPhase::Established {
            // Only the in-order case matters: our advertised window is
            // what the guest keeps within, and we never reorder.
            if seq == flow.ack {
                if let Err(e) = flow.stream.write_all(payload) {
                    tracing::debug!(error = %e, "tcp nat write failed");
                    let frame = flow_rst(&gateway_mac, flow, key);
                    self.tcp.remove(&key);
                    return Some(frame);
                }
                flow.ack = flow.ack.wrapping_add(payload.len() as u32);
            }
            reply_flags |= FLAG_ACK;
        }
        if flags & FLAG_FIN != 0 {
            flow.ack = flow.ack.wrapping_add(1);
            let _ = flow.stream.shutdown(std::net::Shutdown::Write);
            let closing = flow.phase == TcpPhase::FinSent;
            let frame = ack_frame(&gateway_mac, flow, key, FLAG_ACK);
            if closing {
                self.tcp.remove(&key);
            }
            return Some(frame);
        }
        if reply_flags != 0 {
            let frame = ack_frame(&gateway_mac, flow, key, reply_flags);
            return Some(frame);
        }
        None
    }

    fn tcp_open(
        &mut self,
        key: FlowKey,
        guest_isn: u32,
        src_mac: &[u8; 6],
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
    ) -> Option<Vec<u8>> {
        let target = self.host_target(dst_ip, key.dst_port);
        // A short blocking connect keeps the state machine simple; local
        // targets either accept or refuse quickly.
        match TcpStream::connect_timeout(&target, Duration::from_secs(5)) {
            Ok(stream) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    tracing::debug!(error = %e, "tcp nonblocking failed");
                    return None;
                }
                stream.set_nodelay(true).ok();
                let flow = TcpFlow {
                    stream,
                    phase: TcpPhase::Connecting,
                    guest_mac: *src_mac,
                    guest_ip: src_ip,
                    wire_dst_ip: dst_ip,
                    seq: OUR_ISN,
                    ack: guest_isn.wrapping_add(1),
                    last_activity: Instant::now(),
                };
                let synack = tcp_frame(
                    &self.gateway_mac,
                    src_mac,
                    dst_ip,
                    src_ip,
                    key.dst_port,
                    key.guest_port,
                    flow.seq,
                    flow.ack,
                    FLAG_SYN | FLAG_ACK,
                    &[],
                );
                let mut flow = flow;
                flow.seq = flow.seq.wrapping_add(1);
                flow.phase = TcpPhase::Established;
                self.tcp.insert(key, flow);
                Some(synack)
            }
            Err(e) => {
                tracing::debug!(target = %target, error = %e, "tcp nat connect refused");
                Some(tcp_frame(
                    &self.gateway_mac,
                    src_mac,
                    dst_ip,
                    src_ip,
                    key.dst_port,
                    key.guest_port,
                    0,
                    guest_isn.wrapping_add(1),
                    FLAG_RST | FLAG_ACK,
                    &[],
                ))
            }
        }
    }

    /// Drain host sockets into guest-bound frames. Called from the
    /// switch loop between receive batches.
    pub fn poll(&mut self, out: &mut Vec<Vec<u8>>) {
        let gateway_mac = self.gateway_mac;
        let mut dead_tcp = Vec::new();
        let mut buf = [0u8; MAX_SEGMENT];
        for (key, flow) in self.tcp.iter_mut() {
            loop {
                match flow.stream.read(&mut buf) {
                    Ok(0) => {
                        if flow.phase == TcpPhase::Established {
                            out.push(tcp_frame(
                                &gateway_mac,
                                &flow.guest_mac,
                                flow.wire_dst_ip,
                                flow.guest_ip,
                                key.dst_port,
                                key.guest_port,
                                flow.seq,
                                flow.ack,
                                FLAG_FIN | FLAG_ACK,
                                &[],
                            ));
                            flow.seq = flow.seq.wrapping_add(1);
                            flow.phase = TcpPhase::FinSent;
                        }
                        break;
                    }
                    Ok(n) => {
                        flow.last_activity = Instant::now();
                        out.push(tcp_frame(
                            &gateway_mac,
                            &flow.guest_mac,
                            flow.wire_dst_ip,
                            flow.guest_ip,
                            key.dst_port,
                            key.guest_port,
                            flow.seq,
                            flow.ack,
                            FLAG_PSH | FLAG_ACK,
                            &buf[..n],
                        ));
                        flow.seq = flow.seq.wrapping_add(n as u32);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "tcp nat read failed");
                        dead_tcp.push(*key);
                        break;
                    }
                }
            }
            if flow.last_activity.elapsed() > TCP_IDLE_TIMEOUT {
                dead_tcp.push(*key);
            }
        }
        for key in dead_tcp {
            if let Some(flow) = self.tcp.remove(&key) {
                out.push(flow_rst(&gateway_mac, &flow, key));
            }
        }

        let mut dgram = [0u8; 65535];
        let mut dead_udp = Vec::new();
        for (key, flow) in self.udp.iter_mut() {
            loop {
                match flow.socket.recv(&mut dgram) {
                    Ok(n) => {
                        flow.last_activity = Instant::now();
                        out.push(udp_frame(
                            &gateway_mac,
                            &flow.guest_mac,
                            flow.wire_dst_ip,
                            flow.guest_ip,
                            key.dst_port,
                            key.guest_port,
                            &dgram[..n],
                        ));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "udp nat recv failed");
                        dead_udp.push(*key);
                        break;
                    }
                }
            }
            if flow.last_activity.elapsed() > UDP_IDLE_TIMEOUT {
                dead_udp.push(*key);
            }
        }
        for key in dead_udp {
            self.udp.remove(&key);
        }
    }

    /// Tear down the flow behind a guest-bound frame that could not be
    /// delivered. Our sequence number already advanced past the frame's
    /// payload, so the only honest continuation is a reset.
    pub fn abort_undelivered(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < 14 || u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_IPV4 {
            return None;
        }
        let ip = parse_ipv4(&frame[14..])?;
        if ip.proto != IP_PROTO_TCP || ip.payload.len() < 20 {
            return None;
        }
        let src_port = u16::from_be_bytes([ip.payload[0], ip.payload[1]]);
        let dst_port = u16::from_be_bytes([ip.payload[2], ip.payload[3]]);
        // Guest-bound, so the remote end is the IP source.
        let key = FlowKey {
            guest_port: dst_port,
            dst_ip: ip.src_ip,
            dst_port: src_port,
        };
        let flow = self.tcp.remove(&key)?;
        tracing::debug!(
            guest_port = key.guest_port,
            "flow aborted after undeliverable frame"
        );
        Some(flow_rst(&self.gateway_mac, &flow, key))
    }

    #[cfg(test)]
    fn tcp_flow_count(&self) -> usize {
        self.tcp.len()
    }
}

fn flow_rst(gateway_mac: &[u8; 6], flow: &TcpFlow, key: FlowKey) -> Vec<u8> {
    tcp_frame(
        gateway_mac,
        &flow.guest_mac,
        flow.wire_dst_ip,
        flow.guest_ip,
        key.dst_port,
        key.guest_port,
        flow.seq,
        flow.ack,
        FLAG_RST | FLAG_ACK,
        &[],
    )
}

fn ack_frame(gateway_mac: &[u8; 6], flow: &TcpFlow, key: FlowKey, flags: u8) -> Vec<u8> {
    tcp_frame(
        gateway_mac,
        &flow.guest_mac,
        flow.wire_dst_ip,
        flow.guest_ip,
        key.dst_port,
        key.guest_port,
        flow.seq,
        flow.ack,
        flags,
        &[],
    )
}

#[allow(clippy::too_many_arguments)]
fn tcp_frame(
    src_mac: &[u8; 6],
    dst_mac: &[u8; 6],
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = Vec::with_capacity(20 + payload.len());
    tcp.extend_from_slice(&src_port.to_be_bytes());
    tcp.extend_from_slice(&dst_port.to_be_bytes());
    tcp.extend_from_slice(&seq.to_be_bytes());
    tcp.extend_from_slice(&ack.to_be_bytes());
    tcp.push(5 << 4); // data offset, no options
    tcp.push(flags);
    tcp.extend_from_slice(&OUR_WINDOW.to_be_bytes());
    tcp.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
    tcp.extend_from_slice(payload);
    let cksum = l4_checksum(src_ip, dst_ip, IP_PROTO_TCP, &tcp);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

    let mut frame = Vec::with_capacity(14 + 20 + tcp.len());
    frame.extend_from_slice(&eth_header(dst_mac, src_mac, ETHERTYPE_IPV4));
    frame.extend_from_slice(&ip_header(src_ip, dst_ip, IP_PROTO_TCP, tcp.len()));
    frame.extend_from_slice(&tcp);
    frame
}

fn udp_frame(
    src_mac: &[u8; 6],
    dst_mac: &[u8; 6],
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: u16,
    dst_port: u16,
    data: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + data.len();
    let mut udp = Vec::with_capacity(udp_len);
    udp.extend_from_slice(&src_port.to_be_bytes());
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&(udp_len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(data);
    let cksum = l4_checksum(src_ip, dst_ip, IP_PROTO_UDP, &udp);
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    let mut frame = Vec::with_capacity(14 + 20 + udp_len);
    frame.extend_from_slice(&eth_header(dst_mac, src_mac, ETHERTYPE_IPV4));
    frame.extend_from_slice(&ip_header(src_ip, dst_ip, IP_PROTO_UDP, udp_len));
    frame.extend_from_slice(&udp);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const GW_IP: [u8; 4] = [192, 168, 104, 2];
    const GW_MAC: [u8; 6] = [0x02, 0x53, 0x4b, 0x46, 0x46, 0x01];
    const GUEST_IP: [u8; 4] = [192, 168, 104, 10];
    const GUEST_MAC: [u8; 6] = [0xaa; 6];

    fn nat() -> Nat {
        Nat::new(GW_IP, GW_MAC, [192, 168, 104, 0])
    }

    fn tcp_segment(src_port: u16, dst_port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut seg = Vec::new();
        seg.extend_from_slice(&src_port.to_be_bytes());
        seg.extend_from_slice(&dst_port.to_be_bytes());
        seg.extend_from_slice(&seq.to_be_bytes());
        seg.extend_from_slice(&0u32.to_be_bytes());
        seg.push(5 << 4);
        seg.push(flags);
        seg.extend_from_slice(&OUR_WINDOW.to_be_bytes());
        seg.extend_from_slice(&[0, 0, 0, 0]);
        seg.extend_from_slice(payload);
        seg
    }

    fn tcp_flags(frame: &[u8]) -> u8 {
        frame[14 + 20 + 13]
    }

    #[test]
    fn icmp_echo_is_answered_locally() {
        let nat = nat();
        let mut icmp = vec![8, 0, 0, 0, 0, 1, 0, 1, 0xde, 0xad];
        let cksum = crate::eth::checksum(&icmp);
        icmp[2..4].copy_from_slice(&cksum.to_be_bytes());
        let reply = nat
            .handle_icmp(&icmp, &GUEST_MAC, GUEST_IP, [1, 1, 1, 1])
            .unwrap();
        // Type flipped to echo reply, addressed back to the guest.
        assert_eq!(reply[14 + 20], 0);
        assert_eq!(&reply[14 + 16..14 + 20], &GUEST_IP);
        assert!(nat.handle_icmp(&[0u8; 4], &GUEST_MAC, GUEST_IP, [1, 1, 1, 1]).is_none());
    }

    #[test]
    fn tcp_connect_and_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut nat = nat();
        let dst_ip = [192, 168, 104, HOST_ALIAS_OCTET];

        let synack = nat
            .handle_tcp(
                &tcp_segment(40000, port, 100, FLAG_SYN, &[]),
                &GUEST_MAC,
                GUEST_IP,
                dst_ip,
            )
            .unwrap();
        assert_eq!(tcp_flags(&synack), FLAG_SYN | FLAG_ACK);
        let (mut server, _) = listener.accept().unwrap();

        // Guest sends data; server sees it.
        let ack = nat
            .handle_tcp(
                &tcp_segment(40000, port, 101, FLAG_ACK | FLAG_PSH, b"ping"),
                &GUEST_MAC,
                GUEST_IP,
                dst_ip,
            )
            .unwrap();
        assert_eq!(tcp_flags(&ack) & FLAG_ACK, FLAG_ACK);
        let mut got = [0u8; 4];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        // Server replies; poll turns it into a guest frame.
        server.write_all(b"pong").unwrap();
        let mut frames = Vec::new();
        for _ in 0..50 {
            nat.poll(&mut frames);
            if !frames.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let frame = frames.first().expect("response frame");
        assert_eq!(&frame[frame.len() - 4..], b"pong");
        assert_eq!(&frame[0..6], &GUEST_MAC);
    }

    #[test]
    fn refused_connect_yields_rst() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut nat = nat();
        let rst = nat
            .handle_tcp(
                &tcp_segment(40001, port, 7, FLAG_SYN, &[]),
                &GUEST_MAC,
                GUEST_IP,
                [192, 168, 104, HOST_ALIAS_OCTET],
            )
            .unwrap();
        assert_eq!(tcp_flags(&rst) & FLAG_RST, FLAG_RST);
        assert_eq!(nat.tcp_flow_count(), 0);
    }

    #[test]
    fn stray_segment_gets_rst() {
        let mut nat = nat();
        let rst = nat
            .handle_tcp(
                &tcp_segment(40002, 80, 55, FLAG_ACK, b"x"),
                &GUEST_MAC,
                GUEST_IP,
                [10, 0, 0, 1],
            )
            .unwrap();
        assert_eq!(tcp_flags(&rst) & FLAG_RST, FLAG_RST);
    }

    #[test]
    fn undeliverable_frame_aborts_the_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut nat = nat();
        let dst_ip = [192, 168, 104, HOST_ALIAS_OCTET];

        nat.handle_tcp(
            &tcp_segment(40003, port, 100, FLAG_SYN, &[]),
            &GUEST_MAC,
            GUEST_IP,
            dst_ip,
        )
        .unwrap();
        let (mut server, _) = listener.accept().unwrap();
        server.write_all(b"data").unwrap();

        let mut frames = Vec::new();
        for _ in 0..50 {
            nat.poll(&mut frames);
            if !frames.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let frame = frames.first().expect("data frame");

        // The frame never reached the guest; the flow must not survive
        // with its sequence numbers already advanced.
        let rst = nat.abort_undelivered(frame).expect("reset frame");
        assert_eq!(tcp_flags(&rst) & FLAG_RST, FLAG_RST);
        assert_eq!(&rst[0..6], &GUEST_MAC);
        assert_eq!(nat.tcp_flow_count(), 0);

        // Whatever the guest sends next lands on no flow and is reset.
        let stray = nat
            .handle_tcp(
                &tcp_segment(40003, port, 101, FLAG_ACK, b"x"),
                &GUEST_MAC,
                GUEST_IP,
                dst_ip,
            )
            .unwrap();
        assert_eq!(tcp_flags(&stray) & FLAG_RST, FLAG_RST);
    }

    #[test]
    fn udp_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let mut nat = nat();

        let mut seg = Vec::new();
        seg.extend_from_slice(&4010u16.to_be_bytes());
        seg.extend_from_slice(&port.to_be_bytes());
        seg.extend_from_slice(&16u16.to_be_bytes());
        seg.extend_from_slice(&[0, 0]);
        seg.extend_from_slice(b"hello udp");
        nat.handle_udp(&seg, &GUEST_MAC, GUEST_IP, [192, 168, 104, HOST_ALIAS_OCTET]);

        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello udp");
        server.send_to(b"ack", from).unwrap();

        let mut frames = Vec::new();
        for _ in 0..50 {
            nat.poll(&mut frames);
            if !frames.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let frame = frames.first().expect("udp response frame");
        assert_eq!(&frame[frame.len() - 3..], b"ack");
    }
}
