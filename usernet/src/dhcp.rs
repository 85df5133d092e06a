//! In-process DHCP server backed by the lease table.

use crate::eth::{ETHERTYPE_IPV4, IP_PROTO_UDP, eth_header, ip_header};
use crate::leases::{LeaseTable, format_hw};

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const DHCP_DISCOVER: u8 = 1;
const DHCP_OFFER: u8 = 2;
const DHCP_REQUEST: u8 = 3;
const DHCP_ACK: u8 = 5;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const LEASE_SECS: u32 = 86400;

/// Addressing the server hands out. Gateway and DNS are the same host.
#[derive(Debug, Clone)]
pub struct DhcpParams {
    pub gateway_ip: [u8; 4],
    pub gateway_mac: [u8; 6],
    pub netmask: [u8; 4],
    pub mtu: u16,
    /// First host search domain, handed to clients as the domain name.
    pub search_domain: Option<String>,
}

/// Answer a BOOTP/DHCP datagram, allocating a lease for the client MAC.
pub fn handle_dhcp(
    payload: &[u8],
    table: &mut LeaseTable,
    params: &DhcpParams,
) -> Option<Vec<u8>> {
    if payload.len() < 240 || payload[0] != BOOTREQUEST {
        return None;
    }
    if payload[236..240] != MAGIC_COOKIE {
        return None;
    }
    let msg_type = find_option(&payload[240..], 53)?;
    let reply_type = match msg_type {
        DHCP_DISCOVER => DHCP_OFFER,
        DHCP_REQUEST => DHCP_ACK,
        _ => return None,
    };

    let client_mac = format_hw(&payload[28..34]);
    let ip = match table.allocate(&client_mac) {
        Ok(ip) => ip.octets(),
        Err(e) => {
            tracing::warn!(mac = %client_mac, error = %e, "dhcp allocation failed");
            return None;
        }
    };
    tracing::debug!(
        mac = %client_mac,
        ip = %std::net::Ipv4Addr::from(ip),
        reply = if reply_type == DHCP_OFFER { "offer" } else { "ack" },
        "dhcp",
    );

    let dhcp = build_reply(payload, reply_type, ip, params);
    let udp = udp_datagram(67, 68, &dhcp);
    let ip_hdr = ip_header(params.gateway_ip, [255; 4], IP_PROTO_UDP, udp.len());

    let mut frame = Vec::with_capacity(14 + 20 + udp.len());
    frame.extend_from_slice(&eth_header(&[0xff; 6], &params.gateway_mac, ETHERTYPE_IPV4));
    frame.extend_from_slice(&ip_hdr);
    frame.extend_from_slice(&udp);
    Some(frame)
}

fn find_option(options: &[u8], wanted: u8) -> Option<u8> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            255 => break,
            0 => i += 1,
            code => {
                let len = *options.get(i + 1)? as usize;
                if code == wanted && len >= 1 {
                    return options.get(i + 2).copied();
                }
                i += 2 + len;
            }
        }
    }
    None
}

fn build_reply(request: &[u8], msg_type: u8, client_ip: [u8; 4], params: &DhcpParams) -> Vec<u8> {
    let mut dhcp = vec![0u8; 240];
    dhcp[0] = BOOTREPLY;
    dhcp[1] = 1; // ethernet
    dhcp[2] = 6; // hw address length
    dhcp[4..8].copy_from_slice(&request[4..8]); // transaction id
    dhcp[10..12].copy_from_slice(&[0x80, 0]); // broadcast
    dhcp[16..20].copy_from_slice(&client_ip);
    dhcp[20..24].copy_from_slice(&params.gateway_ip);
    dhcp[28..34].copy_from_slice(&request[28..34]);
    dhcp[236..240].copy_from_slice(&MAGIC_COOKIE);

    push_option(&mut dhcp, 53, &[msg_type]);
    push_option(&mut dhcp, 54, &params.gateway_ip); // server id
    push_option(&mut dhcp, 51, &LEASE_SECS.to_be_bytes());
    push_option(&mut dhcp, 1, &params.netmask);
    push_option(&mut dhcp, 3, &params.gateway_ip); // router
    push_option(&mut dhcp, 6, &params.gateway_ip); // dns, same host
    push_option(&mut dhcp, 26, &params.mtu.to_be_bytes());
    if let Some(domain) = &params.search_domain {
        push_option(&mut dhcp, 15, domain.as_bytes());
    }
    dhcp.push(255);
    dhcp
}

fn push_option(dhcp: &mut Vec<u8>, code: u8, data: &[u8]) {
    dhcp.push(code);
    dhcp.push(data.len() as u8);
    dhcp.extend_from_slice(data);
}

fn udp_datagram(src_port: u16, dst_port: u16, data: &[u8]) -> Vec<u8> {
    let len = (8 + data.len()) as u16;
    let mut udp = Vec::with_capacity(8 + data.len());
    udp.extend_from_slice(&src_port.to_be_bytes());
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&len.to_be_bytes());
    udp.extend_from_slice(&[0, 0]); // checksum optional over ipv4
    udp.extend_from_slice(data);
    udp
}
