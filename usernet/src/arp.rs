//! ARP responder for the gateway address.

use crate::eth::{ETHERTYPE_ARP, eth_header};

const ARP_LEN: usize = 28;
const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;

/// Answer ARP requests for the gateway (which also serves DNS). Anything
/// else on the segment is guest-to-guest and not ours to answer.
pub fn handle_arp(
    payload: &[u8],
    src_mac: &[u8; 6],
    gateway_ip: [u8; 4],
    gateway_mac: [u8; 6],
) -> Option<Vec<u8>> {
    if payload.len() < ARP_LEN {
        return None;
    }
    let operation = u16::from_be_bytes([payload[6], payload[7]]);
    if operation != OP_REQUEST {
        return None;
    }
    if payload[24..28] != gateway_ip {
        return None;
    }
    tracing::trace!("arp request for gateway");

    let mut reply = Vec::with_capacity(14 + ARP_LEN);
    reply.extend_from_slice(&eth_header(src_mac, &gateway_mac, ETHERTYPE_ARP));

    let mut arp = [0u8; ARP_LEN];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes()); // ethernet
    arp[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // ipv4
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&OP_REPLY.to_be_bytes());
    arp[8..14].copy_from_slice(&gateway_mac);
    arp[14..18].copy_from_slice(&gateway_ip);
    arp[18..24].copy_from_slice(src_mac);
    arp[24..28].copy_from_slice(&payload[14..18]);
    reply.extend_from_slice(&arp);
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GW_IP: [u8; 4] = [192, 168, 104, 2];
    const GW_MAC: [u8; 6] = [0x02, 0x53, 0x4b, 0x46, 0x46, 0x01];

    fn request(target_ip: [u8; 4]) -> [u8; ARP_LEN] {
        let mut arp = [0u8; ARP_LEN];
        arp[0..2].copy_from_slice(&1u16.to_be_bytes());
        arp[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        arp[4] = 6;
        arp[5] = 4;
        arp[6..8].copy_from_slice(&OP_REQUEST.to_be_bytes());
        arp[8..14].copy_from_slice(&[0xaa; 6]);
        arp[14..18].copy_from_slice(&[192, 168, 104, 10]);
        arp[24..28].copy_from_slice(&target_ip);
        arp
    }

    #[test]
    fn replies_for_gateway() {
        let src_mac = [0xaa; 6];
        let reply = handle_arp(&request(GW_IP), &src_mac, GW_IP, GW_MAC).unwrap();
        // Destination is the requester, sender is the gateway.
        assert_eq!(&reply[0..6], &src_mac);
        assert_eq!(&reply[6..12], &GW_MAC);
        assert_eq!(u16::from_be_bytes([reply[20], reply[21]]), OP_REPLY);
        assert_eq!(&reply[28..32], &GW_IP);
    }

    #[test]
    fn ignores_other_targets_and_replies() {
        let src_mac = [0xaa; 6];
        assert!(handle_arp(&request([192, 168, 104, 9]), &src_mac, GW_IP, GW_MAC).is_none());
        let mut reply_frame = request(GW_IP);
        reply_frame[6..8].copy_from_slice(&OP_REPLY.to_be_bytes());
        assert!(handle_arp(&reply_frame, &src_mac, GW_IP, GW_MAC).is_none());
        assert!(handle_arp(&[0u8; 20], &src_mac, GW_IP, GW_MAC).is_none());
    }
}
