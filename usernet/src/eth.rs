//! Ethernet and IPv4 frame helpers shared by the in-process stack.

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub const ETH_HEADER_LEN: usize = 14;
pub const IP_HEADER_LEN: usize = 20;

pub fn eth_header(dst: &[u8; 6], src: &[u8; 6], ethertype: u16) -> [u8; ETH_HEADER_LEN] {
    let mut hdr = [0u8; ETH_HEADER_LEN];
    hdr[0..6].copy_from_slice(dst);
    hdr[6..12].copy_from_slice(src);
    hdr[12..14].copy_from_slice(&ethertype.to_be_bytes());
    hdr
}

pub fn ip_header(
    src: [u8; 4],
    dst: [u8; 4],
    proto: u8,
    payload_len: usize,
) -> [u8; IP_HEADER_LEN] {
    let total_len = (IP_HEADER_LEN + payload_len) as u16;
    let mut hdr = [0u8; IP_HEADER_LEN];
    hdr[0] = 0x45;
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[6] = 0x40; // don't fragment
    hdr[8] = 64; // ttl
    hdr[9] = proto;
    hdr[12..16].copy_from_slice(&src);
    hdr[16..20].copy_from_slice(&dst);
    let cksum = checksum(&hdr);
    hdr[10..12].copy_from_slice(&cksum.to_be_bytes());
    hdr
}

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data))
}

/// TCP/UDP checksum including the IPv4 pseudo-header.
pub fn l4_checksum(src: [u8; 4], dst: [u8; 4], proto: u8, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src);
    sum += sum_words(&dst);
    sum += proto as u32;
    sum += segment.len() as u32;
    sum += sum_words(segment);
    fold(sum)
}

fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// A parsed view of one guest frame, borrowed from the receive buffer.
#[derive(Debug)]
pub struct Ipv4View<'a> {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub proto: u8,
    pub payload: &'a [u8],
}

pub fn parse_ipv4(packet: &[u8]) -> Option<Ipv4View<'_>> {
    if packet.len() < IP_HEADER_LEN {
        return None;
    }
    let ihl = (packet[0] & 0x0f) as usize * 4;
    if ihl < IP_HEADER_LEN || packet.len() < ihl {
        return None;
    }
    let mut src_ip = [0u8; 4];
    let mut dst_ip = [0u8; 4];
    src_ip.copy_from_slice(&packet[12..16]);
    dst_ip.copy_from_slice(&packet[16..20]);
    Some(Ipv4View {
        src_ip,
        dst_ip,
        proto: packet[9],
        payload: &packet[ihl..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_zero_header_validates() {
        let hdr = ip_header([192, 168, 104, 1], [192, 168, 104, 5], IP_PROTO_UDP, 8);
        // Re-summing a header with its checksum in place yields zero.
        assert_eq!(checksum(&hdr), 0);
    }

    #[test]
    fn checksum_handles_odd_length() {
        assert_eq!(checksum(&[0x00]), 0xffff);
        // A trailing odd byte pads with zero.
        assert_eq!(checksum(&[0x45, 0x00, 0x01]), checksum(&[0x45, 0x00, 0x01, 0x00]));
        assert_eq!(checksum(&[0x45, 0x00, 0x01]), 0xb9ff);
    }

    #[test]
    fn parse_rejects_short_packets() {
        assert!(parse_ipv4(&[0u8; 10]).is_none());
        let hdr = ip_header([1, 1, 1, 1], [2, 2, 2, 2], IP_PROTO_TCP, 0);
        let view = parse_ipv4(&hdr).unwrap();
        assert_eq!(view.proto, IP_PROTO_TCP);
        assert_eq!(view.src_ip, [1, 1, 1, 1]);
        assert!(view.payload.is_empty());
    }
}
