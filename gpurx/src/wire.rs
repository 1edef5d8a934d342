//! Ethernet/IPv4/TCP header field extraction and address conversions.
//!
//! Parsing is deliberately lenient: a frame the gather kernel cannot fully
//! parse yields zeroed fields and a zero-length payload instead of an error,
//! so one malformed packet can never terminate a capture session.

use smoltcp::wire::{EthernetFrame, EthernetProtocol, Ipv4Packet, IpProtocol, TcpPacket};

use crate::error::{Error, Result};

const ETHERNET_HEADER_LEN: usize = 14;

/// Fixed per-packet fields extracted by the gather kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFields {
    /// 48-bit source MAC packed into the low bytes of a 64-bit integer.
    pub src_mac: u64,
    /// 48-bit destination MAC packed into the low bytes of a 64-bit integer.
    pub dst_mac: u64,
    /// Source IPv4 address, packed big-endian.
    pub src_ip: u32,
    /// Destination IPv4 address, packed big-endian.
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    /// TCP payload size derived from total-length minus header lengths,
    /// clamped to zero for implausible headers.
    pub payload_size: i32,
    /// Offset of the payload from the start of the frame.
    pub payload_offset: usize,
    pub tcp_flags: i32,
    pub ether_type: i32,
    pub next_proto_id: i32,
}

/// Extract the fixed fields of one raw Ethernet frame.
///
/// Fields beyond the point where parsing fails are left zeroed; the payload
/// size contribution of such a packet is zero so downstream offset math is
/// never corrupted.
pub fn parse(frame: &[u8]) -> PacketFields {
    let mut fields = PacketFields::default();

    let Ok(eth) = EthernetFrame::new_checked(frame) else {
        return fields;
    };
    fields.src_mac = mac_to_u64(eth.src_addr().0);
    fields.dst_mac = mac_to_u64(eth.dst_addr().0);
    fields.ether_type = i32::from(u16::from(eth.ethertype()));

    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return fields;
    }
    let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
        return fields;
    };
    fields.src_ip = u32::from_be_bytes(ip.src_addr().octets());
    fields.dst_ip = u32::from_be_bytes(ip.dst_addr().octets());
    fields.next_proto_id = i32::from(u8::from(ip.next_header()));

    if ip.next_header() != IpProtocol::Tcp {
        return fields;
    }
    let ip_header_len = ip.header_len() as usize;
    let ip_total_len = ip.total_len() as usize;
    let Ok(tcp) = TcpPacket::new_checked(ip.payload()) else {
        return fields;
    };
    fields.src_port = tcp.src_port();
    fields.dst_port = tcp.dst_port();
    fields.tcp_flags = tcp_flags(&tcp);

    let tcp_header_len = tcp.header_len() as usize;
    fields.payload_offset = ETHERNET_HEADER_LEN + ip_header_len + tcp_header_len;
    // Implausible header lengths would make this negative; clamp instead of
    // letting one bad packet corrupt the batch's prefix sum.
    let payload = ip_total_len
        .saturating_sub(ip_header_len)
        .saturating_sub(tcp_header_len);
    let available = frame.len().saturating_sub(fields.payload_offset);
    fields.payload_size = payload.min(available) as i32;

    fields
}

fn tcp_flags(tcp: &TcpPacket<&[u8]>) -> i32 {
    let mut flags = 0;
    if tcp.fin() {
        flags |= 0x01;
    }
    if tcp.syn() {
        flags |= 0x02;
    }
    if tcp.rst() {
        flags |= 0x04;
    }
    if tcp.psh() {
        flags |= 0x08;
    }
    if tcp.ack() {
        flags |= 0x10;
    }
    if tcp.urg() {
        flags |= 0x20;
    }
    flags
}

/// Pack a 6-byte MAC address into the low 48 bits of a `u64`.
#[inline]
pub fn mac_to_u64(mac: [u8; 6]) -> u64 {
    mac.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Unpack the low 48 bits of a `u64` into a 6-byte MAC address.
#[inline]
pub fn u64_to_mac(value: u64) -> [u8; 6] {
    let b = value.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Format a packed MAC integer as a colon-hex string.
pub fn mac_to_string(value: u64) -> String {
    let m = u64_to_mac(value);
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        m[0], m[1], m[2], m[3], m[4], m[5]
    )
}

/// Format a packed big-endian IPv4 integer as a dotted-quad string.
pub fn ipv4_to_string(value: u32) -> String {
    let o = value.to_be_bytes();
    format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3])
}

/// Parse a dotted-quad IPv4 address into its packed big-endian integer.
pub fn ipv4_from_string(s: &str) -> Option<u32> {
    let addr: std::net::Ipv4Addr = s.parse().ok()?;
    Some(u32::from_be_bytes(addr.octets()))
}

/// Parse a source-IP filter option.
///
/// An empty filter means "match all" and maps to zero; anything else must be
/// a well-formed dotted-quad address or construction fails.
pub fn parse_ip_filter(filter: &str) -> Result<u32> {
    if filter.is_empty() {
        return Ok(0);
    }
    ipv4_from_string(filter).ok_or_else(|| Error::InvalidIpFilter(filter.to_string()))
}

#[cfg(test)]
pub(crate) mod tests_frame_support {
    /// Hand-assembled TCP/IPv4 frame for in-crate unit tests.
    pub(crate) fn tcp_frame_with_payload(src_port: u16, payload: &[u8]) -> Vec<u8> {
        let total_len = 40 + payload.len();
        let mut frame = vec![0u8; 14 + total_len];
        frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]); // dst mac
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]); // src mac
        frame[12..14].copy_from_slice(&[0x08, 0x00]); // ipv4
        frame[14] = 0x45; // version 4, ihl 5
        frame[16..18].copy_from_slice(&(total_len as u16).to_be_bytes());
        frame[22] = 64; // ttl
        frame[23] = 6; // tcp
        frame[26..30].copy_from_slice(&[10, 0, 0, 1]); // src ip
        frame[30..34].copy_from_slice(&[10, 0, 0, 2]); // dst ip
        frame[34..36].copy_from_slice(&src_port.to_be_bytes());
        frame[36..38].copy_from_slice(&80u16.to_be_bytes()); // dst port
        frame[46] = 5 << 4; // data offset 5 words
        frame[54..].copy_from_slice(payload);
        frame
    }

    /// 54-byte TCP/IPv4 frame with an empty payload.
    pub(crate) fn minimal_tcp_frame() -> Vec<u8> {
        tcp_frame_with_payload(4000, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_frame_parses() {
        let fields = parse(&tests_frame_support::minimal_tcp_frame());
        assert_eq!(fields.ether_type, 0x0800);
        assert_eq!(fields.next_proto_id, 6);
        assert_eq!(fields.src_ip, u32::from_be_bytes([10, 0, 0, 1]));
        assert_eq!(fields.src_port, 4000);
        assert_eq!(fields.dst_port, 80);
        assert_eq!(fields.payload_size, 0);
        assert_eq!(fields.payload_offset, 54);
    }

    #[test]
    fn test_mac_round_trip() {
        let mac = [0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22];
        let packed = mac_to_u64(mac);
        assert_eq!(u64_to_mac(packed), mac);
        assert_eq!(mac_to_string(packed), "AA:BB:CC:00:11:22");
    }

    #[test]
    fn test_ipv4_round_trip() {
        let packed = ipv4_from_string("192.168.1.10").unwrap();
        assert_eq!(packed, u32::from_be_bytes([192, 168, 1, 10]));
        assert_eq!(ipv4_to_string(packed), "192.168.1.10");
    }

    #[test]
    fn test_ip_filter_parse() {
        assert_eq!(parse_ip_filter("").unwrap(), 0);
        assert_eq!(
            parse_ip_filter("10.0.0.1").unwrap(),
            u32::from_be_bytes([10, 0, 0, 1])
        );
        assert!(parse_ip_filter("not-an-ip").is_err());
        assert!(parse_ip_filter("10.0.0").is_err());
    }

    #[test]
    fn test_parse_truncated_frame() {
        // Too short for an Ethernet header: everything zeroed, size zero.
        let fields = parse(&[0u8; 6]);
        assert_eq!(fields, PacketFields::default());
    }

    #[test]
    fn test_parse_non_ip_frame() {
        let mut frame = [0u8; 64];
        frame[0..6].copy_from_slice(&[2, 0, 0, 0, 0, 2]);
        frame[6..12].copy_from_slice(&[2, 0, 0, 0, 0, 1]);
        // ARP ethertype.
        frame[12] = 0x08;
        frame[13] = 0x06;
        let fields = parse(&frame);
        assert_eq!(fields.ether_type, 0x0806);
        assert_eq!(fields.src_ip, 0);
        assert_eq!(fields.payload_size, 0);
    }
}
