//! IP packet inspection and construction
//!
//! Thin layer over `etherparse` exposing what flow tracking and UDP
//! relaying need: addresses, transport ports, the ICMP echo identifier,
//! and a builder for UDP reply packets.

use std::net::{IpAddr, SocketAddr};

use etherparse::{
    Icmpv4Slice, Icmpv4Type, Icmpv6Slice, Icmpv6Type, IpSlice, PacketBuilder, TcpHeaderSlice,
    UdpHeaderSlice, UdpSlice,
};

use crate::error::{Error, Result};
use crate::flow::IpVersion;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

const DEFAULT_TTL: u8 = 64;

/// Parsed view over an IP packet
#[derive(Debug, Clone)]
pub struct IpPacketInfo<'a> {
    pub version: IpVersion,
    pub source: IpAddr,
    pub destination: IpAddr,
    /// Transport protocol number, after any IPv6 extension headers
    pub protocol: u8,
    /// Bytes after the IP headers, trimmed to the length the header declares
    pub payload: &'a [u8],
}

impl<'a> IpPacketInfo<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let ip = IpSlice::from_slice(data).map_err(|e| Error::InvalidPacket(e.to_string()))?;
        let version = match ip {
            IpSlice::Ipv4(_) => IpVersion::V4,
            IpSlice::Ipv6(_) => IpVersion::V6,
        };
        let payload = ip.payload();

        Ok(Self {
            version,
            source: ip.source_addr(),
            destination: ip.destination_addr(),
            protocol: payload.ip_number.0,
            payload: payload.payload,
        })
    }

    /// Source and destination ports of a TCP or UDP packet
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.protocol {
            IPPROTO_UDP => UdpHeaderSlice::from_slice(self.payload)
                .ok()
                .map(|udp| (udp.source_port(), udp.destination_port())),
            IPPROTO_TCP => TcpHeaderSlice::from_slice(self.payload)
                .ok()
                .map(|tcp| (tcp.source_port(), tcp.destination_port())),
            _ => None,
        }
    }

    /// Data carried by a UDP datagram
    pub fn udp_payload(&self) -> Option<&'a [u8]> {
        if self.protocol != IPPROTO_UDP {
            return None;
        }
        UdpSlice::from_slice(self.payload).ok().map(|udp| udp.payload())
    }

    /// Identifier of an ICMP / ICMPv6 echo request or reply
    pub fn icmp_echo_id(&self) -> Option<u16> {
        match (self.version, self.protocol) {
            (IpVersion::V4, IPPROTO_ICMP) => {
                match Icmpv4Slice::from_slice(self.payload).ok()?.icmp_type() {
                    Icmpv4Type::EchoRequest(echo) | Icmpv4Type::EchoReply(echo) => Some(echo.id),
                    _ => None,
                }
            }
            (IpVersion::V6, IPPROTO_ICMPV6) => {
                match Icmpv6Slice::from_slice(self.payload).ok()?.icmp_type() {
                    Icmpv6Type::EchoRequest(echo) | Icmpv6Type::EchoReply(echo) => Some(echo.id),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Build a complete IP/UDP packet carrying `payload` from `source` to `destination`
pub fn build_udp_packet(source: SocketAddr, destination: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let builder = match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            PacketBuilder::ipv4(src.octets(), dst.octets(), DEFAULT_TTL)
                .udp(source.port(), destination.port())
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            PacketBuilder::ipv6(src.octets(), dst.octets(), DEFAULT_TTL)
                .udp(source.port(), destination.port())
        }
        _ => {
            return Err(Error::InvalidPacket(format!(
                "address family mismatch: {} -> {}",
                source, destination
            )))
        }
    };

    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut packet, payload)
        .map_err(|e| Error::InvalidPacket(format!("cannot build UDP packet: {}", e)))?;
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{NetHeaders, PacketHeaders, PayloadSlice, TransportHeader};

    fn assert_checksums_valid(packet: &[u8]) {
        let headers = PacketHeaders::from_ip_slice(packet).expect("packet parses");
        match (headers.net, headers.transport, headers.payload) {
            (
                Some(NetHeaders::Ipv4(ip, _)),
                Some(TransportHeader::Udp(udp)),
                PayloadSlice::Udp(payload),
            ) => {
                assert_eq!(ip.header_checksum, ip.calc_header_checksum());
                assert_eq!(udp.checksum, udp.calc_checksum_ipv4(&ip, payload).unwrap());
            }
            (
                Some(NetHeaders::Ipv6(ip, _)),
                Some(TransportHeader::Udp(udp)),
                PayloadSlice::Udp(payload),
            ) => {
                assert_eq!(udp.checksum, udp.calc_checksum_ipv6(&ip, payload).unwrap());
            }
            _ => panic!("packet is not UDP over IP"),
        }
    }

    #[test]
    fn test_build_and_parse_ipv4_udp() {
        let packet = build_udp_packet(
            "192.168.1.10:5353".parse().unwrap(),
            "192.168.1.1:53".parse().unwrap(),
            b"hello",
        )
        .unwrap();

        assert_eq!(packet.len(), 20 + 8 + 5);
        assert_checksums_valid(&packet);

        let info = IpPacketInfo::parse(&packet).unwrap();
        assert_eq!(info.version, IpVersion::V4);
        assert_eq!(info.protocol, IPPROTO_UDP);
        assert_eq!(info.ports(), Some((5353, 53)));
        assert_eq!(info.udp_payload(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_build_and_parse_ipv6_udp() {
        let packet = build_udp_packet(
            "[fd00::1]:4000".parse().unwrap(),
            "[fd00::2]:4001".parse().unwrap(),
            &[1, 2, 3],
        )
        .unwrap();

        assert_checksums_valid(&packet);

        let info = IpPacketInfo::parse(&packet).unwrap();
        assert_eq!(info.version, IpVersion::V6);
        assert_eq!(info.source, "fd00::1".parse::<IpAddr>().unwrap());
        assert_eq!(info.ports(), Some((4000, 4001)));
        assert_eq!(info.udp_payload(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_odd_length_payload_checksum() {
        let packet = build_udp_packet(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            b"odd",
        )
        .unwrap();
        assert_checksums_valid(&packet);
    }

    #[test]
    fn test_mixed_families_rejected() {
        let result = build_udp_packet(
            "10.0.0.1:1".parse().unwrap(),
            "[::1]:1".parse().unwrap(),
            b"x",
        );
        assert!(matches!(result, Err(Error::InvalidPacket(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(IpPacketInfo::parse(&[]).is_err());
        assert!(IpPacketInfo::parse(&[0x45, 0, 0]).is_err());
        assert!(IpPacketInfo::parse(&[0x20; 40]).is_err());

        // total length larger than the buffer
        let mut packet = build_udp_packet(
            "10.0.0.1:1".parse().unwrap(),
            "10.0.0.2:2".parse().unwrap(),
            b"abc",
        )
        .unwrap();
        packet.truncate(packet.len() - 1);
        assert!(IpPacketInfo::parse(&packet).is_err());
    }
}
