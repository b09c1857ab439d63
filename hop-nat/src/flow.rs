//! Flow identification
//!
//! A [`FlowKey`] names one local conversation: the protocol, the local
//! source endpoint and, depending on the [`KeyingMode`], the remote
//! destination. For ICMP echo the echo identifier takes the place of the
//! source port.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};
use crate::packet::{IpPacketInfo, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "ipv4"),
            IpVersion::V6 => write!(f, "ipv6"),
        }
    }
}

/// Transport protocol of a tracked flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl FlowProtocol {
    /// Map an IP protocol / next-header number. ICMP and ICMPv6 share a variant.
    pub fn from_ip_protocol(protocol: u8) -> Option<Self> {
        match protocol {
            IPPROTO_TCP => Some(FlowProtocol::Tcp),
            IPPROTO_UDP => Some(FlowProtocol::Udp),
            IPPROTO_ICMP | IPPROTO_ICMPV6 => Some(FlowProtocol::Icmp),
            _ => None,
        }
    }

    /// IP protocol number for this protocol in the given family
    pub fn ip_protocol(&self, version: IpVersion) -> u8 {
        match (self, version) {
            (FlowProtocol::Tcp, _) => IPPROTO_TCP,
            (FlowProtocol::Udp, _) => IPPROTO_UDP,
            (FlowProtocol::Icmp, IpVersion::V4) => IPPROTO_ICMP,
            (FlowProtocol::Icmp, IpVersion::V6) => IPPROTO_ICMPV6,
        }
    }
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowProtocol::Tcp => write!(f, "tcp"),
            FlowProtocol::Udp => write!(f, "udp"),
            FlowProtocol::Icmp => write!(f, "icmp"),
        }
    }
}

/// How much of a flow participates in its identity
///
/// `Basic` keys on the local source only, so every destination reached from
/// one source port shares a NAT id (endpoint-independent mapping).
/// `Extended` also keys on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyingMode {
    #[default]
    Basic,
    Extended,
}

impl KeyingMode {
    /// Reduce a flow to the fields this mode keys on
    pub fn normalize(&self, flow: &FlowKey) -> FlowKey {
        match self {
            KeyingMode::Basic => FlowKey {
                destination: None,
                destination_port: None,
                ..flow.clone()
            },
            KeyingMode::Extended => flow.clone(),
        }
    }
}

/// Identity of one local flow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: FlowProtocol,
    pub source: IpAddr,
    pub source_port: u16,
    pub destination: Option<IpAddr>,
    pub destination_port: Option<u16>,
}

impl FlowKey {
    /// Flow between two socket endpoints
    pub fn new(protocol: FlowProtocol, source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            protocol,
            source: source.ip(),
            source_port: source.port(),
            destination: Some(destination.ip()),
            destination_port: Some(destination.port()),
        }
    }

    /// Flow identified by its source alone
    pub fn from_source(protocol: FlowProtocol, source: SocketAddr) -> Self {
        Self {
            protocol,
            source: source.ip(),
            source_port: source.port(),
            destination: None,
            destination_port: None,
        }
    }

    /// Extract the flow an outbound IP packet belongs to
    pub fn from_packet(packet: &[u8]) -> Result<Self> {
        let info = IpPacketInfo::parse(packet)?;
        let protocol = FlowProtocol::from_ip_protocol(info.protocol)
            .ok_or(Error::UnsupportedProtocol(info.protocol))?;

        match protocol {
            FlowProtocol::Tcp | FlowProtocol::Udp => {
                let (source_port, destination_port) = info
                    .ports()
                    .ok_or_else(|| Error::InvalidPacket("truncated transport header".into()))?;
                Ok(Self {
                    protocol,
                    source: info.source,
                    source_port,
                    destination: Some(info.destination),
                    destination_port: Some(destination_port),
                })
            }
            FlowProtocol::Icmp => {
                let id = info
                    .icmp_echo_id()
                    .ok_or_else(|| Error::InvalidPacket("not an ICMP echo message".into()))?;
                Ok(Self {
                    protocol,
                    source: info.source,
                    source_port: id,
                    destination: Some(info.destination),
                    destination_port: None,
                })
            }
        }
    }

    pub fn ip_version(&self) -> IpVersion {
        IpVersion::of(&self.source)
    }

    pub fn source_addr(&self) -> SocketAddr {
        SocketAddr::new(self.source, self.source_port)
    }

    pub fn destination_addr(&self) -> Option<SocketAddr> {
        self.destination
            .map(|ip| SocketAddr::new(ip, self.destination_port.unwrap_or(0)))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, self.source_addr())?;
        if let Some(destination) = self.destination_addr() {
            write!(f, " -> {}", destination)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_udp_packet;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_basic_mode_strips_destination() {
        let flow = FlowKey::new(
            FlowProtocol::Udp,
            "10.0.0.2:5000".parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
        );

        let basic = KeyingMode::Basic.normalize(&flow);
        assert_eq!(basic.destination, None);
        assert_eq!(basic.destination_port, None);
        assert_eq!(basic.source_port, 5000);

        assert_eq!(KeyingMode::Extended.normalize(&flow), flow);
    }

    #[test]
    fn test_families_never_compare_equal() {
        let v4 = FlowKey::from_source(
            FlowProtocol::Udp,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7000),
        );
        let v6 = FlowKey::from_source(
            FlowProtocol::Udp,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 7000),
        );
        let mapped = FlowKey::from_source(
            FlowProtocol::Udp,
            SocketAddr::new(IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped()), 7000),
        );

        assert_ne!(v4, v6);
        assert_ne!(v4, mapped);
        assert_eq!(v4.ip_version(), IpVersion::V4);
        assert_eq!(mapped.ip_version(), IpVersion::V6);
    }

    #[test]
    fn test_flow_from_udp_packet() {
        let packet = build_udp_packet(
            "10.1.0.5:40000".parse().unwrap(),
            "1.1.1.1:53".parse().unwrap(),
            b"query",
        )
        .unwrap();

        let flow = FlowKey::from_packet(&packet).unwrap();
        assert_eq!(flow.protocol, FlowProtocol::Udp);
        assert_eq!(flow.source_addr(), "10.1.0.5:40000".parse().unwrap());
        assert_eq!(flow.destination_addr(), Some("1.1.1.1:53".parse().unwrap()));
    }

    #[test]
    fn test_flow_from_icmp_echo_uses_identifier() {
        // IPv4 header + ICMP echo request, id 0x1234
        let mut packet = vec![
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x40, 0x00, 0x40, 0x01, 0x00, 0x00, 10, 0, 0, 2, 8,
            8, 8, 8,
        ];
        packet.extend_from_slice(&[8, 0, 0, 0, 0x12, 0x34, 0x00, 0x01]);

        let flow = FlowKey::from_packet(&packet).unwrap();
        assert_eq!(flow.protocol, FlowProtocol::Icmp);
        assert_eq!(flow.source_port, 0x1234);
        assert_eq!(flow.destination, Some(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn test_unsupported_protocol() {
        // GRE
        let packet = vec![
            0x45, 0x00, 0x00, 0x18, 0x00, 0x00, 0x40, 0x00, 0x40, 47, 0x00, 0x00, 10, 0, 0, 2, 8, 8,
            8, 8, 0, 0, 0, 0,
        ];
        assert!(matches!(
            FlowKey::from_packet(&packet),
            Err(Error::UnsupportedProtocol(47))
        ));
    }
}
