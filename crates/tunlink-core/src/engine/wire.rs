// ============================================
// File: crates/tunlink-core/src/engine/wire.rs
// ============================================
//! # Ingress Inspection and UDP Emission
//!
//! ## Creation Reason
//! The engine needs to look at a packet before smoltcp does: a SYN for an
//! unknown 4-tuple goes to the TCP forwarder first, and UDP never reaches
//! smoltcp at all. Replies on UDP flows are built here too.
//!
//! ## Main Functionality
//! - `inspect`: validates IP and transport headers (checksums included)
//!   and classifies the segment
//! - `build_udp`: emits an IPv4/IPv6 + UDP packet
//! - address conversions between `std::net` and `smoltcp::wire`
//!
//! ## Last Modified
//! v0.1.0 - Initial wire helpers

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpEndpoint, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Address,
    Ipv6Packet, Ipv6Repr, TcpPacket, UdpPacket, UdpRepr,
};

use tunlink_common::CommonError;

use super::TransportEndpointId;
use crate::error::{CoreError, Result};
use crate::packet::{NetworkProtocol, PacketBuffer};

const DEFAULT_HOP_LIMIT: u8 = 64;

// ============================================
// Address Conversions
// ============================================

pub(crate) fn to_ip_address(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from(v4)),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from(v6)),
    }
}

pub(crate) fn to_std_ip(ip: IpAddress) -> IpAddr {
    match ip {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6)),
    }
}

pub(crate) fn to_socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    SocketAddr::new(to_std_ip(endpoint.addr), endpoint.port)
}

// ============================================
// Inspection
// ============================================

/// What an inbound packet carries.
#[derive(Debug)]
pub(crate) enum Inspected {
    /// Connection request: SYN without ACK.
    TcpSyn(TransportEndpointId),
    /// Any other TCP segment.
    Tcp,
    /// A datagram with a valid checksum.
    Udp(TransportEndpointId, Bytes),
    /// ICMPv4 / ICMPv6.
    Icmp,
    /// Something smoltcp may still want (extension headers, IGMP, ...).
    Other,
}

/// Validates and classifies a packet. `None` means malformed.
pub(crate) fn inspect(protocol: NetworkProtocol, data: &[u8]) -> Option<Inspected> {
    let caps = ChecksumCapabilities::default();
    match protocol {
        NetworkProtocol::Ipv4 => {
            let packet = Ipv4Packet::new_checked(data).ok()?;
            let repr = Ipv4Repr::parse(&packet, &caps).ok()?;
            inspect_transport(
                repr.next_header,
                IpAddr::V4(Ipv4Addr::from(repr.src_addr)),
                IpAddr::V4(Ipv4Addr::from(repr.dst_addr)),
                packet.payload(),
                &caps,
            )
        }
        NetworkProtocol::Ipv6 => {
            let packet = Ipv6Packet::new_checked(data).ok()?;
            let repr = Ipv6Repr::parse(&packet).ok()?;
            inspect_transport(
                repr.next_header,
                IpAddr::V6(Ipv6Addr::from(repr.src_addr)),
                IpAddr::V6(Ipv6Addr::from(repr.dst_addr)),
                packet.payload(),
                &caps,
            )
        }
    }
}

fn inspect_transport(
    next_header: IpProtocol,
    source: IpAddr,
    destination: IpAddr,
    payload: &[u8],
    caps: &ChecksumCapabilities,
) -> Option<Inspected> {
    let src = to_ip_address(source);
    let dst = to_ip_address(destination);

    match next_header {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(payload).ok()?;
            if !tcp.verify_checksum(&src, &dst) {
                return None;
            }
            if tcp.syn() && !tcp.ack() {
                Some(Inspected::TcpSyn(TransportEndpointId {
                    local: SocketAddr::new(destination, tcp.dst_port()),
                    remote: SocketAddr::new(source, tcp.src_port()),
                }))
            } else {
                Some(Inspected::Tcp)
            }
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(payload).ok()?;
            let repr = UdpRepr::parse(&udp, &src, &dst, caps).ok()?;
            let id = TransportEndpointId {
                local: SocketAddr::new(destination, repr.dst_port),
                remote: SocketAddr::new(source, repr.src_port),
            };
            Some(Inspected::Udp(id, Bytes::copy_from_slice(udp.payload())))
        }
        IpProtocol::Icmp | IpProtocol::Icmpv6 => Some(Inspected::Icmp),
        _ => Some(Inspected::Other),
    }
}

// ============================================
// Emission
// ============================================

/// Builds a UDP datagram from `source` to `destination`.
///
/// # Errors
/// The two addresses belong to different families.
pub(crate) fn build_udp(
    source: SocketAddr,
    destination: SocketAddr,
    payload: &[u8],
) -> Result<PacketBuffer> {
    let caps = ChecksumCapabilities::default();
    let udp_repr = UdpRepr {
        src_port: source.port(),
        dst_port: destination.port(),
    };
    let udp_len = udp_repr.header_len() + payload.len();
    let src = to_ip_address(source.ip());
    let dst = to_ip_address(destination.ip());

    let (protocol, buffer) = match (source.ip(), destination.ip()) {
        (IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
            let ip_repr = Ipv4Repr {
                src_addr: Ipv4Address::from(src_addr),
                dst_addr: Ipv4Address::from(dst_addr),
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: DEFAULT_HOP_LIMIT,
            };
            let mut buffer = vec![0u8; ip_repr.buffer_len() + udp_len];
            let mut ip = Ipv4Packet::new_unchecked(&mut buffer[..]);
            ip_repr.emit(&mut ip, &caps);
            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp_repr.emit(
                &mut udp,
                &src,
                &dst,
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            (NetworkProtocol::Ipv4, buffer)
        }
        (IpAddr::V6(src_addr), IpAddr::V6(dst_addr)) => {
            let ip_repr = Ipv6Repr {
                src_addr: Ipv6Address::from(src_addr),
                dst_addr: Ipv6Address::from(dst_addr),
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: DEFAULT_HOP_LIMIT,
            };
            let mut buffer = vec![0u8; ip_repr.buffer_len() + udp_len];
            let mut ip = Ipv6Packet::new_unchecked(&mut buffer[..]);
            ip_repr.emit(&mut ip);
            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp_repr.emit(
                &mut udp,
                &src,
                &dst,
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            (NetworkProtocol::Ipv6, buffer)
        }
        _ => {
            return Err(CoreError::Common(CommonError::invalid_input(
                "destination",
                format!("{destination} does not match the family of {source}"),
            )))
        }
    };

    Ok(PacketBuffer::from_bytes(protocol, Bytes::from(buffer)))
}

// ============================================
// Test Packets
// ============================================


// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_udp_v4_built_then_inspected() {
        let pkt = build_udp(addr("198.51.100.9:53"), addr("10.0.0.2:40000"), b"answer").unwrap();
        assert_eq!(pkt.protocol(), NetworkProtocol::Ipv4);

        match inspect(NetworkProtocol::Ipv4, &pkt.to_contiguous()) {
            Some(Inspected::Udp(id, payload)) => {
                assert_eq!(id.remote, addr("198.51.100.9:53"));
                assert_eq!(id.local, addr("10.0.0.2:40000"));
                assert_eq!(&payload[..], b"answer");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_udp_v6_built_then_inspected() {
        let pkt = build_udp(addr("[2001:db8::1]:5353"), addr("[2001:db8::2]:53"), b"q").unwrap();
        assert_eq!(pkt.protocol(), NetworkProtocol::Ipv6);
        assert!(matches!(
            inspect(NetworkProtocol::Ipv6, &pkt.to_contiguous()),
            Some(Inspected::Udp(..))
        ));
    }

    #[test]
    fn test_corrupted_udp_checksum_is_malformed() {
        let pkt = build_udp(addr("198.51.100.9:53"), addr("10.0.0.2:40000"), b"answer").unwrap();
        let mut data = pkt.to_contiguous().into_owned();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(inspect(NetworkProtocol::Ipv4, &data).is_none());
    }

    #[test]
    fn test_mixed_families_rejected() {
        assert!(build_udp(addr("10.0.0.1:1"), addr("[2001:db8::2]:53"), b"").is_err());
    }

    #[test]
    fn test_syn_and_ack_classification() {
        let client = addr("10.0.0.2:51820");
        let server = addr("203.0.113.5:443");

        let syn = tcp_v4(client, server, SYN, 1000, 0, &[]);
        match inspect(NetworkProtocol::Ipv4, &syn) {
            Some(Inspected::TcpSyn(id)) => {
                assert_eq!(id.remote, client);
                assert_eq!(id.local, server);
            }
            other => panic!("unexpected {other:?}"),
        }

        let ack = tcp_v4(client, server, ACK, 1001, 1, &[]);
        assert!(matches!(
            inspect(NetworkProtocol::Ipv4, &ack),
            Some(Inspected::Tcp)
        ));
    }

    #[test]
    fn test_truncated_packet_is_malformed() {
        assert!(inspect(NetworkProtocol::Ipv4, &[0x45, 0, 0]).is_none());
        assert!(inspect(NetworkProtocol::Ipv6, &[0x60]).is_none());
    }

    #[test]
    fn test_endpoint_conversion() {
        let sock = addr("203.0.113.5:443");
        let endpoint = IpEndpoint::new(to_ip_address(sock.ip()), sock.port());
        assert_eq!(to_socket_addr(endpoint), sock);
    }
}
