// ============================================
// File: crates/wrapguard-core/src/packet/codec.rs
// ============================================
//! # Packet Codec
//!
//! ## Creation Reason
//! Synthesizes IPv4/IPv6 packets for the virtual stack's outbound path
//! and parses packets delivered by the tunnel on the inbound path.
//!
//! ## Parsing Strategy
//! 1. Check minimum header length for the version nibble
//! 2. Validate declared header lengths against the buffer
//! 3. Never trust lengths from the wire without bounds checks
//!
//! ## ⚠️ Important Note for Next Developer
//! - All multi-byte fields are big-endian
//! - `decode` only interprets the IP header; `decode_transport` digs out
//!   ports and flags when the stack needs them
//!
//! ## Last Modified
//! v0.1.0 - Initial codec implementation

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use wrapguard_common::types::TransportKind;

use crate::error::{CoreError, Result};
use crate::packet::{
    IpVersion, PacketMeta, StreamFlags, TransportHeader, DATAGRAM_HEADER_LEN, DEFAULT_HOP_LIMIT,
    IPV4_HEADER_LEN, IPV6_HEADER_LEN, STREAM_HEADER_LEN,
};

// ============================================
// Encoding
// ============================================

/// Encodes an IPv4 packet: fixed 20-octet header, TTL 64, Don't-Fragment
/// set, identification zero, checksums computed.
#[must_use]
pub fn encode_v4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    header: &TransportHeader,
    payload: &[u8],
) -> Vec<u8> {
    let transport_len = header.encoded_len() + payload.len();
    let total_len = IPV4_HEADER_LEN + transport_len;
    let mut buf = BytesMut::with_capacity(total_len);

    buf.put_u8(0x45); // version 4, IHL 5
    buf.put_u8(0); // DSCP/ECN
    buf.put_u16(total_len as u16);
    buf.put_u16(0); // identification
    buf.put_u16(0x4000); // flags: Don't Fragment
    buf.put_u8(DEFAULT_HOP_LIMIT);
    buf.put_u8(header.protocol_number());
    buf.put_u16(0); // header checksum, filled below
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());

    let checksum = fold(sum_words(&buf));
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    let pseudo = pseudo_header_v4(src, dst, header.protocol_number(), transport_len as u16);
    put_transport(&mut buf, header, payload, pseudo);

    buf.to_vec()
}

/// Encodes an IPv6 packet: fixed 40-octet header, hop limit 64,
/// transport checksum computed over the v6 pseudo-header.
#[must_use]
pub fn encode_v6(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    header: &TransportHeader,
    payload: &[u8],
) -> Vec<u8> {
    let transport_len = header.encoded_len() + payload.len();
    let mut buf = BytesMut::with_capacity(IPV6_HEADER_LEN + transport_len);

    buf.put_u32(0x6000_0000); // version 6, no traffic class, no flow label
    buf.put_u16(transport_len as u16);
    buf.put_u8(header.protocol_number());
    buf.put_u8(DEFAULT_HOP_LIMIT);
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());

    let pseudo = pseudo_header_v6(src, dst, header.protocol_number(), transport_len as u32);
    put_transport(&mut buf, header, payload, pseudo);

    buf.to_vec()
}

/// Appends the transport header and payload, then patches the transport
/// checksum in place.
fn put_transport(buf: &mut BytesMut, header: &TransportHeader, payload: &[u8], pseudo_sum: u32) {
    let transport_start = buf.len();

    match header {
        TransportHeader::Stream {
            src_port,
            dst_port,
            flags,
        } => {
            buf.put_u16(*src_port);
            buf.put_u16(*dst_port);
            buf.put_u32(0); // sequence number
            buf.put_u32(0); // acknowledgement number
            buf.put_u8(0x50); // data offset 5 words
            buf.put_u8(flags.bits());
            buf.put_u16(65535); // window
            buf.put_u16(0); // checksum, filled below
            buf.put_u16(0); // urgent pointer
        }
        TransportHeader::Datagram { src_port, dst_port } => {
            buf.put_u16(*src_port);
            buf.put_u16(*dst_port);
            buf.put_u16((DATAGRAM_HEADER_LEN + payload.len()) as u16);
            buf.put_u16(0); // checksum, filled below
        }
    }
    buf.put_slice(payload);

    let checksum_at = match header {
        TransportHeader::Stream { .. } => transport_start + 16,
        TransportHeader::Datagram { .. } => transport_start + 6,
    };
    let mut checksum = fold(pseudo_sum.wrapping_add(sum_words(&buf[transport_start..])));
    // A computed zero is transmitted as all-ones for datagrams, where a
    // zero checksum octet pair means "not computed".
    if checksum == 0 && matches!(header, TransportHeader::Datagram { .. }) {
        checksum = 0xffff;
    }
    buf[checksum_at..checksum_at + 2].copy_from_slice(&checksum.to_be_bytes());
}

// ============================================
// Decoding
// ============================================

/// Interprets the IP header of `packet`.
///
/// # Errors
/// `MalformedPacket` if the buffer is too short or the version nibble is
/// not 4 or 6.
pub fn decode(packet: &[u8]) -> Result<PacketMeta> {
    let first = *packet
        .first()
        .ok_or_else(|| CoreError::malformed("empty packet"))?;

    match first >> 4 {
        4 => {
            if packet.len() < IPV4_HEADER_LEN {
                return Err(CoreError::malformed("IPv4 packet shorter than 20 octets"));
            }
            let header_len = usize::from(first & 0x0f) * 4;
            if header_len < IPV4_HEADER_LEN || packet.len() < header_len {
                return Err(CoreError::malformed("invalid IPv4 header length"));
            }
            Ok(PacketMeta {
                version: IpVersion::V4,
                src: IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15])),
                dst: IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19])),
                protocol: packet[9],
                payload_offset: header_len,
            })
        }
        6 => {
            if packet.len() < IPV6_HEADER_LEN {
                return Err(CoreError::malformed("IPv6 packet shorter than 40 octets"));
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&packet[8..24]);
            dst.copy_from_slice(&packet[24..40]);
            Ok(PacketMeta {
                version: IpVersion::V6,
                src: IpAddr::V6(Ipv6Addr::from(src)),
                dst: IpAddr::V6(Ipv6Addr::from(dst)),
                protocol: packet[6],
                payload_offset: IPV6_HEADER_LEN,
            })
        }
        other => Err(CoreError::malformed(format!("IP version {other}"))),
    }
}

/// Parses the transport header that `meta` points at.
///
/// Returns the header and the absolute offset of the payload.
///
/// # Errors
/// `UnsupportedProtocol` for anything other than stream/datagram, and
/// `MalformedPacket` if the transport header is truncated.
pub fn decode_transport(packet: &[u8], meta: &PacketMeta) -> Result<(TransportHeader, usize)> {
    let off = meta.payload_offset;
    match meta.protocol {
        6 => {
            if packet.len() < off + STREAM_HEADER_LEN {
                return Err(CoreError::malformed("stream header truncated"));
            }
            let header_len = usize::from(packet[off + 12] >> 4) * 4;
            if header_len < STREAM_HEADER_LEN || packet.len() < off + header_len {
                return Err(CoreError::malformed("invalid stream header length"));
            }
            let header = TransportHeader::Stream {
                src_port: u16::from_be_bytes([packet[off], packet[off + 1]]),
                dst_port: u16::from_be_bytes([packet[off + 2], packet[off + 3]]),
                flags: StreamFlags::from_bits(packet[off + 13]),
            };
            Ok((header, off + header_len))
        }
        17 => {
            if packet.len() < off + DATAGRAM_HEADER_LEN {
                return Err(CoreError::malformed("datagram header truncated"));
            }
            let header = TransportHeader::Datagram {
                src_port: u16::from_be_bytes([packet[off], packet[off + 1]]),
                dst_port: u16::from_be_bytes([packet[off + 2], packet[off + 3]]),
            };
            Ok((header, off + DATAGRAM_HEADER_LEN))
        }
        protocol => Err(CoreError::UnsupportedProtocol { protocol }),
    }
}

/// Extracts the routing key (destination, transport, destination port)
/// from a raw outbound packet, if it carries a routable transport.
#[must_use]
pub fn route_key(packet: &[u8]) -> Option<(IpAddr, TransportKind, u16)> {
    let meta = decode(packet).ok()?;
    let (header, _) = decode_transport(packet, &meta).ok()?;
    let kind = TransportKind::from_protocol_number(meta.protocol)?;
    Some((meta.dst, kind, header.dst_port()))
}

// ============================================
// Checksums
// ============================================

/// Sums 16-bit big-endian words, padding an odd trailing octet with zero.
fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
    }
    sum
}

/// Folds carries and complements, per the internet checksum.
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn pseudo_header_v4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, transport_len: u16) -> u32 {
    sum_words(&src.octets())
        .wrapping_add(sum_words(&dst.octets()))
        .wrapping_add(u32::from(protocol))
        .wrapping_add(u32::from(transport_len))
}

fn pseudo_header_v6(src: Ipv6Addr, dst: Ipv6Addr, protocol: u8, transport_len: u32) -> u32 {
    sum_words(&src.octets())
        .wrapping_add(sum_words(&dst.octets()))
        .wrapping_add(transport_len >> 16)
        .wrapping_add(transport_len & 0xffff)
        .wrapping_add(u32::from(protocol))
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    /// A checksum is valid when summing the covered bytes, checksum
    /// included, folds to zero.
    fn transport_checksum_is_valid(packet: &[u8], meta: &PacketMeta) -> bool {
        let segment = &packet[meta.payload_offset..];
        let pseudo = match (meta.src, meta.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                pseudo_header_v4(s, d, meta.protocol, segment.len() as u16)
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                pseudo_header_v6(s, d, meta.protocol, segment.len() as u32)
            }
            _ => unreachable!(),
        };
        fold(pseudo.wrapping_add(sum_words(segment))) == 0
    }

    #[test]
    fn test_encode_v4_stream_roundtrip() {
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let dst = Ipv4Addr::new(10, 0, 0, 3);
        let header = TransportHeader::Stream {
            src_port: 30001,
            dst_port: 80,
            flags: StreamFlags::ACK,
        };
        let payload = b"GET / \r\n\r\n";
        let packet = encode_v4(src, dst, &header, payload);

        assert_eq!(packet.len(), IPV4_HEADER_LEN + STREAM_HEADER_LEN + 10);

        let meta = decode(&packet).unwrap();
        assert_eq!(meta.version, IpVersion::V4);
        assert_eq!(meta.src, IpAddr::V4(src));
        assert_eq!(meta.dst, IpAddr::V4(dst));
        assert_eq!(meta.protocol, 6);
        assert_eq!(meta.payload_offset, IPV4_HEADER_LEN);

        let (decoded, payload_off) = decode_transport(&packet, &meta).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&packet[payload_off..], payload);
    }

    #[test]
    fn test_encode_v4_header_fields() {
        let packet = encode_v4(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
            &TransportHeader::Datagram {
                src_port: 1234,
                dst_port: 53,
            },
            b"q",
        );

        assert_eq!(packet[0], 0x45);
        assert_eq!(&packet[6..8], &[0x40, 0x00]); // Don't Fragment
        assert_eq!(packet[8], 64); // TTL
        assert_eq!(packet[9], 17);
        let total = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        assert_eq!(total, packet.len());

        // The IPv4 header checksum must fold to zero over the header.
        assert_eq!(fold(sum_words(&packet[..IPV4_HEADER_LEN])), 0);
    }

    #[test]
    fn test_encode_v6_roundtrip() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let header = TransportHeader::Datagram {
            src_port: 5353,
            dst_port: 53,
        };
        let packet = encode_v6(src, dst, &header, b"query");

        assert_eq!(packet[0] >> 4, 6);
        assert_eq!(packet[7], 64); // hop limit

        let meta = decode(&packet).unwrap();
        assert_eq!(meta.version, IpVersion::V6);
        assert_eq!(meta.src, IpAddr::V6(src));
        assert_eq!(meta.dst, IpAddr::V6(dst));
        assert_eq!(meta.protocol, 17);
        assert_eq!(meta.payload_offset, IPV6_HEADER_LEN);

        let (decoded, payload_off) = decode_transport(&packet, &meta).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&packet[payload_off..], b"query");
    }

    #[test]
    fn test_transport_checksums_verify() {
        let v4 = encode_v4(
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(8, 8, 8, 8),
            &TransportHeader::Stream {
                src_port: 43210,
                dst_port: 443,
                flags: StreamFlags::SYN,
            },
            &[],
        );
        let meta = decode(&v4).unwrap();
        assert!(transport_checksum_is_valid(&v4, &meta));

        let v6 = encode_v6(
            "fd00::1".parse().unwrap(),
            "fd00::2".parse().unwrap(),
            &TransportHeader::Datagram {
                src_port: 40000,
                dst_port: 514,
            },
            b"odd-length-payload!",
        );
        let meta = decode(&v6).unwrap();
        assert!(transport_checksum_is_valid(&v6, &meta));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x45; 10]).is_err()); // truncated v4
        assert!(decode(&[0x60; 20]).is_err()); // truncated v6
        assert!(decode(&[0x10; 40]).is_err()); // version 1

        // IHL claims options beyond the buffer
        let mut packet = vec![0u8; IPV4_HEADER_LEN];
        packet[0] = 0x4f;
        assert!(decode(&packet).is_err());
    }

    #[test]
    fn test_decode_transport_rejects_unsupported() {
        let mut packet = encode_v4(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            &TransportHeader::Datagram {
                src_port: 1,
                dst_port: 2,
            },
            &[],
        );
        packet[9] = 1; // ICMP
        let meta = decode(&packet).unwrap();
        assert!(matches!(
            decode_transport(&packet, &meta),
            Err(CoreError::UnsupportedProtocol { protocol: 1 })
        ));
    }

    #[test]
    fn test_route_key() {
        let packet = encode_v4(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
            &TransportHeader::Stream {
                src_port: 30001,
                dst_port: 80,
                flags: StreamFlags::SYN,
            },
            &[],
        );
        let (dst, kind, port) = route_key(&packet).unwrap();
        assert_eq!(dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)));
        assert_eq!(kind, TransportKind::Stream);
        assert_eq!(port, 80);

        assert!(route_key(&[0u8; 4]).is_none());
    }

    #[test]
    fn test_stream_flag_bits() {
        assert_eq!(StreamFlags::SYN.bits(), 0x02);
        assert_eq!(StreamFlags::SYN_ACK.bits(), 0x12);
        assert_eq!(StreamFlags::FIN.bits(), 0x01);
        assert_eq!(StreamFlags::from_bits(0x12), StreamFlags::SYN_ACK);
    }
}
