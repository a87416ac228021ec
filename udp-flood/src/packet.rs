//! IPv4/UDP packet template construction.
//!
//! A template is built once per (interface, target) pair before any unit
//! starts and is sent bit-for-bit on every transmission afterwards.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use thiserror::Error;

use crate::checksum;
use crate::config::Config;

// ---------------------------------------------------------------------------
// Wire Constants
// ---------------------------------------------------------------------------

/// Largest datagram the engine will build (standard Ethernet MTU).
pub const MAX_PACKET_SIZE: usize = 1500;

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ETH_HEADER_LEN: usize = 14;

/// IPv4 + UDP header bytes preceding the payload.
pub const HEADER_OVERHEAD: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Largest accepted payload.
pub const MAX_PAYLOAD: usize = 1400;

const IPPROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;
const ETHERTYPE_IPV4: u16 = 0x0800;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("target '{0}' is not a valid IPv4 address")]
    InvalidTarget(String),

    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("payload must not be empty")]
    EmptyPayload,
}

// ---------------------------------------------------------------------------
// Packet Template
// ---------------------------------------------------------------------------

/// One complete, checksum-valid IPv4/UDP datagram.
#[derive(Clone, PartialEq, Eq)]
pub struct PacketTemplate {
    bytes: Box<[u8]>,
    destination: SocketAddrV4,
}

impl PacketTemplate {
    /// Build the datagram for `target` using the ports and payload in `config`.
    ///
    /// `source` is written into the IPv4 header as-is; `0.0.0.0` leaves it
    /// to the kernel (raw sockets fill it in) and disables the UDP checksum.
    pub fn build(config: &Config, source: Ipv4Addr, target: &str) -> Result<Self, PacketError> {
        let destination: Ipv4Addr = target
            .trim()
            .parse()
            .map_err(|_| PacketError::InvalidTarget(target.to_string()))?;

        let payload = config.payload();
        if payload.is_empty() {
            return Err(PacketError::EmptyPayload);
        }
        if payload.len() > MAX_PAYLOAD || payload.len() + HEADER_OVERHEAD > MAX_PACKET_SIZE {
            return Err(PacketError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let total_len = HEADER_OVERHEAD + payload.len();
        let udp_len = UDP_HEADER_LEN + payload.len();
        let mut buf = vec![0u8; total_len];

        // --- IPv4 header (no options) ---
        let ip = &mut buf[..IPV4_HEADER_LEN];
        ip[0] = (4 << 4) | 5;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip[8] = DEFAULT_TTL;
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&source.octets());
        ip[16..20].copy_from_slice(&destination.octets());
        let ip_sum = checksum::checksum(ip);
        ip[10..12].copy_from_slice(&ip_sum.to_be_bytes());

        // --- UDP header + payload ---
        let udp = &mut buf[IPV4_HEADER_LEN..];
        udp[0..2].copy_from_slice(&config.source_port.to_be_bytes());
        udp[2..4].copy_from_slice(&config.port.to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        udp[UDP_HEADER_LEN..].copy_from_slice(&payload);

        if !source.is_unspecified() {
            let sum = udp_checksum(source, destination, udp);
            udp[6..8].copy_from_slice(&sum.to_be_bytes());
        }

        Ok(Self {
            bytes: buf.into_boxed_slice(),
            destination: SocketAddrV4::new(destination, config.port),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn destination(&self) -> SocketAddrV4 {
        self.destination
    }

    /// Write an Ethernet II header followed by the datagram into `frame`.
    ///
    /// Returns the number of bytes written. `frame` must hold at least
    /// `ETH_HEADER_LEN + self.len()` bytes.
    pub fn write_ethernet_frame(&self, frame: &mut [u8], src: MacAddr, dst: MacAddr) -> usize {
        let len = ETH_HEADER_LEN + self.len();
        frame[0..6].copy_from_slice(&dst.0);
        frame[6..12].copy_from_slice(&src.0);
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame[ETH_HEADER_LEN..len].copy_from_slice(&self.bytes);
        len
    }
}

impl fmt::Debug for PacketTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketTemplate")
            .field("destination", &self.destination)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// UDP checksum over the RFC 768 pseudo-header. `udp` is header + payload
/// with the checksum field zeroed.
fn udp_checksum(source: Ipv4Addr, destination: Ipv4Addr, udp: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&source.octets());
    pseudo[4..8].copy_from_slice(&destination.octets());
    pseudo[9] = IPPROTO_UDP;
    pseudo[10..12].copy_from_slice(&(udp.len() as u16).to_be_bytes());

    let sum = checksum::accumulate(checksum::accumulate(0, &pseudo), udp);
    match !checksum::fold(sum) {
        // Zero means "no checksum" on the wire.
        0 => 0xffff,
        sum => sum,
    }
}

// ---------------------------------------------------------------------------
// MAC Address
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("'{}' has fewer than 6 octets", s))?;
            if part.len() != 2 {
                return Err(format!("'{}' has a malformed octet '{}'", s, part));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("'{}' has a non-hex octet '{}'", s, part))?;
        }
        if parts.next().is_some() {
            return Err(format!("'{}' has more than 6 octets", s));
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config_with_payload(len: usize) -> Config {
        Config {
            port: 9999,
            payload_size: len,
            ..Config::default()
        }
    }

    #[test]
    fn test_header_fields() {
        let config = config_with_payload(64);
        let pkt = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "203.0.113.5").unwrap();
        let b = pkt.as_bytes();

        assert_eq!(pkt.len(), 20 + 8 + 64);
        assert_eq!(b[0], 0x45);
        assert_eq!(b[8], 64);
        assert_eq!(b[9], 17);
        assert_eq!(&b[16..20], &[203, 0, 113, 5]);
        assert_eq!(u16::from_be_bytes([b[20], b[21]]), 12345);
        assert_eq!(u16::from_be_bytes([b[22], b[23]]), 9999);
        assert!(b[28..].iter().all(|&x| x == b'A'));
        assert_eq!(pkt.destination(), "203.0.113.5:9999".parse().unwrap());
    }

    #[test]
    fn test_ip_checksum_validates() {
        let config = config_with_payload(100);
        let pkt = PacketTemplate::build(&config, "10.0.0.1".parse().unwrap(), "10.0.0.2").unwrap();
        assert_eq!(checksum::checksum(&pkt.as_bytes()[..IPV4_HEADER_LEN]), 0);
    }

    #[test]
    fn test_udp_checksum_with_known_source() {
        let config = config_with_payload(33);
        let src: Ipv4Addr = "192.0.2.10".parse().unwrap();
        let dst: Ipv4Addr = "192.0.2.20".parse().unwrap();
        let pkt = PacketTemplate::build(&config, src, "192.0.2.20").unwrap();
        let udp = &pkt.as_bytes()[IPV4_HEADER_LEN..];
        assert_ne!(u16::from_be_bytes([udp[6], udp[7]]), 0);

        // Recomputing over pseudo-header + datagram (checksum included) yields 0xffff.
        let mut pseudo = [0u8; 12];
        pseudo[0..4].copy_from_slice(&src.octets());
        pseudo[4..8].copy_from_slice(&dst.octets());
        pseudo[9] = 17;
        pseudo[10..12].copy_from_slice(&(udp.len() as u16).to_be_bytes());
        let sum = checksum::accumulate(checksum::accumulate(0, &pseudo), udp);
        assert_eq!(checksum::fold(sum), 0xffff);
    }

    #[test]
    fn test_udp_checksum_omitted_without_source() {
        let config = config_with_payload(16);
        let pkt = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "192.0.2.20").unwrap();
        assert_eq!(&pkt.as_bytes()[26..28], &[0, 0]);
    }

    #[test]
    fn test_build_is_deterministic() {
        let config = config_with_payload(512);
        let a = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "198.51.100.7").unwrap();
        let b = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "198.51.100.7").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let config = config_with_payload(1500);
        let err = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "203.0.113.5").unwrap_err();
        assert_eq!(err, PacketError::PayloadTooLarge { len: 1500, max: 1400 });

        let config = config_with_payload(1401);
        assert!(PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "203.0.113.5").is_err());
    }

    #[test]
    fn test_rejects_bad_target() {
        let config = config_with_payload(64);
        for target in ["", "example.com", "300.1.1.1", "2001:db8::1"] {
            let err = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, target).unwrap_err();
            assert_eq!(err, PacketError::InvalidTarget(target.to_string()));
        }
    }

    #[test]
    fn test_payload_text_overrides_fill() {
        let config = Config {
            payload_text: Some("hello".to_string()),
            ..Config::default()
        };
        let pkt = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "192.0.2.1").unwrap();
        assert_eq!(&pkt.as_bytes()[HEADER_OVERHEAD..], b"hello");
        assert_eq!(pkt.len(), HEADER_OVERHEAD + 5);
    }

    #[test]
    fn test_ethernet_frame() {
        let config = config_with_payload(10);
        let pkt = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "192.0.2.1").unwrap();
        let src: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let mut frame = [0u8; 2048];
        let len = pkt.write_ethernet_frame(&mut frame, src, MacAddr::BROADCAST);

        assert_eq!(len, ETH_HEADER_LEN + pkt.len());
        assert_eq!(&frame[0..6], &[0xff; 6]);
        assert_eq!(&frame[6..12], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(&frame[ETH_HEADER_LEN..len], pkt.as_bytes());
    }

    #[test]
    fn test_mac_parse() {
        let mac: MacAddr = "aa-bb-cc-dd-ee-0f".parse().unwrap();
        assert_eq!(mac.0, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:0f");

        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
        assert!("aaa:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    proptest! {
        #[test]
        fn test_length_fields_match_payload(p in 1usize..=MAX_PAYLOAD) {
            let config = config_with_payload(p);
            let pkt = PacketTemplate::build(&config, Ipv4Addr::UNSPECIFIED, "203.0.113.5").unwrap();
            let b = pkt.as_bytes();
            prop_assert_eq!(u16::from_be_bytes([b[2], b[3]]) as usize, 20 + 8 + p);
            prop_assert_eq!(u16::from_be_bytes([b[24], b[25]]) as usize, 8 + p);
            prop_assert_eq!(pkt.len(), 20 + 8 + p);
        }
    }
}
