//! VRRPv3 advertisement encoding and decoding (RFC 5798)
//!
//! The advertisement payload is eight octets:
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  |   Virtual Rtr ID   |   Priority  | Count IPvX  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |(rsvd) |     Max Adver Int          |          Checksum         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The checksum is the 16-bit one's complement of the one's complement
//! sum of the IPv4 or IPv6 pseudo-header followed by the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::IpAddr;

use crate::{HaError, Result};

pub const VRRP_PROTOCOL: i32 = 112;
pub const VRRP_VERSION: u8 = 3;
pub const VRRP_TYPE_ADVERTISEMENT: u8 = 1;
pub const VRRP_MCAST_V4: &str = "224.0.0.18";
pub const VRRP_MCAST_V6: &str = "ff02::12";
/// Advertisements must arrive with an undecremented TTL/hop limit.
pub const VRRP_TTL: u8 = 255;

const PAYLOAD_LEN: usize = 8;
/// Max Adver Int is a 12-bit field in centiseconds.
const MAX_ADVER_INT: u16 = 0x0fff;

/// One VRRPv3 advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrrpPacket {
    pub vrid: u8,
    /// Zero signals abdication by the current leader
    pub priority: u8,
    pub count_addrs: u8,
    /// Advertisement interval in centiseconds (12 bits)
    pub advert_interval_cs: u16,
}

impl VrrpPacket {
    pub fn new(vrid: u8, priority: u8, advert_interval_cs: u16) -> Self {
        Self {
            vrid,
            priority,
            count_addrs: 0,
            advert_interval_cs: advert_interval_cs.min(MAX_ADVER_INT),
        }
    }

    /// Encode with the checksum computed over the pseudo-header for
    /// (`src`, `dst`).
    pub fn encode(&self, src: IpAddr, dst: IpAddr) -> Bytes {
        let mut buf = BytesMut::with_capacity(PAYLOAD_LEN);
        buf.put_u8((VRRP_VERSION << 4) | VRRP_TYPE_ADVERTISEMENT);
        buf.put_u8(self.vrid);
        buf.put_u8(self.priority);
        buf.put_u8(self.count_addrs);
        buf.put_u16(self.advert_interval_cs & MAX_ADVER_INT);
        buf.put_u16(0);
        let checksum = pseudo_header_checksum(src, dst, &buf);
        buf[6] = (checksum >> 8) as u8;
        buf[7] = (checksum & 0xff) as u8;
        buf.freeze()
    }

    /// Decode and verify a received payload. `src`/`dst` are the outer IP
    /// addresses used for the pseudo-header.
    pub fn decode(payload: &[u8], src: IpAddr, dst: IpAddr) -> Result<Self> {
        if payload.len() < PAYLOAD_LEN {
            return Err(HaError::Packet(format!(
                "short advertisement: {} bytes",
                payload.len()
            )));
        }
        let mut buf = Bytes::copy_from_slice(&payload[..PAYLOAD_LEN]);
        let vt = buf.get_u8();
        let version = vt >> 4;
        let msg_type = vt & 0x0f;
        if version != VRRP_VERSION {
            return Err(HaError::Packet(format!("unsupported version {}", version)));
        }
        if msg_type != VRRP_TYPE_ADVERTISEMENT {
            return Err(HaError::Packet(format!("unsupported type {}", msg_type)));
        }
        let vrid = buf.get_u8();
        let priority = buf.get_u8();
        let count_addrs = buf.get_u8();
        let advert_interval_cs = buf.get_u16() & MAX_ADVER_INT;
        let received_checksum = buf.get_u16();

        let mut zeroed = payload[..PAYLOAD_LEN].to_vec();
        zeroed[6] = 0;
        zeroed[7] = 0;
        let computed = pseudo_header_checksum(src, dst, &zeroed);
        if computed != received_checksum {
            return Err(HaError::Packet(format!(
                "checksum mismatch: computed {:04x}, received {:04x}",
                computed, received_checksum
            )));
        }

        Ok(Self {
            vrid,
            priority,
            count_addrs,
            advert_interval_cs,
        })
    }
}

/// 16-bit one's complement sum over the pseudo-header and payload.
fn pseudo_header_checksum(src: IpAddr, dst: IpAddr, payload: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum += sum_bytes(&src.octets());
            sum += sum_bytes(&dst.octets());
            sum += VRRP_PROTOCOL as u32;
            sum += payload.len() as u32;
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            sum += sum_bytes(&src.octets());
            sum += sum_bytes(&dst.octets());
            sum += payload.len() as u32;
            sum += VRRP_PROTOCOL as u32;
        }
        _ => {
            // Mixed families never happen on a single socket; fold both
            // anyway rather than panic.
            sum += VRRP_PROTOCOL as u32;
            sum += payload.len() as u32;
        }
    }
    sum += sum_bytes(payload);

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !sum as u16
}

fn sum_bytes(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (IpAddr, IpAddr) {
        (
            "192.0.2.10".parse().unwrap(),
            VRRP_MCAST_V4.parse().unwrap(),
        )
    }

    #[test]
    fn test_roundtrip_is_identity() {
        let (src, dst) = addrs();
        let packet = VrrpPacket::new(60, 200, 100);
        let wire = packet.encode(src, dst);
        assert_eq!(wire.len(), 8);
        let decoded = VrrpPacket::decode(&wire, src, dst).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_over_ipv6() {
        let src: IpAddr = "fe80::1".parse().unwrap();
        let dst: IpAddr = VRRP_MCAST_V6.parse().unwrap();
        let packet = VrrpPacket::new(60, 100, 250);
        let decoded = VrrpPacket::decode(&packet.encode(src, dst), src, dst).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let (src, dst) = addrs();
        let mut wire = VrrpPacket::new(60, 200, 100).encode(src, dst).to_vec();
        wire[2] ^= 0xff;
        assert!(VrrpPacket::decode(&wire, src, dst).is_err());
    }

    #[test]
    fn test_checksum_binds_source_address() {
        let (src, dst) = addrs();
        let wire = VrrpPacket::new(60, 200, 100).encode(src, dst);
        let other: IpAddr = "192.0.2.99".parse().unwrap();
        assert!(VrrpPacket::decode(&wire, other, dst).is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let (src, dst) = addrs();
        let mut wire = VrrpPacket::new(60, 200, 100).encode(src, dst).to_vec();
        wire[0] = (2 << 4) | 1;
        assert!(VrrpPacket::decode(&wire, src, dst).is_err());
    }

    #[test]
    fn test_priority_zero_encodes() {
        let (src, dst) = addrs();
        let packet = VrrpPacket::new(60, 0, 100);
        let decoded = VrrpPacket::decode(&packet.encode(src, dst), src, dst).unwrap();
        assert_eq!(decoded.priority, 0);
    }

    #[test]
    fn test_advert_interval_clamped_to_twelve_bits() {
        let packet = VrrpPacket::new(60, 100, 0xffff);
        assert_eq!(packet.advert_interval_cs, 0x0fff);
    }
}
