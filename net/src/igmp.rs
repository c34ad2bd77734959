// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IGMPv2 message handling.
//!
//! Only the three message kinds the membership engine exchanges are
//! modeled: membership queries (received), v2 membership reports and leaves
//! (sent).  Frames are fixed-shape -- Ethernet, a bare 20-byte IPv4 header
//! with TTL 1, and the 8-byte IGMP message -- so report and leave templates
//! are assembled by hand once per flow and cloned per transmission.

use std::net::Ipv4Addr;

use etherparse::{NetHeaders, PacketHeaders, PayloadSlice, ip_number};

use crate::eth::{ETHERTYPE_IPV4, Mac};

/// All-Hosts group, the destination of general queries.
pub const ALL_HOSTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
/// All-Routers group, the destination of leave messages.
pub const ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);

/// Length of the IGMPv2 message body.
pub const MESSAGE_LEN: usize = 8;
/// Length of a built report/leave frame: Ethernet + IPv4 (no options) + IGMP.
pub const FRAME_LEN: usize = crate::eth::HEADER_LEN + IPV4_HEADER_LEN + MESSAGE_LEN;

const IPV4_HEADER_LEN: usize = 20;

/// IGMP message kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IgmpType {
    /// General or group-specific membership query.
    MembershipQuery = 0x11,
    /// Version 2 membership report (join).
    MembershipReportV2 = 0x16,
    /// Leave group.
    LeaveGroup = 0x17,
}

impl IgmpType {
    fn from_wire(value: u8) -> Option<IgmpType> {
        match value {
            0x11 => Some(IgmpType::MembershipQuery),
            0x16 => Some(IgmpType::MembershipReportV2),
            0x17 => Some(IgmpType::LeaveGroup),
            _ => None,
        }
    }
}

/// A decoded IGMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgmpMessage {
    /// Message kind.
    pub kind: IgmpType,
    /// Maximum response time in units of 100 ms; zero on v1 queries and on
    /// reports/leaves.
    pub max_resp_time: u8,
    /// Group address; unspecified (0.0.0.0) on general queries.
    pub group: Ipv4Addr,
}

impl IgmpMessage {
    /// True for a general (not group-specific) query.
    #[must_use]
    pub fn is_general_query(&self) -> bool {
        self.kind == IgmpType::MembershipQuery && self.group.is_unspecified()
    }
}

/// Why a frame on the IGMP control queue could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum IgmpError {
    /// The frame does not carry IPv4.
    #[error("not an IPv4 frame")]
    NotIpv4,
    /// The IPv4 protocol number is not IGMP.
    #[error("not an IGMP packet")]
    NotIgmp,
    /// The message is truncated or carries an unknown type.
    #[error("malformed IGMP message: {0}")]
    Malformed(String),
}

/// Decode the IGMP message carried by an Ethernet frame.
pub fn parse_frame(frame: &[u8]) -> Result<IgmpMessage, IgmpError> {
    let headers = PacketHeaders::from_ethernet_slice(frame)
        .map_err(|err| IgmpError::Malformed(err.to_string()))?;
    let Some(NetHeaders::Ipv4(ip, _)) = headers.net else {
        return Err(IgmpError::NotIpv4);
    };
    if ip.protocol != ip_number::IGMP {
        return Err(IgmpError::NotIgmp);
    }
    let PayloadSlice::Ip(ip_payload) = headers.payload else {
        return Err(IgmpError::NotIgmp);
    };
    parse_message(ip_payload.payload)
}

/// Decode a bare IGMP message (the IPv4 payload).
pub fn parse_message(body: &[u8]) -> Result<IgmpMessage, IgmpError> {
    if body.len() < MESSAGE_LEN {
        return Err(IgmpError::Malformed(format!(
            "{} bytes, need {MESSAGE_LEN}",
            body.len()
        )));
    }
    let kind = IgmpType::from_wire(body[0])
        .ok_or_else(|| IgmpError::Malformed(format!("unknown type {:#04x}", body[0])))?;
    Ok(IgmpMessage {
        kind,
        max_resp_time: body[1],
        group: Ipv4Addr::new(body[4], body[5], body[6], body[7]),
    })
}

/// Build a complete report/leave/query frame for `group`.
///
/// Destination addressing follows the message kind: reports go to the group
/// itself, leaves to All-Routers, queries to All-Hosts.  The Ethernet
/// destination is the IANA mapping of the IPv4 destination.
#[must_use]
pub fn build_frame(
    kind: IgmpType,
    max_resp_time: u8,
    src_mac: Mac,
    src_ip: Ipv4Addr,
    group: Ipv4Addr,
) -> Vec<u8> {
    let dst_ip = match kind {
        IgmpType::MembershipReportV2 => group,
        IgmpType::LeaveGroup => ALL_ROUTERS,
        IgmpType::MembershipQuery => ALL_HOSTS,
    };

    let mut frame = Vec::with_capacity(FRAME_LEN);
    frame.extend_from_slice(&Mac::multicast_for(dst_ip).0);
    frame.extend_from_slice(&src_mac.0);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let total_len = (IPV4_HEADER_LEN + MESSAGE_LEN) as u16;
    let mut ip = [0u8; IPV4_HEADER_LEN];
    ip[0] = 0x45;
    ip[1] = 0xc0; // internetwork control
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip[8] = 1; // TTL: link-local only
    ip[9] = 2; // IGMP
    ip[12..16].copy_from_slice(&src_ip.octets());
    ip[16..20].copy_from_slice(&dst_ip.octets());
    let ip_cksum = checksum(&ip);
    ip[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
    frame.extend_from_slice(&ip);

    let mut msg = [0u8; MESSAGE_LEN];
    msg[0] = kind as u8;
    msg[1] = max_resp_time;
    msg[4..8].copy_from_slice(&group.octets());
    let msg_cksum = checksum(&msg);
    msg[2..4].copy_from_slice(&msg_cksum.to_be_bytes());
    frame.extend_from_slice(&msg);

    frame
}

/// RFC 1071 internet checksum over `bytes` (checksum field zeroed).
#[must_use]
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod test {
    use super::*;

    const SRC_MAC: Mac = Mac([0x02, 0, 0, 0, 0, 0x0a]);
    const SRC_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 1);

    fn verify(bytes: &[u8]) -> bool {
        // Checksum over a message including its checksum field folds to 0.
        checksum(bytes) == 0
    }

    #[test]
    fn report_frame_round_trips() {
        let frame = build_frame(IgmpType::MembershipReportV2, 0, SRC_MAC, SRC_IP, GROUP);
        assert_eq!(frame.len(), FRAME_LEN);
        // Destination MAC is the IANA group mapping, destination IP the group.
        assert_eq!(&frame[0..6], &Mac::multicast_for(GROUP).0);
        assert_eq!(&frame[30..34], &GROUP.octets());
        // Both checksums verify.
        assert!(verify(&frame[14..34]));
        assert!(verify(&frame[34..42]));
        let msg = parse_frame(&frame).unwrap();
        assert_eq!(msg.kind, IgmpType::MembershipReportV2);
        assert_eq!(msg.group, GROUP);
    }

    #[test]
    fn leave_goes_to_all_routers() {
        let frame = build_frame(IgmpType::LeaveGroup, 0, SRC_MAC, SRC_IP, GROUP);
        assert_eq!(&frame[30..34], &ALL_ROUTERS.octets());
        let msg = parse_frame(&frame).unwrap();
        assert_eq!(msg.kind, IgmpType::LeaveGroup);
        // The leave still names the group being left.
        assert_eq!(msg.group, GROUP);
    }

    #[test]
    fn general_query_parses() {
        let frame = build_frame(
            IgmpType::MembershipQuery,
            20,
            SRC_MAC,
            SRC_IP,
            Ipv4Addr::UNSPECIFIED,
        );
        assert_eq!(&frame[30..34], &ALL_HOSTS.octets());
        let msg = parse_frame(&frame).unwrap();
        assert!(msg.is_general_query());
        assert_eq!(msg.max_resp_time, 20);
    }

    #[test]
    fn truncated_message_rejected() {
        assert!(matches!(
            parse_message(&[0x11, 0, 0, 0]),
            Err(IgmpError::Malformed(_))
        ));
        assert!(matches!(
            parse_message(&[0x42, 0, 0, 0, 0, 0, 0, 0]),
            Err(IgmpError::Malformed(_))
        ));
    }
}
