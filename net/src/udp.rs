// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IPv4/UDP frame validation for descriptor construction.

use std::net::Ipv4Addr;

use etherparse::{NetHeaders, PacketHeaders, PayloadSlice, TransportHeader};

/// Why a received frame could not be handed to a UDP stream consumer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame does not carry IPv4.
    #[error("not an IPv4 frame")]
    NotIpv4,
    /// The datagram is not UDP.
    #[error("not a UDP datagram")]
    NotUdp,
    /// The headers could not be decoded at all.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Where the UDP payload of a validated frame lives.
///
/// Offsets are relative to the start of the frame, so a descriptor built
/// from this view references the original buffer without copying a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpView {
    /// IPv4 destination address.
    pub dst_addr: Ipv4Addr,
    /// UDP destination port, host order.
    pub dst_port: u16,
    /// Byte offset of the UDP payload from the frame start
    /// (L2 + L3 + L4 header lengths).
    pub payload_offset: usize,
    /// UDP payload length in bytes.
    pub payload_len: usize,
}

/// Validate that `frame` is an IPv4/UDP datagram and locate its payload.
pub fn parse(frame: &[u8]) -> Result<UdpView, FrameError> {
    let headers = PacketHeaders::from_ethernet_slice(frame)
        .map_err(|err| FrameError::Malformed(err.to_string()))?;
    let Some(NetHeaders::Ipv4(ip, _)) = headers.net else {
        return Err(FrameError::NotIpv4);
    };
    let Some(TransportHeader::Udp(udp)) = headers.transport else {
        return Err(FrameError::NotUdp);
    };
    let PayloadSlice::Udp(payload) = headers.payload else {
        return Err(FrameError::NotUdp);
    };
    Ok(UdpView {
        dst_addr: Ipv4Addr::from(ip.destination),
        dst_port: udp.destination_port,
        payload_offset: frame.len() - payload.len(),
        payload_len: payload.len(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use etherparse::PacketBuilder;

    fn udp_frame(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [1, 0, 0x5e, 1, 1, 1])
            .ipv4([10, 0, 0, 2], [239, 1, 1, 1], 64)
            .udp(9000, 5004);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    #[test]
    fn parse_locates_payload() {
        let payload = b"media sample";
        let frame = udp_frame(payload);
        let view = parse(&frame).unwrap();
        assert_eq!(view.dst_addr, Ipv4Addr::new(239, 1, 1, 1));
        assert_eq!(view.dst_port, 5004);
        assert_eq!(view.payload_len, payload.len());
        assert_eq!(
            &frame[view.payload_offset..view.payload_offset + view.payload_len],
            payload
        );
    }

    #[test]
    fn rejects_non_udp() {
        let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4([10, 0, 0, 2], [10, 0, 0, 1], 64)
            .tcp(1000, 2000, 0, 1024);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[]).unwrap();
        assert!(matches!(parse(&frame), Err(FrameError::NotUdp)));
    }

    #[test]
    fn rejects_short_garbage() {
        assert!(matches!(parse(&[0u8; 9]), Err(FrameError::Malformed(_))));
    }
}
