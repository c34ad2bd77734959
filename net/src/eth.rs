// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Ethernet addresses and the few header fields the fast path looks at.

use core::fmt::{Debug, Display, Formatter};
use std::net::Ipv4Addr;

/// Ethertype of IPv4, host order.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Minimum bytes in a frame before the L3 header can start.
pub const HEADER_LEN: usize = 14;

/// An Ethernet MAC address.
#[must_use]
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    /// The all-ones broadcast address.
    pub const BROADCAST: Mac = Mac([0xff; 6]);

    /// True for the broadcast address.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Mac::BROADCAST
    }

    /// True for group (multicast) addresses, broadcast included.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// The IANA-mapped multicast MAC for an IPv4 group: `01:00:5e` followed
    /// by the low 23 bits of the group address.
    pub fn multicast_for(group: Ipv4Addr) -> Mac {
        let g = group.octets();
        Mac([0x01, 0x00, 0x5e, g[1] & 0x7f, g[2], g[3]])
    }
}

impl From<[u8; 6]> for Mac {
    fn from(value: [u8; 6]) -> Self {
        Mac(value)
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl Debug for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Destination MAC of a frame, if the frame is long enough to have one.
#[must_use]
pub fn destination(frame: &[u8]) -> Option<Mac> {
    let bytes: [u8; 6] = frame.get(0..6)?.try_into().ok()?;
    Some(Mac(bytes))
}

/// Ethertype of a frame, host order, if the frame is long enough.
#[must_use]
pub fn ethertype(frame: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]))
}
