// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Ingress flow-rule match/action descriptions.

use std::net::Ipv4Addr;

use crate::QueueId;

/// Opaque handle to an installed rule.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RuleHandle(pub u64);

/// What a matched packet is steered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Deliver on the given receive queue.
    ToQueue(QueueId),
    /// Discard.
    Drop,
}

/// The match side of a rule, most specific last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePattern {
    /// Every Ethernet frame.
    Any,
    /// IPv4 with an exact protocol number and destination address.
    Ipv4Proto {
        /// IPv4 protocol number to match.
        proto: u8,
        /// Exact destination address to match.
        dst: Ipv4Addr,
    },
    /// IPv4/UDP with an exact destination address and port.
    Ipv4Udp {
        /// Exact destination address to match.
        dst: Ipv4Addr,
        /// Exact UDP destination port to match, host order.
        dst_port: u16,
    },
}

impl RulePattern {
    /// Ranking used when several installed rules match one frame: the most
    /// specific pattern wins, the way perfect-match NIC filtering behaves.
    #[must_use]
    pub fn specificity(&self) -> u8 {
        match self {
            RulePattern::Any => 0,
            RulePattern::Ipv4Proto { .. } => 1,
            RulePattern::Ipv4Udp { .. } => 2,
        }
    }
}

/// A complete ingress rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSpec {
    /// Match side.
    pub pattern: RulePattern,
    /// Action on match.
    pub action: RuleAction,
}

impl RuleSpec {
    /// The lowest-priority catch-all that discards chatter no other rule
    /// claims.
    #[must_use]
    pub fn drop_all() -> RuleSpec {
        RuleSpec {
            pattern: RulePattern::Any,
            action: RuleAction::Drop,
        }
    }

    /// Steer IGMP control traffic (protocol 2 to All-Hosts) to `queue`.
    #[must_use]
    pub fn igmp_control(queue: QueueId) -> RuleSpec {
        RuleSpec {
            pattern: RulePattern::Ipv4Proto {
                proto: 2,
                dst: net::igmp::ALL_HOSTS,
            },
            action: RuleAction::ToQueue(queue),
        }
    }

    /// Steer one UDP stream, identified by exact destination address and
    /// port, to `queue` -- or drop it when `action` says so.
    #[must_use]
    pub fn udp_stream(dst: Ipv4Addr, dst_port: u16, action: RuleAction) -> RuleSpec {
        RuleSpec {
            pattern: RulePattern::Ipv4Udp { dst, dst_port },
            action,
        }
    }
}
