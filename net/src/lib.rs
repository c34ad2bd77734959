// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Frame-level helpers for the receive engine: Ethernet address classes,
//! the IPv4/UDP parse used to build zero-copy packet descriptors, and
//! IGMPv2 message handling (parse, build, checksum).

#![deny(missing_docs, clippy::all)]

pub mod eth;
pub mod igmp;
pub mod udp;
