// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flows: one logical classification unit per hardware receive queue.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use dev::pool::PktBuf;
use dev::rule::{RuleAction, RuleHandle, RuleSpec};
use dev::{QueueId, install_rule};
use net::eth::{self, ETHERTYPE_IPV4};
use ring::Queue;

use crate::control::CmdError;
use crate::igmp::{self, Membership};
use crate::nic::NicShared;

/// Flow indices reserved for the catch-all drop rule and IGMP control.
pub(crate) const DROP_FLOW: u16 = 0;
pub(crate) const IGMP_FLOW: u16 = 1;
pub(crate) const FIRST_UDP_FLOW: u16 = 2;

/// Frame lengths of the errant RTP packets that show up on the drop queue
/// when a filter is enabled against an already-running stream.  Counted but
/// otherwise ignored.
const RUNT_RTP_LENS: [usize; 2] = [1442, 1328];

/// A received UDP datagram, handed to consumers without copying payload
/// bytes: the descriptor owns the packet buffer and records where the
/// payload lives inside it.
///
/// Releasing a descriptor moves it into the flow's free-return queue, so a
/// double release is unrepresentable.
pub struct PktDesc {
    buf: PktBuf,
    payload_off: usize,
    payload_len: usize,
}

impl PktDesc {
    /// The UDP payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf.as_ref()[self.payload_off..self.payload_off + self.payload_len]
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
}

impl std::fmt::Debug for PktDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PktDesc")
            .field("off", &self.payload_off)
            .field("len", &self.payload_len)
            .finish()
    }
}

/// What a flow does with the packets on its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Queue 0: counts and discards whatever the catch-all rule collects.
    Drop,
    /// Queue 1: feeds the membership engine.
    IgmpControl,
    /// A configured stream.
    Udp {
        /// Destination address of the stream (multicast or unicast).
        addr: Ipv4Addr,
        /// Destination UDP port, host order.
        port: u16,
    },
}

/// Per-flow counters, written by the poller, readable from anywhere.
#[derive(Debug, Default)]
pub struct FlowStats {
    rx_pkt: AtomicU64,
    rx_free: AtomicU64,
    rx_broadcast: AtomicU64,
    rx_multicast: AtomicU64,
    rx_runt: AtomicU64,
    rx_qfull: AtomicU64,
    rx_nopkt: AtomicU64,
    rx_burst_max: AtomicU64,
    tx_pkt: AtomicU64,
}

/// One coherent-enough read of a flow's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    /// Packets the poller pulled for this flow.
    pub received: u64,
    /// Buffers released back to the pool on behalf of this flow.
    pub freed: u64,
    /// Frames addressed to the broadcast MAC.
    pub broadcast: u64,
    /// Frames addressed to a (non-broadcast) group MAC.
    pub multicast: u64,
    /// Runt RTP leftovers counted on the drop flow.
    pub runt: u64,
    /// Packets dropped because the receive queue was full.
    pub queue_full: u64,
    /// Packets dropped because they could not be wrapped in a descriptor.
    pub no_buffer: u64,
    /// Largest burst pulled in one poll.
    pub burst_max: u64,
    /// IGMP packets transmitted for this flow.
    pub transmitted: u64,
}

impl FlowStats {
    pub(crate) fn snapshot(&self) -> FlowCounters {
        FlowCounters {
            received: self.rx_pkt.load(Ordering::Relaxed),
            freed: self.rx_free.load(Ordering::Relaxed),
            broadcast: self.rx_broadcast.load(Ordering::Relaxed),
            multicast: self.rx_multicast.load(Ordering::Relaxed),
            runt: self.rx_runt.load(Ordering::Relaxed),
            queue_full: self.rx_qfull.load(Ordering::Relaxed),
            no_buffer: self.rx_nopkt.load(Ordering::Relaxed),
            burst_max: self.rx_burst_max.load(Ordering::Relaxed),
            transmitted: self.tx_pkt.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn note_burst(&self, n: u64) {
        self.rx_burst_max.fetch_max(n, Ordering::Relaxed);
    }

    pub(crate) fn note_tx(&self) {
        self.tx_pkt.fetch_add(1, Ordering::Relaxed);
    }
}

/// A flow bound to one receive queue.
pub struct Flow {
    pub(crate) index: u16,
    pub(crate) kind: FlowKind,
    #[allow(dead_code)] // held so the rule's lifetime is visible in the record
    pub(crate) rule: RuleHandle,
    pub(crate) recvq: Arc<Queue<PktDesc>>,
    pub(crate) freeq: Arc<Queue<PktDesc>>,
    pub(crate) stats: FlowStats,
    pub(crate) igmp: Option<Mutex<Membership>>,
}

impl Flow {
    /// The flow's index, equal to its receive queue index.
    #[must_use]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// What this flow is for.
    #[must_use]
    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> FlowCounters {
        self.stats.snapshot()
    }

    /// The queue the poller delivers descriptors on.
    #[must_use]
    pub fn receive_queue(&self) -> &Arc<Queue<PktDesc>> {
        &self.recvq
    }

    /// The queue consumers return descriptors on.
    #[must_use]
    pub fn free_queue(&self) -> &Arc<Queue<PktDesc>> {
        &self.freeq
    }

    /// A control flow (drop or IGMP) for a reserved queue index.
    pub(crate) fn control(index: u16, kind: FlowKind, rule: RuleHandle, qsize: u16) -> Flow {
        Flow {
            index,
            kind,
            rule,
            recvq: Arc::new(Queue::new(usize::from(qsize))),
            freeq: Arc::new(Queue::new(usize::from(qsize))),
            stats: FlowStats::default(),
            igmp: None,
        }
    }
}

/// Allocate and install a UDP flow on `shared`.
///
/// Scans for an exact (address, port) duplicate, then for a reusable hole
/// (a slot claimed earlier whose rule install failed), then appends.  The
/// flow is only published after its filter rule is installed, so a failure
/// leaves no partial state behind.
pub(crate) fn allocate(
    shared: &NicShared,
    addr: Ipv4Addr,
    udp_port: u16,
) -> Result<Arc<Flow>, CmdError> {
    let next = shared.next_flow.load(Ordering::Acquire);
    let mut hole = None;
    for idx in FIRST_UDP_FLOW..next {
        match &*shared.flows[usize::from(idx)].load() {
            Some(flow) => {
                if let FlowKind::Udp { addr: a, port: p } = flow.kind {
                    if a == addr && p == udp_port {
                        return Err(CmdError::Parameter(format!(
                            "flow[{idx}]: {addr}:{udp_port} already configured"
                        )));
                    }
                }
            }
            None => {
                if hole.is_none() {
                    hole = Some(idx);
                }
            }
        }
    }

    let index = match hole {
        Some(idx) => idx,
        None if next < shared.rx_queues => {
            shared.next_flow.store(next + 1, Ordering::Release);
            next
        }
        None => {
            return Err(CmdError::Exhausted(format!(
                "no free flows (out of {})",
                shared.rx_queues
            )));
        }
    };

    let spec = RuleSpec::udp_stream(addr, udp_port, RuleAction::ToQueue(QueueId(index)));
    let rule = install_rule(&*shared.dev, &spec)?;

    let igmp = addr.is_multicast().then(|| {
        Mutex::new(Membership::new(shared.mac, shared.ip, addr))
    });

    let flow = Arc::new(Flow {
        index,
        kind: FlowKind::Udp {
            addr,
            port: udp_port,
        },
        rule,
        recvq: Arc::new(Queue::new(usize::from(shared.rx_descriptors))),
        freeq: Arc::new(Queue::new(usize::from(shared.rx_descriptors))),
        stats: FlowStats::default(),
        igmp,
    });
    shared.flows[usize::from(index)].store(Some(Arc::clone(&flow)));

    if flow.igmp.is_some() {
        igmp::arm_initial_report(shared, index);
    }

    info!(port = shared.port.as_u16(), flow = index, %addr, udp_port, "flow configured");
    Ok(flow)
}

/// Counter trace cadence on the packet path.
const STATS_TRACE_MODULUS: u64 = 100_000;

/// Classification dispatch, run by the poller for every received buffer.
pub(crate) fn receive(shared: &NicShared, flow: &Flow, buf: PktBuf) {
    let seen = flow.stats.rx_pkt.fetch_add(1, Ordering::Relaxed) + 1;
    if seen % STATS_TRACE_MODULUS == 0 {
        debug!(flow = flow.index, counters = ?flow.stats.snapshot(), "flow counters");
    }
    classify(flow, &buf);
    match flow.kind {
        FlowKind::Drop => {
            drop(buf);
            flow.stats.rx_free.fetch_add(1, Ordering::Relaxed);
        }
        FlowKind::IgmpControl => {
            igmp::control_frame(shared, buf.as_ref());
            drop(buf);
            flow.stats.rx_free.fetch_add(1, Ordering::Relaxed);
        }
        FlowKind::Udp { .. } => receive_udp(flow, buf),
    }
}

fn classify(flow: &Flow, buf: &PktBuf) {
    let frame = buf.as_ref();
    if let Some(dst) = eth::destination(frame) {
        if dst.is_broadcast() {
            flow.stats.rx_broadcast.fetch_add(1, Ordering::Relaxed);
        } else if dst.is_group() {
            flow.stats.rx_multicast.fetch_add(1, Ordering::Relaxed);
        }
    }
    if flow.index == DROP_FLOW
        && eth::ethertype(frame) == Some(ETHERTYPE_IPV4)
        && RUNT_RTP_LENS.contains(&frame.len())
    {
        flow.stats.rx_runt.fetch_add(1, Ordering::Relaxed);
    }
}

fn receive_udp(flow: &Flow, buf: PktBuf) {
    match net::udp::parse(buf.as_ref()) {
        Err(err) => {
            trace!(flow = flow.index, %err, "undeliverable datagram");
            flow.stats.rx_nopkt.fetch_add(1, Ordering::Relaxed);
            drop(buf);
            flow.stats.rx_free.fetch_add(1, Ordering::Relaxed);
        }
        Ok(view) => {
            let desc = PktDesc {
                buf,
                payload_off: view.payload_offset,
                payload_len: view.payload_len,
            };
            if let Err(desc) = flow.recvq.try_push(desc) {
                debug!(flow = flow.index, "receive queue full");
                flow.stats.rx_qfull.fetch_add(1, Ordering::Relaxed);
                drop(desc);
                flow.stats.rx_free.fetch_add(1, Ordering::Relaxed);
            }
            // A parked consumer learns about new descriptors (or the drop)
            // either way.
            flow.recvq.consumer_waiter().kick();
        }
    }

    // Bound unconsumed buffer retention: give back whatever consumers have
    // finished with.
    while let Some(done) = flow.freeq.try_pop() {
        drop(done);
        flow.stats.rx_free.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dev::pool::{Pool, PoolConfig};

    fn frame_of_len(ethertype: u16, len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        frame[0..6].copy_from_slice(&[0xff; 6]);
        frame[12..14].copy_from_slice(&ethertype.to_be_bytes());
        frame
    }

    fn buf_with(pool: &Pool, frame: &[u8]) -> dev::PktBuf {
        let mut buf = pool.try_alloc().unwrap();
        buf.append_from(frame).unwrap();
        buf
    }

    #[test]
    fn drop_flow_counts_runt_rtp_leftovers() {
        let pool = Pool::new(&PoolConfig {
            buffers: 8,
            buffer_size: 2048,
            headroom: 0,
        });
        let flow = Flow::control(DROP_FLOW, FlowKind::Drop, RuleHandle(1), 8);

        classify(&flow, &buf_with(&pool, &frame_of_len(ETHERTYPE_IPV4, 1442)));
        classify(&flow, &buf_with(&pool, &frame_of_len(ETHERTYPE_IPV4, 1328)));
        classify(&flow, &buf_with(&pool, &frame_of_len(ETHERTYPE_IPV4, 1400)));
        classify(&flow, &buf_with(&pool, &frame_of_len(0x86dd, 1442)));

        let stats = flow.stats();
        assert_eq!(stats.runt, 2);
        // All four frames carried the broadcast MAC.
        assert_eq!(stats.broadcast, 4);
    }

    #[test]
    fn runt_sizes_only_count_on_the_drop_flow() {
        let pool = Pool::new(&PoolConfig {
            buffers: 8,
            buffer_size: 2048,
            headroom: 0,
        });
        let flow = Flow::control(IGMP_FLOW, FlowKind::IgmpControl, RuleHandle(2), 8);
        classify(&flow, &buf_with(&pool, &frame_of_len(ETHERTYPE_IPV4, 1442)));
        assert_eq!(flow.stats().runt, 0);
    }

    #[test]
    fn multicast_and_broadcast_frames_are_distinguished() {
        let pool = Pool::new(&PoolConfig {
            buffers: 8,
            buffer_size: 2048,
            headroom: 0,
        });
        let flow = Flow::control(DROP_FLOW, FlowKind::Drop, RuleHandle(1), 8);

        let mut group = frame_of_len(ETHERTYPE_IPV4, 100);
        group[0..6].copy_from_slice(&[0x01, 0x00, 0x5e, 0x01, 0x01, 0x01]);
        classify(&flow, &buf_with(&pool, &group));

        let mut unicast = frame_of_len(ETHERTYPE_IPV4, 100);
        unicast[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        classify(&flow, &buf_with(&pool, &unicast));

        let stats = flow.stats();
        assert_eq!(stats.multicast, 1);
        assert_eq!(stats.broadcast, 0);
    }
}
