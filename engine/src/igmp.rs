// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The IGMP membership engine.
//!
//! Each multicast UDP flow carries a membership state machine:
//!
//! * `Reporting` -- configuring the flow arms an unsolicited-report
//!   countdown.  Every fire sends one membership report and decrements the
//!   repeat counter; while it is nonzero the timer re-arms at an increased
//!   interval, and when it reaches zero the flow settles to `Idle`.
//! * `Idle` -- nothing pending.  A general query, or one for this flow's
//!   group, arms a uniformly random response delay bounded by the query's
//!   advertised maximum response time and moves to `QueryPending`.
//! * `QueryPending` -- the randomized response timer is armed.  Further
//!   queries are ignored (so is any query during `Reporting`: a report is
//!   already on its way).  The fire sends one report and returns to `Idle`.
//!
//! Shutdown cancels every timer and sends one leave per multicast flow,
//! synchronously, from the poller thread before it exits.
//!
//! Report and leave frames are built once per flow and cloned into a fresh
//! pool buffer per transmission.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use dev::QueueId;
use net::eth::Mac;
use net::igmp::{IgmpType, build_frame, parse_frame};

use crate::flow::{Flow, FlowKind};
use crate::nic::NicShared;

/// Unsolicited reports sent after a flow is configured.
pub(crate) const REPORT_REPEATS: u8 = 2;

/// Transmit queue reserved for membership signaling.
pub(crate) const IGMP_TX_QUEUE: QueueId = QueueId(1);

/// One unit of a query's maximum response time.
const MRT_UNIT: Duration = Duration::from_millis(100);

/// Response-time units assumed for v1 queries, which advertise none.
const V1_MRT_UNITS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MembershipState {
    /// No report pending, no timer armed.
    Idle,
    /// Unsolicited-report countdown armed; `remaining` reports left.
    Reporting {
        /// Reports still to send, including the one for the armed timer.
        remaining: u8,
    },
    /// A query armed a randomized response timer.
    QueryPending,
}

/// Membership state of one multicast flow.
pub(crate) struct Membership {
    pub(crate) state: MembershipState,
    report: Vec<u8>,
    leave: Vec<u8>,
}

impl Membership {
    pub(crate) fn new(mac: Mac, src_ip: Ipv4Addr, group: Ipv4Addr) -> Membership {
        Membership {
            state: MembershipState::Reporting {
                remaining: REPORT_REPEATS,
            },
            report: build_frame(IgmpType::MembershipReportV2, 0, mac, src_ip, group),
            leave: build_frame(IgmpType::LeaveGroup, 0, mac, src_ip, group),
        }
    }
}

/// Software timers for one NIC, armed by the control thread and the poller,
/// serviced only by the poller.
pub(crate) struct TimerQueue {
    entries: Vec<(u16, Instant)>,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            entries: Vec::new(),
        }
    }

    /// Arm (or re-arm) the timer for `flow`.
    pub(crate) fn arm(&mut self, flow: u16, at: Instant) {
        self.cancel(flow);
        self.entries.push((flow, at));
    }

    pub(crate) fn cancel(&mut self, flow: u16) {
        self.entries.retain(|(f, _)| *f != flow);
    }

    fn take_due(&mut self, now: Instant) -> Vec<u16> {
        if self.entries.iter().all(|(_, at)| *at > now) {
            return Vec::new();
        }
        let mut due = Vec::new();
        self.entries.retain(|(flow, at)| {
            if *at <= now {
                due.push(*flow);
                false
            } else {
                true
            }
        });
        due
    }
}

/// Arm the first unsolicited report for a freshly configured flow.
pub(crate) fn arm_initial_report(shared: &NicShared, flow: u16) {
    shared
        .timers
        .lock()
        .arm(flow, Instant::now() + shared.igmp_interval);
}

/// Fire whatever timers are due.  Called from the poller loop, gated by its
/// coarse elapsed check.
pub(crate) fn service_timers(shared: &NicShared) {
    let now = Instant::now();
    let due = shared.timers.lock().take_due(now);
    for index in due {
        let slot = shared.flows[usize::from(index)].load();
        if let Some(flow) = &*slot {
            timer_fired(shared, flow, now);
        }
    }
}

fn timer_fired(shared: &NicShared, flow: &Flow, now: Instant) {
    let Some(membership) = &flow.igmp else { return };
    let mut membership = membership.lock();
    match membership.state {
        MembershipState::Reporting { remaining } => {
            transmit(shared, flow, &membership.report);
            let remaining = remaining.saturating_sub(1);
            if remaining > 0 {
                // Back off: each repeat waits one base interval longer.
                let step = u32::from(REPORT_REPEATS - remaining + 1);
                shared
                    .timers
                    .lock()
                    .arm(flow.index, now + shared.igmp_interval * step);
                membership.state = MembershipState::Reporting { remaining };
            } else {
                membership.state = MembershipState::Idle;
            }
            debug!(flow = flow.index, remaining, "membership report sent");
        }
        MembershipState::QueryPending => {
            transmit(shared, flow, &membership.report);
            membership.state = MembershipState::Idle;
            debug!(flow = flow.index, "query response sent");
        }
        MembershipState::Idle => {}
    }
}

/// Process a frame delivered on the IGMP control queue.
pub(crate) fn control_frame(shared: &NicShared, frame: &[u8]) {
    let message = match parse_frame(frame) {
        Ok(message) => message,
        Err(err) => {
            debug!(%err, "undecodable frame on control queue");
            return;
        }
    };
    if message.kind != IgmpType::MembershipQuery {
        debug!(?message, "ignoring non-query");
        return;
    }

    let units = if message.max_resp_time == 0 {
        V1_MRT_UNITS
    } else {
        u32::from(message.max_resp_time)
    };
    let max_delay = MRT_UNIT * units;
    let now = Instant::now();

    let next = shared.next_flow.load(Ordering::Acquire);
    for index in 0..next {
        let slot = shared.flows[usize::from(index)].load();
        let Some(flow) = &*slot else { continue };
        let FlowKind::Udp { addr, .. } = flow.kind else {
            continue;
        };
        if !addr.is_multicast() {
            continue;
        }
        if !message.group.is_unspecified() && message.group != addr {
            continue;
        }
        let Some(membership) = &flow.igmp else { continue };
        let mut membership = membership.lock();
        if membership.state != MembershipState::Idle {
            // A report is already on its way; that satisfies the query.
            continue;
        }
        let bound = (max_delay.as_millis() as u64).max(1);
        let delay = Duration::from_millis(rand::thread_rng().gen_range(1..=bound));
        membership.state = MembershipState::QueryPending;
        shared.timers.lock().arm(flow.index, now + delay);
        debug!(flow = flow.index, group = %addr, ?delay, "query response armed");
    }
}

/// Cancel timers and send a leave for every multicast flow.  Runs on the
/// poller thread on its way out.
pub(crate) fn shutdown(shared: &NicShared) {
    let next = shared.next_flow.load(Ordering::Acquire);
    for index in 0..next {
        let slot = shared.flows[usize::from(index)].load();
        let Some(flow) = &*slot else { continue };
        let FlowKind::Udp { addr, .. } = flow.kind else {
            continue;
        };
        let Some(membership) = &flow.igmp else { continue };
        shared.timers.lock().cancel(flow.index);
        let membership = membership.lock();
        transmit(shared, flow, &membership.leave);
        info!(flow = flow.index, group = %addr, "membership leave sent");
    }
}

fn transmit(shared: &NicShared, flow: &Flow, template: &[u8]) {
    let Some(mut buf) = shared.pool.try_alloc() else {
        warn!(flow = flow.index, "no buffer for membership transmit");
        return;
    };
    if buf.append_from(template).is_err() {
        warn!(flow = flow.index, "membership frame larger than pool buffer");
        return;
    }
    shared.dev.tx_burst(IGMP_TX_QUEUE, vec![buf]);
    flow.stats.note_tx();
}
