// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NIC records and the per-port registry.
//!
//! The registry is a plain object owned by the control thread -- the only
//! writer of NIC and flow state.  Activation hands the poller an
//! [`NicShared`], which carries exactly the state the data path needs:
//! immutable-after-activation configuration plus the lock-free flow arena.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::debug;

use dev::{DevConfig, Device, Pool, PortId, QueueId, install_rule};
use dev::rule::RuleSpec;
use net::eth::Mac;

use crate::control::CmdError;
use crate::flow::{DROP_FLOW, FIRST_UDP_FLOW, Flow, FlowKind, IGMP_FLOW};
use crate::igmp::TimerQueue;

/// Upper bound on ports the registry tracks; matches the widest poll-mode
/// environments supported.
pub(crate) const MAX_PORTS: usize = 32;

/// Queue/descriptor tuning, mutable only before activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NicTuning {
    pub rx_queues: u16,
    pub rx_descriptors: u16,
    pub tx_queues: u16,
    pub tx_descriptors: u16,
    pub burst: u16,
    pub igmp_interval_ms: u32,
}

impl Default for NicTuning {
    fn default() -> Self {
        Self {
            rx_queues: 8,
            rx_descriptors: 512,
            tx_queues: 4,
            tx_descriptors: 1024,
            burst: 32,
            igmp_interval_ms: 1000,
        }
    }
}

/// Control-plane record of one port.
pub(crate) struct NicRecord {
    pub name: String,
    pub ip: Option<Ipv4Addr>,
    pub tuning: NicTuning,
    pub shared: Option<Arc<NicShared>>,
    pub poller: Option<JoinHandle<()>>,
}

impl NicRecord {
    pub(crate) fn new(name: &str) -> NicRecord {
        NicRecord {
            name: name.to_string(),
            ip: None,
            tuning: NicTuning::default(),
            shared: None,
            poller: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.shared.is_some()
    }
}

/// Per-port registry, constructed once at startup and passed explicitly to
/// whatever needs it.
pub(crate) struct Registry {
    nics: Vec<Option<NicRecord>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            nics: (0..MAX_PORTS).map(|_| None).collect(),
        }
    }

    /// Bounds-checked mutable access to a port's slot.
    pub(crate) fn slot_mut(&mut self, port: PortId) -> Result<&mut Option<NicRecord>, CmdError> {
        self.nics
            .get_mut(usize::from(port.as_u16()))
            .ok_or_else(|| CmdError::Parameter(format!("{port} out of range")))
    }

    /// Bounds-checked read access.
    pub(crate) fn get(&self, port: PortId) -> Option<&NicRecord> {
        self.nics.get(usize::from(port.as_u16()))?.as_ref()
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut NicRecord> {
        self.nics.iter_mut().filter_map(Option::as_mut)
    }
}

/// Data-path state of an active NIC, shared between the control thread (its
/// only writer) and the poller/consumers (lock-free readers).
pub(crate) struct NicShared {
    pub port: PortId,
    pub name: String,
    pub dev: Arc<dyn Device>,
    pub pool: Pool,
    pub ip: Ipv4Addr,
    pub mac: Mac,
    pub rx_queues: u16,
    pub rx_descriptors: u16,
    pub burst: usize,
    pub igmp_interval: Duration,
    /// One slot per receive queue.  The control thread publishes, the
    /// poller loads.
    pub flows: Box<[ArcSwapOption<Flow>]>,
    /// High-water mark of claimed flow slots.
    pub next_flow: AtomicU16,
    pub timers: Mutex<TimerQueue>,
}

/// Configure and start the device, then install the two fixed control
/// flows: queue 0 is the dumpster, queue 1 is IGMP.
///
/// On any rule failure the device is stopped and its rules flushed, so a
/// failed bring-up leaves nothing half-installed behind.
pub(crate) fn activate(
    name: &str,
    port: PortId,
    dev: Arc<dyn Device>,
    pool: &Pool,
    ip: Ipv4Addr,
    tuning: &NicTuning,
) -> Result<Arc<NicShared>, CmdError> {
    let config = DevConfig {
        rx_queues: tuning.rx_queues,
        tx_queues: tuning.tx_queues,
        rx_descriptors: tuning.rx_descriptors,
        tx_descriptors: tuning.tx_descriptors,
    };
    dev.configure(&config, pool)?;
    dev.start()?;

    let mac = dev.mac();
    let shared = NicShared {
        port,
        name: name.to_string(),
        dev,
        pool: pool.clone(),
        ip,
        mac,
        rx_queues: tuning.rx_queues,
        rx_descriptors: tuning.rx_descriptors,
        burst: usize::from(tuning.burst),
        igmp_interval: Duration::from_millis(u64::from(tuning.igmp_interval_ms)),
        flows: (0..tuning.rx_queues).map(|_| ArcSwapOption::empty()).collect(),
        next_flow: AtomicU16::new(0),
        timers: Mutex::new(TimerQueue::new()),
    };

    if let Err(err) = install_control_flows(&shared) {
        shared.dev.flush_rules();
        shared.dev.stop();
        return Err(err);
    }
    debug!(%port, name, %ip, "NIC activated");
    Ok(Arc::new(shared))
}

fn install_control_flows(shared: &NicShared) -> Result<(), CmdError> {
    let drop_rule = install_rule(&*shared.dev, &RuleSpec::drop_all())?;
    let drop_flow = Flow::control(DROP_FLOW, FlowKind::Drop, drop_rule, shared.rx_descriptors);
    shared.flows[usize::from(DROP_FLOW)].store(Some(Arc::new(drop_flow)));
    shared.next_flow.store(IGMP_FLOW, Ordering::Release);

    let igmp_rule = install_rule(&*shared.dev, &RuleSpec::igmp_control(QueueId(IGMP_FLOW)))?;
    let igmp_flow = Flow::control(
        IGMP_FLOW,
        FlowKind::IgmpControl,
        igmp_rule,
        shared.rx_descriptors,
    );
    shared.flows[usize::from(IGMP_FLOW)].store(Some(Arc::new(igmp_flow)));
    shared.next_flow.store(FIRST_UDP_FLOW, Ordering::Release);
    Ok(())
}
