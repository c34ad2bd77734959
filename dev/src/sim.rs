// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory poll-mode devices.
//!
//! A [`SimDev`] behaves like a NIC with perfect-match ingress filtering:
//! frames injected with [`SimDev::inject`] are classified against the
//! installed rules (most specific pattern first) and land on the matching
//! receive queue, drawing their buffers from the configured pool.  Frames
//! with no match, and frames matched by a drop-action rule, land on queue 0
//! -- the dumpster -- mirroring hardware that cannot truly drop at line
//! rate.  Transmissions are captured for inspection.

use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use net::eth::{self, ETHERTYPE_IPV4};
use ring::Queue;

use crate::pool::{PktBuf, Pool};
use crate::rule::{RuleAction, RuleHandle, RulePattern, RuleSpec};
use crate::{Backend, DevConfig, Device, DeviceError, PortId, QueueId, RuleError};

/// Default number of flow rules a device accepts before reporting its
/// filter table full, the way a perfect-match NIC would.
const DEFAULT_RULE_QUOTA: usize = 512;

/// Where an injected frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    /// Delivered to the given receive queue.
    Queued(QueueId),
    /// The pool had no buffer left; the frame was lost.
    NoBuffer,
    /// The target receive queue was full; the frame was lost.
    QueueFull(QueueId),
}

struct SimState {
    config: Option<DevConfig>,
    started: bool,
    rules: Vec<(RuleHandle, RuleSpec)>,
    next_rule: u64,
    rule_quota: usize,
}

struct SimRx {
    queues: Vec<Arc<Queue<PktBuf>>>,
    pool: Pool,
}

/// One simulated port.
pub struct SimDev {
    port: PortId,
    name: String,
    mac: net::eth::Mac,
    state: Mutex<SimState>,
    rx: RwLock<Option<SimRx>>,
    tx_log: Mutex<Vec<(QueueId, Vec<u8>)>>,
}

impl SimDev {
    fn new(port: PortId, name: &str) -> SimDev {
        SimDev {
            port,
            name: name.to_string(),
            mac: net::eth::Mac([0x02, 0x00, 0x00, 0x00, 0x00, port.0 as u8]),
            state: Mutex::new(SimState {
                config: None,
                started: false,
                rules: Vec::new(),
                next_rule: 1,
                rule_quota: DEFAULT_RULE_QUOTA,
            }),
            rx: RwLock::new(None),
            tx_log: Mutex::new(Vec::new()),
        }
    }

    /// The interface identifier this device answers to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shrink the filter table, forcing rule creation to fail once `quota`
    /// rules are installed.
    pub fn set_rule_quota(&self, quota: usize) {
        self.state.lock().rule_quota = quota;
    }

    /// Frames handed to the transmit path so far, in order.
    #[must_use]
    pub fn transmitted(&self) -> Vec<(QueueId, Vec<u8>)> {
        self.tx_log.lock().clone()
    }

    /// The pool this device draws receive buffers from, once configured.
    #[must_use]
    pub fn rx_pool(&self) -> Option<Pool> {
        self.rx.read().as_ref().map(|rx| rx.pool.clone())
    }

    /// Classify `frame` through the installed rules and deliver it, the way
    /// ingress hardware would.
    pub fn inject(&self, frame: &[u8]) -> Result<InjectOutcome, DeviceError> {
        let queue = {
            let state = self.state.lock();
            if !state.started {
                return Err(DeviceError::NotStarted);
            }
            match best_match(&state.rules, frame) {
                Some((_, RuleAction::ToQueue(queue))) => queue,
                // Dropped and unmatched traffic surfaces on the dumpster.
                Some((_, RuleAction::Drop)) | None => QueueId(0),
            }
        };
        self.deliver(queue, frame)
    }

    /// Deliver `frame` straight to `queue`, bypassing classification.
    /// Models traffic the NIC buffered before a filter took effect.
    pub fn inject_to_queue(&self, queue: QueueId, frame: &[u8]) -> Result<InjectOutcome, DeviceError> {
        if !self.state.lock().started {
            return Err(DeviceError::NotStarted);
        }
        self.deliver(queue, frame)
    }

    fn deliver(&self, queue: QueueId, frame: &[u8]) -> Result<InjectOutcome, DeviceError> {
        let rx = self.rx.read();
        let rx = rx.as_ref().ok_or(DeviceError::NotConfigured)?;
        let ring = rx
            .queues
            .get(queue.0 as usize)
            .ok_or(DeviceError::InvalidQueue(queue))?;
        let Some(mut buf) = rx.pool.try_alloc() else {
            return Ok(InjectOutcome::NoBuffer);
        };
        if buf.append_from(frame).is_err() {
            return Ok(InjectOutcome::NoBuffer);
        }
        match ring.try_push_mp(buf) {
            Ok(()) => Ok(InjectOutcome::Queued(queue)),
            Err(_) => Ok(InjectOutcome::QueueFull(queue)),
        }
    }
}

fn pattern_matches(pattern: &RulePattern, frame: &[u8]) -> bool {
    match pattern {
        RulePattern::Any => true,
        RulePattern::Ipv4Proto { proto, dst } => ipv4_fields(frame)
            .is_some_and(|f| f.proto == *proto && f.dst == *dst),
        RulePattern::Ipv4Udp { dst, dst_port } => ipv4_fields(frame)
            .is_some_and(|f| f.proto == 17 && f.dst == *dst && f.udp_dst_port == Some(*dst_port)),
    }
}

struct Ipv4Fields {
    proto: u8,
    dst: Ipv4Addr,
    udp_dst_port: Option<u16>,
}

/// The handful of header fields perfect-match filtering keys on, pulled
/// straight from the wire bytes.
fn ipv4_fields(frame: &[u8]) -> Option<Ipv4Fields> {
    if eth::ethertype(frame)? != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = frame.get(eth::HEADER_LEN..)?;
    let first = *ip.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(first & 0x0f) * 4;
    let proto = *ip.get(9)?;
    let dst = Ipv4Addr::new(*ip.get(16)?, *ip.get(17)?, *ip.get(18)?, *ip.get(19)?);
    let udp_dst_port = match proto {
        17 => Some(u16::from_be_bytes([*ip.get(ihl + 2)?, *ip.get(ihl + 3)?])),
        _ => None,
    };
    Some(Ipv4Fields {
        proto,
        dst,
        udp_dst_port,
    })
}

fn best_match(rules: &[(RuleHandle, RuleSpec)], frame: &[u8]) -> Option<(RuleHandle, RuleAction)> {
    rules
        .iter()
        .filter(|(_, spec)| pattern_matches(&spec.pattern, frame))
        .max_by_key(|(_, spec)| spec.pattern.specificity())
        .map(|(handle, spec)| (*handle, spec.action))
}

impl Device for SimDev {
    fn port(&self) -> PortId {
        self.port
    }

    fn mac(&self) -> net::eth::Mac {
        self.mac
    }

    fn configure(&self, config: &DevConfig, pool: &Pool) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.started {
            return Err(DeviceError::AlreadyStarted);
        }
        if config.rx_queues == 0 {
            return Err(DeviceError::BadConfig("no receive queues".to_string()));
        }
        let queues = (0..config.rx_queues)
            .map(|_| Arc::new(Queue::new(usize::from(config.rx_descriptors))))
            .collect();
        *self.rx.write() = Some(SimRx {
            queues,
            pool: pool.clone(),
        });
        state.config = Some(*config);
        debug!(port = self.port.0, ?config, "device configured");
        Ok(())
    }

    fn start(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.config.is_none() {
            return Err(DeviceError::NotConfigured);
        }
        state.started = true;
        debug!(port = self.port.0, "device started");
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().started = false;
        debug!(port = self.port.0, "device stopped");
    }

    fn rx_burst(&self, queue: QueueId, out: &mut Vec<PktBuf>, max: usize) -> usize {
        let rx = self.rx.read();
        let Some(rx) = rx.as_ref() else { return 0 };
        let Some(ring) = rx.queues.get(queue.0 as usize) else {
            return 0;
        };
        let mut pulled = 0;
        while pulled < max {
            match ring.try_pop() {
                Some(buf) => {
                    out.push(buf);
                    pulled += 1;
                }
                None => break,
            }
        }
        pulled
    }

    fn tx_burst(&self, queue: QueueId, frames: Vec<PktBuf>) -> usize {
        let mut log = self.tx_log.lock();
        let n = frames.len();
        for frame in frames {
            trace!(port = self.port.0, queue = queue.0, len = frame.len(), "tx");
            log.push((queue, frame.as_ref().to_vec()));
        }
        n
    }

    fn validate_rule(&self, spec: &RuleSpec) -> Result<(), RuleError> {
        let state = self.state.lock();
        let Some(config) = state.config.as_ref() else {
            return Err(RuleError::Rejected("device not configured".to_string()));
        };
        if let RuleAction::ToQueue(queue) = spec.action {
            if queue.0 >= config.rx_queues {
                return Err(RuleError::Rejected(format!(
                    "{queue} out of range ({} rx queues)",
                    config.rx_queues
                )));
            }
        }
        if state.rules.len() >= state.rule_quota {
            return Err(RuleError::Rejected("filter table full".to_string()));
        }
        Ok(())
    }

    fn create_rule(&self, spec: &RuleSpec) -> Result<RuleHandle, RuleError> {
        let mut state = self.state.lock();
        if state.rules.len() >= state.rule_quota {
            return Err(RuleError::CreateFailed("filter table full".to_string()));
        }
        let handle = RuleHandle(state.next_rule);
        state.next_rule += 1;
        state.rules.push((handle, *spec));
        debug!(port = self.port.0, ?handle, ?spec, "rule installed");
        Ok(handle)
    }

    fn flush_rules(&self) {
        self.state.lock().rules.clear();
    }
}

/// A fixed set of simulated ports, looked up by interface identifier.
pub struct SimBackend {
    devices: Vec<Arc<SimDev>>,
}

impl SimBackend {
    /// One device per name, ports assigned in order.
    #[must_use]
    pub fn new(names: &[&str]) -> SimBackend {
        let devices = names
            .iter()
            .enumerate()
            .map(|(i, name)| Arc::new(SimDev::new(PortId(i as u16), name)))
            .collect();
        SimBackend { devices }
    }

    /// Direct access to a simulated device, for injection and inspection.
    #[must_use]
    pub fn dev(&self, port: PortId) -> Option<Arc<SimDev>> {
        self.devices.get(port.0 as usize).cloned()
    }
}

impl Backend for SimBackend {
    fn port_count(&self) -> usize {
        self.devices.len()
    }

    fn port_by_name(&self, name: &str) -> Option<PortId> {
        self.devices
            .iter()
            .find(|dev| dev.name == name)
            .map(|dev| dev.port)
    }

    fn device(&self, port: PortId) -> Option<Arc<dyn Device>> {
        self.devices
            .get(port.0 as usize)
            .map(|dev| Arc::clone(dev) as Arc<dyn Device>)
    }
}
