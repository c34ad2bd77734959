// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The poll-mode device boundary.
//!
//! Everything the receive engine knows about hardware goes through the
//! [`Device`] trait: queue configuration, burst receive/transmit, and
//! two-phase (validate, then create) flow-rule programming.  A [`Backend`]
//! enumerates the ports present in the environment.  The [`sim`] module
//! provides an in-memory implementation of both so the engine can be
//! exercised end-to-end without hardware.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use net::eth::Mac;

pub mod pool;
pub mod rule;
pub mod sim;

pub use pool::{Pool, PoolConfig, PktBuf};
pub use rule::{RuleAction, RuleHandle, RulePattern, RuleSpec};

/// Identifies a physical port within a [`Backend`].
///
/// This is a newtype around `u16` to provide type safety and prevent
/// accidental misuse; registries index by it after bounds-checking.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u16);

impl PortId {
    /// The port id represented as a `u16`.
    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl Display for PortId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "port {}", self.0)
    }
}

/// Identifies a hardware receive or transmit queue on one device.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub u16);

impl QueueId {
    /// The queue index represented as a `u16`.
    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl Display for QueueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue {}", self.0)
    }
}

/// Queue and descriptor counts applied to a device before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevConfig {
    /// Number of receive queues (one logical flow per queue).
    pub rx_queues: u16,
    /// Number of transmit queues.
    pub tx_queues: u16,
    /// Descriptors per receive queue.
    pub rx_descriptors: u16,
    /// Descriptors per transmit queue.
    pub tx_descriptors: u16,
}

/// Device-level failures.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Queue setup was attempted before [`Device::configure`].
    #[error("device is not configured")]
    NotConfigured,
    /// A data-path call arrived before [`Device::start`].
    #[error("device is not started")]
    NotStarted,
    /// Reconfiguration was attempted on a running device.
    #[error("device already started")]
    AlreadyStarted,
    /// A queue index outside the configured range was used.
    #[error("invalid {0}")]
    InvalidQueue(QueueId),
    /// The configuration itself is unusable.
    #[error("invalid device configuration: {0}")]
    BadConfig(String),
}

/// Flow-rule programming failures.  The message is the one the driver
/// reported, passed through verbatim.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The validation phase rejected the rule.
    #[error("rule validation rejected: {0}")]
    Rejected(String),
    /// Validation passed but creation failed anyway.
    #[error("rule creation failed: {0}")]
    CreateFailed(String),
}

/// One poll-mode network device.
///
/// Burst calls never block: an empty receive queue simply returns zero
/// buffers.  All mutation (`configure`, `start`, rule programming) is
/// expected to come from a single control thread.
pub trait Device: Send + Sync {
    /// The port this device occupies.
    fn port(&self) -> PortId;

    /// The device's MAC address.
    fn mac(&self) -> Mac;

    /// Apply queue/descriptor counts and attach the buffer pool receive
    /// buffers are allocated from.
    fn configure(&self, config: &DevConfig, pool: &Pool) -> Result<(), DeviceError>;

    /// Start packet reception.
    fn start(&self) -> Result<(), DeviceError>;

    /// Stop packet reception.
    fn stop(&self);

    /// Pull up to `max` received buffers from `queue` into `out`.
    /// Returns the number pulled; zero for an empty or unknown queue.
    fn rx_burst(&self, queue: QueueId, out: &mut Vec<PktBuf>, max: usize) -> usize;

    /// Hand `frames` to the transmit path of `queue`.  Returns the number
    /// accepted.
    fn tx_burst(&self, queue: QueueId, frames: Vec<PktBuf>) -> usize;

    /// Check a rule against the device's capabilities without installing it.
    fn validate_rule(&self, spec: &RuleSpec) -> Result<(), RuleError>;

    /// Install a previously validated rule.
    fn create_rule(&self, spec: &RuleSpec) -> Result<RuleHandle, RuleError>;

    /// Remove every installed rule.
    fn flush_rules(&self);
}

/// Install a rule using the mandatory two-phase sequence: creation is never
/// attempted unless validation succeeds.
pub fn install_rule(dev: &dyn Device, spec: &RuleSpec) -> Result<RuleHandle, RuleError> {
    dev.validate_rule(spec)?;
    dev.create_rule(spec)
}

/// Enumerates the ports available in one environment.
pub trait Backend: Send + Sync {
    /// Number of usable ports.
    fn port_count(&self) -> usize;

    /// Resolve an interface identifier (e.g. a PCI address) to its port.
    fn port_by_name(&self, name: &str) -> Option<PortId>;

    /// The device occupying `port`.
    fn device(&self, port: PortId) -> Option<Arc<dyn Device>>;
}
