// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A multicast/unicast UDP packet-reception engine over poll-mode devices.
//!
//! The engine programs per-stream ingress filters, polls receive queues
//! from one dedicated thread per NIC, classifies datagrams into per-flow
//! ring queues, hands them to consumers as zero-copy [`PktDesc`]s, and
//! maintains IGMP group membership for the multicast streams it serves.
//!
//! Configuration flows through a synchronous command channel owned by a
//! single control thread (see [`Engine::request`] for the raw command
//! surface); [`Engine::configure_slot`] wraps the common bring-up sequence
//! and hands back a packed [`SlotHandle`] for the data-path calls.
//!
//! ```no_run
//! use std::sync::Arc;
//! use udprx_engine::{Engine, SlotConfig};
//! use dev::sim::SimBackend;
//!
//! let backend = Arc::new(SimBackend::new(&["0000:01:00.0"]));
//! let engine = Engine::start(backend, None).unwrap();
//! let slot = engine
//!     .configure_slot(&SlotConfig {
//!         iface: "0000:01:00.0".to_string(),
//!         iface_ip: "10.0.0.1".parse().unwrap(),
//!         group: "239.1.1.1".parse().unwrap(),
//!         udp_port: 5004,
//!     })
//!     .unwrap();
//! let mut descs = Vec::new();
//! engine.rx_burst(slot, &mut descs, 8).unwrap();
//! for desc in descs.drain(..) {
//!     println!("{} payload bytes", desc.payload_len());
//!     engine.release(slot, desc).unwrap();
//! }
//! ```

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::error;

use dev::{Backend, PortId};

mod control;
mod flow;
mod igmp;
mod nic;
mod poller;
mod shutdown;

pub use control::{CmdError, CmdOutput};
pub use flow::{Flow, FlowCounters, FlowKind, PktDesc};

use crate::control::Channel;
use crate::shutdown::Shutdown;

/// How often a blocked receive re-checks the shutdown token.
const RX_WAIT: Duration = Duration::from_millis(20);

/// Identifies one configured stream slot.
///
/// Packs a one-byte type tag, the 8-bit flow index, and the 8-bit port
/// index into a `u32`: `('F' << 16) | (flow << 8) | port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(u32);

const SLOT_TAG: u32 = b'F' as u32;

impl SlotHandle {
    fn pack(flow: u16, port: PortId) -> SlotHandle {
        SlotHandle((SLOT_TAG << 16) | ((u32::from(flow) & 0xff) << 8) | (u32::from(port.0) & 0xff))
    }

    /// Reconstruct a handle from its packed form; `None` unless the type
    /// tag checks out.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<SlotHandle> {
        ((raw >> 16) & 0xff == SLOT_TAG).then_some(SlotHandle(raw))
    }

    /// The packed form.
    #[must_use]
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// The flow index on its NIC.
    #[must_use]
    pub fn flow_index(&self) -> u16 {
        ((self.0 >> 8) & 0xff) as u16
    }

    /// The port index.
    #[must_use]
    pub fn port(&self) -> PortId {
        PortId((self.0 & 0xff) as u16)
    }
}

/// The fixed record describing one stream receive slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    /// Interface identifier (e.g. a PCI address) of the receiving NIC.
    pub iface: String,
    /// IP address of the receiving NIC.
    pub iface_ip: Ipv4Addr,
    /// Destination group (multicast) or unicast address of the stream.
    pub group: Ipv4Addr,
    /// Destination UDP port of the stream, host order.
    pub udp_port: u16,
}

/// Engine-level failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The handle does not name a configured slot.
    #[error("invalid slot handle {0:#010x}")]
    InvalidHandle(u32),
    /// The engine is shutting down.
    #[error("engine is shutting down")]
    ShutDown,
    /// A command failed; see [`CmdError`] for the taxonomy.
    #[error(transparent)]
    Command(#[from] CmdError),
}

/// The packet-reception engine.
///
/// Owns the control thread; dropping the engine triggers a cooperative
/// shutdown (pollers emit IGMP leaves on their way out) and joins it.
pub struct Engine {
    channel: Arc<Channel>,
    cancel: Shutdown,
    slots: RwLock<HashMap<u32, Arc<Flow>, ahash::RandomState>>,
    control: Option<JoinHandle<()>>,
}

impl Engine {
    /// Launch the control thread and initialize the environment, passing
    /// `env_args` (long-form `--name=value` options) through to the
    /// environment-init command.
    pub fn start(
        backend: Arc<dyn Backend>,
        env_args: Option<&str>,
    ) -> Result<Engine, EngineError> {
        let cancel = Shutdown::new();
        let channel = Arc::new(Channel::new(cancel.clone()));

        let control = {
            let channel = Arc::clone(&channel);
            let cancel = cancel.clone();
            std::thread::Builder::new()
                .name("udprx-control".to_string())
                .spawn(move || control::run(&channel, backend, cancel))
                .map_err(|err| CmdError::Environment(format!("control thread: {err}")))?
        };

        let engine = Engine {
            channel,
            cancel,
            slots: RwLock::new(HashMap::default()),
            control: Some(control),
        };

        let line = match env_args {
            Some(args) => format!("init-environment {args}"),
            None => "init-environment".to_string(),
        };
        if let Err(err) = engine.request(&line) {
            error!(%err, "environment initialisation failed");
            engine.cancel.trigger();
            return Err(err);
        }
        Ok(engine)
    }

    /// Submit a raw command line to the control thread and wait for its
    /// result.  See the crate docs for the command language.
    pub fn request(&self, line: &str) -> Result<CmdOutput, EngineError> {
        self.channel.submit(line)
    }

    /// Configure a stream receive slot: bring up the NIC if needed, then
    /// configure the flow.
    pub fn configure_slot(&self, config: &SlotConfig) -> Result<SlotHandle, EngineError> {
        let reply = self.request(&format!(
            "bring-up-nic {} {}",
            config.iface, config.iface_ip
        ))?;
        let CmdOutput::Port(port) = reply else {
            return Err(CmdError::Environment("unexpected bring-up reply".to_string()).into());
        };

        let reply = self.request(&format!(
            "configure-flow {} {} {}",
            config.iface, config.group, config.udp_port
        ))?;
        let CmdOutput::Flow(flow) = reply else {
            return Err(CmdError::Environment("unexpected flow reply".to_string()).into());
        };

        let handle = SlotHandle::pack(flow.index(), port);
        self.slots.write().insert(handle.raw(), flow);
        Ok(handle)
    }

    /// Receive up to `max` descriptors into `out`.
    ///
    /// Blocks until at least one descriptor is available (or shutdown);
    /// everything past the first is taken non-blocking.  Returns the number
    /// appended.
    pub fn rx_burst(
        &self,
        slot: SlotHandle,
        out: &mut Vec<PktDesc>,
        max: usize,
    ) -> Result<usize, EngineError> {
        let flow = self.lookup(slot)?;
        if max == 0 {
            return Ok(0);
        }
        let recvq = flow.receive_queue();
        let first = loop {
            if self.cancel.is_set() {
                return Err(EngineError::ShutDown);
            }
            if let Some(desc) = recvq.try_pop() {
                break desc;
            }
            recvq
                .consumer_waiter()
                .wait_timeout(|| recvq.has_ready() || self.cancel.is_set(), RX_WAIT);
        };
        out.push(first);
        let mut taken = 1;
        while taken < max {
            match recvq.try_pop() {
                Some(desc) => {
                    out.push(desc);
                    taken += 1;
                }
                None => break,
            }
        }
        Ok(taken)
    }

    /// Return a descriptor to its flow.  The buffer goes back to the pool
    /// the next time the poller services the flow.
    ///
    /// Consuming the descriptor makes a double release unrepresentable.
    pub fn release(&self, slot: SlotHandle, desc: PktDesc) -> Result<(), EngineError> {
        let flow = self.lookup(slot)?;
        flow.free_queue().push(desc);
        Ok(())
    }

    /// Counter snapshot for a slot's flow.
    pub fn flow_stats(&self, slot: SlotHandle) -> Result<FlowCounters, EngineError> {
        Ok(self.lookup(slot)?.stats())
    }

    /// Request an orderly shutdown and wait for the control thread to
    /// acknowledge it.  Pollers send their IGMP leaves before exiting.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.request("shutdown").map(|_| ())
    }

    fn lookup(&self, slot: SlotHandle) -> Result<Arc<Flow>, EngineError> {
        self.slots
            .read()
            .get(&slot.raw())
            .cloned()
            .ok_or(EngineError::InvalidHandle(slot.raw()))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.trigger();
        self.channel.wake_consumer();
        if let Some(control) = self.control.take() {
            if control.join().is_err() {
                error!("control thread panicked");
            }
        }
    }
}
