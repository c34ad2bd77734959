// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The command/control channel.
//!
//! A single control thread owns environment initialization and every
//! NIC/flow mutation, so command handlers need no locks of their own; only
//! the submission ring and the pending-record free list are synchronized.
//! Submission is synchronous: the caller borrows a pending record from the
//! free list, tokenizes its command into it, pushes it multi-producer onto
//! the ring, kicks the control thread, and parks on the record's completion
//! waiter until the result is written back.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use dev::{Backend, DeviceError, Pool, PoolConfig, PortId, RuleError};
use ring::Queue;

use crate::flow::{self, Flow};
use crate::nic::{self, NicRecord, Registry};
use crate::poller;
use crate::shutdown::Shutdown;
use crate::EngineError;

/// Pending-command records in the free list; commands beyond this are
/// rejected with resource exhaustion rather than allocated.
const COMMAND_SLOTS: usize = 16;
/// Tokens kept per command line.
const MAX_TOKENS: usize = 20;
/// Longest command line, in bytes.
const MAX_LINE: usize = 256;

/// How long the control thread sleeps between queue checks while idle.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// What a successfully executed command hands back.
pub enum CmdOutput {
    /// Nothing beyond success (environment init, shutdown, empty line).
    Unit,
    /// The port a NIC occupies.
    Port(PortId),
    /// A freshly configured flow, queues and counters included.
    Flow(Arc<Flow>),
}

/// Why a command failed.
#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    /// Malformed command or argument; rejected synchronously, never retried.
    #[error("parameter error: {0}")]
    Parameter(String),
    /// Out of flow slots, command records, or similar.
    #[error("resource exhausted: {0}")]
    Exhausted(String),
    /// The device rejected a filter rule; carries the driver's message.
    #[error(transparent)]
    Hardware(#[from] RuleError),
    /// The device rejected configuration.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Environment-level failure (initialization, thread spawn).
    #[error("environment error: {0}")]
    Environment(String),
    /// The command name is not in the dispatch table.
    #[error("unknown command \"{0}\"")]
    UnknownCommand(String),
}

struct PendingState {
    done: bool,
    result: Option<Result<CmdOutput, CmdError>>,
    tokens: Vec<String>,
}

/// A command in flight.  Borrowed from the free list on submission and
/// returned the moment the caller has been signaled; the record itself is
/// reused, never deallocated.
struct Pending {
    waiter: ring::Waiter,
    state: Mutex<PendingState>,
}

impl Pending {
    fn new() -> Pending {
        Pending {
            waiter: ring::Waiter::new(),
            state: Mutex::new(PendingState {
                done: false,
                result: None,
                tokens: Vec::with_capacity(MAX_TOKENS),
            }),
        }
    }
}

/// The submission side of the control channel.
pub(crate) struct Channel {
    queue: Queue<Arc<Pending>>,
    free: Mutex<Vec<Arc<Pending>>>,
    cancel: Shutdown,
}

impl Channel {
    pub(crate) fn new(cancel: Shutdown) -> Channel {
        Channel {
            queue: Queue::new(COMMAND_SLOTS),
            free: Mutex::new((0..COMMAND_SLOTS).map(|_| Arc::new(Pending::new())).collect()),
            cancel,
        }
    }

    /// Execute `line` on the control thread and wait for its result.
    pub(crate) fn submit(&self, line: &str) -> Result<CmdOutput, EngineError> {
        if self.cancel.is_set() {
            return Err(EngineError::ShutDown);
        }
        let tokens = tokenize(line)?;
        if tokens.is_empty() {
            // An empty command is a successful no-op.
            return Ok(CmdOutput::Unit);
        }

        let pending = self
            .free
            .lock()
            .pop()
            .ok_or(CmdError::Exhausted("no free command records".to_string()))?;
        pending.state.lock().tokens = tokens;

        self.queue.push_mp(Arc::clone(&pending));
        self.queue.consumer_waiter().kick();
        pending.waiter.wait_until(|| pending.state.lock().done);

        let result = {
            let mut state = pending.state.lock();
            state.done = false;
            state.tokens.clear();
            state.result.take()
        };
        self.free.lock().push(pending);

        match result {
            Some(Ok(output)) => Ok(output),
            Some(Err(err)) => Err(EngineError::Command(err)),
            // Failed during shutdown drain.
            None => Err(EngineError::ShutDown),
        }
    }

    pub(crate) fn wake_consumer(&self) {
        self.queue.consumer_waiter().kick();
    }
}

fn tokenize(line: &str) -> Result<Vec<String>, CmdError> {
    if !line.is_ascii() {
        return Err(CmdError::Parameter("command must be ASCII".to_string()));
    }
    let line = if line.len() > MAX_LINE {
        warn!(len = line.len(), "command truncated to {MAX_LINE} bytes");
        &line[..MAX_LINE]
    } else {
        line
    };
    Ok(line
        .split_whitespace()
        .take(MAX_TOKENS)
        .map(str::to_string)
        .collect())
}

/// Everything the control thread owns.
struct ControlCtx {
    backend: Arc<dyn Backend>,
    pool: Option<Pool>,
    registry: Registry,
    cancel: Shutdown,
}

/// The control thread body: execute commands until the shutdown token is
/// raised, then fail whatever is still queued and join the pollers.
pub(crate) fn run(channel: &Channel, backend: Arc<dyn Backend>, cancel: Shutdown) {
    info!("control thread running");
    let mut ctx = ControlCtx {
        backend,
        pool: None,
        registry: Registry::new(),
        cancel: cancel.clone(),
    };

    loop {
        if cancel.is_set() {
            break;
        }
        let Some(pending) = channel.queue.try_pop() else {
            channel
                .queue
                .consumer_waiter()
                .wait_timeout(|| channel.queue.has_ready() || cancel.is_set(), IDLE_WAIT);
            continue;
        };
        let tokens = pending.state.lock().tokens.clone();
        let result = execute(&mut ctx, &tokens);
        complete(&pending, Some(result));
    }

    while let Some(pending) = channel.queue.try_pop() {
        complete(&pending, None);
    }

    teardown(ctx);
}

fn complete(pending: &Pending, result: Option<Result<CmdOutput, CmdError>>) {
    {
        let mut state = pending.state.lock();
        state.result = result;
        state.done = true;
    }
    pending.waiter.kick();
}

fn teardown(mut ctx: ControlCtx) {
    for record in ctx.registry.records_mut() {
        if let Some(handle) = record.poller.take() {
            if handle.join().is_err() {
                error!(nic = %record.name, "poller thread panicked");
            }
        }
        if let Some(shared) = &record.shared {
            shared.dev.stop();
        }
    }
    info!("control thread stopped");
}

type Handler = fn(&mut ControlCtx, &[String]) -> Result<CmdOutput, CmdError>;

/// Fixed dispatch table; first token of the command line selects the entry.
const COMMANDS: &[(&str, Handler)] = &[
    ("init-environment", cmd_init_environment),
    ("bring-up-nic", cmd_bring_up_nic),
    ("configure-flow", cmd_configure_flow),
    ("shutdown", cmd_shutdown),
];

fn execute(ctx: &mut ControlCtx, tokens: &[String]) -> Result<CmdOutput, CmdError> {
    let Some(name) = tokens.first() else {
        return Ok(CmdOutput::Unit);
    };
    let Some((_, handler)) = COMMANDS.iter().find(|(cmd, _)| *cmd == name.as_str()) else {
        return Err(CmdError::UnknownCommand(name.clone()));
    };
    handler(ctx, tokens)
}

/// Long-form option tokens: `--name=value`.
fn long_opt(token: &str) -> Option<(&str, &str)> {
    token.strip_prefix("--")?.split_once('=')
}

/// Apply a `u16` tuning option.  Out-of-range values are reported and the
/// current setting kept; they are not a command failure.
fn tune_u16(name: &str, value: &str, lo: u16, hi: u16, current: &mut u16) {
    match value.parse::<u16>() {
        Ok(v) if (lo..=hi).contains(&v) => *current = v,
        _ => warn!("option --{name}={value} invalid, keeping {current}"),
    }
}

fn tune_u32(name: &str, value: &str, lo: u32, current: &mut u32) {
    match value.parse::<u32>() {
        Ok(v) if v >= lo => *current = v,
        _ => warn!("option --{name}={value} invalid, keeping {current}"),
    }
}

fn tune_usize(name: &str, value: &str, lo: usize, current: &mut usize) {
    match value.parse::<usize>() {
        Ok(v) if v >= lo => *current = v,
        _ => warn!("option --{name}={value} invalid, keeping {current}"),
    }
}

/// `init-environment [--max-buffers=N] [--buffer-size=N] [--headroom=N]`
fn cmd_init_environment(ctx: &mut ControlCtx, tokens: &[String]) -> Result<CmdOutput, CmdError> {
    if ctx.pool.is_some() {
        return Err(CmdError::Environment(
            "environment already initialised".to_string(),
        ));
    }
    let mut config = PoolConfig::default();
    for token in &tokens[1..] {
        let Some((name, value)) = long_opt(token) else {
            return Err(CmdError::Parameter(format!(
                "unexpected argument \"{token}\""
            )));
        };
        match name {
            "max-buffers" => tune_usize(name, value, 1024, &mut config.buffers),
            "buffer-size" => tune_usize(name, value, 128, &mut config.buffer_size),
            "headroom" => tune_usize(name, value, 0, &mut config.headroom),
            _ => return Err(CmdError::Parameter(format!("unknown option --{name}"))),
        }
    }
    if ctx.backend.port_count() == 0 {
        return Err(CmdError::Environment("no usable ports".to_string()));
    }
    ctx.pool = Some(Pool::new(&config));
    info!(
        buffers = config.buffers,
        buffer_size = config.buffer_size,
        ports = ctx.backend.port_count(),
        "environment initialised"
    );
    Ok(CmdOutput::Unit)
}

/// `bring-up-nic <iface> <ip> [--rxq=N] [--rxd=N] [--txq=N] [--txd=N]
/// [--burst=N] [--igmp-interval-ms=N]`
///
/// Idempotent per port: once a NIC is active the call just reports its
/// port, tuning options are honored only before first activation, and a
/// conflicting IP is rejected.
fn cmd_bring_up_nic(ctx: &mut ControlCtx, tokens: &[String]) -> Result<CmdOutput, CmdError> {
    let [_, name, ip, options @ ..] = tokens else {
        return Err(CmdError::Parameter(
            "usage: bring-up-nic <iface> <ip> [--option=value ...]".to_string(),
        ));
    };

    let port = ctx
        .backend
        .port_by_name(name)
        .ok_or_else(|| CmdError::Parameter(format!("\"{name}\": no such interface")))?;
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| CmdError::Parameter(format!("\"{ip}\": invalid address")))?;

    let slot = ctx.registry.slot_mut(port)?;
    let record = slot.get_or_insert_with(|| NicRecord::new(name));

    match record.ip {
        Some(existing) if existing != ip => {
            return Err(CmdError::Parameter(format!(
                "\"{name}\": inconsistent address: {existing} != {ip}"
            )));
        }
        Some(_) => {}
        None => record.ip = Some(ip),
    }

    const TUNING_OPTS: &[&str] = &["rxq", "rxd", "txq", "txd", "burst", "igmp-interval-ms"];
    for token in options {
        let Some((opt, value)) = long_opt(token) else {
            return Err(CmdError::Parameter(format!(
                "unexpected argument \"{token}\""
            )));
        };
        if !TUNING_OPTS.contains(&opt) {
            return Err(CmdError::Parameter(format!("unknown option --{opt}")));
        }
        // Tuning is settable only before first activation.
        if record.is_active() {
            warn!("option --{opt} ignored: \"{name}\" is already active");
            continue;
        }
        let tuning = &mut record.tuning;
        match opt {
            // The flow index must fit the 8-bit handle encoding.
            "rxq" => tune_u16(opt, value, 2, 256, &mut tuning.rx_queues),
            "rxd" => tune_u16(opt, value, 1, u16::MAX, &mut tuning.rx_descriptors),
            "txq" => tune_u16(opt, value, 1, u16::MAX, &mut tuning.tx_queues),
            "txd" => tune_u16(opt, value, 1, u16::MAX, &mut tuning.tx_descriptors),
            "burst" => tune_u16(opt, value, 1, u16::MAX, &mut tuning.burst),
            "igmp-interval-ms" => tune_u32(opt, value, 1, &mut tuning.igmp_interval_ms),
            _ => unreachable!(),
        }
    }

    if record.is_active() {
        return Ok(CmdOutput::Port(port));
    }

    let pool = ctx
        .pool
        .as_ref()
        .ok_or_else(|| CmdError::Environment("environment not initialised".to_string()))?;
    let device = ctx
        .backend
        .device(port)
        .ok_or_else(|| CmdError::Environment(format!("{port}: no device")))?;

    let shared = nic::activate(name, port, device, pool, ip, &record.tuning)?;
    let handle = poller::spawn(Arc::clone(&shared), ctx.cancel.clone())?;
    record.shared = Some(shared);
    record.poller = Some(handle);
    info!(%port, name = %name, %ip, "NIC brought up");
    Ok(CmdOutput::Port(port))
}

/// `configure-flow <iface> <addr> <udp-port>`
fn cmd_configure_flow(ctx: &mut ControlCtx, tokens: &[String]) -> Result<CmdOutput, CmdError> {
    let [_, name, addr, udp_port, ..] = tokens else {
        return Err(CmdError::Parameter(
            "usage: configure-flow <iface> <addr> <udp-port>".to_string(),
        ));
    };

    let port = ctx
        .backend
        .port_by_name(name)
        .ok_or_else(|| CmdError::Parameter(format!("\"{name}\": no such interface")))?;
    let record = ctx
        .registry
        .get(port)
        .filter(|record| record.is_active())
        .ok_or_else(|| CmdError::Parameter(format!("\"{name}\": not brought up")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| CmdError::Parameter(format!("\"{addr}\": invalid address")))?;
    let udp_port: u16 = match udp_port.parse() {
        Ok(p) if p != 0 => p,
        _ => {
            return Err(CmdError::Parameter(format!(
                "\"{udp_port}\": invalid udp port"
            )));
        }
    };

    let shared = record
        .shared
        .as_ref()
        .ok_or_else(|| CmdError::Parameter(format!("\"{name}\": not brought up")))?;
    let flow = flow::allocate(shared, addr, udp_port)?;
    Ok(CmdOutput::Flow(flow))
}

/// `shutdown`
fn cmd_shutdown(ctx: &mut ControlCtx, _tokens: &[String]) -> Result<CmdOutput, CmdError> {
    info!("shutdown requested");
    ctx.cancel.trigger();
    Ok(CmdOutput::Unit)
}
