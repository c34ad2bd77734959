// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The per-NIC ingress poller.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use dev::QueueId;

use crate::control::CmdError;
use crate::flow;
use crate::igmp;
use crate::nic::NicShared;
use crate::shutdown::Shutdown;

/// How often the loop is willing to call into the timer subsystem.
const TIMER_SERVICE_PERIOD: Duration = Duration::from_millis(100);

/// Launch the poller thread for an activated NIC, pinned to a dedicated
/// core when one is available.
pub(crate) fn spawn(
    shared: Arc<NicShared>,
    cancel: Shutdown,
) -> Result<JoinHandle<()>, CmdError> {
    std::thread::Builder::new()
        .name(format!("udprx-poll-{}", shared.port.as_u16()))
        .spawn(move || {
            pin_current_thread(&shared);
            run(&shared, &cancel);
        })
        .map_err(|err| CmdError::Environment(format!("poller thread: {err}")))
}

/// The poll loop: round-robin over the receive queues, up to `burst`
/// buffers per queue, dispatching each buffer to its flow's handler.
/// Terminates only on the shutdown token; leaves are emitted on the way
/// out, before the thread exits.
fn run(shared: &NicShared, cancel: &Shutdown) {
    info!(
        port = shared.port.as_u16(),
        name = %shared.name,
        "ingress poller running"
    );
    let mut burst = Vec::with_capacity(shared.burst);
    let mut timer_check = Instant::now();

    while !cancel.is_set() {
        for queue in 0..shared.rx_queues {
            let pulled = shared.dev.rx_burst(QueueId(queue), &mut burst, shared.burst);
            if pulled == 0 {
                continue;
            }
            let next = shared.next_flow.load(Ordering::Acquire);
            let slot = shared.flows[usize::from(queue)].load();
            for buf in burst.drain(..) {
                match &*slot {
                    Some(flow) if queue < next => flow::receive(shared, flow, buf),
                    _ => {
                        // Arrived before flow initialization completed.
                        warn!(
                            port = shared.port.as_u16(),
                            queue,
                            len = buf.len(),
                            "unexpected datagram, releasing"
                        );
                        drop(buf);
                    }
                }
            }
            if let Some(flow) = &*slot {
                flow.stats.note_burst(pulled as u64);
            }
        }

        if timer_check.elapsed() >= TIMER_SERVICE_PERIOD {
            igmp::service_timers(shared);
            timer_check = Instant::now();
        }
    }

    igmp::shutdown(shared);
    info!(port = shared.port.as_u16(), "ingress poller stopped");
}

#[cfg(target_os = "linux")]
fn pin_current_thread(shared: &NicShared) {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if cores < 2 {
        debug!("single core, leaving poller unpinned");
        return;
    }
    // Core 0 stays with the control plane; pollers spread over the rest.
    let core = 1 + usize::from(shared.port.as_u16()) % (cores - 1);
    let mut set = CpuSet::new();
    if set.set(core).is_err() {
        return;
    }
    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => debug!(port = shared.port.as_u16(), core, "poller pinned"),
        Err(err) => warn!(%err, core, "could not pin poller"),
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_shared: &NicShared) {}
