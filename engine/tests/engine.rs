// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End-to-end scenarios over the in-memory device backend.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use etherparse::PacketBuilder;

use dev::sim::{InjectOutcome, SimBackend, SimDev};
use dev::{Backend, PortId, QueueId};
use net::igmp::{ALL_ROUTERS, IgmpType};
use udprx_engine::{CmdError, CmdOutput, Engine, EngineError, SlotConfig, SlotHandle};

const IFACE: &str = "0000:01:00.0";

fn start_engine() -> (Engine, Arc<SimBackend>) {
    let backend = Arc::new(SimBackend::new(&[IFACE]));
    let engine = Engine::start(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Some("--max-buffers=1024 --buffer-size=2048"),
    )
    .expect("engine start");
    (engine, backend)
}

fn slot_config(group: &str, udp_port: u16) -> SlotConfig {
    SlotConfig {
        iface: IFACE.to_string(),
        iface_ip: "10.0.0.1".parse().unwrap(),
        group: group.parse().unwrap(),
        udp_port,
    }
}

fn udp_frame(group: [u8; 4], udp_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 9], [1, 0, 0x5e, 1, 1, 1])
        .ipv4([10, 0, 0, 9], group, 64)
        .udp(9000, udp_port);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

/// Inject until the frame lands on a queue, riding out transient
/// queue-full moments while the poller catches up.
fn inject_queued(dev: &SimDev, frame: &[u8]) -> QueueId {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match dev.inject(frame).expect("inject") {
            InjectOutcome::Queued(queue) => return queue,
            InjectOutcome::QueueFull(_) | InjectOutcome::NoBuffer => {
                assert!(Instant::now() < deadline, "injection never accepted");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn igmp_frames(dev: &SimDev, kind: IgmpType) -> Vec<net::igmp::IgmpMessage> {
    dev.transmitted()
        .iter()
        .filter_map(|(_, frame)| net::igmp::parse_frame(frame).ok())
        .filter(|msg| msg.kind == kind)
        .collect()
}

#[test]
fn end_to_end_receive_and_release() {
    let (engine, backend) = start_engine();
    let slot = engine
        .configure_slot(&slot_config("239.1.1.1", 5004))
        .unwrap();
    let dev = backend.dev(PortId(0)).unwrap();

    let payload = b"0123456789abcdef";
    let frame = udp_frame([239, 1, 1, 1], 5004, payload);
    // The first UDP flow owns queue 2 (0 is the dumpster, 1 is IGMP).
    assert_eq!(inject_queued(&dev, &frame), QueueId(2));

    let mut descs = Vec::new();
    let n = engine.rx_burst(slot, &mut descs, 4).unwrap();
    assert_eq!(n, 1);
    let desc = descs.pop().unwrap();
    assert_eq!(desc.payload_len(), payload.len());
    assert_eq!(desc.payload(), payload);

    engine.release(slot, desc).unwrap();

    // The next serviced packet drains the free-return queue.
    inject_queued(&dev, &frame);
    assert!(wait_for(
        || engine.flow_stats(slot).unwrap().freed >= 1,
        Duration::from_secs(5)
    ));
    let stats = engine.flow_stats(slot).unwrap();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.queue_full, 0);
    assert_eq!(stats.no_buffer, 0);
}

#[test]
fn duplicate_flow_is_rejected_without_state_change() {
    let (engine, _backend) = start_engine();
    let first = engine
        .configure_slot(&slot_config("239.1.1.1", 5004))
        .unwrap();
    assert_eq!(first.flow_index(), 2);

    let err = engine
        .configure_slot(&slot_config("239.1.1.1", 5004))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Command(CmdError::Parameter(_))
    ));

    // The failed request consumed no slot: the next flow lands on index 3.
    let second = engine
        .configure_slot(&slot_config("239.1.1.2", 5004))
        .unwrap();
    assert_eq!(second.flow_index(), 3);

    // Same group on a different port is a distinct flow, not a duplicate.
    let third = engine
        .configure_slot(&slot_config("239.1.1.1", 5005))
        .unwrap();
    assert_eq!(third.flow_index(), 4);
}

#[test]
fn seventeenth_flow_fails_with_exhaustion() {
    let (engine, _backend) = start_engine();
    engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.1 --rxq=18"))
        .unwrap();

    for i in 0..16u16 {
        let reply = engine
            .request(&format!("configure-flow {IFACE} 239.1.2.{} 5004", i + 1))
            .unwrap();
        let CmdOutput::Flow(flow) = reply else {
            panic!("expected a flow reply");
        };
        assert_eq!(flow.index(), i + 2);
    }

    let err = engine
        .request(&format!("configure-flow {IFACE} 239.1.3.1 5004"))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Command(CmdError::Exhausted(_))
    ));
}

#[test]
fn flood_past_capacity_counts_drops() {
    let (engine, backend) = start_engine();
    // Tiny receive rings so the flood overflows quickly.
    engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.1 --rxd=8"))
        .unwrap();
    let slot = engine
        .configure_slot(&slot_config("239.1.1.1", 5004))
        .unwrap();
    let dev = backend.dev(PortId(0)).unwrap();

    let frame = udp_frame([239, 1, 1, 1], 5004, b"flood");
    // The consumer is stalled: nothing calls rx_burst while we flood.
    for _ in 0..20 {
        inject_queued(&dev, &frame);
    }
    assert!(wait_for(
        || engine.flow_stats(slot).unwrap().received == 20,
        Duration::from_secs(5)
    ));

    let stats = engine.flow_stats(slot).unwrap();
    // The ring holds 8 descriptors; everything past that was dropped and
    // counted, nothing crashed, nothing deadlocked.
    assert_eq!(stats.queue_full, 12);

    let mut descs = Vec::new();
    let n = engine.rx_burst(slot, &mut descs, 32).unwrap();
    assert_eq!(n, 8);
    for desc in descs.drain(..) {
        engine.release(slot, desc).unwrap();
    }
}

#[test]
fn igmp_reports_then_idle_then_query_response() {
    let (engine, backend) = start_engine();
    engine
        .request(&format!(
            "bring-up-nic {IFACE} 10.0.0.1 --igmp-interval-ms=50"
        ))
        .unwrap();
    engine
        .configure_slot(&slot_config("239.1.1.1", 5004))
        .unwrap();
    let dev = backend.dev(PortId(0)).unwrap();

    // Exactly two unsolicited reports, then the flow settles to idle.
    assert!(wait_for(
        || igmp_frames(&dev, IgmpType::MembershipReportV2).len() == 2,
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(500));
    let reports = igmp_frames(&dev, IgmpType::MembershipReportV2);
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|msg| msg.group == Ipv4Addr::new(239, 1, 1, 1)));

    // A general query while idle arms exactly one response within the
    // advertised window (3 units = 300 ms).
    let query = net::igmp::build_frame(
        IgmpType::MembershipQuery,
        3,
        net::eth::Mac([2, 0, 0, 0, 0, 0xfe]),
        "10.0.0.254".parse().unwrap(),
        Ipv4Addr::UNSPECIFIED,
    );
    assert_eq!(inject_queued(&dev, &query), QueueId(1));
    assert!(wait_for(
        || igmp_frames(&dev, IgmpType::MembershipReportV2).len() == 3,
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(igmp_frames(&dev, IgmpType::MembershipReportV2).len(), 3);
}

#[test]
fn shutdown_while_reporting_emits_one_leave() {
    let (engine, backend) = start_engine();
    // A long interval keeps the flow in its reporting state.
    engine
        .request(&format!(
            "bring-up-nic {IFACE} 10.0.0.1 --igmp-interval-ms=10000"
        ))
        .unwrap();
    engine
        .configure_slot(&slot_config("239.1.1.1", 5004))
        .unwrap();
    let dev = backend.dev(PortId(0)).unwrap();

    engine.shutdown().unwrap();
    drop(engine); // joins control thread and pollers

    let leaves = igmp_frames(&dev, IgmpType::LeaveGroup);
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].group, Ipv4Addr::new(239, 1, 1, 1));
    // The leave frame itself went to All-Routers.
    let raw_leaves: Vec<_> = dev
        .transmitted()
        .into_iter()
        .filter(|(_, frame)| frame[30..34] == ALL_ROUTERS.octets())
        .collect();
    assert_eq!(raw_leaves.len(), 1);
    // No report ever fired.
    assert!(igmp_frames(&dev, IgmpType::MembershipReportV2).is_empty());
}

#[test]
fn datagram_on_uninitialised_queue_is_released() {
    let (engine, backend) = start_engine();
    engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.1"))
        .unwrap();
    let dev = backend.dev(PortId(0)).unwrap();
    let pool = dev.rx_pool().unwrap();
    let full = pool.available();

    let frame = udp_frame([239, 9, 9, 9], 7000, b"early");
    // Queue 5 exists in hardware but no flow was initialised for it.
    dev.inject_to_queue(QueueId(5), &frame).unwrap();

    // The poller logs it and releases the buffer straight back to the pool.
    assert!(wait_for(|| pool.available() == full, Duration::from_secs(5)));
}

#[test]
fn bring_up_is_idempotent_and_rejects_conflicting_ip() {
    let (engine, _backend) = start_engine();
    let CmdOutput::Port(port) = engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.1"))
        .unwrap()
    else {
        panic!("expected a port reply");
    };
    assert_eq!(port, PortId(0));

    // Same address again: same port, no error.
    let CmdOutput::Port(again) = engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.1"))
        .unwrap()
    else {
        panic!("expected a port reply");
    };
    assert_eq!(again, port);

    let err = engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.2"))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Command(CmdError::Parameter(_))
    ));
}

#[test]
fn command_language_edges() {
    let (engine, _backend) = start_engine();

    // Empty and whitespace-only commands are successful no-ops.
    assert!(matches!(engine.request("").unwrap(), CmdOutput::Unit));
    assert!(matches!(engine.request(" \t ").unwrap(), CmdOutput::Unit));

    let err = engine.request("frobnicate now").unwrap_err();
    assert!(matches!(
        err,
        EngineError::Command(CmdError::UnknownCommand(_))
    ));

    // Unknown interfaces and malformed arguments are parameter errors.
    let bads = [
        "bring-up-nic 0000:99:00.0 10.0.0.1".to_string(),
        format!("bring-up-nic {IFACE} not-an-ip"),
        format!("configure-flow {IFACE} 239.1.1.1 0"),
        "configure-flow".to_string(),
    ];
    for bad in &bads {
        let err = engine.request(bad).unwrap_err();
        assert!(
            matches!(err, EngineError::Command(CmdError::Parameter(_))),
            "{bad}: {err}"
        );
    }

    // Invalid tuning values are reported and ignored, not failures.
    assert!(engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.1 --rxq=0 --burst=junk"))
        .is_ok());

    // Unknown options do fail.
    let err = engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.1 --warp-factor=9"))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Command(CmdError::Parameter(_))
    ));
}

#[test]
fn configure_flow_requires_brought_up_nic() {
    let (engine, _backend) = start_engine();
    let err = engine
        .request(&format!("configure-flow {IFACE} 239.1.1.1 5004"))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Command(CmdError::Parameter(_))
    ));
}

#[test]
fn hardware_rejection_surfaces_driver_message_and_slot_is_reusable() {
    let (engine, backend) = start_engine();
    engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.1"))
        .unwrap();
    let dev = backend.dev(PortId(0)).unwrap();

    // Two control rules are installed; allow just one more, then the
    // filter table is full.
    dev.set_rule_quota(3);
    let first = engine
        .configure_slot(&slot_config("239.1.1.1", 5004))
        .unwrap();
    assert_eq!(first.flow_index(), 2);

    let err = engine
        .configure_slot(&slot_config("239.1.1.2", 5004))
        .unwrap_err();
    let EngineError::Command(CmdError::Hardware(rule_err)) = err else {
        panic!("expected a hardware rejection, got {err}");
    };
    assert!(rule_err.to_string().contains("filter table full"));

    // The claimed slot was never published; once the table has room again
    // it is reused rather than leaked.
    dev.set_rule_quota(100);
    let retry = engine
        .configure_slot(&slot_config("239.1.1.2", 5004))
        .unwrap();
    assert_eq!(retry.flow_index(), 3);
}

#[test]
fn invalid_handles_are_rejected() {
    let (engine, _backend) = start_engine();
    engine
        .request(&format!("bring-up-nic {IFACE} 10.0.0.1"))
        .unwrap();

    // Well-formed tag, but nothing was configured at that slot.
    let bogus = SlotHandle::from_raw((u32::from(b'F') << 16) | (9 << 8)).unwrap();
    let mut descs = Vec::new();
    assert!(matches!(
        engine.rx_burst(bogus, &mut descs, 4),
        Err(EngineError::InvalidHandle(_))
    ));
    assert!(matches!(
        engine.flow_stats(bogus),
        Err(EngineError::InvalidHandle(_))
    ));

    // A wrong type tag never even constructs.
    assert!(SlotHandle::from_raw(0x0045_0200).is_none());
}

#[test]
fn unicast_flow_receives_without_igmp() {
    let (engine, backend) = start_engine();
    let slot = engine
        .configure_slot(&slot_config("10.0.0.1", 6000))
        .unwrap();
    let dev = backend.dev(PortId(0)).unwrap();

    let frame = udp_frame([10, 0, 0, 1], 6000, b"unicast payload");
    inject_queued(&dev, &frame);

    let mut descs = Vec::new();
    engine.rx_burst(slot, &mut descs, 1).unwrap();
    assert_eq!(descs[0].payload(), b"unicast payload");
    engine.release(slot, descs.pop().unwrap()).unwrap();

    // No membership signaling for unicast destinations.
    std::thread::sleep(Duration::from_millis(200));
    assert!(dev.transmitted().is_empty());
    drop(engine);
    assert!(igmp_frames(&dev, IgmpType::LeaveGroup).is_empty());
}
