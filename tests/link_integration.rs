//! End-to-end scenarios from spec.md §8, driven through an in-memory
//! `ChannelTransport` double instead of a real serial port or socket.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gcs_link::{LinkConfig, RadioLink};
use mavlink::ardupilotmega::{
    MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavResult, MavState, MavType,
    COMMAND_ACK_DATA, COMMAND_LONG_DATA, HEARTBEAT_DATA,
};
use mavlink::MavHeader;

/// Fake C2: an inbound queue the test feeds frames into, and an outbound
/// sink the test can inspect for frames the core sent.
struct ChannelTransport {
    inbound: Mutex<Receiver<(MavHeader, MavMessage)>>,
    outbound: SyncSender<(MavHeader, MavMessage)>,
}

impl ChannelTransport {
    fn new() -> (Arc<Self>, SyncSender<(MavHeader, MavMessage)>, Receiver<(MavHeader, MavMessage)>) {
        let (in_tx, in_rx) = sync_channel(64);
        let (out_tx, out_rx) = sync_channel(64);
        (
            Arc::new(Self {
                inbound: Mutex::new(in_rx),
                outbound: out_tx,
            }),
            in_tx,
            out_rx,
        )
    }
}

impl gcs_link::transport::MavTransport for ChannelTransport {
    fn recv_with_timeout(&self, timeout: Duration) -> gcs_link::transport::RecvOutcome {
        let inbound = self.inbound.lock().unwrap();
        match inbound.recv_timeout(timeout) {
            Ok((header, message)) => gcs_link::transport::RecvOutcome::Frame(header, message),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => gcs_link::transport::RecvOutcome::Timeout,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                gcs_link::transport::RecvOutcome::Fatal
            }
        }
    }

    fn send(&self, header: &MavHeader, message: &MavMessage) -> Result<(), gcs_link::LinkError> {
        let _ = self.outbound.try_send((*header, message.clone()));
        Ok(())
    }

    fn close(&self) {}
}

fn heartbeat_frame(system_id: u8, mav_type: MavType, armed: bool, custom_mode: u32) -> (MavHeader, MavMessage) {
    let mut base_mode = MavModeFlag::empty();
    if armed {
        base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
    }
    (
        MavHeader {
            system_id,
            component_id: 1,
            sequence: 0,
        },
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: mav_type,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        }),
    )
}

fn command_ack_frame(system_id: u8, command: MavCmd, result: MavResult) -> (MavHeader, MavMessage) {
    (
        MavHeader {
            system_id,
            component_id: 1,
            sequence: 0,
        },
        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command,
            result,
            ..Default::default()
        }),
    )
}

fn open_with_two_vehicles() -> (Arc<ChannelTransport>, SyncSender<(MavHeader, MavMessage)>, Receiver<(MavHeader, MavMessage)>, RadioLink) {
    let (transport, in_tx, out_rx) = ChannelTransport::new();
    in_tx.send(heartbeat_frame(1, MavType::MAV_TYPE_QUADROTOR, false, 0)).unwrap();
    in_tx.send(heartbeat_frame(2, MavType::MAV_TYPE_FIXED_WING, false, 0)).unwrap();

    let mut config = LinkConfig::default();
    config.discovery_window = Duration::from_millis(400);
    config.discovery_poll_interval = Duration::from_millis(20);
    config.default_command_timeout = Duration::from_millis(500);
    config.post_condition_poll_interval = Duration::from_millis(10);

    let link = RadioLink::open_with_transport(transport.clone(), config, &mut |_| {}).unwrap();
    (transport, in_tx, out_rx, link)
}

#[test]
fn discovery_reports_both_vehicles_and_progress_ticks() {
    let (transport, in_tx, _out_rx) = ChannelTransport::new();
    in_tx.send(heartbeat_frame(1, MavType::MAV_TYPE_QUADROTOR, false, 0)).unwrap();
    in_tx.send(heartbeat_frame(2, MavType::MAV_TYPE_FIXED_WING, false, 0)).unwrap();

    let mut config = LinkConfig::default();
    config.discovery_window = Duration::from_millis(1200);
    config.discovery_poll_interval = Duration::from_millis(20);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress_clone = progress.clone();

    let link = RadioLink::open_with_transport(transport, config, &mut move |p| {
        progress_clone.lock().unwrap().push(p);
    })
    .unwrap();

    let mut vehicles = link.list_vehicles();
    vehicles.sort_by_key(|v| v.system_id);
    assert_eq!(vehicles.len(), 2);
    assert_eq!(vehicles[0].system_id, 1);
    assert_eq!(vehicles[0].vehicle_class.as_str(), "copter");
    assert_eq!(vehicles[1].system_id, 2);
    assert_eq!(vehicles[1].vehicle_class.as_str(), "plane");

    let progress = progress.lock().unwrap();
    assert!(progress.iter().any(|p| p.message.is_some()));
    assert!(progress.iter().any(|p| p.data == Some(1) || p.data == Some(2)));

    link.close();
}

#[test]
fn arm_success_reports_armed_once_post_condition_heartbeat_arrives() {
    let (_transport, in_tx, out_rx, link) = open_with_two_vehicles();

    let worker_tx = in_tx.clone();
    let handle = std::thread::spawn(move || {
        // Wait for the COMMAND_LONG to be sent before acking, mirroring the
        // real wire's request/response ordering.
        std::thread::sleep(Duration::from_millis(50));
        worker_tx
            .send(command_ack_frame(1, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, MavResult::MAV_RESULT_ACCEPTED))
            .unwrap();
        worker_tx
            .send(heartbeat_frame(1, MavType::MAV_TYPE_QUADROTOR, true, 0))
            .unwrap();
    });

    let outcome = link.arm_vehicle(1, false);
    handle.join().unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.message, "Armed successfully");

    let sent = out_rx.try_recv().unwrap();
    match sent.1 {
        MavMessage::COMMAND_LONG(cmd) => {
            assert_eq!(cmd.command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
            assert_eq!(cmd.param1, 1.0);
        }
        other => panic!("expected COMMAND_LONG, got {other:?}"),
    }

    link.close();
}

#[test]
fn arm_not_accepted_reports_failure() {
    let (_transport, in_tx, _out_rx, link) = open_with_two_vehicles();

    let worker_tx = in_tx.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        worker_tx
            .send(command_ack_frame(1, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, MavResult::MAV_RESULT_FAILED))
            .unwrap();
    });

    let outcome = link.arm_vehicle(1, false);
    assert!(!outcome.success);
    assert_eq!(outcome.message, "Could not arm, command not accepted");

    link.close();
}

#[test]
fn arm_timeout_without_any_ack_fails_within_budget() {
    let (_transport, _in_tx, _out_rx, link) = open_with_two_vehicles();

    let start = std::time::Instant::now();
    let outcome = link.arm_vehicle(1, false);
    let elapsed = start.elapsed();

    assert!(!outcome.success);
    assert_eq!(outcome.message, "Could not arm, command not accepted");
    assert!(elapsed < Duration::from_millis(900));

    link.close();
}

#[test]
fn concurrent_command_on_same_link_is_rejected_while_one_is_in_flight() {
    let (_transport, _in_tx, _out_rx, link) = open_with_two_vehicles();
    let link = Arc::new(link);

    let link_clone = link.clone();
    let handle = std::thread::spawn(move || link_clone.arm_vehicle(1, false));

    std::thread::sleep(Duration::from_millis(50));
    let second = link.disarm_vehicle(1, false);
    assert!(!second.success);
    assert!(second.message.to_lowercase().contains("reserve"));

    let _ = handle.join().unwrap();
    link.close();
}

#[test]
fn takeoff_on_plane_is_rejected_without_sending_nav_takeoff() {
    let (_transport, _in_tx, out_rx, link) = open_with_two_vehicles();

    let outcome = link.copter_takeoff(2, 10.0);
    assert!(!outcome.success);
    assert_eq!(outcome.message, "Vehicle is not a copter");

    match out_rx.try_recv() {
        Err(TryRecvError::Empty) => {}
        other => panic!("expected no frame sent, got {other:?}"),
    }

    link.close();
}

#[test]
fn set_mode_on_unknown_name_fails_without_sending_a_frame() {
    let (_transport, _in_tx, out_rx, link) = open_with_two_vehicles();

    let outcome = link.set_flight_mode_all("NOT_A_REAL_MODE");
    assert!(!outcome.success);

    match out_rx.try_recv() {
        Err(TryRecvError::Empty) => {}
        other => panic!("expected no frame sent, got {other:?}"),
    }

    link.close();
}

#[test]
fn ack_from_the_wrong_vehicle_is_ignored() {
    let (_transport, in_tx, _out_rx, link) = open_with_two_vehicles();

    let worker_tx = in_tx.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        // Vehicle 2 acks the same command code first; it must not satisfy
        // vehicle 1's wait. Vehicle 1's own ack follows shortly after.
        worker_tx
            .send(command_ack_frame(2, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, MavResult::MAV_RESULT_ACCEPTED))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        worker_tx
            .send(command_ack_frame(1, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, MavResult::MAV_RESULT_ACCEPTED))
            .unwrap();
        worker_tx
            .send(heartbeat_frame(1, MavType::MAV_TYPE_QUADROTOR, true, 0))
            .unwrap();
    });

    let outcome = link.arm_vehicle(1, false);
    handle.join().unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.message, "Armed successfully");

    link.close();
}

#[test]
fn concurrent_precondition_failure_reports_reservation_conflict() {
    let (_transport, _in_tx, _out_rx, link) = open_with_two_vehicles();
    let link = Arc::new(link);

    let link_clone = link.clone();
    let handle = std::thread::spawn(move || link_clone.arm_vehicle(1, false));

    std::thread::sleep(Duration::from_millis(50));
    // Vehicle 2 is a plane, so this would normally fail its precondition
    // check; while another command holds the reservation it must instead
    // report a reservation conflict, matching every other executor.
    let second = link.copter_takeoff(2, 10.0);
    assert!(!second.success);
    assert!(second.message.to_lowercase().contains("reserve"));

    let _ = handle.join().unwrap();
    link.close();
}

#[test]
fn close_joins_all_workers_within_budget() {
    let (_transport, _in_tx, _out_rx, link) = open_with_two_vehicles();
    let start = std::time::Instant::now();
    link.close();
    assert!(start.elapsed() < Duration::from_secs(3));
}
