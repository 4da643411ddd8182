//! C3 — Frame Router.
//!
//! Owns the discovery phase and the four long-running workers described in
//! spec.md §5: reader/router, heartbeat emitter, passive dispatcher, plus
//! the caller threads that live in `commands`/`link`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use mavlink::ardupilotmega::{
    MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA, TIMESYNC_DATA,
};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::reservation::ReservationRegistry;
use crate::transport::{self, MavTransport, RecvOutcome};
use crate::vehicle::VehicleRegistry;

/// Progress payload delivered to the caller-supplied discovery callback, per
/// spec.md §6.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveryProgress {
    pub success: bool,
    pub message: Option<String>,
    pub data: Option<u64>,
}

/// A dequeued (type_name, frame) pair handed to the passive dispatcher.
pub type PassiveItem = (&'static str, MavMessage);

fn type_name(message: &MavMessage) -> &'static str {
    match message {
        MavMessage::HEARTBEAT(_) => "HEARTBEAT",
        MavMessage::VFR_HUD(_) => "VFR_HUD",
        MavMessage::TIMESYNC(_) => "TIMESYNC",
        MavMessage::STATUSTEXT(_) => "STATUSTEXT",
        MavMessage::COMMAND_ACK(_) => "COMMAND_ACK",
        MavMessage::SYS_STATUS(_) => "SYS_STATUS",
        MavMessage::GLOBAL_POSITION_INT(_) => "GLOBAL_POSITION_INT",
        _ => "OTHER",
    }
}

/// Blocks on the transport for up to `config.discovery_window`, creating a
/// vehicle record for every new heartbeat with a recognized class and the
/// expected autopilot component id. Ticks `progress` once per second and
/// once per newly discovered vehicle. Returns `true` if at least one
/// vehicle was discovered.
pub fn run_discovery(
    transport: &dyn MavTransport,
    vehicles: &VehicleRegistry,
    config: &LinkConfig,
    mut progress: impl FnMut(DiscoveryProgress),
) -> bool {
    let start = Instant::now();
    let mut last_tick = 0u64;
    let mut discovered_any = false;

    while start.elapsed() < config.discovery_window {
        match transport.recv_with_timeout(config.discovery_poll_interval) {
            RecvOutcome::Frame(header, MavMessage::HEARTBEAT(heartbeat)) => {
                if let Some(class) =
                    vehicles.upsert_on_heartbeat(header.system_id, header.component_id, &heartbeat)
                {
                    discovered_any = true;
                    progress(DiscoveryProgress {
                        success: true,
                        message: Some(format!(
                            "Heartbeat received from {}: {}:{}",
                            class.as_str(),
                            header.system_id,
                            header.component_id
                        )),
                        data: None,
                    });
                }
            }
            RecvOutcome::Frame(_, _) => {}
            RecvOutcome::Timeout | RecvOutcome::Transient | RecvOutcome::Interrupted => {}
            RecvOutcome::Fatal => break,
        }

        let elapsed_secs = start.elapsed().as_secs();
        if elapsed_secs > last_tick {
            last_tick = elapsed_secs;
            progress(DiscoveryProgress {
                success: true,
                message: None,
                data: Some(elapsed_secs),
            });
        }
    }

    discovered_any
}

/// Steady-state routing loop, per spec.md §4.3. Runs until `active` clears.
pub fn run_routing_loop(
    transport: &dyn MavTransport,
    vehicles: &VehicleRegistry,
    reservations: &ReservationRegistry,
    passive_tx: &Sender<PassiveItem>,
    active: &AtomicBool,
) {
    while active.load(Ordering::Relaxed) {
        let outcome = transport.recv_with_timeout(Duration::from_millis(500));
        let (header, message) = match outcome {
            RecvOutcome::Frame(header, message) => (header, message),
            RecvOutcome::Timeout => continue,
            RecvOutcome::Transient => continue,
            RecvOutcome::Interrupted => break,
            RecvOutcome::Fatal => {
                warn!("transport reported a fatal error, router exiting");
                break;
            }
        };

        // Ignore strangers: a system id not yet in the registry never
        // reaches the vehicle cache, reserved queues, passive listeners, or
        // even the TIMESYNC auto-reply.
        if !vehicles.contains(header.system_id) {
            continue;
        }

        let name = type_name(&message);

        if let MavMessage::TIMESYNC(ts) = &message {
            let reply = TIMESYNC_DATA {
                tc1: now_nanos(),
                ts1: ts.ts1,
            };
            if let Err(err) = transport.send(&transport::header(), &MavMessage::TIMESYNC(reply)) {
                warn!(error = %err, "failed to send TIMESYNC reply");
            }
            continue;
        }

        match &message {
            MavMessage::STATUSTEXT(text) => {
                debug!(system_id = header.system_id, text = ?text.text, "STATUSTEXT");
            }
            MavMessage::HEARTBEAT(heartbeat) => {
                vehicles.upsert_on_heartbeat(header.system_id, header.component_id, heartbeat);
            }
            MavMessage::VFR_HUD(vfr_hud) => {
                vehicles.apply_vfr_hud(header.system_id, vfr_hud);
            }
            MavMessage::SYS_STATUS(sys_status) => {
                vehicles.apply_sys_status(
                    header.system_id,
                    sys_status.voltage_battery,
                    sys_status.current_battery,
                );
            }
            _ => {}
        }

        if reservations.is_reserved(name) {
            reservations.dispatch(name, header.system_id, &message);
        } else {
            let _ = passive_tx.send((name, message));
        }
    }
}

/// Drains the passive buffer with a one-second poll, invoking `dispatch` for
/// every dequeued item. A missing listener is the caller's concern (`link`
/// logs and drops it).
pub fn run_passive_dispatcher(
    rx: &Receiver<PassiveItem>,
    active: &AtomicBool,
    poll_interval: Duration,
    mut dispatch: impl FnMut(PassiveItem),
) {
    while active.load(Ordering::Relaxed) {
        match rx.recv_timeout(poll_interval) {
            Ok(item) => dispatch(item),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    // Drain whatever is left so `close()` does not leave frames stranded.
    loop {
        match rx.try_recv() {
            Ok(item) => dispatch(item),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
        }
    }
}

/// Emits a GCS heartbeat once per `interval`. Send errors are logged; the
/// loop continues, per spec.md §4.3.
pub fn run_heartbeat_emitter(transport: &dyn MavTransport, active: &AtomicBool, interval: Duration) {
    let heartbeat = HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    };
    while active.load(Ordering::Relaxed) {
        if let Err(err) = transport.send(
            &transport::header(),
            &MavMessage::HEARTBEAT(heartbeat.clone()),
        ) {
            warn!(error = %err, "heartbeat send failed");
        }
        std::thread::sleep(interval);
    }
    info!("heartbeat emitter stopped");
}

fn now_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
