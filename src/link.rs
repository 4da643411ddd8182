//! Top-level orchestration: link construction, the `{Opening, Discovering,
//! Running, Closing, Closed}` state machine from spec.md §9, and the public
//! API surface excluded components consume.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use mavlink::ardupilotmega::MavMessage;
use tracing::{info, warn};

use crate::commands::{self, CommandOutcome, ExecutorContext};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::reservation::ReservationRegistry;
use crate::router::{self, DiscoveryProgress, PassiveItem};
use crate::transport::{MavTransport, MavlinkTransport};
use crate::vehicle::{VehicleRegistry, VehicleSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Opening,
    Discovering,
    Running,
    Closing,
    Closed,
}

impl LinkState {
    fn as_str(&self) -> &'static str {
        match self {
            LinkState::Opening => "opening",
            LinkState::Discovering => "discovering",
            LinkState::Running => "running",
            LinkState::Closing => "closing",
            LinkState::Closed => "closed",
        }
    }
}

type PassiveListeners = Mutex<HashMap<&'static str, Box<dyn Fn(MavMessage) + Send + Sync>>>;

/// Owns C1–C4, the transport handle, and every worker thread. `RadioLink`
/// is the single entry point excluded components (the outward client
/// socket layer) consume — see spec.md §6's Core API.
pub struct RadioLink {
    transport: Arc<dyn MavTransport>,
    vehicles: Arc<VehicleRegistry>,
    reservations: Arc<ReservationRegistry>,
    config: LinkConfig,
    state: RwLock<LinkState>,
    active: Arc<AtomicBool>,
    passive_listeners: Arc<PassiveListeners>,
    passive_tx: Sender<PassiveItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// The source reuses one controller id per link for every executor; we
    /// preserve that throttling semantics (see spec.md §9 Open Questions).
    controller_id: u64,
}

impl RadioLink {
    /// Opens `url`, runs discovery for `config.discovery_window`, and on
    /// success spawns the steady-state workers. `initial_heartbeat_cb` is
    /// invoked per spec.md §6's progress payloads during discovery only.
    pub fn open(
        url: &str,
        config: LinkConfig,
        mut initial_heartbeat_cb: impl FnMut(DiscoveryProgress) + Send + 'static,
    ) -> Result<Self> {
        let transport: Arc<dyn MavTransport> = Arc::new(MavlinkTransport::open(url)?);
        Self::open_with_transport(transport, config, &mut initial_heartbeat_cb)
    }

    /// Same as [`Self::open`] but with an injected transport, used by tests
    /// so discovery and routing can be driven without a real serial/socket.
    pub fn open_with_transport(
        transport: Arc<dyn MavTransport>,
        config: LinkConfig,
        initial_heartbeat_cb: &mut dyn FnMut(DiscoveryProgress),
    ) -> Result<Self> {
        let vehicles = Arc::new(VehicleRegistry::new());
        let discovered = router::run_discovery(transport.as_ref(), &vehicles, &config, |p| {
            initial_heartbeat_cb(p)
        });

        if !discovered {
            transport.close();
            return Err(LinkError::NoHeartbeats);
        }

        let reservations = Arc::new(ReservationRegistry::new(config.controller_queue_bound));
        let active = Arc::new(AtomicBool::new(true));
        let (passive_tx, passive_rx) = channel::<PassiveItem>();
        let passive_listeners: Arc<PassiveListeners> = Arc::new(Mutex::new(HashMap::new()));

        let link = Self {
            transport: transport.clone(),
            vehicles: vehicles.clone(),
            reservations: reservations.clone(),
            config: config.clone(),
            state: RwLock::new(LinkState::Running),
            active: active.clone(),
            passive_listeners: passive_listeners.clone(),
            passive_tx,
            workers: Mutex::new(Vec::new()),
            controller_id: 1,
        };

        let mut workers = Vec::new();

        let router_tx = link.passive_tx.clone();
        {
            let transport = transport.clone();
            let vehicles = vehicles.clone();
            let reservations = reservations.clone();
            let active = active.clone();
            workers.push(std::thread::spawn(move || {
                router::run_routing_loop(transport.as_ref(), &vehicles, &reservations, &router_tx, &active);
            }));
        }

        {
            let transport = transport.clone();
            let active = active.clone();
            let interval = config.heartbeat_interval;
            workers.push(std::thread::spawn(move || {
                router::run_heartbeat_emitter(transport.as_ref(), &active, interval);
            }));
        }

        {
            let active = active.clone();
            let listeners = passive_listeners.clone();
            let poll_interval = config.passive_dispatch_poll_interval;
            workers.push(std::thread::spawn(move || {
                router::run_passive_dispatcher(&passive_rx, &active, poll_interval, |(name, frame)| {
                    let guard = listeners.lock().unwrap();
                    match guard.get(name) {
                        Some(cb) => cb(frame),
                        None => warn!(type_name = name, "no passive listener registered, dropping"),
                    }
                });
            }));
        }

        *link.workers.lock().unwrap() = workers;
        info!(url, "link running");
        Ok(link)
    }

    pub fn state(&self) -> LinkState {
        *self.state.read().unwrap()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state() != LinkState::Running {
            return Err(LinkError::NotReady(self.state().as_str()));
        }
        Ok(())
    }

    /// Flips the active flag, joins every worker with a 3s budget per
    /// thread, and drops the transport handle. Per spec.md §5, ordering
    /// beyond "eventually stopped" is not guaranteed across workers.
    pub fn close(&self) {
        *self.state.write().unwrap() = LinkState::Closing;
        self.active.store(false, Ordering::Relaxed);
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        self.transport.close();
        *self.state.write().unwrap() = LinkState::Closed;
        info!("link closed");
    }

    pub fn list_vehicles(&self) -> Vec<VehicleSnapshot> {
        self.vehicles.list()
    }

    pub fn vehicle_snapshot(&self, system_id: u8) -> Option<VehicleSnapshot> {
        self.vehicles.snapshot(system_id)
    }

    pub fn vehicle_snapshots(&self) -> Vec<VehicleSnapshot> {
        self.vehicles.list()
    }

    pub fn mode_name(&self, system_id: u8, custom_mode: u32) -> Option<String> {
        self.vehicles.mode_name(system_id, custom_mode)
    }

    /// Registers `callback` for `type_name`. Refuses a second registration
    /// for the same name — "the first wins", per spec.md §3.
    pub fn add_passive_listener(
        &self,
        type_name: &'static str,
        callback: impl Fn(MavMessage) + Send + Sync + 'static,
    ) -> bool {
        let mut listeners = self.passive_listeners.lock().unwrap();
        if listeners.contains_key(type_name) {
            return false;
        }
        listeners.insert(type_name, Box::new(callback));
        true
    }

    pub fn remove_passive_listener(&self, type_name: &'static str) -> bool {
        self.passive_listeners.lock().unwrap().remove(type_name).is_some()
    }

    fn ctx(&self) -> ExecutorContext<'_> {
        ExecutorContext {
            transport: self.transport.as_ref(),
            reservations: &self.reservations,
            vehicles: &self.vehicles,
            config: &self.config,
            controller_id: self.controller_id,
        }
    }

    fn not_ready_outcome(&self) -> CommandOutcome {
        CommandOutcome {
            success: false,
            message: format!("link not ready (state: {})", self.state().as_str()),
            data: None,
        }
    }

    pub fn arm_vehicle(&self, system_id: u8, force: bool) -> CommandOutcome {
        if self.ensure_running().is_err() {
            return self.not_ready_outcome();
        }
        commands::arm_vehicle(&self.ctx(), system_id, force)
    }

    pub fn disarm_vehicle(&self, system_id: u8, force: bool) -> CommandOutcome {
        if self.ensure_running().is_err() {
            return self.not_ready_outcome();
        }
        commands::disarm_vehicle(&self.ctx(), system_id, force)
    }

    pub fn set_flight_mode(&self, system_id: u8, mode_int: u32) -> CommandOutcome {
        if self.ensure_running().is_err() {
            return self.not_ready_outcome();
        }
        commands::set_flight_mode(&self.ctx(), system_id, mode_int)
    }

    pub fn copter_takeoff(&self, system_id: u8, altitude: f32) -> CommandOutcome {
        if self.ensure_running().is_err() {
            return self.not_ready_outcome();
        }
        commands::copter_takeoff(&self.ctx(), system_id, altitude)
    }

    pub fn arm_all(&self, force: bool) -> CommandOutcome {
        if self.ensure_running().is_err() {
            return self.not_ready_outcome();
        }
        let ctx = self.ctx();
        commands::fan_out(&self.vehicles, |id| commands::arm_vehicle(&ctx, id, force))
    }

    pub fn disarm_all(&self, force: bool) -> CommandOutcome {
        if self.ensure_running().is_err() {
            return self.not_ready_outcome();
        }
        let ctx = self.ctx();
        commands::fan_out(&self.vehicles, |id| commands::disarm_vehicle(&ctx, id, force))
    }

    pub fn set_flight_mode_all(&self, mode_name: &str) -> CommandOutcome {
        if self.ensure_running().is_err() {
            return self.not_ready_outcome();
        }
        let ctx = self.ctx();
        commands::fan_out(&self.vehicles, |id| {
            match self.vehicles.resolve_mode_name(id, mode_name) {
                Some(mode_int) => commands::set_flight_mode(&ctx, id, mode_int),
                None => CommandOutcome {
                    success: false,
                    message: format!("vehicle {id} has no flight mode named {mode_name}"),
                    data: None,
                },
            }
        })
    }
}

impl Drop for RadioLink {
    fn drop(&mut self) {
        if self.state() != LinkState::Closed {
            self.close();
        }
    }
}
