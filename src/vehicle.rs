//! C1 — Vehicle State Cache.
//!
//! One record per observed `system_id`. Mutated only by the router thread
//! (see `crate::router`); read by callers through `&self` snapshots, which is
//! safe because every field access goes through a `Mutex` guarding the whole
//! record table (see §5: "read-only accessors ... take a short read-side
//! lock").

use std::collections::HashMap;
use std::sync::Mutex;

use mavlink::ardupilotmega::{
    CopterMode, HEARTBEAT_DATA, MavModeFlag, MavType, PlaneMode, RoverMode, SubMode, TrackerMode,
    VFR_HUD_DATA,
};
use num_traits::FromPrimitive;
use serde::Serialize;

/// The expected autopilot component id for a vehicle's own heartbeat.
/// Mirrors `MAV_COMP_ID_AUTOPILOT1` (1).
pub const AUTOPILOT_COMPONENT_ID: u8 = 1;

/// Derived from `mav_type_raw` per the fixed mapping in spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Copter,
    Plane,
    Rover,
    Boat,
    Tracker,
    Sub,
}

impl VehicleClass {
    /// Returns `None` for any `MAV_TYPE` not named in spec.md §6 — such
    /// heartbeats never create a vehicle record.
    pub fn from_mav_type(mav_type: MavType) -> Option<Self> {
        use MavType::*;
        Some(match mav_type {
            MAV_TYPE_HELICOPTER
            | MAV_TYPE_TRICOPTER
            | MAV_TYPE_QUADROTOR
            | MAV_TYPE_HEXAROTOR
            | MAV_TYPE_OCTOROTOR
            | MAV_TYPE_DECAROTOR
            | MAV_TYPE_DODECAROTOR
            | MAV_TYPE_COAXIAL => VehicleClass::Copter,
            MAV_TYPE_FIXED_WING | MAV_TYPE_VTOL_TILTROTOR => VehicleClass::Plane,
            MAV_TYPE_GROUND_ROVER => VehicleClass::Rover,
            MAV_TYPE_SURFACE_BOAT => VehicleClass::Boat,
            MAV_TYPE_ANTENNA_TRACKER => VehicleClass::Tracker,
            MAV_TYPE_SUBMARINE => VehicleClass::Sub,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Copter => "copter",
            VehicleClass::Plane => "plane",
            VehicleClass::Rover => "rover",
            VehicleClass::Boat => "boat",
            VehicleClass::Tracker => "tracker",
            VehicleClass::Sub => "sub",
        }
    }

    /// Builds the class's flight-mode table by walking every `custom_mode`
    /// value the corresponding ArduPilot mode enum recognizes. Cached once on
    /// the record at creation time, per spec.md §4.1.
    fn flight_mode_map(&self) -> HashMap<u32, String> {
        fn build<T: FromPrimitive + std::fmt::Debug>() -> HashMap<u32, String> {
            (0..=253u32)
                .filter_map(|n| T::from_u32(n).map(|mode| (n, format!("{mode:?}"))))
                .collect()
        }

        match self {
            VehicleClass::Copter => build::<CopterMode>(),
            VehicleClass::Plane => build::<PlaneMode>(),
            VehicleClass::Rover | VehicleClass::Boat => build::<RoverMode>(),
            VehicleClass::Tracker => build::<TrackerMode>(),
            VehicleClass::Sub => build::<SubMode>(),
        }
    }
}

/// Per-system-id record of the most recently observed derived state.
#[derive(Debug, Clone, Serialize)]
pub struct VehicleRecord {
    pub system_id: u8,
    pub component_id: u8,
    pub mav_type_raw: u32,
    pub vehicle_class: VehicleClass,
    pub armed: bool,
    pub flight_mode: u32,
    pub ground_speed: f32,
    pub altitude: f32,
    pub batt_volts: f32,
    pub batt_curr: f32,
    #[serde(skip)]
    pub flight_mode_map: HashMap<u32, String>,
}

impl VehicleRecord {
    fn new(system_id: u8, component_id: u8, mav_type_raw: u32, vehicle_class: VehicleClass) -> Self {
        Self {
            system_id,
            component_id,
            mav_type_raw,
            vehicle_class,
            armed: false,
            flight_mode: 0,
            ground_speed: 0.0,
            altitude: 0.0,
            batt_volts: 0.0,
            batt_curr: 0.0,
            flight_mode_map: vehicle_class.flight_mode_map(),
        }
    }

    pub fn flight_mode_name(&self) -> Option<&str> {
        self.flight_mode_map
            .get(&self.flight_mode)
            .map(String::as_str)
    }
}

/// Read-only projection of a [`VehicleRecord`], exposed across the public
/// API boundary (spec.md's `list_vehicles` plus the supplemented snapshot
/// calls in SPEC_FULL.md).
#[derive(Debug, Clone, Serialize)]
pub struct VehicleSnapshot {
    pub system_id: u8,
    pub component_id: u8,
    pub vehicle_class: VehicleClass,
    pub armed: bool,
    pub flight_mode: u32,
    pub flight_mode_name: Option<String>,
    pub ground_speed: f32,
    pub altitude: f32,
    pub batt_volts: f32,
    pub batt_curr: f32,
}

impl From<&VehicleRecord> for VehicleSnapshot {
    fn from(record: &VehicleRecord) -> Self {
        Self {
            system_id: record.system_id,
            component_id: record.component_id,
            vehicle_class: record.vehicle_class,
            armed: record.armed,
            flight_mode: record.flight_mode,
            flight_mode_name: record.flight_mode_name().map(str::to_owned),
            ground_speed: record.ground_speed,
            altitude: record.altitude,
            batt_volts: record.batt_volts,
            batt_curr: record.batt_curr,
        }
    }
}

/// C1: append-only table of vehicle records, keyed by `system_id`.
#[derive(Debug, Default)]
pub struct VehicleRegistry {
    records: Mutex<Vec<VehicleRecord>>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// No-op for unknown vehicle classes and for component ids other than
    /// the autopilot. Creates a new record for a `system_id` not yet known;
    /// otherwise updates `armed`/`flight_mode` on the existing record and
    /// ignores anything else about the frame.
    ///
    /// Returns `Some(class)` exactly when a *new* record was created, so the
    /// router can drive the discovery-progress callback.
    pub fn upsert_on_heartbeat(
        &self,
        system_id: u8,
        component_id: u8,
        heartbeat: &HEARTBEAT_DATA,
    ) -> Option<VehicleClass> {
        if component_id != AUTOPILOT_COMPONENT_ID {
            return None;
        }
        let armed = heartbeat
            .base_mode
            .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);

        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|r| r.system_id == system_id) {
            record.armed = armed;
            record.flight_mode = heartbeat.custom_mode;
            return None;
        }

        let class = VehicleClass::from_mav_type(heartbeat.mavtype)?;
        let mut record = VehicleRecord::new(
            system_id,
            component_id,
            heartbeat.mavtype as u32,
            class,
        );
        record.armed = armed;
        record.flight_mode = heartbeat.custom_mode;
        records.push(record);
        Some(class)
    }

    /// Does nothing for unknown system ids.
    pub fn apply_vfr_hud(&self, system_id: u8, vfr_hud: &VFR_HUD_DATA) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|r| r.system_id == system_id) {
            record.ground_speed = vfr_hud.groundspeed;
            record.altitude = vfr_hud.alt;
        }
    }

    pub fn apply_sys_status(&self, system_id: u8, volts_mv: u16, current_ca: i16) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|r| r.system_id == system_id) {
            record.batt_volts = f32::from(volts_mv) / 1000.0;
            record.batt_curr = f32::from(current_ca) / 100.0;
        }
    }

    pub fn contains(&self, system_id: u8) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.system_id == system_id)
    }

    pub fn is_armed(&self, system_id: u8) -> Option<bool> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.system_id == system_id)
            .map(|r| r.armed)
    }

    pub fn snapshot(&self, system_id: u8) -> Option<VehicleSnapshot> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.system_id == system_id)
            .map(VehicleSnapshot::from)
    }

    pub fn vehicle_class(&self, system_id: u8) -> Option<VehicleClass> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.system_id == system_id)
            .map(|r| r.vehicle_class)
    }

    /// Looks up the `custom_mode` integer for a human mode name through the
    /// vehicle's flight-mode map (used by `set_flight_mode_all`).
    pub fn resolve_mode_name(&self, system_id: u8, mode_name: &str) -> Option<u32> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.system_id == system_id)
            .and_then(|r| {
                r.flight_mode_map
                    .iter()
                    .find(|(_, name)| name.as_str() == mode_name)
                    .map(|(mode, _)| *mode)
            })
    }

    pub fn mode_name(&self, system_id: u8, custom_mode: u32) -> Option<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.system_id == system_id)
            .and_then(|r| r.flight_mode_map.get(&custom_mode).cloned())
    }

    pub fn list(&self) -> Vec<VehicleSnapshot> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(VehicleSnapshot::from)
            .collect()
    }

    pub fn system_ids(&self) -> Vec<u8> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.system_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(mavtype: MavType, custom_mode: u32, armed: bool) -> HEARTBEAT_DATA {
        let mut base_mode = MavModeFlag::empty();
        if armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        HEARTBEAT_DATA {
            custom_mode,
            mavtype,
            autopilot: mavlink::ardupilotmega::MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: mavlink::ardupilotmega::MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        }
    }

    #[test]
    fn unknown_vehicle_class_is_not_created() {
        let reg = VehicleRegistry::new();
        let hb = heartbeat(MavType::MAV_TYPE_GCS, 0, false);
        assert!(reg.upsert_on_heartbeat(9, AUTOPILOT_COMPONENT_ID, &hb).is_none());
        assert!(!reg.contains(9));
    }

    #[test]
    fn non_autopilot_component_is_rejected_on_discovery() {
        let reg = VehicleRegistry::new();
        let hb = heartbeat(MavType::MAV_TYPE_QUADROTOR, 0, false);
        assert!(reg.upsert_on_heartbeat(1, 42, &hb).is_none());
        assert!(!reg.contains(1));
    }

    #[test]
    fn first_heartbeat_creates_a_record_with_fixed_class() {
        let reg = VehicleRegistry::new();
        let hb = heartbeat(MavType::MAV_TYPE_QUADROTOR, 4, true);
        let created = reg.upsert_on_heartbeat(1, AUTOPILOT_COMPONENT_ID, &hb);
        assert_eq!(created, Some(VehicleClass::Copter));

        let snap = reg.snapshot(1).unwrap();
        assert_eq!(snap.vehicle_class, VehicleClass::Copter);
        assert!(snap.armed);
        assert_eq!(snap.flight_mode, 4);
    }

    #[test]
    fn subsequent_heartbeats_update_but_never_change_class() {
        let reg = VehicleRegistry::new();
        let hb1 = heartbeat(MavType::MAV_TYPE_QUADROTOR, 0, false);
        reg.upsert_on_heartbeat(1, AUTOPILOT_COMPONENT_ID, &hb1);

        let hb2 = heartbeat(MavType::MAV_TYPE_QUADROTOR, 3, true);
        let created = reg.upsert_on_heartbeat(1, AUTOPILOT_COMPONENT_ID, &hb2);
        assert!(created.is_none());

        let snap = reg.snapshot(1).unwrap();
        assert_eq!(snap.vehicle_class, VehicleClass::Copter);
        assert!(snap.armed);
        assert_eq!(snap.flight_mode, 3);
    }

    #[test]
    fn unknown_system_id_is_ignored_by_vfr_hud() {
        let reg = VehicleRegistry::new();
        reg.apply_vfr_hud(
            7,
            &VFR_HUD_DATA {
                airspeed: 0.0,
                groundspeed: 12.0,
                heading: 0,
                throttle: 0,
                alt: 5.0,
                climb: 0.0,
            },
        );
        assert!(reg.snapshot(7).is_none());
    }
}
