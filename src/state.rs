//! # Vehicle State Table
//!
//! Central mutable state, one record per vehicle, shared by the ingestion
//! loop and the interpolation ticker.
//!
//! The table sits behind a single coarse mutex; the fleet is a handful of
//! buses. All access goes through closure helpers so the lock is never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::geo_utils::normalize_bearing;
use crate::geometry::RouteGeometryStore;
use crate::interpolation::InterpolationState;
use crate::laps::LapTracker;
use crate::routes::RouteCatalog;
use crate::window::FixWindow;
use crate::{GpsPoint, RouteColor, VehicleFix};

// ============================================================================
// Vehicle State
// ============================================================================

/// Everything the tracker knows about one vehicle.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle_id: String,
    /// Registry id of the bus, when known
    pub bus_id: Option<i64>,
    pub last_fix: Option<VehicleFix>,
    /// Position shown to readers; leads or lags `last_fix` while interpolating
    pub displayed_position: GpsPoint,
    /// Last confirmed stop
    pub current_stop: Option<String>,
    pub current_stop_since: Option<DateTime<Utc>>,
    /// Whether the latest fix is inside the radius of `current_stop`
    pub within_stop_radius: bool,
    pub route_color: RouteColor,
    pub window: FixWindow,
    pub laps: LapTracker,
    pub interpolation: InterpolationState,
}

impl VehicleState {
    pub fn new(vehicle_id: impl Into<String>, window_capacity: usize) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            bus_id: None,
            last_fix: None,
            displayed_position: GpsPoint::new(0.0, 0.0),
            current_stop: None,
            current_stop_since: None,
            within_stop_radius: false,
            route_color: RouteColor::Unknown,
            window: FixWindow::new(window_capacity),
            laps: LapTracker::new(),
            interpolation: InterpolationState::new(),
        }
    }

    pub fn has_position(&self) -> bool {
        self.last_fix.is_some()
    }

    /// Human-readable position relative to the last confirmed stop.
    pub fn status_message(&self) -> Option<String> {
        let stop = self.current_stop.as_deref()?;
        if self.within_stop_radius {
            Some(format!("Arriving at {}", stop))
        } else {
            Some(format!("Depart from {}", stop))
        }
    }

    /// Point-in-time copy for readers.
    pub fn snapshot(&self, catalog: &RouteCatalog, geometry: &RouteGeometryStore) -> VehicleSnapshot {
        let position = self.has_position().then_some(self.displayed_position);
        let next_stop = self
            .current_stop
            .as_deref()
            .and_then(|stop| catalog.next_stop(self.route_color, stop))
            .map(str::to_string);
        let route_distance_m = position.and_then(|p| {
            geometry
                .best_route(&p, self.route_color)
                .map(|line| line.distance_to_route(&p))
        });
        let active = self.laps.active();

        VehicleSnapshot {
            vehicle_id: self.vehicle_id.clone(),
            bus_id: self.bus_id,
            position,
            last_fix: self.last_fix.as_ref().map(|f| f.position),
            last_update: self.last_fix.as_ref().map(|f| f.timestamp),
            speed_kmh: self.interpolation.speed_mps * 3.6,
            bearing_deg: normalize_bearing(self.interpolation.bearing_deg),
            current_stop: self.current_stop.clone(),
            next_stop,
            status_message: self.status_message(),
            route_color: self.route_color,
            active_lap: active.is_some(),
            lap_number: self.laps.active_lap_number(),
            visit_count: active.map_or(0, |lap| lap.history.len()),
            window_fill: self.window.len(),
            route_distance_m,
        }
    }
}

/// Read-only copy of a vehicle's state, safe to hand to other tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleSnapshot {
    pub vehicle_id: String,
    pub bus_id: Option<i64>,
    /// Displayed (possibly interpolated) position
    pub position: Option<GpsPoint>,
    pub last_fix: Option<GpsPoint>,
    pub last_update: Option<DateTime<Utc>>,
    pub speed_kmh: f64,
    pub bearing_deg: f64,
    pub current_stop: Option<String>,
    pub next_stop: Option<String>,
    pub status_message: Option<String>,
    pub route_color: RouteColor,
    pub active_lap: bool,
    pub lap_number: Option<u32>,
    pub visit_count: usize,
    pub window_fill: usize,
    /// Distance from the displayed position to the vehicle's route (or the nearest one)
    pub route_distance_m: Option<f64>,
}

// ============================================================================
// Vehicle Table
// ============================================================================

/// Vehicle states keyed by vehicle id.
#[derive(Debug)]
pub struct VehicleTable {
    inner: Mutex<HashMap<String, VehicleState>>,
    window_capacity: usize,
}

impl VehicleTable {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            window_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VehicleState>> {
        // A panic mid-update leaves a usable map; keep serving it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` on a vehicle, creating its record on first use.
    pub fn with_vehicle<F, R>(&self, vehicle_id: &str, f: F) -> R
    where
        F: FnOnce(&mut VehicleState) -> R,
    {
        let mut table = self.lock();
        let capacity = self.window_capacity;
        let state = table
            .entry(vehicle_id.to_string())
            .or_insert_with(|| VehicleState::new(vehicle_id, capacity));
        f(state)
    }

    /// Run `f` on a vehicle only if it is already known.
    pub fn with_existing<F, R>(&self, vehicle_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut VehicleState) -> R,
    {
        self.lock().get_mut(vehicle_id).map(f)
    }

    /// Run `f` over every vehicle under a single lock.
    pub fn with_all<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<String, VehicleState>) -> R,
    {
        let mut table = self.lock();
        f(&mut *table)
    }

    pub fn get(&self, vehicle_id: &str) -> Option<VehicleState> {
        self.lock().get(vehicle_id).cloned()
    }

    pub fn vehicle_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Consistent snapshot of all vehicles, ordered by id.
    pub fn snapshot(
        &self,
        catalog: &RouteCatalog,
        geometry: &RouteGeometryStore,
    ) -> Vec<VehicleSnapshot> {
        let table = self.lock();
        let mut snapshots: Vec<VehicleSnapshot> = table
            .values()
            .map(|state| state.snapshot(catalog, geometry))
            .collect();
        drop(table);
        snapshots.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geofence::{campus_stops, GeofenceIndex};
    use crate::routes::campus_variants;

    fn catalog() -> RouteCatalog {
        let stops = GeofenceIndex::new(campus_stops()).unwrap();
        RouteCatalog::new(campus_variants(), &stops).unwrap()
    }

    #[test]
    fn test_lazy_creation() {
        let table = VehicleTable::new(10);
        assert!(table.is_empty());
        table.with_vehicle("bus-2", |v| v.route_color = RouteColor::Red);
        table.with_vehicle("bus-1", |_| ());
        assert_eq!(table.vehicle_ids(), vec!["bus-1", "bus-2"]);
        assert_eq!(table.get("bus-2").unwrap().route_color, RouteColor::Red);
        assert!(table.with_existing("bus-9", |_| ()).is_none());
        assert_eq!(table.get("bus-1").unwrap().window.capacity(), 10);
    }

    #[test]
    fn test_snapshot_status_and_next_stop() {
        let catalog = catalog();
        let geometry = RouteGeometryStore::new();
        let mut state = VehicleState::new("bus-1", 5);
        state.current_stop = Some("Stasiun UI".to_string());
        state.route_color = RouteColor::Red;
        state.within_stop_radius = true;

        let snap = state.snapshot(&catalog, &geometry);
        assert_eq!(snap.next_stop.as_deref(), Some("Fakultas Hukum"));
        assert_eq!(snap.status_message.as_deref(), Some("Arriving at Stasiun UI"));
        assert!(snap.position.is_none());
        assert!(snap.route_distance_m.is_none());

        state.within_stop_radius = false;
        state.route_color = RouteColor::Unknown;
        let snap = state.snapshot(&catalog, &geometry);
        assert_eq!(snap.status_message.as_deref(), Some("Depart from Stasiun UI"));
        assert!(snap.next_stop.is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let catalog = catalog();
        let geometry = RouteGeometryStore::new();
        let table = VehicleTable::new(5);
        table.with_vehicle("bus-1", |v| v.current_stop = Some("Menwa".to_string()));
        let before = table.snapshot(&catalog, &geometry);
        table.with_vehicle("bus-1", |v| v.current_stop = Some("FISIP".to_string()));
        assert_eq!(before[0].current_stop.as_deref(), Some("Menwa"));
    }
}
