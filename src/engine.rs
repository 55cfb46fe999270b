//! # Tracker Engine
//!
//! The ingestion pipeline and everything it owns.
//!
//! ## Architecture
//!
//! The engine is shared as `Arc<TrackerEngine>` between:
//! - the feed loop, which calls [`TrackerEngine::ingest_message`] per payload
//! - the interpolation ticker ([`TrackerEngine::spawn_interpolation_ticker`])
//! - detached lane classification tasks
//! - readers ([`TrackerEngine::get_snapshot`], [`TrackerEngine::subscribe`])
//!
//! Per fix the pipeline runs geofencing, pair classification with hysteresis,
//! the lap state machine, the rolling window and the interpolation update, all
//! under one short table lock. Collaborator writes are queued afterwards and
//! never awaited by ingestion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::collaborators::{
    recorded_lap_count, CollaboratorHandle, Collaborators, LaneClassifier, LaneLabel,
    LapNumberHook, LapStore, NewLap, VehicleRegistry,
};
use crate::config::TrackerConfig;
use crate::error::{OptionExt, Result, TrackerError};
use crate::feed::parse_feed_message;
use crate::geofence::{campus_stops, GeofenceIndex, StopMatch};
use crate::geometry::RouteGeometryStore;
use crate::interpolation::TickOutcome;
use crate::laps::{ActiveLap, LapEvent, LapEventKind, LapTracker, StopVisit, VisitHistory};
use crate::routes::{campus_variants, RouteCatalog};
use crate::state::{VehicleSnapshot, VehicleState, VehicleTable};
use crate::{RouteColor, VehicleFix};

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    malformed_messages: AtomicU64,
    fixes: AtomicU64,
    stop_changes: AtomicU64,
    laps_started: AtomicU64,
    laps_completed: AtomicU64,
    classifications_requested: AtomicU64,
    lane_overrides: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Engine statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub vehicle_count: u32,
    pub messages: u64,
    pub malformed_messages: u64,
    pub fixes: u64,
    pub stop_changes: u64,
    pub laps_started: u64,
    pub laps_completed: u64,
    pub classifications_requested: u64,
    pub lane_overrides: u64,
}

/// Side effects of one fix, applied after the table lock is released.
#[derive(Debug, Default)]
struct FixOutcome {
    bus_id: Option<i64>,
    stop_changed: Option<String>,
    color_changed: Option<RouteColor>,
    lap_events: Vec<LapEvent>,
    /// First lap of a vehicle whose numbering was never read from the store
    resolve_lap_numbers: bool,
    classify_window: Option<Vec<VehicleFix>>,
}

// ============================================================================
// Tracker Engine
// ============================================================================

pub struct TrackerEngine {
    config: TrackerConfig,
    display_offset: FixedOffset,
    geofence: GeofenceIndex,
    catalog: RouteCatalog,
    geometry: RouteGeometryStore,
    table: Arc<VehicleTable>,
    lap_store: Arc<dyn LapStore>,
    registry: Arc<dyn VehicleRegistry>,
    classifier: Option<Arc<dyn LaneClassifier>>,
    writes: CollaboratorHandle,
    snapshots: watch::Sender<Vec<VehicleSnapshot>>,
    counters: Counters,
}

impl TrackerEngine {
    /// Build an engine. Must be called inside a tokio runtime (it starts the
    /// collaborator worker).
    pub fn new(
        config: TrackerConfig,
        geofence: GeofenceIndex,
        catalog: RouteCatalog,
        geometry: RouteGeometryStore,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let display_offset = FixedOffset::east_opt(config.display_utc_offset_hours * 3600)
            .ok_or_config("display_utc_offset_hours out of range")?;

        let table = Arc::new(VehicleTable::new(config.window.capacity));
        let on_lap_numbers: LapNumberHook = {
            let table = Arc::clone(&table);
            Arc::new(move |vehicle_id: &str, offset: u32| {
                table.with_existing(vehicle_id, |state| state.laps.set_number_offset(offset));
            })
        };
        let (writes, _worker) = CollaboratorHandle::spawn(
            Arc::clone(&collaborators.lap_store),
            Arc::clone(&collaborators.registry),
            collaborators.event_sink.clone(),
            config.collaborator_timeout(),
            Some(on_lap_numbers),
        );
        let (snapshots, _) = watch::channel(Vec::new());

        info!(
            "[Tracker] Engine ready: {} stops, {} routes, {} polylines, classifier {}",
            geofence.len(),
            catalog.variants().len(),
            geometry.len(),
            if collaborators.classifier.is_some() { "on" } else { "off" }
        );

        Ok(Arc::new(Self {
            table,
            config,
            display_offset,
            geofence,
            catalog,
            geometry,
            lap_store: collaborators.lap_store,
            registry: collaborators.registry,
            classifier: collaborators.classifier,
            writes,
            snapshots,
            counters: Counters::default(),
        }))
    }

    /// Engine over the campus stop table and routes, with geometry loaded from
    /// `config.route_fixture_path` when set. Missing geometry only degrades
    /// interpolation.
    pub fn campus(config: TrackerConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let geofence = GeofenceIndex::new(campus_stops())?;
        let catalog = RouteCatalog::new(campus_variants(), &geofence)?;
        let geometry = match &config.route_fixture_path {
            Some(path) => RouteGeometryStore::from_fixture_file(path).unwrap_or_else(|e| {
                warn!("[Tracker] Route geometry unavailable ({}), using heading-only interpolation", e);
                RouteGeometryStore::new()
            }),
            None => RouteGeometryStore::new(),
        };
        Self::new(config, geofence, catalog, geometry, collaborators)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &RouteCatalog {
        &self.catalog
    }

    pub fn geofence(&self) -> &GeofenceIndex {
        &self.geofence
    }

    // ========================================================================
    // Startup
    // ========================================================================

    async fn call<'a, T>(&self, operation: &str, fut: BoxFuture<'a, Result<T>>) -> Result<T> {
        let timeout = self.config.collaborator_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| TrackerError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Reconcile with the registry and lap store after a (re)start.
    ///
    /// Every registered vehicle gets its stored color reset to grey, its bus id
    /// and lap count seeded, and any still-open lap resumed. Per-vehicle lap
    /// store failures are logged and skipped. Returns the number of vehicles seeded.
    pub async fn bootstrap(&self) -> Result<usize> {
        let vehicles = self.call("list vehicles", self.registry.list_vehicles()).await?;

        for vehicle in &vehicles {
            let id = vehicle.vehicle_id.as_str();
            self.writes.set_color(id, RouteColor::Unknown);

            let laps = self
                .call("list laps", self.lap_store.list_laps(id.to_string()))
                .await
                .unwrap_or_else(|e| {
                    warn!("[Tracker] Cannot list laps of {}: {}", id, e);
                    Vec::new()
                });
            let active = self
                .call("get active lap", self.lap_store.get_active_lap(id.to_string()))
                .await
                .unwrap_or_else(|e| {
                    warn!("[Tracker] Cannot read active lap of {}: {}", id, e);
                    None
                });

            let recorded = recorded_lap_count(&laps);
            let resumed = active.map(|lap| ActiveLap {
                history: VisitHistory::parse(&lap.visit_history, self.display_offset),
                key: lap.key,
                start_time: lap.start_time,
                start_color: lap.route_color,
            });
            if let Some(lap) = &resumed {
                info!("[Tracker] Resuming lap {}", lap.key);
            }

            self.table.with_vehicle(id, |state| {
                state.bus_id = vehicle.bus_id;
                state.route_color = RouteColor::Unknown;
                if state.current_stop.is_none() {
                    state.current_stop = vehicle.current_stop.clone();
                }
                state.laps = LapTracker::resume(recorded, resumed);
            });
        }

        info!("[Tracker] Bootstrapped {} vehicles", vehicles.len());
        self.publish_snapshot();
        Ok(vehicles.len())
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Parse and process one feed payload. Malformed payloads are logged,
    /// counted and returned as an error; the engine state is untouched.
    pub fn ingest_message(self: &Arc<Self>, payload: &[u8]) -> Result<usize> {
        bump(&self.counters.messages);
        match parse_feed_message(payload, Utc::now()) {
            Ok(fixes) => Ok(self.process_fixes(fixes)),
            Err(e) => {
                bump(&self.counters.malformed_messages);
                warn!("[Feed] Dropping malformed payload: {}", e);
                Err(e)
            }
        }
    }

    /// Run a batch of fixes through the pipeline, then publish a snapshot.
    pub fn process_fixes(self: &Arc<Self>, fixes: Vec<VehicleFix>) -> usize {
        let count = fixes.len();
        for fix in fixes {
            self.process_fix(fix);
        }
        self.publish_snapshot();
        count
    }

    /// Run one fix through the pipeline. Does not publish a snapshot.
    pub fn process_fix(self: &Arc<Self>, fix: VehicleFix) {
        bump(&self.counters.fixes);
        let within = self
            .geofence
            .nearest_stop(&fix.position)
            .filter(|m| m.distance_m < self.config.geofence.proximity_threshold_m);

        let outcome = self
            .table
            .with_vehicle(&fix.vehicle_id, |state| self.apply_fix(state, &fix, within));

        self.dispatch(&fix.vehicle_id, outcome);
    }

    fn apply_fix(&self, state: &mut VehicleState, fix: &VehicleFix, within: Option<StopMatch<'_>>) -> FixOutcome {
        let mut outcome = FixOutcome::default();
        state.within_stop_radius = within.is_some();

        if let Some(stop) = within.filter(|m| state.current_stop.as_deref() != Some(m.name)) {
            let previous = state.current_stop.replace(stop.name.to_string());
            let previous_at = state.current_stop_since.replace(fix.timestamp);
            let prev_name = previous.as_deref().unwrap_or("");
            info!(
                "[Tracker] {} stop {} -> {} ({:.0} m)",
                fix.vehicle_id,
                if prev_name.is_empty() { "-" } else { prev_name },
                stop.name,
                stop.distance_m
            );
            bump(&self.counters.stop_changes);
            outcome.stop_changed = Some(stop.name.to_string());

            let family = self.catalog.classify_by_transition(prev_name, stop.name);
            let color = self.resolve_color(state.route_color, family, prev_name, stop.name);
            if color != state.route_color {
                info!(
                    "[Tracker] {} route {} -> {}",
                    fix.vehicle_id, state.route_color, color
                );
                state.route_color = color;
                outcome.color_changed = Some(color);
            }

            let visit = StopVisit {
                vehicle_id: fix.vehicle_id.clone(),
                previous,
                previous_at,
                stop: stop.name.to_string(),
                at: fix.timestamp,
                color: state.route_color,
            };
            outcome.lap_events = state
                .laps
                .on_stop_visit(&visit, &self.config.laps, self.display_offset);
            let opened = outcome.lap_events.iter().any(|e| e.kind == LapEventKind::Start);
            if opened && !state.laps.is_seeded() {
                state.laps.mark_seeded();
                outcome.resolve_lap_numbers = true;
            }
        }

        if state.window.push(fix.clone()) && state.window.is_due() {
            outcome.classify_window = Some(state.window.snapshot());
        }

        let interpolation = &self.config.interpolation;
        if interpolation.enabled {
            let polyline = self.geometry.get(state.route_color);
            state
                .interpolation
                .on_real_fix(&mut state.displayed_position, fix, polyline, interpolation);
        } else {
            state.displayed_position = fix.position;
        }
        state.last_fix = Some(fix.clone());
        outcome.bus_id = state.bus_id;
        outcome
    }

    /// Apply hysteresis: a known family refines the variant, an ambiguous
    /// reading keeps whatever color the vehicle already had.
    fn resolve_color(&self, current: RouteColor, family: RouteColor, prev: &str, next: &str) -> RouteColor {
        if family.is_known() {
            self.catalog.refine_variant(family, prev, next, current)
        } else {
            current
        }
    }

    fn dispatch(self: &Arc<Self>, vehicle_id: &str, outcome: FixOutcome) {
        if let Some(stop) = &outcome.stop_changed {
            self.writes.set_current_stop(vehicle_id, stop);
        }
        if let Some(color) = outcome.color_changed {
            self.writes.set_color(vehicle_id, color);
        }
        if outcome.resolve_lap_numbers {
            self.writes.resolve_lap_numbers(vehicle_id);
        }
        for event in outcome.lap_events {
            self.dispatch_lap_event(event, outcome.bus_id);
        }
        if let Some(window) = outcome.classify_window {
            self.spawn_classification(vehicle_id.to_string(), window);
        }
    }

    fn dispatch_lap_event(&self, event: LapEvent, bus_id: Option<i64>) {
        match serde_json::to_string(&event) {
            Ok(json) => debug!("[Laps] Event {}", json),
            Err(e) => warn!("[Laps] Cannot serialize event for {}: {}", event.key, e),
        }

        match event.kind {
            LapEventKind::Start => {
                bump(&self.counters.laps_started);
                self.writes.create_lap(NewLap {
                    key: event.key.clone(),
                    bus_id,
                    start_time: event.start_time,
                    route_color: event.route_color,
                    visit_history: event.visit_history.clone(),
                });
                self.writes.push_event(event);
            }
            LapEventKind::Progress => {
                self.writes.append_visit(event.key, event.visit_history);
            }
            LapEventKind::End => {
                bump(&self.counters.laps_completed);
                self.writes
                    .append_visit(event.key.clone(), event.visit_history.clone());
                self.writes.close_lap(
                    event.key.clone(),
                    event.end_time.unwrap_or(event.timestamp),
                    event.route_color,
                );
                self.writes.push_event(event);
            }
        }
    }

    // ========================================================================
    // Lane Reclassification
    // ========================================================================

    fn spawn_classification(self: &Arc<Self>, vehicle_id: String, window: Vec<VehicleFix>) {
        let Some(classifier) = self.classifier.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("[LaneClassifier] No runtime, skipping {}", vehicle_id);
            return;
        };

        bump(&self.counters.classifications_requested);
        let engine = Arc::clone(self);
        let timeout = self.config.collaborator_timeout();
        debug!(
            "[LaneClassifier] Classifying {} over {} fixes",
            vehicle_id,
            window.len()
        );

        runtime.spawn(async move {
            let result =
                tokio::time::timeout(timeout, classifier.classify(vehicle_id.clone(), window)).await;
            match result {
                Ok(Ok(label)) => {
                    engine.apply_lane_label(&vehicle_id, label);
                }
                Ok(Err(e)) => warn!("[LaneClassifier] {} failed: {}", vehicle_id, e),
                Err(_) => warn!(
                    "[LaneClassifier] {} timed out after {:?}",
                    vehicle_id, timeout
                ),
            }
        });
    }

    /// Apply a classifier verdict. A known label overrides the stored color
    /// family; `Unknown` changes nothing. Returns the new color if it changed.
    pub fn apply_lane_label(&self, vehicle_id: &str, label: LaneLabel) -> Option<RouteColor> {
        if label == LaneLabel::Unknown {
            debug!("[LaneClassifier] {} unresolved", vehicle_id);
            return None;
        }

        let changed = self
            .table
            .with_existing(vehicle_id, |state| {
                let color = self
                    .catalog
                    .refine_variant(label.family(), "", "", state.route_color);
                (color != state.route_color).then(|| {
                    state.route_color = color;
                    color
                })
            })
            .flatten();

        match changed {
            Some(color) => {
                bump(&self.counters.lane_overrides);
                info!("[LaneClassifier] {} reclassified as {}", vehicle_id, color);
                self.writes.set_color(vehicle_id, color);
                self.publish_snapshot();
            }
            None => debug!("[LaneClassifier] {} confirmed as {:?}", vehicle_id, label),
        }
        changed
    }

    // ========================================================================
    // Interpolation
    // ========================================================================

    /// Advance every vehicle's displayed position. Returns how many moved.
    pub fn interpolation_tick(&self, now: DateTime<Utc>) -> usize {
        let config = &self.config.interpolation;
        if !config.enabled {
            return 0;
        }

        let moved = self.table.with_all(|vehicles| {
            let mut moved = 0;
            for state in vehicles.values_mut() {
                let polyline = self.geometry.get(state.route_color);
                let outcome = state.interpolation.tick(
                    &mut state.displayed_position,
                    now,
                    polyline,
                    config,
                );
                if matches!(outcome, TickOutcome::Moved { .. }) {
                    moved += 1;
                }
            }
            moved
        });

        if moved > 0 {
            self.publish_snapshot();
        }
        moved
    }

    /// Run [`Self::interpolation_tick`] on a fixed interval until `shutdown` turns true.
    pub fn spawn_interpolation_ticker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.interpolation.tick_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "[Interpolation] Ticker every {:?}",
                engine.config.interpolation.tick_interval()
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        engine.interpolation_tick(Utc::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("[Interpolation] Ticker stopped");
        })
    }

    // ========================================================================
    // Read Surface
    // ========================================================================

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.get_snapshot());
    }

    /// Point-in-time copy of every vehicle, ordered by id.
    pub fn get_snapshot(&self) -> Vec<VehicleSnapshot> {
        self.table.snapshot(&self.catalog, &self.geometry)
    }

    pub fn get_snapshot_by_id(&self, vehicle_id: &str) -> Option<VehicleSnapshot> {
        self.table
            .with_existing(vehicle_id, |state| state.snapshot(&self.catalog, &self.geometry))
    }

    /// Receive a snapshot after every processed batch, tick and lane override.
    pub fn subscribe(&self) -> watch::Receiver<Vec<VehicleSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Wait until all queued collaborator writes have been applied.
    pub async fn flush_collaborators(&self) {
        self.writes.flush().await;
    }

    pub fn stats(&self) -> TrackerStats {
        let c = &self.counters;
        TrackerStats {
            vehicle_count: self.table.len() as u32,
            messages: c.messages.load(Ordering::Relaxed),
            malformed_messages: c.malformed_messages.load(Ordering::Relaxed),
            fixes: c.fixes.load(Ordering::Relaxed),
            stop_changes: c.stop_changes.load(Ordering::Relaxed),
            laps_started: c.laps_started.load(Ordering::Relaxed),
            laps_completed: c.laps_completed.load(Ordering::Relaxed),
            classifications_requested: c.classifications_requested.load(Ordering::Relaxed),
            lane_overrides: c.lane_overrides.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
