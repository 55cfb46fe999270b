//! External collaborators of the tracker.
//!
//! - [`LapStore`]: durable lap records
//! - [`VehicleRegistry`]: the bus list with its displayed color and stop
//! - [`LaneClassifier`]: pattern recognition over a window of recent fixes
//! - [`LapEventSink`]: push target for lap start/end events
//!
//! Traits return boxed futures so implementations can be held as
//! `Arc<dyn Trait>`. Store and registry writes go through a
//! [`CollaboratorHandle`], which queues them to one worker task: the ingestion
//! loop never waits on them, and a lap close can never overtake its create.
//!
//! Vehicles first seen without a bootstrap number their laps from 1. Before
//! the first such lap is created the worker asks the store how many laps it
//! already holds and shifts every later key for that vehicle past them, so
//! stored history is never overwritten.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, TrackerError};
use crate::laps::{LapEvent, LapKey};
use crate::{RouteColor, VehicleFix};

// ============================================================================
// Data Types
// ============================================================================

/// Lap record as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lap {
    #[serde(flatten)]
    pub key: LapKey,
    pub bus_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub route_color: RouteColor,
    pub visit_history: String,
}

impl Lap {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Highest lap number in use, counting unnumbered gaps as laps.
pub fn recorded_lap_count(laps: &[Lap]) -> u32 {
    laps.iter()
        .map(|l| l.key.lap_number)
        .max()
        .unwrap_or(0)
        .max(laps.len() as u32)
}

/// Request to open a lap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLap {
    #[serde(flatten)]
    pub key: LapKey,
    pub bus_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub route_color: RouteColor,
    pub visit_history: String,
}

/// Vehicle as known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredVehicle {
    pub vehicle_id: String,
    pub bus_id: Option<i64>,
    pub color: RouteColor,
    pub current_stop: Option<String>,
}

impl RegisteredVehicle {
    pub fn new(vehicle_id: impl Into<String>, bus_id: Option<i64>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            bus_id,
            color: RouteColor::Unknown,
            current_stop: None,
        }
    }
}

/// Coarse lane label returned by the pattern-recognition service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneLabel {
    Blue,
    Red,
    Unknown,
}

impl LaneLabel {
    /// Parse a service label; anything unrecognized is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "blue" | "blue-lane" => LaneLabel::Blue,
            "red" | "red-lane" => LaneLabel::Red,
            _ => LaneLabel::Unknown,
        }
    }

    /// Color family of the label.
    pub fn family(self) -> RouteColor {
        match self {
            LaneLabel::Blue => RouteColor::Blue,
            LaneLabel::Red => RouteColor::Red,
            LaneLabel::Unknown => RouteColor::Unknown,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

pub trait LapStore: Send + Sync {
    fn create_lap(&self, lap: NewLap) -> BoxFuture<'_, Result<Lap>>;

    fn close_lap(
        &self,
        key: LapKey,
        end_time: DateTime<Utc>,
        route_color: RouteColor,
    ) -> BoxFuture<'_, Result<Lap>>;

    fn append_visit(&self, key: LapKey, visit_history: String) -> BoxFuture<'_, Result<()>>;

    fn get_active_lap(&self, vehicle_id: String) -> BoxFuture<'_, Result<Option<Lap>>>;

    fn list_laps(&self, vehicle_id: String) -> BoxFuture<'_, Result<Vec<Lap>>>;
}

pub trait VehicleRegistry: Send + Sync {
    fn list_vehicles(&self) -> BoxFuture<'_, Result<Vec<RegisteredVehicle>>>;

    fn set_color(&self, vehicle_id: String, color: RouteColor) -> BoxFuture<'_, Result<()>>;

    fn set_current_stop(&self, vehicle_id: String, stop: String) -> BoxFuture<'_, Result<()>>;
}

pub trait LaneClassifier: Send + Sync {
    /// Classify the oldest-first window of a vehicle's recent fixes.
    fn classify(&self, vehicle_id: String, fixes: Vec<VehicleFix>)
        -> BoxFuture<'_, Result<LaneLabel>>;
}

pub trait LapEventSink: Send + Sync {
    fn push(&self, event: LapEvent) -> BoxFuture<'_, Result<()>>;
}

/// The set of collaborators a tracker is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub lap_store: Arc<dyn LapStore>,
    pub registry: Arc<dyn VehicleRegistry>,
    /// Lane reclassification is skipped when absent
    pub classifier: Option<Arc<dyn LaneClassifier>>,
    pub event_sink: Option<Arc<dyn LapEventSink>>,
}

impl Collaborators {
    /// In-memory store and registry, no classifier or sink.
    pub fn in_memory() -> Self {
        Self {
            lap_store: Arc::new(InMemoryLapStore::new()),
            registry: Arc::new(InMemoryVehicleRegistry::new()),
            classifier: None,
            event_sink: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn LaneClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn LapEventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }
}

// ============================================================================
// In-Memory Implementations
// ============================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lap store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLapStore {
    laps: Mutex<Vec<Lap>>,
}

impl InMemoryLapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate, e.g. to simulate laps recorded before a restart.
    pub fn with_laps(laps: Vec<Lap>) -> Self {
        Self {
            laps: Mutex::new(laps),
        }
    }

    pub fn all(&self) -> Vec<Lap> {
        lock(&self.laps).clone()
    }

    fn update<F>(&self, key: &LapKey, f: F) -> Result<Lap>
    where
        F: FnOnce(&mut Lap),
    {
        let mut laps = lock(&self.laps);
        let lap = laps
            .iter_mut()
            .find(|l| &l.key == key)
            .ok_or_else(|| TrackerError::collaborator("lap store", format!("no lap {}", key)))?;
        f(lap);
        Ok(lap.clone())
    }
}

impl LapStore for InMemoryLapStore {
    fn create_lap(&self, new: NewLap) -> BoxFuture<'_, Result<Lap>> {
        let lap = Lap {
            key: new.key,
            bus_id: new.bus_id,
            start_time: new.start_time,
            end_time: None,
            route_color: new.route_color,
            visit_history: new.visit_history,
        };
        let mut laps = lock(&self.laps);
        let result = if laps.iter().any(|l| l.key == lap.key) {
            Err(TrackerError::collaborator(
                "lap store",
                format!("lap {} already exists", lap.key),
            ))
        } else {
            laps.push(lap.clone());
            Ok(lap)
        };
        Box::pin(future::ready(result))
    }

    fn close_lap(
        &self,
        key: LapKey,
        end_time: DateTime<Utc>,
        route_color: RouteColor,
    ) -> BoxFuture<'_, Result<Lap>> {
        let result = self.update(&key, |lap| {
            lap.end_time = Some(end_time);
            lap.route_color = route_color;
        });
        Box::pin(future::ready(result))
    }

    fn append_visit(&self, key: LapKey, visit_history: String) -> BoxFuture<'_, Result<()>> {
        let result = self
            .update(&key, |lap| lap.visit_history = visit_history)
            .map(|_| ());
        Box::pin(future::ready(result))
    }

    fn get_active_lap(&self, vehicle_id: String) -> BoxFuture<'_, Result<Option<Lap>>> {
        let active = lock(&self.laps)
            .iter()
            .filter(|l| l.key.vehicle_id == vehicle_id && l.is_active())
            .max_by_key(|l| l.key.lap_number)
            .cloned();
        Box::pin(future::ready(Ok(active)))
    }

    fn list_laps(&self, vehicle_id: String) -> BoxFuture<'_, Result<Vec<Lap>>> {
        let mut laps: Vec<Lap> = lock(&self.laps)
            .iter()
            .filter(|l| l.key.vehicle_id == vehicle_id)
            .cloned()
            .collect();
        laps.sort_by_key(|l| l.key.lap_number);
        Box::pin(future::ready(Ok(laps)))
    }
}

/// Vehicle registry kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryVehicleRegistry {
    vehicles: Mutex<HashMap<String, RegisteredVehicle>>,
}

impl InMemoryVehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vehicles(vehicles: Vec<RegisteredVehicle>) -> Self {
        Self {
            vehicles: Mutex::new(
                vehicles
                    .into_iter()
                    .map(|v| (v.vehicle_id.clone(), v))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, vehicle_id: &str) -> Option<RegisteredVehicle> {
        lock(&self.vehicles).get(vehicle_id).cloned()
    }

    fn upsert<F>(&self, vehicle_id: String, f: F)
    where
        F: FnOnce(&mut RegisteredVehicle),
    {
        let mut vehicles = lock(&self.vehicles);
        let entry = vehicles
            .entry(vehicle_id.clone())
            .or_insert_with(|| RegisteredVehicle::new(vehicle_id, None));
        f(entry);
    }
}

impl VehicleRegistry for InMemoryVehicleRegistry {
    fn list_vehicles(&self) -> BoxFuture<'_, Result<Vec<RegisteredVehicle>>> {
        let mut vehicles: Vec<RegisteredVehicle> = lock(&self.vehicles).values().cloned().collect();
        vehicles.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        Box::pin(future::ready(Ok(vehicles)))
    }

    fn set_color(&self, vehicle_id: String, color: RouteColor) -> BoxFuture<'_, Result<()>> {
        self.upsert(vehicle_id, |v| v.color = color);
        Box::pin(future::ready(Ok(())))
    }

    fn set_current_stop(&self, vehicle_id: String, stop: String) -> BoxFuture<'_, Result<()>> {
        self.upsert(vehicle_id, |v| v.current_stop = Some(stop));
        Box::pin(future::ready(Ok(())))
    }
}

// ============================================================================
// Ordered Collaborator Worker
// ============================================================================

/// Called by the worker with `(vehicle_id, offset)` when a vehicle's lap
/// numbers are shifted past the laps already in the store.
pub type LapNumberHook = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// A queued collaborator write.
#[derive(Debug)]
pub enum StoreCommand {
    /// Look up the laps the store holds for a vehicle that was never
    /// bootstrapped, and number its laps after them from here on
    ResolveLapNumbers { vehicle_id: String },
    CreateLap(NewLap),
    CloseLap {
        key: LapKey,
        end_time: DateTime<Utc>,
        route_color: RouteColor,
    },
    AppendVisit {
        key: LapKey,
        visit_history: String,
    },
    SetColor {
        vehicle_id: String,
        color: RouteColor,
    },
    SetCurrentStop {
        vehicle_id: String,
        stop: String,
    },
    PushEvent(LapEvent),
    /// Resolves once every earlier command has been applied
    Flush(oneshot::Sender<()>),
}

impl StoreCommand {
    fn describe(&self) -> String {
        match self {
            StoreCommand::ResolveLapNumbers { vehicle_id } => {
                format!("resolve lap numbers of {}", vehicle_id)
            }
            StoreCommand::CreateLap(lap) => format!("create lap {}", lap.key),
            StoreCommand::CloseLap { key, .. } => format!("close lap {}", key),
            StoreCommand::AppendVisit { key, .. } => format!("append visit to {}", key),
            StoreCommand::SetColor { vehicle_id, color } => {
                format!("set color of {} to {}", vehicle_id, color)
            }
            StoreCommand::SetCurrentStop { vehicle_id, stop } => {
                format!("set stop of {} to {}", vehicle_id, stop)
            }
            StoreCommand::PushEvent(event) => format!("push {:?} for {}", event.kind, event.key),
            StoreCommand::Flush(_) => "flush".to_string(),
        }
    }
}

struct Worker {
    lap_store: Arc<dyn LapStore>,
    registry: Arc<dyn VehicleRegistry>,
    event_sink: Option<Arc<dyn LapEventSink>>,
    timeout: Duration,
    /// Per-vehicle shift applied to every lap key
    lap_offsets: HashMap<String, u32>,
    on_lap_numbers: Option<LapNumberHook>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
        while let Some(mut command) = rx.recv().await {
            if let StoreCommand::Flush(done) = command {
                let _ = done.send(());
                continue;
            }

            self.shift_lap_key(&mut command);
            let description = command.describe();
            match tokio::time::timeout(self.timeout, self.apply(command)).await {
                Ok(Ok(())) => debug!("[Collaborators] {}", description),
                Ok(Err(e)) => warn!("[Collaborators] {} failed: {}", description, e),
                Err(_) => {
                    let e = TrackerError::Timeout {
                        operation: description,
                        timeout_ms: self.timeout.as_millis() as u64,
                    };
                    warn!("[Collaborators] {}", e);
                }
            }
        }
        debug!("[Collaborators] Worker stopped");
    }

    fn shift_lap_key(&self, command: &mut StoreCommand) {
        let key = match command {
            StoreCommand::CreateLap(lap) => &mut lap.key,
            StoreCommand::CloseLap { key, .. } | StoreCommand::AppendVisit { key, .. } => key,
            StoreCommand::PushEvent(event) => &mut event.key,
            _ => return,
        };
        if let Some(offset) = self.lap_offsets.get(&key.vehicle_id) {
            key.lap_number += *offset;
        }
    }

    async fn resolve_lap_numbers(&mut self, vehicle_id: String) -> Result<()> {
        let laps = self.lap_store.list_laps(vehicle_id.clone()).await?;
        let offset = recorded_lap_count(&laps);
        if offset == 0 {
            return Ok(());
        }

        info!(
            "[Collaborators] {} already has {} stored laps, numbering continues from {}",
            vehicle_id,
            offset,
            offset + 1
        );
        if let Some(hook) = &self.on_lap_numbers {
            hook(&vehicle_id, offset);
        }
        self.lap_offsets.insert(vehicle_id, offset);
        Ok(())
    }

    async fn apply(&mut self, command: StoreCommand) -> Result<()> {
        match command {
            StoreCommand::ResolveLapNumbers { vehicle_id } => {
                self.resolve_lap_numbers(vehicle_id).await
            }
            StoreCommand::CreateLap(lap) => self.lap_store.create_lap(lap).await.map(|_| ()),
            StoreCommand::CloseLap {
                key,
                end_time,
                route_color,
            } => self
                .lap_store
                .close_lap(key, end_time, route_color)
                .await
                .map(|_| ()),
            StoreCommand::AppendVisit { key, visit_history } => {
                self.lap_store.append_visit(key, visit_history).await
            }
            StoreCommand::SetColor { vehicle_id, color } => {
                self.registry.set_color(vehicle_id, color).await
            }
            StoreCommand::SetCurrentStop { vehicle_id, stop } => {
                self.registry.set_current_stop(vehicle_id, stop).await
            }
            StoreCommand::PushEvent(event) => match &self.event_sink {
                Some(sink) => sink.push(event).await,
                None => Ok(()),
            },
            StoreCommand::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        }
    }
}

/// Sender side of the collaborator worker. Cheap to clone.
#[derive(Clone)]
pub struct CollaboratorHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl CollaboratorHandle {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(
        lap_store: Arc<dyn LapStore>,
        registry: Arc<dyn VehicleRegistry>,
        event_sink: Option<Arc<dyn LapEventSink>>,
        timeout: Duration,
        on_lap_numbers: Option<LapNumberHook>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            lap_store,
            registry,
            event_sink,
            timeout,
            lap_offsets: HashMap::new(),
            on_lap_numbers,
        };
        let handle = tokio::spawn(worker.run(rx));
        (Self { tx }, handle)
    }

    /// Queue a command. Never blocks; a stopped worker only logs.
    pub fn send(&self, command: StoreCommand) {
        if let Err(e) = self.tx.send(command) {
            warn!("[Collaborators] Worker gone, dropped: {}", e.0.describe());
        }
    }

    pub fn resolve_lap_numbers(&self, vehicle_id: &str) {
        self.send(StoreCommand::ResolveLapNumbers {
            vehicle_id: vehicle_id.to_string(),
        });
    }

    pub fn create_lap(&self, lap: NewLap) {
        self.send(StoreCommand::CreateLap(lap));
    }

    pub fn close_lap(&self, key: LapKey, end_time: DateTime<Utc>, route_color: RouteColor) {
        self.send(StoreCommand::CloseLap {
            key,
            end_time,
            route_color,
        });
    }

    pub fn append_visit(&self, key: LapKey, visit_history: String) {
        self.send(StoreCommand::AppendVisit { key, visit_history });
    }

    pub fn set_color(&self, vehicle_id: &str, color: RouteColor) {
        self.send(StoreCommand::SetColor {
            vehicle_id: vehicle_id.to_string(),
            color,
        });
    }

    pub fn set_current_stop(&self, vehicle_id: &str, stop: &str) {
        self.send(StoreCommand::SetCurrentStop {
            vehicle_id: vehicle_id.to_string(),
            stop: stop.to_string(),
        });
    }

    pub fn push_event(&self, event: LapEvent) {
        self.send(StoreCommand::PushEvent(event));
    }

    /// Wait until every command queued so far has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(StoreCommand::Flush(done));
        let _ = wait.await;
    }
}
