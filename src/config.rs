//! Tracker configuration.
//!
//! Every threshold used by the pipeline lives here so it stays tunable.
//! Defaults reproduce the campus deployment; `from_env` layers the handful of
//! deployment-specific values on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TrackerError};

/// Geofence tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    /// A vehicle is "at" a stop when within this many meters of it.
    /// Default: 60.0
    pub proximity_threshold_m: f64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            proximity_threshold_m: 60.0,
        }
    }
}

/// Stop transitions that open and close laps.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LapRules {
    /// First stop of the lap-start pair.
    /// Default: "Asrama UI"
    pub start_stop: String,
    /// Second stop of the lap-start pair. Arriving here from `start_stop` opens a lap,
    /// and going from here back to `start_stop` closes one.
    /// Default: "Menwa"
    pub second_stop: String,
    /// Reaching this stop always closes the active lap.
    /// Default: "Parking"
    pub terminal_stop: String,
}

impl Default for LapRules {
    fn default() -> Self {
        Self {
            start_stop: "Asrama UI".to_string(),
            second_stop: "Menwa".to_string(),
            terminal_stop: "Parking".to_string(),
        }
    }
}

/// Rolling window used for lane reclassification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Number of distinct fixes kept per vehicle; the classifier is called once
    /// every `capacity` accepted fixes.
    /// Default: 50
    pub capacity: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

/// Dead-reckoning tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    /// Disable to display raw fixes only.
    /// Default: true
    pub enabled: bool,
    /// Ticker period in milliseconds.
    /// Default: 500
    pub tick_interval_ms: u64,
    /// Vehicles whose last real fix is older than this are frozen.
    /// Default: 20.0 seconds
    pub stale_after_secs: f64,
    /// Ceiling for estimated speed.
    /// Default: 25.0 km/h
    pub max_speed_kmh: f64,
    /// Estimated speeds below this are treated as stopped.
    /// Default: 0.5 m/s
    pub stopped_speed_mps: f64,
    /// Hard cap on displayed-position movement per tick.
    /// Default: 5.0 meters
    pub max_step_m: f64,
    /// A new fix within this distance of the displayed position snaps it.
    /// Default: 20.0 meters
    pub snap_distance_m: f64,
    /// Within this distance of the last real fix, steps shrink to a third of the gap
    /// and the heading aims at the fix.
    /// Default: 30.0 meters
    pub approach_distance_m: f64,
    /// Route-constrained steps farther than this from the polyline are rejected.
    /// Default: 30.0 meters
    pub max_route_deviation_m: f64,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 500,
            stale_after_secs: 20.0,
            max_speed_kmh: 25.0,
            stopped_speed_mps: 0.5,
            max_step_m: 5.0,
            snap_distance_m: 20.0,
            approach_distance_m: 30.0,
            max_route_deviation_m: 30.0,
        }
    }
}

impl InterpolationConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn max_speed_mps(&self) -> f64 {
        crate::geo_utils::kmh_to_mps(self.max_speed_kmh)
    }
}

/// Live feed connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Websocket URL of the upstream GPS feed.
    /// Default: "" (must be provided)
    pub url: String,
    /// Fixed delay before reconnecting after a dial/read failure.
    /// Default: 3000 ms
    pub reconnect_delay_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_delay_ms: 3000,
        }
    }
}

impl FeedConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Top-level tracker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub geofence: GeofenceConfig,
    pub laps: LapRules,
    pub window: WindowConfig,
    pub interpolation: InterpolationConfig,
    pub feed: FeedConfig,
    /// Deadline for each collaborator call (lap store, registry, classifier).
    /// Default: 5000 ms
    pub collaborator_timeout_ms: u64,
    /// Base URL of the lane classification service; reclassification is skipped when unset.
    /// Default: None
    pub classifier_url: Option<String>,
    /// Endpoint receiving lap start/end events as JSON.
    /// Default: None
    pub lap_event_url: Option<String>,
    /// Route geometry fixture; interpolation falls back to heading-only when unset.
    /// Default: None
    pub route_fixture_path: Option<PathBuf>,
    /// UTC offset used when rendering visit history timestamps.
    /// Default: 7 (Asia/Jakarta)
    pub display_utc_offset_hours: i32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            geofence: GeofenceConfig::default(),
            laps: LapRules::default(),
            window: WindowConfig::default(),
            interpolation: InterpolationConfig::default(),
            feed: FeedConfig::default(),
            collaborator_timeout_ms: 5000,
            classifier_url: None,
            lap_event_url: None,
            route_fixture_path: None,
            display_utc_offset_hours: 7,
        }
    }
}

impl TrackerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TrackerError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: TrackerConfig = serde_json::from_str(&raw).map_err(|e| {
            TrackerError::config(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Build from the process environment.
    ///
    /// `TRACKER_CONFIG` names an optional JSON base file; `FEED_URL`, `RM_API`,
    /// `LAP_EVENT_URL`, `ROUTE_FIXTURE_PATH` and `INTERPOLATION_INTERVAL_MS`
    /// override individual fields.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("TRACKER_CONFIG") {
            Some(path) if !path.is_empty() => Self::from_json_file(path)?,
            _ => Self::default(),
        };

        if let Some(url) = lookup("FEED_URL") {
            config.feed.url = url;
        }
        if let Some(url) = lookup("RM_API").filter(|s| !s.is_empty()) {
            config.classifier_url = Some(url);
        }
        if let Some(url) = lookup("LAP_EVENT_URL").filter(|s| !s.is_empty()) {
            config.lap_event_url = Some(url);
        }
        if let Some(path) = lookup("ROUTE_FIXTURE_PATH").filter(|s| !s.is_empty()) {
            config.route_fixture_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = lookup("INTERPOLATION_INTERVAL_MS") {
            config.interpolation.tick_interval_ms = ms.trim().parse().map_err(|_| {
                TrackerError::config(format!("INTERPOLATION_INTERVAL_MS is not a number: {}", ms))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.window.capacity == 0 {
            return Err(TrackerError::config("window.capacity must be at least 1"));
        }
        if !(self.geofence.proximity_threshold_m > 0.0) {
            return Err(TrackerError::config(
                "geofence.proximity_threshold_m must be positive",
            ));
        }
        let interp = &self.interpolation;
        if interp.tick_interval_ms == 0 {
            return Err(TrackerError::config(
                "interpolation.tick_interval_ms must be positive",
            ));
        }
        for (name, value) in [
            ("stale_after_secs", interp.stale_after_secs),
            ("max_speed_kmh", interp.max_speed_kmh),
            ("max_step_m", interp.max_step_m),
            ("snap_distance_m", interp.snap_distance_m),
            ("max_route_deviation_m", interp.max_route_deviation_m),
        ] {
            if !(value > 0.0) {
                return Err(TrackerError::config(format!(
                    "interpolation.{} must be positive",
                    name
                )));
            }
        }
        if self.laps.start_stop.is_empty()
            || self.laps.second_stop.is_empty()
            || self.laps.terminal_stop.is_empty()
        {
            return Err(TrackerError::config("lap rules need all three stop names"));
        }
        if !(-12..=14).contains(&self.display_utc_offset_hours) {
            return Err(TrackerError::config("display_utc_offset_hours out of range"));
        }
        Ok(())
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}
