//! # Shuttle Tracker
//!
//! Live GPS ingestion for a small campus shuttle fleet.
//!
//! This library turns a noisy stream of vehicle fixes into a consistent
//! per-vehicle state:
//! - Geofencing against a fixed table of named stops
//! - Route classification from consecutive stop visits
//! - Lap lifecycle tracking (open/close of loop traversals)
//! - Rolling-window lane reclassification through an external classifier
//! - Smooth, route-constrained position interpolation between real fixes
//!
//! ## Features
//!
//! - **`http`** (default) - HTTP clients for the lane classifier and lap event push
//!
//! ## Quick Start
//!
//! ```rust
//! use shuttle_tracker::{GeofenceIndex, GpsPoint, RouteCatalog, RouteColor};
//! use shuttle_tracker::geofence::campus_stops;
//! use shuttle_tracker::routes::campus_variants;
//!
//! let stops = GeofenceIndex::new(campus_stops()).unwrap();
//! let nearest = stops.nearest_stop(&GpsPoint::new(-6.36105, 106.83170)).unwrap();
//! assert_eq!(nearest.name, "Stasiun UI");
//!
//! let catalog = RouteCatalog::new(campus_variants(), &stops).unwrap();
//! let color = catalog.classify_by_transition("Stasiun UI", "Fakultas Psikologi");
//! assert_eq!(color, RouteColor::Blue);
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TrackerError};

// Configuration
pub mod config;
pub use config::{
    FeedConfig, GeofenceConfig, InterpolationConfig, LapRules, TrackerConfig, WindowConfig,
};

// Geographic utilities (distance, bearing, destination)
pub mod geo_utils;

// Nearest-stop lookup
pub mod geofence;
pub use geofence::{GeofenceIndex, Stop, StopMatch};

// Route variants and pair classification
pub mod routes;
pub use routes::{RouteCatalog, RouteVariant};

// Route polylines for constrained interpolation
pub mod geometry;
pub use geometry::{RouteGeometryStore, RoutePolyline, RoutePosition};

// Rolling fix window for lane reclassification
pub mod window;
pub use window::FixWindow;

// Lap state machine
pub mod laps;
pub use laps::{LapEvent, LapEventKind, LapKey, LapTracker, StopVisit, Visit, VisitHistory};

// Dead reckoning between fixes
pub mod interpolation;
pub use interpolation::{InterpolationState, TickOutcome};

// Per-vehicle state table
pub mod state;
pub use state::{VehicleSnapshot, VehicleState, VehicleTable};

// Collaborator seams (lap store, registry, classifier)
pub mod collaborators;
pub use collaborators::{
    CollaboratorHandle, Collaborators, InMemoryLapStore, InMemoryVehicleRegistry, LaneClassifier,
    LaneLabel, Lap, LapEventSink, LapNumberHook, LapStore, NewLap, RegisteredVehicle,
    VehicleRegistry,
};

// Live feed parsing and consumption
pub mod feed;
pub use feed::{parse_feed_message, FeedConsumer};

// HTTP collaborators
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{HttpLaneClassifier, HttpLapEventSink};

// Ingestion pipeline
pub mod engine;
pub use engine::{TrackerEngine, TrackerStats};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use shuttle_tracker::GpsPoint;
/// let point = GpsPoint::new(-6.3605, 106.8272); // Depok
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// Exact coordinate equality, used for duplicate-fix suppression.
    pub fn same_coordinates(&self, other: &GpsPoint) -> bool {
        self.latitude == other.latitude && self.longitude == other.longitude
    }
}

/// The loop variant a vehicle is running.
///
/// Two color families (blue, red), each with a normal and an express
/// (morning) schedule. `Unknown` is rendered as "grey".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RouteColor {
    Blue,
    ExpressBlue,
    Red,
    ExpressRed,
    #[default]
    #[serde(rename = "grey", alias = "unknown")]
    Unknown,
}

impl RouteColor {
    pub const VARIANTS: [RouteColor; 4] = [
        RouteColor::Blue,
        RouteColor::ExpressBlue,
        RouteColor::Red,
        RouteColor::ExpressRed,
    ];

    /// Collapse a variant into its family color (`Blue`, `Red` or `Unknown`).
    pub fn family(self) -> RouteColor {
        match self {
            RouteColor::Blue | RouteColor::ExpressBlue => RouteColor::Blue,
            RouteColor::Red | RouteColor::ExpressRed => RouteColor::Red,
            RouteColor::Unknown => RouteColor::Unknown,
        }
    }

    pub fn is_known(self) -> bool {
        self != RouteColor::Unknown
    }

    /// Wire label of the color.
    pub fn label(self) -> &'static str {
        match self {
            RouteColor::Blue => "blue",
            RouteColor::ExpressBlue => "express-blue",
            RouteColor::Red => "red",
            RouteColor::ExpressRed => "express-red",
            RouteColor::Unknown => "grey",
        }
    }

    /// Parse a wire label. Unrecognized labels map to `Unknown`.
    pub fn from_label(label: &str) -> RouteColor {
        match label.trim().to_ascii_lowercase().as_str() {
            "blue" => RouteColor::Blue,
            "express-blue" => RouteColor::ExpressBlue,
            "red" => RouteColor::Red,
            "express-red" => RouteColor::ExpressRed,
            _ => RouteColor::Unknown,
        }
    }
}

impl fmt::Display for RouteColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One sample from the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleFix {
    /// Vehicle identity (the tracker IMEI)
    pub vehicle_id: String,
    pub position: GpsPoint,
    /// Speed reported by the tracker, km/h
    pub speed_kmh: f64,
    /// Time the fix was received
    pub timestamp: DateTime<Utc>,
}

impl VehicleFix {
    pub fn new(
        vehicle_id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        speed_kmh: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            position: GpsPoint::new(latitude, longitude),
            speed_kmh,
            timestamp,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(-6.3605, 106.8272).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_route_color_family() {
        assert_eq!(RouteColor::ExpressBlue.family(), RouteColor::Blue);
        assert_eq!(RouteColor::ExpressRed.family(), RouteColor::Red);
        assert_eq!(RouteColor::Red.family(), RouteColor::Red);
        assert_eq!(RouteColor::Unknown.family(), RouteColor::Unknown);
    }

    #[test]
    fn test_route_color_labels() {
        for color in RouteColor::VARIANTS {
            assert_eq!(RouteColor::from_label(color.label()), color);
        }
        assert_eq!(RouteColor::from_label("grey"), RouteColor::Unknown);
        assert_eq!(RouteColor::from_label("purple"), RouteColor::Unknown);
    }

    #[test]
    fn test_route_color_serde() {
        let json = serde_json::to_string(&RouteColor::ExpressRed).unwrap();
        assert_eq!(json, "\"express-red\"");
        let json = serde_json::to_string(&RouteColor::Unknown).unwrap();
        assert_eq!(json, "\"grey\"");
        let parsed: RouteColor = serde_json::from_str("\"unknown\"").unwrap();
        assert_eq!(parsed, RouteColor::Unknown);
    }
}
