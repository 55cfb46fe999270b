//! Nearest-stop lookup over a small static table of named stops.
//!
//! A linear scan is used on purpose: the campus has under twenty stops and the
//! query runs once per fix.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::geo_utils::haversine_distance;
use crate::GpsPoint;

/// A named physical waypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub name: String,
    pub position: GpsPoint,
}

impl Stop {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            position: GpsPoint::new(latitude, longitude),
        }
    }
}

/// Result of a nearest-stop query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopMatch<'a> {
    pub name: &'a str,
    pub distance_m: f64,
}

/// Immutable stop table with nearest-neighbour queries.
#[derive(Debug, Clone)]
pub struct GeofenceIndex {
    stops: Vec<Stop>,
}

impl GeofenceIndex {
    /// Build the index. Stop names must be unique and coordinates valid.
    pub fn new(stops: Vec<Stop>) -> Result<Self> {
        if stops.is_empty() {
            return Err(TrackerError::config("stop table is empty"));
        }
        let mut seen = HashSet::with_capacity(stops.len());
        for stop in &stops {
            if !seen.insert(stop.name.as_str()) {
                return Err(TrackerError::config(format!(
                    "duplicate stop name '{}'",
                    stop.name
                )));
            }
            if !stop.position.is_valid() {
                return Err(TrackerError::config(format!(
                    "stop '{}' has invalid coordinates",
                    stop.name
                )));
            }
        }
        Ok(Self { stops })
    }

    /// Closest stop to `point` by great-circle distance.
    ///
    /// Ties go to the stop listed first. Returns `None` only for a non-finite query.
    pub fn nearest_stop(&self, point: &GpsPoint) -> Option<StopMatch<'_>> {
        if !point.latitude.is_finite() || !point.longitude.is_finite() {
            return None;
        }

        let mut best: Option<StopMatch<'_>> = None;
        for stop in &self.stops {
            let distance_m = haversine_distance(point, &stop.position);
            // strict less-than keeps the first minimum
            if best.map_or(true, |b| distance_m < b.distance_m) {
                best = Some(StopMatch {
                    name: &stop.name,
                    distance_m,
                });
            }
        }
        best
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stops.iter().any(|s| s.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Stop> {
        self.stops.iter().find(|s| s.name == name)
    }

    pub fn stops(&self) -> &[Stop] {
        &self.stops
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }
}

/// Stop table of the Universitas Indonesia campus loop.
pub fn campus_stops() -> Vec<Stop> {
    vec![
        Stop::new("Asrama UI", -6.348351370044594, 106.82976588606834),
        Stop::new("Menwa", -6.353471269466313, 106.83177955448627),
        Stop::new("Stasiun UI", -6.361052900888018, 106.83170076459645),
        Stop::new("Fakultas Psikologi", -6.36255935735158, 106.83111906051636),
        Stop::new("FISIP", -6.361574, 106.830172),
        Stop::new("Fakultas Ilmu Pengetahuan Budaya", -6.361254501381427, 106.82978868484497),
        Stop::new("Fakultas Ekonomi dan Bisnis", -6.35946048561971, 106.82582974433899),
        Stop::new("Fakultas Teknik", -6.361043911445512, 106.82325214147568),
        Stop::new("Vokasi", -6.366036735678631, 106.8216535449028),
        Stop::new("SOR", -6.366915739619239, 106.82448193430899),
        Stop::new("FMIPA", -6.369828304090281, 106.8257811293006),
        Stop::new("Fakultas Ilmu Keperawatan", -6.371008186217929, 106.8268945813179),
        Stop::new("Fakultas Kesehatan Masyarakat", -6.371677262480034, 106.8293622136116),
        Stop::new("RIK", -6.36987795182555, 106.8310546875),
        Stop::new("Balairung", -6.368212251024606, 106.83178257197142),
        Stop::new("MUI/Perpus UI", -6.3655942342627565, 106.83204710483551),
        Stop::new("Fakultas Hukum", -6.364901492199248, 106.83221206068993),
        Stop::new("Parking", -6.348922, 106.826476),
    ]
}
