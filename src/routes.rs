//! Route catalog and stop-pair classification.
//!
//! Each variant is an ordered stop sequence. Its adjacency set holds every
//! consecutive `(prev, next)` pair plus the wrap-around pair from the last stop
//! back to the first, so classification is a hash lookup per variant.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::geofence::GeofenceIndex;
use crate::RouteColor;

/// One of the four loop variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteVariant {
    pub color: RouteColor,
    /// Stops in travel order. Names may repeat (loop closure).
    pub stops: Vec<String>,
}

impl RouteVariant {
    pub fn new(color: RouteColor, stops: &[&str]) -> Self {
        Self {
            color,
            stops: stops.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn adjacency(&self) -> HashSet<(String, String)> {
        let mut pairs: HashSet<(String, String)> = self
            .stops
            .windows(2)
            .map(|w| (w[0].clone(), w[1].clone()))
            .collect();
        if let (Some(first), Some(last)) = (self.stops.first(), self.stops.last()) {
            if self.stops.len() > 1 {
                pairs.insert((last.clone(), first.clone()));
            }
        }
        pairs
    }
}

/// Immutable route catalog with precomputed adjacency sets.
#[derive(Debug, Clone)]
pub struct RouteCatalog {
    variants: Vec<RouteVariant>,
    adjacency: HashMap<RouteColor, HashSet<(String, String)>>,
}

impl RouteCatalog {
    /// Build the catalog, checking that each color appears once and every
    /// stop name exists in the stop table.
    pub fn new(variants: Vec<RouteVariant>, stops: &GeofenceIndex) -> Result<Self> {
        let mut adjacency = HashMap::with_capacity(variants.len());
        for variant in &variants {
            if !variant.color.is_known() {
                return Err(TrackerError::config("route variant cannot be grey"));
            }
            if variant.stops.len() < 2 {
                return Err(TrackerError::config(format!(
                    "route '{}' needs at least two stops",
                    variant.color
                )));
            }
            if let Some(missing) = variant.stops.iter().find(|s| !stops.contains(s)) {
                return Err(TrackerError::config(format!(
                    "route '{}' references unknown stop '{}'",
                    variant.color, missing
                )));
            }
            if adjacency.insert(variant.color, variant.adjacency()).is_some() {
                return Err(TrackerError::config(format!(
                    "route '{}' defined twice",
                    variant.color
                )));
            }
        }
        Ok(Self {
            variants,
            adjacency,
        })
    }

    fn contains_pair(&self, color: RouteColor, prev: &str, next: &str) -> bool {
        self.adjacency.get(&color).map_or(false, |pairs| {
            pairs.contains(&(prev.to_string(), next.to_string()))
        })
    }

    fn family_contains(&self, family: RouteColor, prev: &str, next: &str) -> bool {
        RouteColor::VARIANTS
            .iter()
            .filter(|c| c.family() == family)
            .any(|c| self.contains_pair(*c, prev, next))
    }

    /// Classify a stop transition into a color family.
    ///
    /// Returns `Blue` or `Red` when exactly one family contains the ordered
    /// pair, `Unknown` when either stop is empty or the pair is in both or
    /// neither family.
    pub fn classify_by_transition(&self, prev: &str, next: &str) -> RouteColor {
        if prev.is_empty() || next.is_empty() {
            return RouteColor::Unknown;
        }
        let in_blue = self.family_contains(RouteColor::Blue, prev, next);
        let in_red = self.family_contains(RouteColor::Red, prev, next);
        match (in_blue, in_red) {
            (true, false) => RouteColor::Blue,
            (false, true) => RouteColor::Red,
            _ => RouteColor::Unknown,
        }
    }

    /// Pick the specific variant within `family` for a transition.
    ///
    /// Keeps `current` when it belongs to the family and contains the pair;
    /// otherwise prefers the normal variant, then the express one. When no
    /// variant of the family has the pair (lane classifier results), `current`
    /// is kept if it is in the family, else the normal variant is returned.
    pub fn refine_variant(
        &self,
        family: RouteColor,
        prev: &str,
        next: &str,
        current: RouteColor,
    ) -> RouteColor {
        let (normal, express) = match family.family() {
            RouteColor::Blue => (RouteColor::Blue, RouteColor::ExpressBlue),
            RouteColor::Red => (RouteColor::Red, RouteColor::ExpressRed),
            _ => return RouteColor::Unknown,
        };
        let current_in_family = current.family() == family.family();

        if current_in_family && self.contains_pair(current, prev, next) {
            return current;
        }
        if self.contains_pair(normal, prev, next) {
            return normal;
        }
        if self.contains_pair(express, prev, next) {
            return express;
        }
        if current_in_family {
            current
        } else {
            normal
        }
    }

    /// Stop following `current` on the given variant, wrapping at the end.
    pub fn next_stop(&self, color: RouteColor, current: &str) -> Option<&str> {
        let variant = self.variant(color)?;
        let idx = variant.stops.iter().position(|s| s == current)?;
        let next = (idx + 1) % variant.stops.len();
        Some(variant.stops[next].as_str())
    }

    pub fn variant(&self, color: RouteColor) -> Option<&RouteVariant> {
        self.variants.iter().find(|v| v.color == color)
    }

    pub fn variants(&self) -> &[RouteVariant] {
        &self.variants
    }
}

/// The four campus loop variants.
pub fn campus_variants() -> Vec<RouteVariant> {
    vec![
        RouteVariant::new(
            RouteColor::Blue,
            &[
                "Asrama UI",
                "Menwa",
                "Stasiun UI",
                "Fakultas Psikologi",
                "FISIP",
                "Fakultas Ilmu Pengetahuan Budaya",
                "Fakultas Ekonomi dan Bisnis",
                "Fakultas Teknik",
                "Vokasi",
                "SOR",
                "FMIPA",
                "Fakultas Ilmu Keperawatan",
                "Fakultas Kesehatan Masyarakat",
                "RIK",
                "Balairung",
                "MUI/Perpus UI",
                "Fakultas Hukum",
                "Stasiun UI",
                "Menwa",
                "Asrama UI",
                "Parking",
            ],
        ),
        RouteVariant::new(
            RouteColor::ExpressBlue,
            &[
                "Asrama UI",
                "Menwa",
                "Stasiun UI",
                "Fakultas Psikologi",
                "FISIP",
                "Fakultas Ilmu Pengetahuan Budaya",
                "Fakultas Ekonomi dan Bisnis",
                "Fakultas Teknik",
                "Vokasi",
                "SOR",
                "FMIPA",
                "Fakultas Ilmu Keperawatan",
                "Fakultas Kesehatan Masyarakat",
                "RIK",
                "Balairung",
                "MUI/Perpus UI",
                "Fakultas Hukum",
                "Fakultas Psikologi",
                "FISIP",
                "Fakultas Ilmu Pengetahuan Budaya",
                "Fakultas Ekonomi dan Bisnis",
                "Fakultas Teknik",
                "Parking",
            ],
        ),
        RouteVariant::new(
            RouteColor::Red,
            &[
                "Asrama UI",
                "Menwa",
                "Stasiun UI",
                "Fakultas Hukum",
                "Balairung",
                "RIK",
                "Fakultas Kesehatan Masyarakat",
                "Fakultas Ilmu Keperawatan",
                "FMIPA",
                "SOR",
                "Vokasi",
                "Fakultas Teknik",
                "Fakultas Ekonomi dan Bisnis",
                "Fakultas Ilmu Pengetahuan Budaya",
                "FISIP",
                "Fakultas Psikologi",
                "Stasiun UI",
                "Menwa",
                "Asrama UI",
                "Parking",
            ],
        ),
        RouteVariant::new(
            RouteColor::ExpressRed,
            &[
                "Asrama UI",
                "Menwa",
                "Stasiun UI",
                "Fakultas Hukum",
                "Balairung",
                "RIK",
                "Fakultas Kesehatan Masyarakat",
                "Fakultas Ilmu Keperawatan",
                "FMIPA",
                "SOR",
                "Vokasi",
                "Fakultas Teknik",
                "Parking",
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geofence::{campus_stops, Stop};

    fn catalog() -> RouteCatalog {
        let stops = GeofenceIndex::new(campus_stops()).unwrap();
        RouteCatalog::new(campus_variants(), &stops).unwrap()
    }

    #[test]
    fn test_single_family_pairs_classify() {
        let catalog = catalog();
        // Blue goes Stasiun UI -> Psikologi, red goes Stasiun UI -> Hukum
        assert_eq!(
            catalog.classify_by_transition("Stasiun UI", "Fakultas Psikologi"),
            RouteColor::Blue
        );
        assert_eq!(
            catalog.classify_by_transition("Stasiun UI", "Fakultas Hukum"),
            RouteColor::Red
        );
        assert_eq!(
            catalog.classify_by_transition("Fakultas Psikologi", "Stasiun UI"),
            RouteColor::Red
        );
    }

    #[test]
    fn test_shared_pairs_are_grey() {
        let catalog = catalog();
        assert_eq!(
            catalog.classify_by_transition("Asrama UI", "Menwa"),
            RouteColor::Unknown
        );
        assert_eq!(
            catalog.classify_by_transition("Menwa", "Stasiun UI"),
            RouteColor::Unknown
        );
    }

    #[test]
    fn test_absent_and_empty_pairs_are_grey() {
        let catalog = catalog();
        assert_eq!(
            catalog.classify_by_transition("SOR", "Asrama UI"),
            RouteColor::Unknown
        );
        assert_eq!(catalog.classify_by_transition("", "Menwa"), RouteColor::Unknown);
        assert_eq!(catalog.classify_by_transition("Menwa", ""), RouteColor::Unknown);
    }

    #[test]
    fn test_every_single_family_pair_classifies() {
        let catalog = catalog();
        for variant in catalog.variants() {
            for pair in variant.adjacency() {
                let family = variant.color.family();
                let other = if family == RouteColor::Blue {
                    RouteColor::Red
                } else {
                    RouteColor::Blue
                };
                let in_other = catalog.family_contains(other, &pair.0, &pair.1);
                let expected = if in_other { RouteColor::Unknown } else { family };
                assert_eq!(
                    catalog.classify_by_transition(&pair.0, &pair.1),
                    expected,
                    "{:?}",
                    pair
                );
            }
        }
    }

    #[test]
    fn test_wrap_around_pair_included() {
        let stops = GeofenceIndex::new(vec![
            Stop::new("A", 0.0, 0.0),
            Stop::new("B", 0.0, 0.01),
            Stop::new("C", 0.0, 0.02),
        ])
        .unwrap();
        let catalog = RouteCatalog::new(
            vec![RouteVariant::new(RouteColor::Blue, &["A", "B", "C"])],
            &stops,
        )
        .unwrap();
        assert_eq!(catalog.classify_by_transition("C", "A"), RouteColor::Blue);
        assert_eq!(catalog.classify_by_transition("A", "C"), RouteColor::Unknown);
    }

    #[test]
    fn test_refine_variant() {
        let catalog = catalog();
        // Hukum -> Psikologi only exists on the express blue loop
        assert_eq!(
            catalog.refine_variant(
                RouteColor::Blue,
                "Fakultas Hukum",
                "Fakultas Psikologi",
                RouteColor::Unknown
            ),
            RouteColor::ExpressBlue
        );
        // Shared pair keeps the current variant
        assert_eq!(
            catalog.refine_variant(
                RouteColor::Blue,
                "FISIP",
                "Fakultas Ilmu Pengetahuan Budaya",
                RouteColor::ExpressBlue
            ),
            RouteColor::ExpressBlue
        );
        // Switching family defaults to the normal loop
        assert_eq!(
            catalog.refine_variant(
                RouteColor::Red,
                "Stasiun UI",
                "Fakultas Hukum",
                RouteColor::ExpressBlue
            ),
            RouteColor::Red
        );
    }

    #[test]
    fn test_next_stop_wraps() {
        let catalog = catalog();
        assert_eq!(
            catalog.next_stop(RouteColor::Red, "Stasiun UI"),
            Some("Fakultas Hukum")
        );
        assert_eq!(catalog.next_stop(RouteColor::Blue, "Parking"), Some("Asrama UI"));
        assert_eq!(catalog.next_stop(RouteColor::Unknown, "Menwa"), None);
    }

    #[test]
    fn test_unknown_stop_rejected() {
        let stops = GeofenceIndex::new(vec![Stop::new("A", 0.0, 0.0)]).unwrap();
        let result = RouteCatalog::new(
            vec![RouteVariant::new(RouteColor::Red, &["A", "Nowhere"])],
            &stops,
        );
        assert!(matches!(result, Err(TrackerError::Config { .. })));
    }
}
