//! # Interpolation Engine
//!
//! Dead reckoning of each vehicle's displayed position between sparse real fixes.
//!
//! Real fixes update the speed and bearing estimates. A fix close to the
//! displayed position (or one arriving while the display is not moving) snaps
//! the display onto it; otherwise the display is left behind and pulled toward
//! the fix by subsequent ticks.
//!
//! Each tick moves the display by at most `max_step_m`. When a polyline exists
//! for the vehicle's color the step follows the route; if the display has
//! drifted too far from the route, or the route has run out, the step falls
//! back to a straight line along the bearing estimate.
//!
//! While catching up, every tick aims at the last real fix regardless of how
//! far away it is, so a display that ran ahead of a slowing vehicle is pulled
//! back instead of running further away.

use chrono::{DateTime, Utc};

use crate::config::InterpolationConfig;
use crate::geo_utils::{destination_point, haversine_distance, initial_bearing, kmh_to_mps};
use crate::geometry::RoutePolyline;
use crate::{GpsPoint, RouteColor, VehicleFix};

/// Minimum movement between fixes before the bearing estimate is refreshed.
const MIN_BEARING_DISTANCE_M: f64 = 1.0;

/// Catch-up ends once the display is this close to the last real fix.
const ARRIVAL_EPSILON_M: f64 = 0.5;

/// Where the displayed position sits on a route polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteAnchor {
    pub color: RouteColor,
    pub segment_index: usize,
    pub offset_m: f64,
}

/// What a tick did to one vehicle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Last real fix is older than the staleness bound
    Frozen,
    /// Nothing to do (no fix yet, stopped, or already at the target)
    Idle,
    Moved { distance_m: f64, on_route: bool },
}

/// Per-vehicle interpolation state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterpolationState {
    /// Estimated ground speed, m/s
    pub speed_mps: f64,
    /// Estimated heading, degrees in `[0, 360)`
    pub bearing_deg: f64,
    /// `bearing_deg` comes from two real fixes rather than the default
    pub has_bearing: bool,
    pub last_fix: Option<GpsPoint>,
    pub last_real_fix_time: Option<DateTime<Utc>>,
    pub last_interpolation_time: Option<DateTime<Utc>>,
    pub anchor: Option<RouteAnchor>,
    /// A tick has moved the display since it was last snapped
    pub interpolating: bool,
    /// The display was left behind the last real fix and is closing the gap
    pub catching_up: bool,
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn clamp_speed(speed_mps: f64, max_mps: f64) -> f64 {
    if speed_mps.is_finite() {
        speed_mps.clamp(0.0, max_mps)
    } else {
        0.0
    }
}

impl InterpolationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_index(&self) -> Option<usize> {
        self.anchor.map(|a| a.segment_index)
    }

    /// Fold a real fix into the estimates and decide whether to snap `displayed`.
    pub fn on_real_fix(
        &mut self,
        displayed: &mut GpsPoint,
        fix: &VehicleFix,
        polyline: Option<&RoutePolyline>,
        config: &InterpolationConfig,
    ) {
        let max_speed = config.max_speed_mps();

        match (self.last_fix, self.last_real_fix_time) {
            (Some(prev), Some(prev_time)) => {
                let distance = haversine_distance(&prev, &fix.position);
                let elapsed = seconds_between(prev_time, fix.timestamp);
                if elapsed > 0.0 {
                    self.speed_mps = clamp_speed(distance / elapsed, max_speed);
                }
                if distance > MIN_BEARING_DISTANCE_M {
                    self.bearing_deg = initial_bearing(&prev, &fix.position);
                    self.has_bearing = true;
                }

                let gap = haversine_distance(displayed, &fix.position);
                let snap = gap <= config.snap_distance_m
                    || !self.interpolating
                    || self.speed_mps < config.stopped_speed_mps;
                if snap {
                    self.snap_to(displayed, fix);
                } else {
                    self.catching_up = true;
                }
            }
            _ => {
                self.speed_mps = clamp_speed(kmh_to_mps(fix.speed_kmh), max_speed);
                self.bearing_deg = 0.0;
                self.has_bearing = false;
                self.snap_to(displayed, fix);
            }
        }

        self.last_fix = Some(fix.position);
        self.last_real_fix_time = Some(fix.timestamp);
        self.anchor = polyline.and_then(|line| self.anchor_on(line, displayed, config));
    }

    fn snap_to(&mut self, displayed: &mut GpsPoint, fix: &VehicleFix) {
        *displayed = fix.position;
        self.interpolating = false;
        self.catching_up = false;
        self.last_interpolation_time = Some(fix.timestamp);
    }

    /// Advance `displayed` for the time elapsed since the previous tick.
    pub fn tick(
        &mut self,
        displayed: &mut GpsPoint,
        now: DateTime<Utc>,
        polyline: Option<&RoutePolyline>,
        config: &InterpolationConfig,
    ) -> TickOutcome {
        let (Some(last_fix), Some(last_time)) = (self.last_fix, self.last_real_fix_time) else {
            return TickOutcome::Idle;
        };

        let since = self.last_interpolation_time.unwrap_or(last_time);
        self.last_interpolation_time = Some(now);

        if seconds_between(last_time, now) > config.stale_after_secs {
            return TickOutcome::Frozen;
        }
        if self.speed_mps < config.stopped_speed_mps {
            return TickOutcome::Idle;
        }

        let dt = seconds_between(since, now).max(0.0);
        let speed = self.speed_mps.min(config.max_speed_mps());
        let mut step = (speed * dt).min(config.max_step_m);

        let gap = haversine_distance(displayed, &last_fix);
        if self.catching_up && gap < ARRIVAL_EPSILON_M {
            self.catching_up = false;
        }
        let chasing = self.catching_up;
        if chasing {
            if gap <= config.approach_distance_m {
                step = step.min(gap / 3.0);
            }
            step = step.min(gap);
        }
        if !(step > 0.0) {
            return TickOutcome::Idle;
        }

        let start = *displayed;
        let route_move = polyline
            .and_then(|line| self.route_step(line, &start, step, config))
            // a route step that widens the gap is running away from the fix
            .filter(|(point, _)| !chasing || haversine_distance(point, &last_fix) < gap);
        let on_route = match route_move {
            Some((point, anchor)) => {
                *displayed = point;
                self.anchor = Some(anchor);
                true
            }
            None => {
                let bearing = if chasing {
                    initial_bearing(&start, &last_fix)
                } else {
                    self.bearing_deg
                };
                *displayed = destination_point(&start, bearing, step);
                self.anchor = None;
                false
            }
        };

        self.interpolating = true;
        TickOutcome::Moved {
            distance_m: haversine_distance(&start, displayed),
            on_route,
        }
    }

    /// Route-constrained step, or `None` when the route cannot be followed.
    fn route_step(
        &self,
        line: &RoutePolyline,
        from: &GpsPoint,
        step: f64,
        config: &InterpolationConfig,
    ) -> Option<(GpsPoint, RouteAnchor)> {
        let anchor = match self.anchor {
            Some(a) if a.color == line.color && a.segment_index < line.segment_count() => a,
            _ => self.anchor_on(line, from, config)?,
        };

        let anchor_point = line.point_at(anchor.segment_index, anchor.offset_m);
        if haversine_distance(from, &anchor_point) > config.max_route_deviation_m {
            return None;
        }

        let next = line.advance(anchor.segment_index, anchor.offset_m, step);
        if next.segment_index == anchor.segment_index && next.offset_m <= anchor.offset_m {
            // end of the line
            return None;
        }

        // Walk toward the route target without exceeding the step, so a display
        // slightly off the line converges onto it.
        let gap = haversine_distance(from, &next.point);
        let point = if gap <= step {
            next.point
        } else {
            destination_point(from, initial_bearing(from, &next.point), step)
        };
        if haversine_distance(&point, &next.point) > config.max_route_deviation_m {
            return None;
        }

        Some((
            point,
            RouteAnchor {
                color: line.color,
                segment_index: next.segment_index,
                offset_m: next.offset_m,
            },
        ))
    }

    /// Anchor on the segment running the way the vehicle is heading.
    fn anchor_on(
        &self,
        line: &RoutePolyline,
        point: &GpsPoint,
        config: &InterpolationConfig,
    ) -> Option<RouteAnchor> {
        let heading = self.has_bearing.then_some(self.bearing_deg);
        line.project_heading(point, heading, config.max_route_deviation_m)
            .map(|pos| RouteAnchor {
                color: line.color,
                segment_index: pos.segment_index,
                offset_m: pos.offset_m,
            })
    }
}
