//! # Lap State Machine
//!
//! Per-vehicle lap lifecycle driven by confirmed stop changes.
//!
//! A lap opens when a vehicle goes from the start stop straight to the second
//! stop, and closes when it reaches the terminal stop or goes from the second
//! stop back to the start stop. The tracker is pure in-memory state: it emits
//! [`LapEvent`]s and the caller forwards them to the lap store. A failed store
//! write never rolls the tracker back.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::LapRules;
use crate::RouteColor;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static VISIT_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s*(.+?)\s*\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\](?:\s*->)?")
        .expect("visit pattern is valid")
});

/// Identity of a lap: the vehicle plus its per-vehicle lap number.
///
/// Deterministic, so a close can be issued before the store has answered the
/// matching create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LapKey {
    pub vehicle_id: String,
    pub lap_number: u32,
}

impl LapKey {
    pub fn new(vehicle_id: impl Into<String>, lap_number: u32) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            lap_number,
        }
    }
}

impl fmt::Display for LapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.vehicle_id, self.lap_number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub stop: String,
    pub at: DateTime<Utc>,
}

/// Ordered stop visits of one lap, never holding the same stop twice in a row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisitHistory {
    visits: Vec<Visit>,
}

impl VisitHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a visit unless it repeats the last stop. Returns whether it was added.
    pub fn push(&mut self, stop: &str, at: DateTime<Utc>) -> bool {
        if self.visits.last().map_or(false, |v| v.stop == stop) {
            return false;
        }
        self.visits.push(Visit {
            stop: stop.to_string(),
            at,
        });
        true
    }

    pub fn visits(&self) -> &[Visit] {
        &self.visits
    }

    pub fn stops(&self) -> Vec<&str> {
        self.visits.iter().map(|v| v.stop.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.visits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
    }

    /// Rebuild a history from its rendered form. Unparseable parts are skipped.
    pub fn parse(rendered: &str, offset: FixedOffset) -> Self {
        let mut history = Self::new();
        for caps in VISIT_ENTRY.captures_iter(rendered) {
            let stop = caps[1].trim();
            let local = NaiveDateTime::parse_from_str(&caps[2], TIMESTAMP_FORMAT).ok();
            let at = local.and_then(|t| t.and_local_timezone(offset).single());
            match at {
                Some(at) if !stop.is_empty() => {
                    history.push(stop, at.with_timezone(&Utc));
                }
                _ => {}
            }
        }
        history
    }

    /// `Name [YYYY-MM-DD HH:MM:SS] -> Name [...]`, timestamps shown in `offset`.
    pub fn render(&self, offset: FixedOffset) -> String {
        self.visits
            .iter()
            .map(|v| {
                format!(
                    "{} [{}]",
                    v.stop,
                    v.at.with_timezone(&offset).format(TIMESTAMP_FORMAT)
                )
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// Confirmed stop change of one vehicle, the only input of the lap machine.
#[derive(Debug, Clone, PartialEq)]
pub struct StopVisit {
    pub vehicle_id: String,
    /// Previously confirmed stop, if any
    pub previous: Option<String>,
    /// When the previous stop was confirmed
    pub previous_at: Option<DateTime<Utc>>,
    pub stop: String,
    pub at: DateTime<Utc>,
    /// Vehicle color after this visit was classified
    pub color: RouteColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LapEventKind {
    #[serde(rename = "lap_start")]
    Start,
    /// A stop was appended to an open lap
    #[serde(rename = "lap_progress")]
    Progress,
    #[serde(rename = "lap_end")]
    End,
}

/// Lap lifecycle event, forwarded to the lap store and the event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapEvent {
    #[serde(rename = "type")]
    pub kind: LapEventKind,
    #[serde(flatten)]
    pub key: LapKey,
    pub route_color: RouteColor,
    pub visit_history: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// The lap currently open for a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveLap {
    pub key: LapKey,
    pub start_time: DateTime<Utc>,
    pub start_color: RouteColor,
    pub history: VisitHistory,
}

/// Lap state of one vehicle.
///
/// A tracker that was not resumed from the store numbers its laps from 1.
/// Those local numbers are shifted by `number_offset` once the store reports
/// how many laps it already holds for the vehicle.
#[derive(Debug, Clone, Default)]
pub struct LapTracker {
    active: Option<ActiveLap>,
    laps_recorded: u32,
    /// Numbering agrees with the store (resumed, or resolution requested)
    seeded: bool,
    number_offset: u32,
}

impl LapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from stored state, e.g. after a restart.
    pub fn resume(laps_recorded: u32, active: Option<ActiveLap>) -> Self {
        let laps_recorded = active
            .as_ref()
            .map_or(laps_recorded, |a| laps_recorded.max(a.key.lap_number));
        Self {
            active,
            laps_recorded,
            seeded: true,
            number_offset: 0,
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn mark_seeded(&mut self) {
        self.seeded = true;
    }

    /// Laps the store held before this tracker started numbering.
    pub fn set_number_offset(&mut self, offset: u32) {
        self.number_offset = offset;
    }

    /// Number of the open lap as the store knows it.
    pub fn active_lap_number(&self) -> Option<u32> {
        self.active
            .as_ref()
            .map(|lap| lap.key.lap_number + self.number_offset)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&ActiveLap> {
        self.active.as_ref()
    }

    pub fn laps_recorded(&self) -> u32 {
        self.laps_recorded
    }

    /// Apply a confirmed stop change and return the resulting events in order.
    pub fn on_stop_visit(
        &mut self,
        visit: &StopVisit,
        rules: &LapRules,
        display_offset: FixedOffset,
    ) -> Vec<LapEvent> {
        let mut events = Vec::new();
        let previous = visit.previous.as_deref().unwrap_or("");

        let appended = match self.active.as_mut() {
            Some(lap) => lap.history.push(&visit.stop, visit.at),
            None => false,
        };

        if previous == rules.start_stop && visit.stop == rules.second_stop {
            if let Some(lap) = self.active.take() {
                log::warn!(
                    "[Laps] Lap {} still open at new start, closing it",
                    lap.key
                );
                events.push(close_event(lap, visit, display_offset));
            }

            self.laps_recorded += 1;
            let mut history = VisitHistory::new();
            history.push(previous, visit.previous_at.unwrap_or(visit.at));
            history.push(&visit.stop, visit.at);

            let lap = ActiveLap {
                key: LapKey::new(&visit.vehicle_id, self.laps_recorded),
                start_time: visit.at,
                start_color: visit.color,
                history,
            };
            log::info!(
                "[Laps] Lap {} started ({})",
                lap.key,
                lap.start_color
            );
            events.push(LapEvent {
                kind: LapEventKind::Start,
                key: lap.key.clone(),
                route_color: visit.color,
                visit_history: lap.history.render(display_offset),
                start_time: lap.start_time,
                end_time: None,
                duration_secs: None,
                timestamp: visit.at,
            });
            self.active = Some(lap);
            return events;
        }

        let ends_lap = visit.stop == rules.terminal_stop
            || (visit.stop == rules.start_stop && previous == rules.second_stop);

        match self.active.take() {
            Some(lap) if ends_lap => {
                let event = close_event(lap, visit, display_offset);
                log::info!(
                    "[Laps] Lap {} ended ({}, {}s)",
                    event.key,
                    event.route_color,
                    event.duration_secs.unwrap_or(0)
                );
                events.push(event);
            }
            Some(lap) => {
                if appended {
                    events.push(LapEvent {
                        kind: LapEventKind::Progress,
                        key: lap.key.clone(),
                        route_color: visit.color,
                        visit_history: lap.history.render(display_offset),
                        start_time: lap.start_time,
                        end_time: None,
                        duration_secs: None,
                        timestamp: visit.at,
                    });
                }
                self.active = Some(lap);
            }
            None => {}
        }
        events
    }
}

/// Close `lap` at the visit time, using the color as of the visit.
fn close_event(lap: ActiveLap, visit: &StopVisit, display_offset: FixedOffset) -> LapEvent {
    LapEvent {
        kind: LapEventKind::End,
        route_color: visit.color,
        visit_history: lap.history.render(display_offset),
        start_time: lap.start_time,
        end_time: Some(visit.at),
        duration_secs: Some((visit.at - lap.start_time).num_seconds()),
        timestamp: visit.at,
        key: lap.key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn jakarta() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    struct Driver {
        tracker: LapTracker,
        rules: LapRules,
        last: Option<(String, DateTime<Utc>)>,
    }

    impl Driver {
        fn new() -> Self {
            Self {
                tracker: LapTracker::new(),
                rules: LapRules::default(),
                last: None,
            }
        }

        fn visit(&mut self, stop: &str, secs: i64, color: RouteColor) -> Vec<LapEvent> {
            let visit = StopVisit {
                vehicle_id: "bus-1".to_string(),
                previous: self.last.as_ref().map(|(s, _)| s.clone()),
                previous_at: self.last.as_ref().map(|(_, at)| *at),
                stop: stop.to_string(),
                at: t(secs),
                color,
            };
            self.last = Some((stop.to_string(), t(secs)));
            self.tracker.on_stop_visit(&visit, &self.rules, jakarta())
        }
    }

    #[test]
    fn test_visit_history_dedup() {
        let mut history = VisitHistory::new();
        assert!(history.push("A", t(0)));
        assert!(!history.push("A", t(1)));
        assert!(history.push("B", t(2)));
        assert!(history.push("A", t(3)));
        assert_eq!(history.stops(), vec!["A", "B", "A"]);
    }

    #[test]
    fn test_visit_history_render() {
        let mut history = VisitHistory::new();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 1, 2, 3).unwrap();
        history.push("Asrama UI", at);
        history.push("Menwa", at + Duration::seconds(90));
        assert_eq!(
            history.render(jakarta()),
            "Asrama UI [2024-03-01 08:02:03] -> Menwa [2024-03-01 08:03:33]"
        );
    }

    #[test]
    fn test_visit_history_parse_rendered() {
        let mut history = VisitHistory::new();
        history.push("Asrama UI", t(0));
        history.push("MUI/Perpus UI", t(75));
        history.push("Fakultas Ilmu Pengetahuan Budaya", t(300));

        let parsed = VisitHistory::parse(&history.render(jakarta()), jakarta());
        assert_eq!(parsed, history);
        assert!(VisitHistory::parse("garbage", jakarta()).is_empty());
    }

    #[test]
    fn test_lap_opens_on_start_pair() {
        let mut d = Driver::new();
        assert!(d.visit("Asrama UI", 0, RouteColor::Unknown).is_empty());
        let events = d.visit("Menwa", 60, RouteColor::Unknown);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LapEventKind::Start);
        assert_eq!(events[0].key, LapKey::new("bus-1", 1));

        let lap = d.tracker.active().unwrap();
        assert_eq!(lap.history.stops(), vec!["Asrama UI", "Menwa"]);
        assert_eq!(lap.history.visits()[0].at, t(0));
        assert_eq!(lap.start_time, t(60));
    }

    #[test]
    fn test_lap_closes_at_terminal_with_current_color() {
        let mut d = Driver::new();
        d.visit("Asrama UI", 0, RouteColor::Unknown);
        d.visit("Menwa", 60, RouteColor::Unknown);
        let progress = d.visit("Stasiun UI", 120, RouteColor::Blue);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].kind, LapEventKind::Progress);

        let events = d.visit("Parking", 900, RouteColor::ExpressBlue);
        assert_eq!(events.len(), 1);
        let end = &events[0];
        assert_eq!(end.kind, LapEventKind::End);
        assert_eq!(end.route_color, RouteColor::ExpressBlue);
        assert_eq!(end.duration_secs, Some(840));
        assert!(end.end_time.unwrap() > end.start_time);
        assert!(end.visit_history.ends_with(&format!(
            "Parking [{}]",
            t(900).with_timezone(&jakarta()).format("%Y-%m-%d %H:%M:%S")
        )));
        assert!(!d.tracker.is_active());
    }

    #[test]
    fn test_lap_closes_on_return_to_start() {
        let mut d = Driver::new();
        d.visit("Asrama UI", 0, RouteColor::Red);
        d.visit("Menwa", 60, RouteColor::Red);
        d.visit("Stasiun UI", 120, RouteColor::Red);
        d.visit("Menwa", 600, RouteColor::Red);
        let events = d.visit("Asrama UI", 660, RouteColor::Red);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LapEventKind::End);

        // Parking afterwards has no lap to close
        assert!(d.visit("Parking", 700, RouteColor::Red).is_empty());
    }

    #[test]
    fn test_new_start_force_closes_open_lap() {
        let mut d = Driver::new();
        d.visit("Asrama UI", 0, RouteColor::Blue);
        d.visit("Menwa", 60, RouteColor::Blue);
        d.visit("Stasiun UI", 120, RouteColor::Blue);
        d.visit("Asrama UI", 500, RouteColor::Blue);
        let events = d.visit("Menwa", 560, RouteColor::Blue);

        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![LapEventKind::End, LapEventKind::Start]);
        assert_eq!(events[0].key.lap_number, 1);
        assert_eq!(events[1].key.lap_number, 2);
        assert_eq!(d.tracker.laps_recorded(), 2);
    }

    #[test]
    fn test_no_lap_without_start_pair() {
        let mut d = Driver::new();
        assert!(d.visit("Menwa", 0, RouteColor::Blue).is_empty());
        assert!(d.visit("Stasiun UI", 60, RouteColor::Blue).is_empty());
        assert!(d.visit("Parking", 120, RouteColor::Blue).is_empty());
        assert!(!d.tracker.is_active());
        assert_eq!(d.tracker.laps_recorded(), 0);
    }

    #[test]
    fn test_resume_continues_numbering() {
        let active = ActiveLap {
            key: LapKey::new("bus-1", 4),
            start_time: t(0),
            start_color: RouteColor::Red,
            history: VisitHistory::new(),
        };
        let tracker = LapTracker::resume(3, Some(active));
        assert!(tracker.is_active());
        assert!(tracker.is_seeded());
        assert_eq!(tracker.laps_recorded(), 4);
        assert_eq!(tracker.active_lap_number(), Some(4));
    }

    #[test]
    fn test_number_offset_shifts_reported_lap() {
        let mut d = Driver::new();
        assert!(!d.tracker.is_seeded());
        d.visit("Asrama UI", 0, RouteColor::Blue);
        let events = d.visit("Menwa", 60, RouteColor::Blue);
        assert_eq!(events[0].key.lap_number, 1);

        d.tracker.set_number_offset(5);
        assert_eq!(d.tracker.active_lap_number(), Some(6));
        assert_eq!(d.tracker.laps_recorded(), 1);
    }

    #[test]
    fn test_lap_event_json_shape() {
        let mut d = Driver::new();
        d.visit("Asrama UI", 0, RouteColor::Blue);
        let events = d.visit("Menwa", 60, RouteColor::Blue);
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["type"], "lap_start");
        assert_eq!(json["vehicle_id"], "bus-1");
        assert_eq!(json["lap_number"], 1);
        assert_eq!(json["route_color"], "blue");
    }
}
