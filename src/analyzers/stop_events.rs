//! Stop event detection: turns a vehicle's position stream into dwell events.
//!
//! A stop event is a run of two or more consecutive samples that the
//! configured [`SameLocationRule`] considers to be in the same place. Each
//! sample in the run counts for one polling interval of dwell time.

use geo::{Distance, Haversine};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::analyzers::types::StopEvent;
use crate::config::SameLocationRule;
use crate::positions::{Coordinate, VehiclePosition};

/// Events found in a batch, plus how many samples were unusable.
#[derive(Debug, Default)]
pub struct Detection {
    pub events: Vec<StopEvent>,
    pub malformed: usize,
}

/// Groups `positions` by vehicle and detects stop events for each vehicle.
///
/// Processed samples are ignored. Output is ordered by vehicle id, then time.
pub fn detect_stop_events(
    positions: &[VehiclePosition],
    rule: SameLocationRule,
    polling_interval_secs: u32,
) -> Detection {
    let mut by_vehicle: BTreeMap<&str, Vec<&VehiclePosition>> = BTreeMap::new();
    for p in positions.iter().filter(|p| !p.processed) {
        by_vehicle.entry(p.vehicle_id.as_str()).or_default().push(p);
    }

    let mut detection = Detection::default();
    for (vehicle_id, mut samples) in by_vehicle {
        samples.sort_by_key(|p| p.timestamp);
        let found = detect_vehicle_events(&samples, rule, polling_interval_secs);
        debug!(
            vehicle_id,
            samples = samples.len(),
            events = found.events.len(),
            "Vehicle scanned"
        );
        detection.events.extend(found.events);
        detection.malformed += found.malformed;
    }
    detection
}

/// Detects stop events in one vehicle's samples, already ordered by timestamp.
pub fn detect_vehicle_events(
    samples: &[&VehiclePosition],
    rule: SameLocationRule,
    polling_interval_secs: u32,
) -> Detection {
    let mut detection = Detection::default();
    let mut run: Vec<(&VehiclePosition, Coordinate)> = Vec::new();

    for &sample in samples {
        let Some(coord) = sample.coordinate() else {
            warn!(
                vehicle_id = %sample.vehicle_id,
                timestamp = %sample.timestamp,
                "Skipping sample with missing or invalid coordinates"
            );
            detection.malformed += 1;
            continue;
        };

        let continues_run = run
            .last()
            .is_some_and(|&(prev, prev_coord)| same_place(prev, prev_coord, sample, coord, rule));

        if !continues_run {
            flush_run(&run, polling_interval_secs, &mut detection.events);
            run.clear();
        }
        run.push((sample, coord));
    }
    flush_run(&run, polling_interval_secs, &mut detection.events);

    detection
}

fn same_place(
    prev: &VehiclePosition,
    prev_coord: Coordinate,
    next: &VehiclePosition,
    next_coord: Coordinate,
    rule: SameLocationRule,
) -> bool {
    if prev.route() != next.route() {
        return false;
    }
    match rule {
        SameLocationRule::Displacement { tolerance_m } => {
            Haversine.distance(prev_coord.point(), next_coord.point()) < tolerance_m
        }
        SameLocationRule::PollingRound => prev.timestamp == next.timestamp,
    }
}

fn flush_run(
    run: &[(&VehiclePosition, Coordinate)],
    polling_interval_secs: u32,
    events: &mut Vec<StopEvent>,
) {
    if run.len() < 2 {
        return;
    }
    let (first, location) = run[0];
    let sample_count = run.len() as u32;

    events.push(StopEvent {
        vehicle_id: first.vehicle_id.clone(),
        route_name: first.route().map(str::to_string),
        direction: first.direction.clone(),
        operator: first.operator.clone(),
        location,
        first_timestamp: first.timestamp,
        sample_count,
        dwell_seconds: sample_count * polling_interval_secs,
    });
}
