//! Route-scoped nearest-stop matching.
//!
//! Positional noise is comparable to stop spacing in dense areas, so a stop
//! event is only ever matched to a stop served by its own route (and
//! direction, when known), and only within a small radius.

use geo::{Distance, Haversine};
use std::collections::HashMap;
use tracing::debug;

use crate::analyzers::types::{Arrival, MatchOutcome, StopEvent, UnmatchedReason};
use crate::catalog::StopCatalog;
use crate::positions::Coordinate;

#[derive(Debug, Clone)]
struct IndexedStop {
    stop_id: String,
    direction: Option<String>,
    operator: Option<String>,
    location: Coordinate,
}

/// Stops of one route, grouped by normalized direction in catalogue order.
/// Stops listed without a direction are served in every direction.
#[derive(Debug, Clone, Default)]
struct RouteStops {
    by_direction: Vec<(String, Vec<IndexedStop>)>,
    any_direction: Vec<IndexedStop>,
}

impl RouteStops {
    fn push(&mut self, stop: IndexedStop) {
        let Some(direction) = stop.direction.as_deref().map(normalize) else {
            self.any_direction.push(stop);
            return;
        };
        match self.by_direction.iter_mut().find(|(d, _)| *d == direction) {
            Some((_, stops)) => stops.push(stop),
            None => self.by_direction.push((direction, vec![stop])),
        }
    }

    /// Candidate stops for `direction`, or for all directions when unknown.
    fn candidates(&self, direction: Option<&str>) -> Option<Vec<&IndexedStop>> {
        match direction {
            Some(direction) => {
                let direction = normalize(direction);
                let directed = self
                    .by_direction
                    .iter()
                    .find(|(d, _)| *d == direction)
                    .map(|(_, stops)| stops);
                if directed.is_none() && self.any_direction.is_empty() {
                    return None;
                }
                Some(
                    directed
                        .into_iter()
                        .flatten()
                        .chain(self.any_direction.iter())
                        .collect(),
                )
            }
            None => Some(
                self.by_direction
                    .iter()
                    .flat_map(|(_, stops)| stops.iter())
                    .chain(self.any_direction.iter())
                    .collect(),
            ),
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Index of the stops served by each route, built once per run.
#[derive(Debug, Clone, Default)]
pub struct StopIndex {
    routes: HashMap<String, RouteStops>,
    radius_m: f64,
}

impl StopIndex {
    pub fn build(catalog: &StopCatalog, radius_m: f64) -> Self {
        let mut routes: HashMap<String, RouteStops> = HashMap::new();
        for stop in catalog.stops() {
            let Some(location) = stop.coordinate() else {
                continue;
            };
            routes
                .entry(stop.route_name.trim().to_string())
                .or_default()
                .push(IndexedStop {
                    stop_id: stop.stop_id.clone(),
                    direction: stop.direction.clone().filter(|d| !d.trim().is_empty()),
                    operator: stop.operator.clone().filter(|o| !o.trim().is_empty()),
                    location,
                });
        }
        debug!(routes = routes.len(), radius_m, "Stop index built");
        Self { routes, radius_m }
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    /// Resolves `event` to the nearest stop of its route within the radius.
    ///
    /// Ties keep the first candidate in catalogue order.
    pub fn match_event(&self, event: &StopEvent) -> MatchOutcome {
        let Some(route) = event.route_name.as_deref() else {
            return MatchOutcome::Unmatched(UnmatchedReason::MissingRoute);
        };
        let Some(route_stops) = self.routes.get(route) else {
            return MatchOutcome::Unmatched(UnmatchedReason::UnknownRoute);
        };
        let Some(candidates) = route_stops.candidates(event.direction.as_deref()) else {
            return MatchOutcome::Unmatched(UnmatchedReason::UnknownDirection);
        };

        let mut best: Option<(&IndexedStop, f64)> = None;
        for stop in candidates {
            let distance = Haversine.distance(event.location.point(), stop.location.point());
            if distance > self.radius_m {
                continue;
            }
            if best.is_none_or(|(_, d)| distance < d) {
                best = Some((stop, distance));
            }
        }

        let Some((stop, distance)) = best else {
            return MatchOutcome::Unmatched(UnmatchedReason::OutOfRadius);
        };

        MatchOutcome::Matched(Arrival {
            vehicle_id: event.vehicle_id.clone(),
            route_name: route.to_string(),
            direction: event.direction.clone().or_else(|| stop.direction.clone()),
            operator: event.operator.clone().or_else(|| stop.operator.clone()),
            stop_id: stop.stop_id.clone(),
            timestamp: event.first_timestamp,
            match_distance_m: distance,
            dwell_seconds: event.dwell_seconds,
        })
    }
}
