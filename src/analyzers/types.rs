//! Data types flowing between the pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::positions::Coordinate;

/// Placeholder used when direction or operator is unknown in an aggregate key.
pub const UNKNOWN: &str = "Unknown";

/// A run of consecutive "same place" samples for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopEvent {
    pub vehicle_id: String,
    pub route_name: Option<String>,
    pub direction: Option<String>,
    pub operator: Option<String>,
    pub location: Coordinate,
    pub first_timestamp: DateTime<Utc>,
    pub sample_count: u32,
    pub dwell_seconds: u32,
}

/// A stop event resolved to a known route-stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arrival {
    pub vehicle_id: String,
    pub route_name: String,
    pub direction: Option<String>,
    pub operator: Option<String>,
    pub stop_id: String,
    pub timestamp: DateTime<Utc>,
    pub match_distance_m: f64,
    pub dwell_seconds: u32,
}

impl Arrival {
    pub fn service(&self) -> ServiceKey {
        ServiceKey::new(
            &self.route_name,
            self.direction.as_deref(),
            self.operator.as_deref(),
        )
    }
}

/// Why a stop event produced no arrival. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// The event carried no route name.
    MissingRoute,
    /// The route is not in the stop catalogue.
    UnknownRoute,
    /// The route has no stops listed for the event's direction.
    UnknownDirection,
    /// No stop of the route lies within the match radius.
    OutOfRadius,
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnmatchedReason::MissingRoute => "missing_route",
            UnmatchedReason::UnknownRoute => "unknown_route",
            UnmatchedReason::UnknownDirection => "unknown_direction",
            UnmatchedReason::OutOfRadius => "out_of_radius",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(Arrival),
    Unmatched(UnmatchedReason),
}

/// An arrival after headway measurement and bunching classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedArrival {
    pub arrival: Arrival,
    /// Gap to the previous arrival at the same route-stop, in minutes.
    pub headway_minutes: Option<f64>,
    pub bunched: Option<bool>,
}

/// A service as reported on: route, direction and operator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub route_name: String,
    pub direction: String,
    pub operator: String,
}

impl ServiceKey {
    pub fn new(route_name: &str, direction: Option<&str>, operator: Option<&str>) -> Self {
        Self {
            route_name: route_name.to_string(),
            direction: direction.unwrap_or(UNKNOWN).to_string(),
            operator: operator.unwrap_or(UNKNOWN).to_string(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) {}", self.route_name, self.direction, self.operator)
    }
}

/// A service at one stop.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StopServiceKey {
    pub service: ServiceKey,
    pub stop_id: String,
}

/// A service between two consecutive stops.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    pub service: ServiceKey,
    pub origin_stop_id: String,
    pub destination_stop_id: String,
}

/// Anything keyed on a service, so route-level rollups can group it.
pub trait HasService {
    fn service(&self) -> &ServiceKey;
}

impl HasService for ServiceKey {
    fn service(&self) -> &ServiceKey {
        self
    }
}

impl HasService for StopServiceKey {
    fn service(&self) -> &ServiceKey {
        &self.service
    }
}

impl HasService for SegmentKey {
    fn service(&self) -> &ServiceKey {
        &self.service
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_service_key_fills_unknown() {
        let key = ServiceKey::new("14", None, Some("Arriva"));
        assert_eq!(key.direction, UNKNOWN);
        assert_eq!(key.operator, "Arriva");
        assert_eq!(key.to_string(), "14 (Unknown) Arriva");
    }

    #[test]
    fn test_arrival_service() {
        let arrival = Arrival {
            vehicle_id: "bus-1".to_string(),
            route_name: "14".to_string(),
            direction: Some("outbound".to_string()),
            operator: None,
            stop_id: "S12".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 4, 8, 0, 0).unwrap(),
            match_distance_m: 4.2,
            dwell_seconds: 20,
        };
        assert_eq!(
            arrival.service(),
            ServiceKey::new("14", Some("outbound"), None)
        );
    }

    #[test]
    fn test_unmatched_reason_display() {
        assert_eq!(UnmatchedReason::OutOfRadius.to_string(), "out_of_radius");
    }
}
