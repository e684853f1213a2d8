//! Vehicle position records as delivered by the ingestion side.

use chrono::{DateTime, Utc};
use geo::Point;
use serde::{Deserialize, Serialize};

/// A validated WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    /// Returns `None` for non-finite, out-of-range, or null-island (0, 0) values.
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if lat.abs() > 90.0 || lon.abs() > 180.0 {
            return None;
        }
        if lat == 0.0 && lon == 0.0 {
            return None;
        }
        Some(Self { lat, lon })
    }

    /// As a `geo` point, x = longitude.
    pub fn point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// One telemetry sample for a vehicle.
///
/// Coordinates are optional because upstream feeds occasionally omit them;
/// such samples are skipped by the stop event detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub vehicle_id: String,
    pub route_name: Option<String>,
    pub direction: Option<String>,
    pub operator: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

impl VehiclePosition {
    pub fn coordinate(&self) -> Option<Coordinate> {
        Coordinate::new(self.latitude?, self.longitude?)
    }

    /// Route name with surrounding whitespace removed; blank names count as missing.
    pub fn route(&self) -> Option<&str> {
        self.route_name
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}
