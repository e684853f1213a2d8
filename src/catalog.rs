//! Static reference data: which stops each route serves, and route aliases.
//!
//! The stop catalogue is a CSV file with the header
//! `route_name,direction,operator,stop_id,stop_name,lat,lon`; one row per
//! route/direction/stop. `direction`, `operator` and `stop_name` may be blank.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::{info, warn};

use crate::analyzers::types::ServiceKey;
use crate::positions::Coordinate;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CatalogStop {
    pub route_name: String,
    pub direction: Option<String>,
    pub operator: Option<String>,
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

impl CatalogStop {
    pub fn coordinate(&self) -> Option<Coordinate> {
        Coordinate::new(self.lat, self.lon)
    }
}

/// Every route-stop pairing known to the matcher.
#[derive(Debug, Clone, Default)]
pub struct StopCatalog {
    stops: Vec<CatalogStop>,
}

impl StopCatalog {
    pub fn new(stops: Vec<CatalogStop>) -> Self {
        Self { stops }
    }

    /// Loads the catalogue from CSV. Rows that fail to parse or carry invalid
    /// coordinates are skipped with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open stop catalogue {}", path.display()))?;
        let mut rdr = csv::Reader::from_reader(file);

        let mut stops = Vec::new();
        let mut skipped = 0usize;
        for (line, result) in rdr.deserialize::<CatalogStop>().enumerate() {
            match result {
                Ok(stop) if stop.coordinate().is_some() && !stop.stop_id.trim().is_empty() => {
                    stops.push(stop)
                }
                Ok(stop) => {
                    warn!(line = line + 2, stop_id = %stop.stop_id, "Skipping catalogue stop with invalid coordinates or id");
                    skipped += 1;
                }
                Err(e) => {
                    warn!(line = line + 2, error = %e, "Skipping malformed catalogue row");
                    skipped += 1;
                }
            }
        }

        info!(stops = stops.len(), skipped, path = %path.display(), "Stop catalogue loaded");
        Ok(Self { stops })
    }

    pub fn stops(&self) -> &[CatalogStop] {
        &self.stops
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RouteAliasRow {
    route_id: String,
    route_name: String,
}

/// Maps feed route ids to the public route names used by the catalogue.
#[derive(Debug, Clone, Default)]
pub struct RouteNames {
    by_id: HashMap<String, String>,
}

impl RouteNames {
    /// Loads `route_id,route_name` rows from CSV.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open route names {}", path.display()))?;
        let mut rdr = csv::Reader::from_reader(file);

        let mut by_id = HashMap::new();
        for result in rdr.deserialize::<RouteAliasRow>() {
            let row = result.with_context(|| format!("malformed row in {}", path.display()))?;
            by_id.insert(row.route_id, row.route_name);
        }
        Ok(Self { by_id })
    }

    /// The public name for `route_id`, or the id itself when no alias is known.
    pub fn resolve<'a>(&'a self, route_id: &'a str) -> &'a str {
        self.by_id.get(route_id).map(String::as_str).unwrap_or(route_id)
    }
}

impl FromIterator<(String, String)> for RouteNames {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            by_id: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlannedTripsRow {
    route_name: String,
    direction: Option<String>,
    operator: Option<String>,
    hour: u32,
    trips: u64,
}

/// Planned trips per service and local hour of day, when a timetable summary
/// is available. Services without a plan fall back to observed trips.
#[derive(Debug, Clone, Default)]
pub struct PlannedTrips {
    by_service_hour: HashMap<(ServiceKey, u32), u64>,
}

impl PlannedTrips {
    /// Loads `route_name,direction,operator,hour,trips` rows from CSV.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open planned trips {}", path.display()))?;
        let mut rdr = csv::Reader::from_reader(file);

        let mut planned = Self::default();
        for result in rdr.deserialize::<PlannedTripsRow>() {
            let row = result.with_context(|| format!("malformed row in {}", path.display()))?;
            if row.hour > 23 {
                anyhow::bail!("hour {} out of range in {}", row.hour, path.display());
            }
            let service = ServiceKey::new(
                &row.route_name,
                row.direction.as_deref(),
                row.operator.as_deref(),
            );
            planned.insert(service, row.hour, row.trips);
        }
        info!(entries = planned.by_service_hour.len(), path = %path.display(), "Planned trips loaded");
        Ok(planned)
    }

    pub fn insert(&mut self, service: ServiceKey, hour: u32, trips: u64) {
        self.by_service_hour.insert((service, hour), trips);
    }

    pub fn get(&self, service: &ServiceKey, hour: u32) -> Option<u64> {
        self.by_service_hour.get(&(service.clone(), hour)).copied()
    }
}
