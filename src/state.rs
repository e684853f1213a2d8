//! Everything the pipeline carries from one pass to the next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::analyzers::aggregate::{PatternSet, Trackers};
use crate::analyzers::baseline::{BaselineBook, HeadwayTracker};
use crate::analyzers::bunching::BunchingTable;
use crate::analyzers::keyed::KeyedMap;
use crate::analyzers::sri::{NetworkSriRecord, SriRecord};

/// Persisted analytics state. Saved as a whole at the end of each pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsState {
    pub baselines: BaselineBook,
    pub headways: HeadwayTracker,
    pub bunching: BunchingTable,
    pub patterns: PatternSet,
    pub trackers: Trackers,
    /// Latest position timestamp already analysed, per vehicle.
    pub watermarks: BTreeMap<String, DateTime<Utc>>,
    pub route_sri: KeyedMap<SriRecord>,
    pub network_sri: KeyedMap<NetworkSriRecord>,
    pub last_pass_at: Option<DateTime<Utc>>,
}

impl AnalyticsState {
    /// True if `timestamp` for `vehicle_id` was covered by an earlier pass.
    pub fn already_seen(&self, vehicle_id: &str, timestamp: DateTime<Utc>) -> bool {
        self.watermarks
            .get(vehicle_id)
            .is_some_and(|w| timestamp <= *w)
    }

    pub fn advance_watermark(&mut self, vehicle_id: &str, timestamp: DateTime<Utc>) {
        self.watermarks
            .entry(vehicle_id.to_string())
            .and_modify(|w| *w = (*w).max(timestamp))
            .or_insert(timestamp);
    }
}
