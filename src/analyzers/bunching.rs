//! Bunching classification against a baseline-derived threshold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyzers::keyed::{Keyed, KeyedMap};
use crate::config::PipelineConfig;

/// The headway below which an arrival counts as bunched.
pub fn threshold(baseline_minutes: f64, config: &PipelineConfig) -> f64 {
    (config.bunching_ratio * baseline_minutes).max(config.bunching_floor_minutes)
}

/// True when `headway_minutes` is below the threshold for `baseline_minutes`.
pub fn classify(headway_minutes: f64, baseline_minutes: f64, config: &PipelineConfig) -> bool {
    headway_minutes < threshold(baseline_minutes, config)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BunchingRecord {
    pub route_name: String,
    pub stop_id: String,
    pub hour: u32,
    pub total_headways: u64,
    pub bunched: u64,
    /// Baseline used for the most recent classification.
    pub expected_headway_minutes: f64,
    pub updated_at: DateTime<Utc>,
}

impl BunchingRecord {
    /// Share of classified headways that were bunched, as a percentage.
    pub fn rate(&self) -> f64 {
        if self.total_headways == 0 {
            return 0.0;
        }
        self.bunched as f64 / self.total_headways as f64 * 100.0
    }
}

impl Keyed for BunchingRecord {
    type Key = (String, String, u32);

    fn key(&self) -> Self::Key {
        (self.route_name.clone(), self.stop_id.clone(), self.hour)
    }
}

/// Running bunching counts per (route, stop, local hour).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BunchingTable {
    records: KeyedMap<BunchingRecord>,
}

impl BunchingTable {
    pub fn record(
        &mut self,
        route: &str,
        stop: &str,
        hour: u32,
        bunched: bool,
        expected_headway_minutes: f64,
        now: DateTime<Utc>,
    ) {
        let key = (route.to_string(), stop.to_string(), hour);
        let row = self
            .records
            .entry(key)
            .or_insert_with(|| BunchingRecord {
                route_name: route.to_string(),
                stop_id: stop.to_string(),
                hour,
                total_headways: 0,
                bunched: 0,
                expected_headway_minutes,
                updated_at: now,
            });
        row.total_headways += 1;
        row.bunched += u64::from(bunched);
        row.expected_headway_minutes = expected_headway_minutes;
        row.updated_at = row.updated_at.max(now);
    }

    pub fn get(&self, route: &str, stop: &str, hour: u32) -> Option<&BunchingRecord> {
        self.records
            .get(&(route.to_string(), stop.to_string(), hour))
    }

    pub fn values(&self) -> impl Iterator<Item = &BunchingRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
