//! Bounded summary tables: one row per (entity, time bucket).
//!
//! Observations are folded into hourly rows with a count-weighted merge.
//! Daily, monthly and overall rows are derived from the next finer level and
//! are always rebuilt from scratch, so coarsening is idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::analyzers::buckets::{Granularity, TimeBucket};
use crate::analyzers::keyed::{Keyed, KeyedMap};
use crate::analyzers::utility::{mean, median, percentile, stddev};

/// Descriptive statistics of a set of observations.
///
/// `median` and `p85` are exact for a single batch; after a merge they are
/// count-weighted approximations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
    pub p85: f64,
    pub min: f64,
    pub max: f64,
}

impl Summary {
    pub fn from_values(values: &[f64]) -> Option<Summary> {
        if values.is_empty() {
            return None;
        }
        let m = mean(values);
        Some(Summary {
            count: values.len() as u64,
            mean: m,
            stddev: stddev(values, m),
            median: median(values),
            p85: percentile(values, 0.85),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }

    /// Combines two summaries as if their observations had been pooled.
    pub fn merge(&self, other: &Summary) -> Summary {
        if self.count == 0 {
            return *other;
        }
        if other.count == 0 {
            return *self;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let n = n1 + n2;
        let m = (n1 * self.mean + n2 * other.mean) / n;
        let variance = (n1 * (self.stddev.powi(2) + (self.mean - m).powi(2))
            + n2 * (other.stddev.powi(2) + (other.mean - m).powi(2)))
            / n;

        Summary {
            count: self.count + other.count,
            mean: m,
            stddev: variance.max(0.0).sqrt(),
            median: (n1 * self.median + n2 * other.median) / n,
            p85: (n1 * self.p85 + n2 * other.p85) / n,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Coefficient of variation; `None` when the mean is not positive.
    pub fn cv(&self) -> Option<f64> {
        (self.mean > 0.0).then(|| self.stddev / self.mean)
    }
}

/// Per-family statistics that can be merged across rows.
pub trait PatternStats: Clone + Debug {
    fn merge(&self, other: &Self) -> Self;

    fn observation_count(&self) -> u64;
}

/// Entity key of a pattern family.
pub trait PatternKey: Ord + Clone + Debug {}

impl<T: Ord + Clone + Debug> PatternKey for T {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord<K, S> {
    pub key: K,
    pub bucket: TimeBucket,
    pub stats: S,
    pub observation_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl<K: PatternKey, S> Keyed for PatternRecord<K, S> {
    type Key = (K, TimeBucket);

    fn key(&self) -> Self::Key {
        (self.key.clone(), self.bucket)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
#[serde(bound(
    serialize = "K: Serialize, S: Serialize",
    deserialize = "K: Deserialize<'de>, S: Deserialize<'de>"
))]
pub struct PatternTable<K: PatternKey, S: PatternStats> {
    rows: KeyedMap<PatternRecord<K, S>>,
}

impl<K: PatternKey, S: PatternStats> Default for PatternTable<K, S> {
    fn default() -> Self {
        Self {
            rows: KeyedMap::new(),
        }
    }
}

impl<K: PatternKey, S: PatternStats> PatternTable<K, S> {
    /// Merges a batch of observations into the row for `(key, bucket)`.
    pub fn fold(&mut self, key: K, bucket: TimeBucket, stats: S, now: DateTime<Utc>) {
        let count = stats.observation_count();
        if count == 0 {
            return;
        }
        match self.rows.get_mut(&(key.clone(), bucket)) {
            Some(row) => {
                row.stats = row.stats.merge(&stats);
                row.observation_count = row.stats.observation_count();
                row.updated_at = row.updated_at.max(now);
            }
            None => {
                self.rows.upsert(PatternRecord {
                    key,
                    bucket,
                    stats,
                    observation_count: count,
                    updated_at: now,
                });
            }
        }
    }

    /// Rebuilds every daily, monthly and overall row from its finer children.
    pub fn coarsen_all(&mut self) {
        for level in [Granularity::Daily, Granularity::Monthly, Granularity::Overall] {
            self.coarsen_level(level);
        }
    }

    fn coarsen_level(&mut self, level: Granularity) {
        self.rows.retain(|row| row.bucket.granularity() != level);

        let mut merged: BTreeMap<(K, TimeBucket), (S, DateTime<Utc>)> = BTreeMap::new();
        for row in self
            .rows
            .values()
            .filter(|r| Some(r.bucket.granularity()) == level.finer())
        {
            let Some(parent) = row.bucket.coarsen() else {
                continue;
            };
            merged
                .entry((row.key.clone(), parent))
                .and_modify(|(stats, updated_at)| {
                    *stats = stats.merge(&row.stats);
                    *updated_at = (*updated_at).max(row.updated_at);
                })
                .or_insert_with(|| (row.stats.clone(), row.updated_at));
        }

        for ((key, bucket), (stats, updated_at)) in merged {
            self.rows.upsert(PatternRecord {
                key,
                bucket,
                observation_count: stats.observation_count(),
                stats,
                updated_at,
            });
        }
    }

    pub fn get(&self, key: &K, bucket: TimeBucket) -> Option<&PatternRecord<K, S>> {
        self.rows.get(&(key.clone(), bucket))
    }

    pub fn rows(&self) -> impl Iterator<Item = &PatternRecord<K, S>> {
        self.rows.values()
    }

    /// Rows at `granularity` with at least `min_observations` observations.
    pub fn qualifying(
        &self,
        granularity: Granularity,
        min_observations: u64,
    ) -> impl Iterator<Item = &PatternRecord<K, S>> {
        self.rows.values().filter(move |r| {
            r.bucket.granularity() == granularity && r.observation_count >= min_observations
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
