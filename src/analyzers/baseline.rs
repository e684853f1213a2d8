//! Headway measurement and the adaptive per-stop baseline it feeds.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::analyzers::keyed::{Keyed, KeyedMap};
use crate::analyzers::types::Arrival;
use crate::analyzers::utility::{mean, median};
use crate::config::PipelineConfig;

/// Last arrival seen at a (route, stop), kept across passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastArrival {
    pub route_name: String,
    pub stop_id: String,
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Keyed for LastArrival {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.route_name.clone(), self.stop_id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeadwayTracker {
    last: KeyedMap<LastArrival>,
}

impl HeadwayTracker {
    /// Records `arrival` and returns the gap in minutes to the previous
    /// arrival at the same route and stop.
    ///
    /// Returns `None` for the first arrival seen, for arrivals that are not
    /// strictly later than the previous one, and for a vehicle re-arriving
    /// at the stop it was last seen at. Only strictly later arrivals by a
    /// different vehicle move the tracker forward.
    pub fn observe(&mut self, arrival: &Arrival) -> Option<f64> {
        let key = (arrival.route_name.clone(), arrival.stop_id.clone());
        let next = LastArrival {
            route_name: arrival.route_name.clone(),
            stop_id: arrival.stop_id.clone(),
            vehicle_id: arrival.vehicle_id.clone(),
            timestamp: arrival.timestamp,
        };

        let Some(prev) = self.last.get_mut(&key) else {
            self.last.upsert(next);
            return None;
        };
        if arrival.timestamp <= prev.timestamp || arrival.vehicle_id == prev.vehicle_id {
            return None;
        }

        let gap = (arrival.timestamp - prev.timestamp).num_milliseconds() as f64 / 60_000.0;
        *prev = next;
        Some(gap)
    }

    /// Forgets stops whose last arrival is older than `cutoff`.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.last.len();
        self.last.retain(|l| l.timestamp >= cutoff);
        before - self.last.len()
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// Expected inter-arrival time at a stop, overall (`hour_of_day = None`) or
/// for one local hour of the day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadwayBaseline {
    pub route_id: String,
    pub stop_id: String,
    pub hour_of_day: Option<u32>,
    pub median_headway: f64,
    pub avg_headway: f64,
    pub observation_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Keyed for HeadwayBaseline {
    type Key = (String, String, Option<u32>);

    fn key(&self) -> Self::Key {
        (self.route_id.clone(), self.stop_id.clone(), self.hour_of_day)
    }
}

/// One measured headway, tagged with the local hour of the later arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadwaySample {
    pub route_name: String,
    pub stop_id: String,
    pub hour: u32,
    pub minutes: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSource {
    Hourly,
    Overall,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BaselineChoice {
    pub minutes: f64,
    pub source: BaselineSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaselineBook {
    baselines: KeyedMap<HeadwayBaseline>,
}

impl BaselineBook {
    pub fn get(&self, route: &str, stop: &str, hour: Option<u32>) -> Option<&HeadwayBaseline> {
        self.baselines
            .get(&(route.to_string(), stop.to_string(), hour))
    }

    pub fn values(&self) -> impl Iterator<Item = &HeadwayBaseline> {
        self.baselines.values()
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    /// Blends a batch of headway samples into the overall and hour-of-day
    /// baselines. Samples outside the sanity band are ignored. Returns the
    /// number of baseline rows touched.
    pub fn learn(
        &mut self,
        samples: &[HeadwaySample],
        config: &PipelineConfig,
        now: DateTime<Utc>,
    ) -> usize {
        let mut batches: BTreeMap<(String, String, Option<u32>), Vec<f64>> = BTreeMap::new();
        for s in samples {
            if !(s.minutes > config.baseline_min_headway_minutes
                && s.minutes < config.baseline_max_headway_minutes)
            {
                continue;
            }
            for hour in [None, Some(s.hour)] {
                batches
                    .entry((s.route_name.clone(), s.stop_id.clone(), hour))
                    .or_default()
                    .push(s.minutes);
            }
        }

        let touched = batches.len();
        let b = config.baseline_blend;
        for ((route_id, stop_id, hour_of_day), values) in batches {
            let batch_median = median(&values);
            let batch_mean = mean(&values);
            let n = values.len() as u64;

            match self.baselines.get_mut(&(route_id.clone(), stop_id.clone(), hour_of_day)) {
                Some(existing) => {
                    existing.median_headway = (1.0 - b) * existing.median_headway + b * batch_median;
                    existing.avg_headway = (1.0 - b) * existing.avg_headway + b * batch_mean;
                    existing.observation_count += n;
                    existing.updated_at = existing.updated_at.max(now);
                }
                None => {
                    self.baselines.upsert(HeadwayBaseline {
                        route_id,
                        stop_id,
                        hour_of_day,
                        median_headway: batch_median,
                        avg_headway: batch_mean,
                        observation_count: n,
                        updated_at: now,
                    });
                }
            }
        }

        debug!(samples = samples.len(), touched, "Baselines learned");
        touched
    }

    /// Picks the baseline to classify against: the hour-of-day entry if it
    /// was updated within the look-back window, then the overall entry, then
    /// the configured cold-start default.
    pub fn best_baseline(
        &self,
        route: &str,
        stop: &str,
        hour: u32,
        now: DateTime<Utc>,
        config: &PipelineConfig,
    ) -> BaselineChoice {
        let lookback = Duration::days(config.hourly_lookback_days);

        if let Some(hourly) = self.get(route, stop, Some(hour))
            && now - hourly.updated_at <= lookback
            && hourly.median_headway > 0.0
        {
            return BaselineChoice {
                minutes: hourly.median_headway,
                source: BaselineSource::Hourly,
            };
        }

        if let Some(overall) = self.get(route, stop, None)
            && overall.median_headway > 0.0
        {
            return BaselineChoice {
                minutes: overall.median_headway,
                source: BaselineSource::Overall,
            };
        }

        BaselineChoice {
            minutes: config.default_baseline_minutes,
            source: BaselineSource::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, h, m, 0).unwrap()
    }

    fn arrival(vehicle: &str, stop: &str, ts: DateTime<Utc>) -> Arrival {
        Arrival {
            vehicle_id: vehicle.to_string(),
            route_name: "14".to_string(),
            direction: Some("outbound".to_string()),
            operator: None,
            stop_id: stop.to_string(),
            timestamp: ts,
            match_distance_m: 3.0,
            dwell_seconds: 20,
        }
    }

    fn sample(hour: u32, minutes: f64) -> HeadwaySample {
        HeadwaySample {
            route_name: "14".to_string(),
            stop_id: "S12".to_string(),
            hour,
            minutes,
        }
    }

    #[test]
    fn test_tracker_measures_gap_per_stop() {
        let mut tracker = HeadwayTracker::default();
        assert_eq!(tracker.observe(&arrival("a", "S12", t(8, 0))), None);
        assert_eq!(tracker.observe(&arrival("b", "S13", t(8, 2))), None);
        assert_eq!(tracker.observe(&arrival("b", "S12", t(8, 7))), Some(7.0));
        assert_eq!(tracker.observe(&arrival("c", "S12", t(8, 10))), Some(3.0));
    }

    #[test]
    fn test_tracker_ignores_out_of_order_and_same_vehicle() {
        let mut tracker = HeadwayTracker::default();
        tracker.observe(&arrival("a", "S12", t(8, 10)));
        assert_eq!(tracker.observe(&arrival("b", "S12", t(8, 5))), None);
        assert_eq!(tracker.observe(&arrival("a", "S12", t(8, 12))), None);
        assert_eq!(tracker.observe(&arrival("b", "S12", t(8, 20))), Some(10.0));
    }

    #[test]
    fn test_tracker_prune() {
        let mut tracker = HeadwayTracker::default();
        tracker.observe(&arrival("a", "S12", t(6, 0)));
        tracker.observe(&arrival("a", "S13", t(8, 0)));
        assert_eq!(tracker.prune(t(7, 0)), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_first_batch_seeds_then_blends() {
        let config = PipelineConfig::default();
        let mut book = BaselineBook::default();

        book.learn(&[sample(8, 10.0), sample(8, 12.0), sample(8, 14.0)], &config, t(9, 0));
        let overall = book.get("14", "S12", None).unwrap();
        assert_eq!(overall.median_headway, 12.0);
        assert_eq!(overall.avg_headway, 12.0);
        assert_eq!(overall.observation_count, 3);
        assert!(book.get("14", "S12", Some(8)).is_some());

        book.learn(&[sample(8, 20.0)], &config, t(10, 0));
        let overall = book.get("14", "S12", None).unwrap();
        assert!((overall.median_headway - (0.7 * 12.0 + 0.3 * 20.0)).abs() < 1e-9);
        assert_eq!(overall.observation_count, 4);
        assert_eq!(overall.updated_at, t(10, 0));
    }

    #[test]
    fn test_sanity_band_is_exclusive() {
        let config = PipelineConfig::default();
        let mut book = BaselineBook::default();
        let touched = book.learn(&[sample(8, 1.0), sample(8, 60.0), sample(8, 0.5)], &config, t(9, 0));
        assert_eq!(touched, 0);
        assert!(book.is_empty());
    }

    #[test]
    fn test_best_baseline_falls_back() {
        let config = PipelineConfig::default();
        let mut book = BaselineBook::default();

        let cold = book.best_baseline("14", "S12", 8, t(9, 0), &config);
        assert_eq!(cold.source, BaselineSource::Default);
        assert_eq!(cold.minutes, 10.0);

        book.learn(&[sample(8, 6.0), sample(9, 12.0)], &config, t(9, 0));
        let hourly = book.best_baseline("14", "S12", 8, t(9, 30), &config);
        assert_eq!(hourly.source, BaselineSource::Hourly);
        assert_eq!(hourly.minutes, 6.0);

        let other_hour = book.best_baseline("14", "S12", 17, t(9, 30), &config);
        assert_eq!(other_hour.source, BaselineSource::Overall);
        assert_eq!(other_hour.minutes, 9.0);
    }

    #[test]
    fn test_stale_hourly_baseline_is_not_trusted() {
        let config = PipelineConfig::default();
        let mut book = BaselineBook::default();
        book.learn(&[sample(8, 6.0)], &config, t(9, 0));

        let later = t(9, 0) + Duration::days(8);
        let choice = book.best_baseline("14", "S12", 8, later, &config);
        assert_eq!(choice.source, BaselineSource::Overall);
    }

    #[test]
    fn test_observation_count_never_decreases() {
        let config = PipelineConfig::default();
        let mut book = BaselineBook::default();
        let mut last = 0;
        for (i, batch) in [vec![5.0, 7.0], vec![], vec![90.0], vec![8.0, 9.0, 10.0]]
            .into_iter()
            .enumerate()
        {
            let samples: Vec<_> = batch.into_iter().map(|m| sample(8, m)).collect();
            book.learn(&samples, &config, t(9, i as u32));
            let count = book.get("14", "S12", None).map_or(0, |b| b.observation_count);
            assert!(count >= last);
            last = count;
        }
        assert_eq!(last, 5);
    }
}
