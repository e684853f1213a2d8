//! Folding classified arrivals into the pattern families.
//!
//! Each pass groups its arrivals by (entity, hourly bucket), summarizes each
//! group, and merges the summaries into the long-lived [`PatternSet`]. The
//! small cross-pass trackers in [`Trackers`] carry what a single batch cannot
//! see on its own: expected arrival times, each vehicle's previous stop and
//! which vehicles already ran in an hour.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::analyzers::buckets::TimeBucket;
use crate::analyzers::keyed::{Keyed, KeyedMap};
use crate::analyzers::patterns::{PatternStats, PatternTable, Summary};
use crate::analyzers::types::{Arrival, ClassifiedArrival, SegmentKey, ServiceKey, StopServiceKey};
use crate::catalog::PlannedTrips;
use crate::config::PipelineConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadwayStats {
    pub headway: Summary,
    pub bunched: u64,
}

impl HeadwayStats {
    pub fn bunching_rate(&self) -> f64 {
        if self.headway.count == 0 {
            return 0.0;
        }
        self.bunched as f64 / self.headway.count as f64 * 100.0
    }
}

impl PatternStats for HeadwayStats {
    fn merge(&self, other: &Self) -> Self {
        HeadwayStats {
            headway: self.headway.merge(&other.headway),
            bunched: self.bunched + other.bunched,
        }
    }

    fn observation_count(&self) -> u64 {
        self.headway.count
    }
}

/// Deviation from the learned typical arrival time, in minutes (late positive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdherenceStats {
    pub deviation: Summary,
    pub on_time: u64,
    pub early: u64,
    pub late: u64,
}

impl AdherenceStats {
    pub fn on_time_pct(&self) -> f64 {
        if self.deviation.count == 0 {
            return 0.0;
        }
        self.on_time as f64 / self.deviation.count as f64 * 100.0
    }
}

impl PatternStats for AdherenceStats {
    fn merge(&self, other: &Self) -> Self {
        AdherenceStats {
            deviation: self.deviation.merge(&other.deviation),
            on_time: self.on_time + other.on_time,
            early: self.early + other.early,
            late: self.late + other.late,
        }
    }

    fn observation_count(&self) -> u64 {
        self.deviation.count
    }
}

/// Stop-to-stop travel time, in minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyStats {
    pub journey: Summary,
}

impl PatternStats for JourneyStats {
    fn merge(&self, other: &Self) -> Self {
        JourneyStats {
            journey: self.journey.merge(&other.journey),
        }
    }

    fn observation_count(&self) -> u64 {
        self.journey.count
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub scheduled_trips: u64,
    pub completed_trips: u64,
}

impl DeliveryStats {
    /// Completed trips as a percentage of scheduled ones, capped at 100.
    pub fn delivery_pct(&self) -> f64 {
        if self.scheduled_trips == 0 {
            return 0.0;
        }
        (self.completed_trips as f64 / self.scheduled_trips as f64 * 100.0).min(100.0)
    }
}

impl PatternStats for DeliveryStats {
    fn merge(&self, other: &Self) -> Self {
        DeliveryStats {
            scheduled_trips: self.scheduled_trips + other.scheduled_trips,
            completed_trips: self.completed_trips + other.completed_trips,
        }
    }

    fn observation_count(&self) -> u64 {
        self.scheduled_trips.max(self.completed_trips)
    }
}

/// Time spent stationary at a stop, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellStats {
    pub dwell: Summary,
}

impl PatternStats for DwellStats {
    fn merge(&self, other: &Self) -> Self {
        DwellStats {
            dwell: self.dwell.merge(&other.dwell),
        }
    }

    fn observation_count(&self) -> u64 {
        self.dwell.count
    }
}

/// Every pattern family the pipeline maintains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSet {
    pub headway: PatternTable<StopServiceKey, HeadwayStats>,
    pub adherence: PatternTable<StopServiceKey, AdherenceStats>,
    pub journey: PatternTable<SegmentKey, JourneyStats>,
    pub delivery: PatternTable<ServiceKey, DeliveryStats>,
    pub dwell: PatternTable<StopServiceKey, DwellStats>,
}

impl PatternSet {
    pub fn coarsen_all(&mut self) {
        self.headway.coarsen_all();
        self.adherence.coarsen_all();
        self.journey.coarsen_all();
        self.delivery.coarsen_all();
        self.dwell.coarsen_all();
    }

    pub fn len(&self) -> usize {
        self.headway.len()
            + self.adherence.len()
            + self.journey.len()
            + self.delivery.len()
            + self.dwell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Running mean of the second-of-day at which a service reaches a stop
/// within one local hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypicalArrival {
    pub key: StopServiceKey,
    pub hour: u32,
    pub mean_second_of_day: f64,
    pub observation_count: u64,
}

impl Keyed for TypicalArrival {
    type Key = (StopServiceKey, u32);

    fn key(&self) -> Self::Key {
        (self.key.clone(), self.hour)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleBaselines {
    typical: KeyedMap<TypicalArrival>,
}

impl ScheduleBaselines {
    /// Returns the deviation in minutes from the typical arrival time, once
    /// that time is trusted, then folds this arrival into it.
    pub fn observe(
        &mut self,
        key: &StopServiceKey,
        hour: u32,
        second_of_day: u32,
        min_observations: u64,
    ) -> Option<f64> {
        let sod = f64::from(second_of_day);
        let row = self
            .typical
            .entry((key.clone(), hour))
            .or_insert_with(|| TypicalArrival {
                key: key.clone(),
                hour,
                mean_second_of_day: sod,
                observation_count: 0,
            });

        let deviation = (row.observation_count >= min_observations)
            .then(|| (sod - row.mean_second_of_day) / 60.0);

        row.observation_count += 1;
        row.mean_second_of_day += (sod - row.mean_second_of_day) / row.observation_count as f64;
        deviation
    }

    pub fn len(&self) -> usize {
        self.typical.len()
    }
}

/// A vehicle's most recent arrival, used to measure its next stop-to-stop leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyCursor {
    pub vehicle_id: String,
    pub service: ServiceKey,
    pub stop_id: String,
    pub service_date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    /// Dwell of the call, extended when the same call shows up again.
    #[serde(default)]
    pub dwell_seconds: u32,
}

impl JourneyCursor {
    fn call_end(&self) -> DateTime<Utc> {
        self.timestamp + Duration::seconds(i64::from(self.dwell_seconds))
    }
}

impl Keyed for JourneyCursor {
    type Key = String;

    fn key(&self) -> Self::Key {
        self.vehicle_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JourneyLeg {
    pub key: SegmentKey,
    pub origin_timestamp: DateTime<Utc>,
    pub minutes: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JourneyCursors {
    cursors: KeyedMap<JourneyCursor>,
}

impl JourneyCursors {
    /// True when `arrival` continues the vehicle's previous call: same stop,
    /// service and date, starting within two polls of where that call ended.
    /// The previous call absorbs the extra dwell.
    pub fn extend_call(
        &mut self,
        arrival: &Arrival,
        service: &ServiceKey,
        service_date: NaiveDate,
        polling_interval_secs: u32,
    ) -> bool {
        let Some(prev) = self.cursors.get_mut(&arrival.vehicle_id) else {
            return false;
        };
        let gap = Duration::seconds(2 * i64::from(polling_interval_secs));
        let continues = prev.stop_id == arrival.stop_id
            && prev.service == *service
            && prev.service_date == service_date
            && arrival.timestamp > prev.timestamp
            && arrival.timestamp <= prev.call_end() + gap;
        if continues {
            let through = (arrival.timestamp - prev.timestamp).num_seconds()
                + i64::from(arrival.dwell_seconds);
            prev.dwell_seconds = u32::try_from(through).unwrap_or(u32::MAX);
        }
        continues
    }

    /// Moves the vehicle's cursor to `arrival` and returns the leg from its
    /// previous stop, when both lie on the same service and service date.
    pub fn advance(
        &mut self,
        arrival: &Arrival,
        service: &ServiceKey,
        service_date: NaiveDate,
    ) -> Option<JourneyLeg> {
        let next = JourneyCursor {
            vehicle_id: arrival.vehicle_id.clone(),
            service: service.clone(),
            stop_id: arrival.stop_id.clone(),
            service_date,
            timestamp: arrival.timestamp,
            dwell_seconds: arrival.dwell_seconds,
        };

        let Some(prev) = self.cursors.get_mut(&arrival.vehicle_id) else {
            self.cursors.upsert(next);
            return None;
        };
        if arrival.timestamp <= prev.timestamp {
            return None;
        }

        let leg = (prev.service == *service
            && prev.service_date == service_date
            && prev.stop_id != arrival.stop_id)
            .then(|| JourneyLeg {
                key: SegmentKey {
                    service: service.clone(),
                    origin_stop_id: prev.stop_id.clone(),
                    destination_stop_id: arrival.stop_id.clone(),
                },
                origin_timestamp: prev.timestamp,
                minutes: (arrival.timestamp - prev.timestamp).num_milliseconds() as f64 / 60_000.0,
            });
        *prev = next;
        leg
    }

    pub fn get(&self, vehicle_id: &str) -> Option<&JourneyCursor> {
        self.cursors.get(&vehicle_id.to_string())
    }

    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.cursors.len();
        self.cursors.retain(|c| c.timestamp >= cutoff);
        before - self.cursors.len()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }
}

/// Vehicles seen running a service in one local hour of one service date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPeriod {
    pub service: ServiceKey,
    pub service_date: NaiveDate,
    pub hour: u32,
    pub vehicles: BTreeSet<String>,
}

impl Keyed for DeliveryPeriod {
    type Key = (ServiceKey, NaiveDate, u32);

    fn key(&self) -> Self::Key {
        (self.service.clone(), self.service_date, self.hour)
    }
}

/// Outcome of recording a vehicle against a delivery period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripSighting {
    /// First vehicle of a period not seen before.
    NewPeriod,
    /// Another vehicle in a period already seen.
    NewTrip,
    /// The vehicle was already counted for this period.
    Repeat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTracker {
    periods: KeyedMap<DeliveryPeriod>,
}

impl DeliveryTracker {
    pub fn observe(
        &mut self,
        service: &ServiceKey,
        service_date: NaiveDate,
        hour: u32,
        vehicle_id: &str,
    ) -> TripSighting {
        let key = (service.clone(), service_date, hour);
        match self.periods.get_mut(&key) {
            Some(period) if period.vehicles.contains(vehicle_id) => TripSighting::Repeat,
            Some(period) => {
                period.vehicles.insert(vehicle_id.to_string());
                TripSighting::NewTrip
            }
            None => {
                self.periods.upsert(DeliveryPeriod {
                    service: service.clone(),
                    service_date,
                    hour,
                    vehicles: BTreeSet::from([vehicle_id.to_string()]),
                });
                TripSighting::NewPeriod
            }
        }
    }

    /// Drops periods from service dates before `oldest`.
    pub fn prune(&mut self, oldest: NaiveDate) -> usize {
        let before = self.periods.len();
        self.periods.retain(|p| p.service_date >= oldest);
        before - self.periods.len()
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trackers {
    pub schedule: ScheduleBaselines,
    pub journeys: JourneyCursors,
    pub delivery: DeliveryTracker,
}

impl Trackers {
    /// Forgets cursors and delivery periods that can no longer contribute.
    pub fn prune(&mut self, now: DateTime<Utc>, config: &PipelineConfig) {
        let max_leg = Duration::milliseconds((config.journey_max_minutes * 60_000.0) as i64);
        let cursors = self.journeys.prune(now - max_leg);
        let oldest_date = (now.with_timezone(&config.local_offset()) - Duration::days(1)).date_naive();
        let periods = self.delivery.prune(oldest_date);
        debug!(cursors, periods, "Trackers pruned");
    }
}

/// How many observations a pass folded into each family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FoldCounts {
    pub headways: usize,
    pub bunched: usize,
    pub adherence: usize,
    pub journeys: usize,
    pub trips: usize,
    pub dwells: usize,
    /// Stop events that continued an earlier call of the same vehicle.
    pub continued_calls: usize,
}

struct OpenCall {
    slot: (StopServiceKey, TimeBucket),
    index: usize,
    start: DateTime<Utc>,
}

#[derive(Default)]
struct AdherenceBatch {
    deviations: Vec<f64>,
    on_time: u64,
    early: u64,
    late: u64,
}

/// Folds one pass worth of arrivals, in timestamp order, into every family's
/// hourly rows.
pub fn fold_arrivals(
    patterns: &mut PatternSet,
    trackers: &mut Trackers,
    arrivals: &[ClassifiedArrival],
    planned: &PlannedTrips,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> FoldCounts {
    let offset = config.local_offset();
    let mut counts = FoldCounts::default();

    let mut headways: BTreeMap<(StopServiceKey, TimeBucket), (Vec<f64>, u64)> = BTreeMap::new();
    let mut adherence: BTreeMap<(StopServiceKey, TimeBucket), AdherenceBatch> = BTreeMap::new();
    let mut journeys: BTreeMap<(SegmentKey, TimeBucket), Vec<f64>> = BTreeMap::new();
    let mut delivery: BTreeMap<(ServiceKey, TimeBucket), DeliveryStats> = BTreeMap::new();
    let mut dwells: BTreeMap<(StopServiceKey, TimeBucket), Vec<f64>> = BTreeMap::new();
    // Where each vehicle's latest dwell of this batch sits in `dwells`.
    let mut open_calls: HashMap<String, OpenCall> = HashMap::new();

    for classified in arrivals {
        let arrival = &classified.arrival;
        let service = arrival.service();
        let stop_key = StopServiceKey {
            service: service.clone(),
            stop_id: arrival.stop_id.clone(),
        };
        let local = arrival.timestamp.with_timezone(&offset);
        let bucket = TimeBucket::hourly_at(arrival.timestamp, offset);
        let hour = local.hour();
        let service_date = local.date_naive();

        if trackers.journeys.extend_call(
            arrival,
            &service,
            service_date,
            config.polling_interval_secs,
        ) {
            // Already folded as one call; only its dwell grows, and only while
            // that call is still in this batch.
            if let Some(call) = open_calls.get(&arrival.vehicle_id)
                && call.slot.0 == stop_key
                && let Some(dwell) = dwells.get_mut(&call.slot).and_then(|v| v.get_mut(call.index))
            {
                *dwell = (arrival.timestamp - call.start).num_seconds() as f64
                    + f64::from(arrival.dwell_seconds);
            }
            counts.continued_calls += 1;
            continue;
        }

        if let Some(h) = classified.headway_minutes {
            let (values, bunched) = headways.entry((stop_key.clone(), bucket)).or_default();
            values.push(h);
            if classified.bunched == Some(true) {
                *bunched += 1;
                counts.bunched += 1;
            }
            counts.headways += 1;
        }

        if let Some(deviation) = trackers.schedule.observe(
            &stop_key,
            hour,
            local.num_seconds_from_midnight(),
            config.adherence_baseline_min_observations,
        ) {
            let batch = adherence.entry((stop_key.clone(), bucket)).or_default();
            batch.deviations.push(deviation);
            if deviation < -config.on_time_window_minutes {
                batch.early += 1;
            } else if deviation > config.on_time_window_minutes {
                batch.late += 1;
            } else {
                batch.on_time += 1;
            }
            counts.adherence += 1;
        }

        if let Some(leg) = trackers.journeys.advance(arrival, &service, service_date)
            && leg.minutes >= config.journey_min_minutes
            && leg.minutes <= config.journey_max_minutes
        {
            let origin_bucket = TimeBucket::hourly_at(leg.origin_timestamp, offset);
            journeys.entry((leg.key, origin_bucket)).or_default().push(leg.minutes);
            counts.journeys += 1;
        }

        let sighting = trackers
            .delivery
            .observe(&service, service_date, hour, &arrival.vehicle_id);
        if sighting != TripSighting::Repeat {
            let stats = delivery.entry((service.clone(), bucket)).or_default();
            stats.completed_trips += 1;
            match planned.get(&service, hour) {
                Some(trips) if sighting == TripSighting::NewPeriod => stats.scheduled_trips += trips,
                Some(_) => {}
                None => stats.scheduled_trips += 1,
            }
            counts.trips += 1;
        }

        let slot = (stop_key, bucket);
        let values = dwells.entry(slot.clone()).or_default();
        values.push(f64::from(arrival.dwell_seconds));
        open_calls.insert(
            arrival.vehicle_id.clone(),
            OpenCall {
                slot,
                index: values.len() - 1,
                start: arrival.timestamp,
            },
        );
        counts.dwells += 1;
    }

    for ((key, bucket), (values, bunched)) in headways {
        if let Some(headway) = Summary::from_values(&values) {
            patterns
                .headway
                .fold(key, bucket, HeadwayStats { headway, bunched }, now);
        }
    }
    for ((key, bucket), batch) in adherence {
        if let Some(deviation) = Summary::from_values(&batch.deviations) {
            let stats = AdherenceStats {
                deviation,
                on_time: batch.on_time,
                early: batch.early,
                late: batch.late,
            };
            patterns.adherence.fold(key, bucket, stats, now);
        }
    }
    for ((key, bucket), values) in journeys {
        if let Some(journey) = Summary::from_values(&values) {
            patterns.journey.fold(key, bucket, JourneyStats { journey }, now);
        }
    }
    for ((key, bucket), stats) in delivery {
        patterns.delivery.fold(key, bucket, stats, now);
    }
    for ((key, bucket), values) in dwells {
        if let Some(dwell) = Summary::from_values(&values) {
            patterns.dwell.fold(key, bucket, DwellStats { dwell }, now);
        }
    }

    debug!(?counts, "Arrivals folded");
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::buckets::Granularity;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, h, m, s).unwrap()
    }

    fn arrival(vehicle: &str, stop: &str, ts: DateTime<Utc>) -> Arrival {
        Arrival {
            vehicle_id: vehicle.to_string(),
            route_name: "14".to_string(),
            direction: Some("outbound".to_string()),
            operator: Some("Arriva".to_string()),
            stop_id: stop.to_string(),
            timestamp: ts,
            match_distance_m: 4.0,
            dwell_seconds: 30,
        }
    }

    fn classified(a: Arrival, headway: Option<f64>, bunched: Option<bool>) -> ClassifiedArrival {
        ClassifiedArrival {
            arrival: a,
            headway_minutes: headway,
            bunched,
        }
    }

    fn service() -> ServiceKey {
        ServiceKey::new("14", Some("outbound"), Some("Arriva"))
    }

    fn stop_key(stop: &str) -> StopServiceKey {
        StopServiceKey {
            service: service(),
            stop_id: stop.to_string(),
        }
    }

    fn bucket(hour: u32) -> TimeBucket {
        TimeBucket::Hourly {
            year: 2025,
            month: 3,
            day_of_week: 2,
            hour,
        }
    }

    #[test]
    fn test_headways_and_bunching_fold_into_hourly_bucket() {
        let mut patterns = PatternSet::default();
        let mut trackers = Trackers::default();
        let arrivals = vec![
            classified(arrival("a", "S12", t(8, 0, 0)), None, None),
            classified(arrival("b", "S12", t(8, 3, 0)), Some(3.0), Some(true)),
            classified(arrival("c", "S12", t(8, 13, 0)), Some(10.0), Some(false)),
        ];

        let counts = fold_arrivals(
            &mut patterns,
            &mut trackers,
            &arrivals,
            &PlannedTrips::default(),
            &PipelineConfig::default(),
            t(9, 0, 0),
        );
        assert_eq!(counts.headways, 2);
        assert_eq!(counts.bunched, 1);
        assert_eq!(counts.dwells, 3);

        let row = patterns.headway.get(&stop_key("S12"), bucket(8)).unwrap();
        assert_eq!(row.observation_count, 2);
        assert_eq!(row.stats.bunched, 1);
        assert_eq!(row.stats.bunching_rate(), 50.0);
        assert!((row.stats.headway.mean - 6.5).abs() < 1e-9);
    }

    #[test]
    fn test_split_call_folds_once_with_combined_dwell() {
        let mut patterns = PatternSet::default();
        let mut trackers = Trackers::default();
        let mut rest = arrival("a", "S12", t(8, 0, 40));
        rest.dwell_seconds = 20;
        let arrivals = vec![
            classified(arrival("a", "S12", t(8, 0, 0)), None, None),
            // Starts 10 s after the first run ended: the same call.
            classified(rest, None, None),
        ];

        let counts = fold_arrivals(
            &mut patterns,
            &mut trackers,
            &arrivals,
            &PlannedTrips::default(),
            &PipelineConfig::default(),
            t(9, 0, 0),
        );
        assert_eq!(counts.dwells, 1);
        assert_eq!(counts.continued_calls, 1);
        assert_eq!(counts.trips, 1);

        let row = patterns.dwell.get(&stop_key("S12"), bucket(8)).unwrap();
        assert_eq!(row.observation_count, 1);
        assert_eq!(row.stats.dwell.mean, 60.0);
        assert_eq!(trackers.journeys.get("a").unwrap().dwell_seconds, 60);
    }

    #[test]
    fn test_return_to_stop_after_gap_is_a_new_call() {
        let mut patterns = PatternSet::default();
        let mut trackers = Trackers::default();
        let arrivals = vec![
            classified(arrival("a", "S12", t(8, 0, 0)), None, None),
            classified(arrival("a", "S12", t(8, 20, 0)), None, None),
        ];

        let counts = fold_arrivals(
            &mut patterns,
            &mut trackers,
            &arrivals,
            &PlannedTrips::default(),
            &PipelineConfig::default(),
            t(9, 0, 0),
        );
        assert_eq!(counts.dwells, 2);
        assert_eq!(counts.continued_calls, 0);
    }

    #[test]
    fn test_schedule_baseline_trusted_after_minimum() {
        let mut baselines = ScheduleBaselines::default();
        let key = stop_key("S12");
        for _ in 0..10 {
            assert_eq!(baselines.observe(&key, 8, 8 * 3600 + 600, 10), None);
        }
        let late = baselines.observe(&key, 8, 8 * 3600 + 780, 10).unwrap();
        assert!((late - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_adherence_counts_on_time_early_late() {
        let config = PipelineConfig {
            adherence_baseline_min_observations: 2,
            ..PipelineConfig::default()
        };
        let mut patterns = PatternSet::default();
        let mut trackers = Trackers::default();
        // Two seeding arrivals at 08:10, then on time, early and late.
        let arrivals: Vec<_> = [(10, 0), (10, 0), (11, 0), (5, 0), (14, 0)]
            .into_iter()
            .enumerate()
            .map(|(i, (m, s))| {
                classified(arrival(&format!("bus-{i}"), "S12", t(8, m, s)), None, None)
            })
            .collect();

        fold_arrivals(
            &mut patterns,
            &mut trackers,
            &arrivals,
            &PlannedTrips::default(),
            &config,
            t(9, 0, 0),
        );

        let row = patterns.adherence.get(&stop_key("S12"), bucket(8)).unwrap();
        assert_eq!(row.observation_count, 3);
        assert_eq!(row.stats.on_time, 1);
        assert_eq!(row.stats.early, 1);
        assert_eq!(row.stats.late, 1);
        assert!((row.stats.on_time_pct() - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_journey_legs_follow_vehicle_within_band() {
        let mut patterns = PatternSet::default();
        let mut trackers = Trackers::default();
        let arrivals = vec![
            classified(arrival("a", "S12", t(8, 0, 0)), None, None),
            classified(arrival("a", "S13", t(8, 4, 0)), None, None),
            // Same stop again: no leg.
            classified(arrival("a", "S13", t(8, 5, 0)), None, None),
            // Too short to count.
            classified(arrival("a", "S14", t(8, 5, 20)), None, None),
            classified(arrival("a", "S15", t(9, 2, 0)), None, None),
        ];

        let counts = fold_arrivals(
            &mut patterns,
            &mut trackers,
            &arrivals,
            &PlannedTrips::default(),
            &PipelineConfig::default(),
            t(10, 0, 0),
        );
        assert_eq!(counts.journeys, 2);

        let leg = SegmentKey {
            service: service(),
            origin_stop_id: "S12".to_string(),
            destination_stop_id: "S13".to_string(),
        };
        let row = patterns.journey.get(&leg, bucket(8)).unwrap();
        assert_eq!(row.stats.journey.mean, 4.0);

        // Bucketed at the origin's hour.
        let leg = SegmentKey {
            service: service(),
            origin_stop_id: "S14".to_string(),
            destination_stop_id: "S15".to_string(),
        };
        assert!(patterns.journey.get(&leg, bucket(8)).is_some());
    }

    #[test]
    fn test_journey_cursor_resets_on_route_change() {
        let mut cursors = JourneyCursors::default();
        let date = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let a = arrival("a", "S12", t(8, 0, 0));
        assert!(cursors.advance(&a, &service(), date).is_none());

        let mut b = arrival("a", "S40", t(8, 5, 0));
        b.route_name = "17".to_string();
        assert!(cursors.advance(&b, &b.service(), date).is_none());

        let c = arrival("a", "S41", t(8, 9, 0));
        let mut c17 = c.clone();
        c17.route_name = "17".to_string();
        let leg = cursors.advance(&c17, &c17.service(), date).unwrap();
        assert_eq!(leg.key.origin_stop_id, "S40");
        assert_eq!(leg.minutes, 4.0);
    }

    #[test]
    fn test_delivery_counts_distinct_vehicles_across_passes() {
        let config = PipelineConfig::default();
        let mut patterns = PatternSet::default();
        let mut trackers = Trackers::default();

        let first = vec![
            classified(arrival("a", "S12", t(8, 0, 0)), None, None),
            classified(arrival("a", "S13", t(8, 4, 0)), None, None),
            classified(arrival("b", "S12", t(8, 10, 0)), None, None),
        ];
        fold_arrivals(&mut patterns, &mut trackers, &first, &PlannedTrips::default(), &config, t(8, 30, 0));

        let second = vec![
            classified(arrival("b", "S14", t(8, 35, 0)), None, None),
            classified(arrival("c", "S12", t(8, 40, 0)), None, None),
        ];
        fold_arrivals(&mut patterns, &mut trackers, &second, &PlannedTrips::default(), &config, t(9, 0, 0));

        let row = patterns.delivery.get(&service(), bucket(8)).unwrap();
        assert_eq!(row.stats.completed_trips, 3);
        assert_eq!(row.stats.scheduled_trips, 3);
        assert_eq!(row.stats.delivery_pct(), 100.0);
    }

    #[test]
    fn test_delivery_uses_planned_trips() {
        let mut planned = PlannedTrips::default();
        planned.insert(service(), 8, 4);
        let mut patterns = PatternSet::default();
        let mut trackers = Trackers::default();
        let arrivals = vec![
            classified(arrival("a", "S12", t(8, 0, 0)), None, None),
            classified(arrival("b", "S12", t(8, 15, 0)), None, None),
            classified(arrival("c", "S12", t(8, 30, 0)), None, None),
        ];
        fold_arrivals(
            &mut patterns,
            &mut trackers,
            &arrivals,
            &planned,
            &PipelineConfig::default(),
            t(9, 0, 0),
        );

        let row = patterns.delivery.get(&service(), bucket(8)).unwrap();
        assert_eq!(row.stats.scheduled_trips, 4);
        assert_eq!(row.stats.completed_trips, 3);
        assert_eq!(row.stats.delivery_pct(), 75.0);
        assert_eq!(row.observation_count, 4);
    }

    #[test]
    fn test_pattern_set_coarsens_every_family() {
        let mut patterns = PatternSet::default();
        let mut trackers = Trackers::default();
        let arrivals = vec![
            classified(arrival("a", "S12", t(8, 0, 0)), None, None),
            classified(arrival("b", "S12", t(8, 5, 0)), Some(5.0), Some(false)),
        ];
        fold_arrivals(
            &mut patterns,
            &mut trackers,
            &arrivals,
            &PlannedTrips::default(),
            &PipelineConfig::default(),
            t(9, 0, 0),
        );
        patterns.coarsen_all();

        assert_eq!(patterns.headway.qualifying(Granularity::Overall, 1).count(), 1);
        assert_eq!(patterns.dwell.qualifying(Granularity::Monthly, 1).count(), 1);
        let overall = patterns.delivery.get(&service(), TimeBucket::Overall).unwrap();
        assert_eq!(overall.stats.completed_trips, 2);
    }

    #[test]
    fn test_tracker_prune() {
        let config = PipelineConfig::default();
        let mut trackers = Trackers::default();
        let date = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        trackers
            .journeys
            .advance(&arrival("a", "S12", t(6, 0, 0)), &service(), date);
        trackers
            .journeys
            .advance(&arrival("b", "S12", t(8, 30, 0)), &service(), date);
        trackers
            .delivery
            .observe(&service(), date - Duration::days(3), 8, "a");
        trackers.delivery.observe(&service(), date, 8, "a");

        trackers.prune(t(9, 0, 0), &config);
        assert_eq!(trackers.journeys.len(), 1);
        assert_eq!(trackers.delivery.len(), 1);
    }
}
