//! Service Reliability Index: weighted composite of the component scores.
//!
//! Route rows are built hourly from component scores and rolled up to daily,
//! monthly and overall rows by averaging the finer rows. Network rows average
//! every route row in a bucket. All tables are recomputed in full each pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::analyzers::buckets::{Granularity, TimeBucket};
use crate::analyzers::grade::{Grade, grade};
use crate::analyzers::keyed::{Keyed, KeyedMap};
use crate::analyzers::scoring::{ComponentScore, RouteComponents};
use crate::analyzers::types::ServiceKey;
use crate::analyzers::utility::mean;
use crate::config::{SriConfig, Weights};

/// Score assumed for a component with no qualifying data.
pub const MISSING_COMPONENT_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Composite {
    pub composite: f64,
    pub grade: Grade,
    /// 25 per component present.
    pub data_completeness: f64,
}

pub fn compose(components: &RouteComponents, weights: &Weights) -> Composite {
    let score = |c: Option<&ComponentScore>| c.map_or(MISSING_COMPONENT_SCORE, |c| c.score);
    let composite = weights.headway * score(components.headway.as_ref())
        + weights.schedule * score(components.schedule.as_ref())
        + weights.journey_time * score(components.journey_time.as_ref())
        + weights.delivery * score(components.delivery.as_ref());

    Composite {
        composite,
        grade: grade(composite),
        data_completeness: 25.0 * components.present() as f64,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SriRecord {
    pub service: ServiceKey,
    pub bucket: TimeBucket,
    pub headway_score: Option<f64>,
    pub schedule_score: Option<f64>,
    pub journey_time_score: Option<f64>,
    pub delivery_score: Option<f64>,
    pub weights: Weights,
    pub composite: f64,
    pub grade: Grade,
    pub observation_count: u64,
    pub data_completeness: f64,
}

impl Keyed for SriRecord {
    type Key = (ServiceKey, TimeBucket);

    fn key(&self) -> Self::Key {
        (self.service.clone(), self.bucket)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeCounts {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
    pub f: u32,
}

impl GradeCounts {
    pub fn add(&mut self, g: Grade) {
        match g {
            Grade::A => self.a += 1,
            Grade::B => self.b += 1,
            Grade::C => self.c += 1,
            Grade::D => self.d += 1,
            Grade::F => self.f += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.a + self.b + self.c + self.d + self.f
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSriRecord {
    pub network: String,
    pub bucket: TimeBucket,
    pub composite: f64,
    pub grade: Grade,
    pub route_count: u32,
    pub grade_counts: GradeCounts,
    pub avg_headway_score: Option<f64>,
    pub avg_schedule_score: Option<f64>,
    pub avg_journey_time_score: Option<f64>,
    pub avg_delivery_score: Option<f64>,
    pub observation_count: u64,
}

impl Keyed for NetworkSriRecord {
    type Key = TimeBucket;

    fn key(&self) -> Self::Key {
        self.bucket
    }
}

fn mean_present(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let present: Vec<f64> = values.flatten().collect();
    (!present.is_empty()).then(|| mean(&present))
}

/// Builds hourly route rows for every service-bucket with enough
/// observations, then the daily, monthly and overall rows above them.
pub fn compose_route_rows(
    components: &BTreeMap<(ServiceKey, TimeBucket), RouteComponents>,
    sri: &SriConfig,
    min_observations: u64,
) -> KeyedMap<SriRecord> {
    let mut rows: KeyedMap<SriRecord> = components
        .iter()
        .filter(|(_, c)| c.observation_count() >= min_observations)
        .map(|((service, bucket), c)| {
            let composite = compose(c, &sri.weights);
            SriRecord {
                service: service.clone(),
                bucket: *bucket,
                headway_score: c.headway.map(|s| s.score),
                schedule_score: c.schedule.map(|s| s.score),
                journey_time_score: c.journey_time.map(|s| s.score),
                delivery_score: c.delivery.map(|s| s.score),
                weights: sri.weights,
                composite: composite.composite,
                grade: composite.grade,
                observation_count: c.observation_count(),
                data_completeness: composite.data_completeness,
            }
        })
        .collect();

    for level in [Granularity::Daily, Granularity::Monthly, Granularity::Overall] {
        let mut children: BTreeMap<(ServiceKey, TimeBucket), Vec<&SriRecord>> = BTreeMap::new();
        for row in rows
            .values()
            .filter(|r| Some(r.bucket.granularity()) == level.finer())
        {
            if let Some(parent) = row.bucket.coarsen() {
                children
                    .entry((row.service.clone(), parent))
                    .or_default()
                    .push(row);
            }
        }

        let coarse: Vec<SriRecord> = children
            .into_iter()
            .map(|((service, bucket), kids)| average_route_rows(service, bucket, &kids, sri))
            .collect();
        for row in coarse {
            rows.upsert(row);
        }
    }

    rows
}

fn average_route_rows(
    service: ServiceKey,
    bucket: TimeBucket,
    kids: &[&SriRecord],
    sri: &SriConfig,
) -> SriRecord {
    let composites: Vec<f64> = kids.iter().map(|r| r.composite).collect();
    let completeness: Vec<f64> = kids.iter().map(|r| r.data_completeness).collect();
    let composite = mean(&composites);

    SriRecord {
        service,
        bucket,
        headway_score: mean_present(kids.iter().map(|r| r.headway_score)),
        schedule_score: mean_present(kids.iter().map(|r| r.schedule_score)),
        journey_time_score: mean_present(kids.iter().map(|r| r.journey_time_score)),
        delivery_score: mean_present(kids.iter().map(|r| r.delivery_score)),
        weights: sri.weights,
        composite,
        grade: grade(composite),
        observation_count: kids.iter().map(|r| r.observation_count).sum(),
        data_completeness: mean(&completeness),
    }
}

/// Averages every route row of each bucket into one network row.
pub fn compose_network_rows(
    route_rows: &KeyedMap<SriRecord>,
    network: &str,
) -> KeyedMap<NetworkSriRecord> {
    let mut by_bucket: BTreeMap<TimeBucket, Vec<&SriRecord>> = BTreeMap::new();
    for row in route_rows.values() {
        by_bucket.entry(row.bucket).or_default().push(row);
    }

    by_bucket
        .into_iter()
        .map(|(bucket, routes)| {
            let composites: Vec<f64> = routes.iter().map(|r| r.composite).collect();
            let composite = mean(&composites);
            let mut grade_counts = GradeCounts::default();
            for r in &routes {
                grade_counts.add(r.grade);
            }

            NetworkSriRecord {
                network: network.to_string(),
                bucket,
                composite,
                grade: grade(composite),
                route_count: routes.len() as u32,
                grade_counts,
                avg_headway_score: mean_present(routes.iter().map(|r| r.headway_score)),
                avg_schedule_score: mean_present(routes.iter().map(|r| r.schedule_score)),
                avg_journey_time_score: mean_present(routes.iter().map(|r| r.journey_time_score)),
                avg_delivery_score: mean_present(routes.iter().map(|r| r.delivery_score)),
                observation_count: routes.iter().map(|r| r.observation_count).sum(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hourly(dow: u32, hour: u32) -> TimeBucket {
        TimeBucket::Hourly {
            year: 2025,
            month: 3,
            day_of_week: dow,
            hour,
        }
    }

    fn components(scores: [Option<f64>; 4], count: u64) -> RouteComponents {
        let c = |s: Option<f64>| s.map(|s| ComponentScore::new(s, count));
        RouteComponents {
            headway: c(scores[0]),
            schedule: c(scores[1]),
            journey_time: c(scores[2]),
            delivery: c(scores[3]),
        }
    }

    #[test]
    fn test_compose_weighted_sum() {
        let c = components([Some(90.0), Some(85.0), Some(80.0), Some(75.0)], 5);
        let out = compose(&c, &Weights::default());
        assert!((out.composite - (36.0 + 25.5 + 16.0 + 7.5)).abs() < 1e-9);
        assert_eq!(out.grade, Grade::B);
        assert_eq!(out.data_completeness, 100.0);
    }

    #[test]
    fn test_missing_components_count_as_fifty() {
        let c = components([Some(100.0), None, None, None], 12);
        let out = compose(&c, &Weights::default());
        assert!((out.composite - (40.0 + 0.6 * 50.0)).abs() < 1e-9);
        assert_eq!(out.data_completeness, 25.0);

        let empty = compose(&RouteComponents::default(), &Weights::default());
        assert!((empty.composite - 50.0).abs() < 1e-9);
        assert_eq!(empty.grade, Grade::F);
        assert_eq!(empty.data_completeness, 0.0);
    }

    #[test]
    fn test_identical_inputs_compose_identically() {
        let a = components([Some(73.0), Some(41.5), None, Some(99.0)], 4);
        let b = a.clone();
        assert_eq!(compose(&a, &Weights::default()), compose(&b, &Weights::default()));
    }

    #[test]
    fn test_route_rows_need_minimum_observations() {
        let service = ServiceKey::new("14", Some("outbound"), None);
        let mut input = BTreeMap::new();
        // Two components at 4 observations each = 8 < 10.
        input.insert(
            (service.clone(), hourly(2, 8)),
            components([Some(90.0), Some(90.0), None, None], 4),
        );
        input.insert(
            (service.clone(), hourly(2, 9)),
            components([Some(90.0), Some(90.0), Some(90.0), None], 4),
        );

        let rows = compose_route_rows(&input, &SriConfig::default(), 10);
        assert!(rows.get(&(service.clone(), hourly(2, 8))).is_none());
        let nine = rows.get(&(service.clone(), hourly(2, 9))).unwrap();
        assert_eq!(nine.observation_count, 12);
        assert_eq!(nine.data_completeness, 75.0);
    }

    #[test]
    fn test_coarse_route_rows_average_children() {
        let service = ServiceKey::new("14", Some("outbound"), None);
        let mut input = BTreeMap::new();
        input.insert(
            (service.clone(), hourly(2, 8)),
            components([Some(100.0), Some(100.0), Some(100.0), Some(100.0)], 5),
        );
        input.insert(
            (service.clone(), hourly(2, 9)),
            components([Some(60.0), None, Some(60.0), Some(60.0)], 5),
        );
        input.insert(
            (service.clone(), hourly(3, 9)),
            components([Some(80.0), Some(80.0), Some(80.0), Some(80.0)], 5),
        );

        let rows = compose_route_rows(&input, &SriConfig::default(), 10);
        let tuesday = rows
            .get(&(
                service.clone(),
                TimeBucket::Daily {
                    year: 2025,
                    month: 3,
                    day_of_week: 2,
                },
            ))
            .unwrap();
        let nine = rows.get(&(service.clone(), hourly(2, 9))).unwrap();
        assert!((tuesday.composite - (100.0 + nine.composite) / 2.0).abs() < 1e-9);
        assert_eq!(tuesday.schedule_score, Some(100.0));
        assert_eq!(tuesday.headway_score, Some(80.0));
        assert_eq!(tuesday.observation_count, 35);

        let overall = rows.get(&(service.clone(), TimeBucket::Overall)).unwrap();
        assert_eq!(overall.observation_count, 55);
        assert_eq!(rows.len(), 3 + 2 + 1 + 1);
    }

    #[test]
    fn test_route_rows_are_deterministic() {
        let service = ServiceKey::new("14", None, None);
        let mut input = BTreeMap::new();
        input.insert(
            (service, hourly(2, 8)),
            components([Some(77.0), Some(33.0), Some(55.0), None], 6),
        );
        let sri = SriConfig::default();
        assert_eq!(
            compose_route_rows(&input, &sri, 10),
            compose_route_rows(&input, &sri, 10)
        );
    }

    #[test]
    fn test_network_rows_carry_grade_distribution() {
        let mut input = BTreeMap::new();
        for (route, score) in [("14", 95.0), ("17", 85.0), ("26", 40.0)] {
            input.insert(
                (ServiceKey::new(route, None, None), hourly(2, 8)),
                components([Some(score); 4], 5),
            );
        }
        let route_rows = compose_route_rows(&input, &SriConfig::default(), 10);
        let network = compose_network_rows(&route_rows, "merseyside");

        let row = network.get(&hourly(2, 8)).unwrap();
        assert_eq!(row.route_count, 3);
        assert_eq!(row.grade_counts.a, 1);
        assert_eq!(row.grade_counts.b, 1);
        assert_eq!(row.grade_counts.f, 1);
        assert_eq!(row.grade_counts.total(), 3);
        assert!((row.composite - 220.0 / 3.0).abs() < 1e-9);
        assert_eq!(row.grade, Grade::C);
        assert_eq!(row.network, "merseyside");

        assert!(network.get(&TimeBucket::Overall).is_some());
    }
}
