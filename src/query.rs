//! Read-only views over persisted analytics state.
//!
//! Every query returns `None` when nothing qualifies, so callers can tell
//! "no data" apart from an empty selection they asked for.

use serde::Serialize;

use crate::analyzers::aggregate::{
    AdherenceStats, DeliveryStats, DwellStats, HeadwayStats, JourneyStats,
};
use crate::analyzers::buckets::{Granularity, TimeBucket};
use crate::analyzers::bunching::BunchingRecord;
use crate::analyzers::patterns::{PatternRecord, PatternStats, PatternTable};
use crate::analyzers::sri::{NetworkSriRecord, SriRecord};
use crate::analyzers::types::{HasService, SegmentKey, ServiceKey, StopServiceKey};
use crate::state::AnalyticsState;

/// Row selection shared by the route-level queries. Unset fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SriFilter {
    pub route: Option<String>,
    pub direction: Option<String>,
    pub operator: Option<String>,
    pub granularity: Option<Granularity>,
    pub bucket: Option<TimeBucket>,
    pub min_observations: u64,
}

impl SriFilter {
    pub fn for_route(route: &str) -> Self {
        Self {
            route: Some(route.to_string()),
            ..Default::default()
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = Some(granularity);
        self
    }

    fn matches_service(&self, service: &ServiceKey) -> bool {
        self.route.as_ref().is_none_or(|r| *r == service.route_name)
            && self.direction.as_ref().is_none_or(|d| *d == service.direction)
            && self.operator.as_ref().is_none_or(|o| *o == service.operator)
    }

    fn matches_bucket(&self, bucket: &TimeBucket) -> bool {
        self.granularity.is_none_or(|g| g == bucket.granularity())
            && self.bucket.is_none_or(|b| b == *bucket)
    }

    fn matches<K: HasService, S>(&self, row: &PatternRecord<K, S>) -> bool {
        self.matches_service(row.key.service())
            && self.matches_bucket(&row.bucket)
            && row.observation_count >= self.min_observations
    }
}

fn non_empty<T>(rows: Vec<T>) -> Option<Vec<T>> {
    (!rows.is_empty()).then_some(rows)
}

/// Route SRI rows matching `filter`.
pub fn route_sri<'a>(state: &'a AnalyticsState, filter: &SriFilter) -> Option<Vec<&'a SriRecord>> {
    non_empty(
        state
            .route_sri
            .values()
            .filter(|r| {
                filter.matches_service(&r.service)
                    && filter.matches_bucket(&r.bucket)
                    && r.observation_count >= filter.min_observations
            })
            .collect(),
    )
}

/// Network SRI rows, optionally restricted to one granularity.
pub fn network_sri(
    state: &AnalyticsState,
    granularity: Option<Granularity>,
) -> Option<Vec<&NetworkSriRecord>> {
    non_empty(
        state
            .network_sri
            .values()
            .filter(|r| granularity.is_none_or(|g| g == r.bucket.granularity()))
            .collect(),
    )
}

/// Pattern rows of every family for the services selected by a filter.
#[derive(Debug, Serialize)]
pub struct RoutePatterns<'a> {
    pub headway: Vec<&'a PatternRecord<StopServiceKey, HeadwayStats>>,
    pub adherence: Vec<&'a PatternRecord<StopServiceKey, AdherenceStats>>,
    pub journey: Vec<&'a PatternRecord<SegmentKey, JourneyStats>>,
    pub delivery: Vec<&'a PatternRecord<ServiceKey, DeliveryStats>>,
    pub dwell: Vec<&'a PatternRecord<StopServiceKey, DwellStats>>,
}

impl RoutePatterns<'_> {
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

fn select<'a, K, S>(
    table: &'a PatternTable<K, S>,
    filter: &SriFilter,
) -> Vec<&'a PatternRecord<K, S>>
where
    K: Ord + Clone + std::fmt::Debug + HasService,
    S: PatternStats,
{
    table.rows().filter(|r| filter.matches(r)).collect()
}

pub fn patterns_for_route<'a>(
    state: &'a AnalyticsState,
    filter: &SriFilter,
) -> Option<RoutePatterns<'a>> {
    let patterns = &state.patterns;
    let found = RoutePatterns {
        headway: select(&patterns.headway, filter),
        adherence: select(&patterns.adherence, filter),
        journey: select(&patterns.journey, filter),
        delivery: select(&patterns.delivery, filter),
        dwell: select(&patterns.dwell, filter),
    };
    (!found.is_empty()).then_some(found)
}

/// The (route, stop, hour) cells with the highest bunching rate, among cells
/// with at least `min_headways` classified headways.
pub fn bunching_hotspots<'a>(
    state: &'a AnalyticsState,
    route: Option<&str>,
    min_headways: u64,
    limit: usize,
) -> Option<Vec<&'a BunchingRecord>> {
    let mut rows: Vec<&BunchingRecord> = state
        .bunching
        .values()
        .filter(|r| route.is_none_or(|route| r.route_name == route))
        .filter(|r| r.total_headways >= min_headways && r.bunched > 0)
        .collect();
    rows.sort_by(|a, b| b.rate().total_cmp(&a.rate()));
    rows.truncate(limit);
    non_empty(rows)
}
