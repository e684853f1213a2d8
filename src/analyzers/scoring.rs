//! Maps aggregated metrics onto 0–100 component scores.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::analyzers::buckets::{Granularity, TimeBucket};
use crate::analyzers::aggregate::PatternSet;
use crate::analyzers::grade::{Grade, grade};
use crate::analyzers::patterns::PatternRecord;
use crate::analyzers::types::{HasService, ServiceKey};
use crate::config::{Anchor, PipelineConfig, SriConfig};

/// Linear interpolation from `anchor.poor` (0) to `anchor.excellent` (100),
/// clamped. Works in either direction, so lower-is-better metrics simply
/// carry `excellent < poor`. Infinities land on the matching end of the
/// scale; NaN scores 0.
pub fn score_linear(value: f64, anchor: Anchor) -> f64 {
    let span = anchor.excellent - anchor.poor;
    if span == 0.0 || value.is_nan() {
        return 0.0;
    }
    if value.is_infinite() {
        let toward_excellent = (value > 0.0) == (span > 0.0);
        return if toward_excellent { 100.0 } else { 0.0 };
    }
    let t = (value - anchor.poor) / span;
    (100.0 * t).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Headway,
    Schedule,
    JourneyTime,
    Delivery,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 4] = [
        ComponentKind::Headway,
        ComponentKind::Schedule,
        ComponentKind::JourneyTime,
        ComponentKind::Delivery,
    ];
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentKind::Headway => "headway",
            ComponentKind::Schedule => "schedule",
            ComponentKind::JourneyTime => "journey_time",
            ComponentKind::Delivery => "delivery",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub score: f64,
    pub grade: Grade,
    pub observation_count: u64,
}

impl ComponentScore {
    pub fn new(score: f64, observation_count: u64) -> Self {
        Self {
            score,
            grade: grade(score),
            observation_count,
        }
    }
}

/// The four component scores of one service in one bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteComponents {
    pub headway: Option<ComponentScore>,
    pub schedule: Option<ComponentScore>,
    pub journey_time: Option<ComponentScore>,
    pub delivery: Option<ComponentScore>,
}

impl RouteComponents {
    pub fn get(&self, kind: ComponentKind) -> Option<&ComponentScore> {
        match kind {
            ComponentKind::Headway => self.headway.as_ref(),
            ComponentKind::Schedule => self.schedule.as_ref(),
            ComponentKind::JourneyTime => self.journey_time.as_ref(),
            ComponentKind::Delivery => self.delivery.as_ref(),
        }
    }

    fn slot(&mut self, kind: ComponentKind) -> &mut Option<ComponentScore> {
        match kind {
            ComponentKind::Headway => &mut self.headway,
            ComponentKind::Schedule => &mut self.schedule,
            ComponentKind::JourneyTime => &mut self.journey_time,
            ComponentKind::Delivery => &mut self.delivery,
        }
    }

    pub fn present(&self) -> usize {
        ComponentKind::ALL
            .iter()
            .filter(|k| self.get(**k).is_some())
            .count()
    }

    pub fn observation_count(&self) -> u64 {
        ComponentKind::ALL
            .iter()
            .filter_map(|k| self.get(*k))
            .map(|c| c.observation_count)
            .sum()
    }
}

/// Count-weighted mean of per-entity scores within one service and bucket.
#[derive(Default)]
struct ScoreAccumulator {
    weighted: f64,
    count: u64,
}

impl ScoreAccumulator {
    fn add(&mut self, score: f64, count: u64) {
        self.weighted += score * count as f64;
        self.count += count;
    }

    fn finish(&self) -> Option<ComponentScore> {
        (self.count > 0).then(|| ComponentScore::new(self.weighted / self.count as f64, self.count))
    }
}

type Accumulators = BTreeMap<(ServiceKey, TimeBucket, ComponentKind), ScoreAccumulator>;

fn accumulate<'a, K: HasService + 'a, S: 'a>(
    acc: &mut Accumulators,
    kind: ComponentKind,
    rows: impl Iterator<Item = &'a PatternRecord<K, S>>,
    metric: impl Fn(&S) -> Option<f64>,
    anchor: Anchor,
) {
    for row in rows {
        let Some(value) = metric(&row.stats) else {
            continue;
        };
        acc.entry((row.key.service().clone(), row.bucket, kind))
            .or_default()
            .add(score_linear(value, anchor), row.observation_count);
    }
}

/// Scores every hourly pattern row that meets its family's minimum, grouped
/// by service and bucket.
pub fn component_scores(
    patterns: &PatternSet,
    sri: &SriConfig,
    config: &PipelineConfig,
) -> BTreeMap<(ServiceKey, TimeBucket), RouteComponents> {
    let hourly = Granularity::Hourly;
    let anchors = &sri.anchors;
    let mut acc = Accumulators::new();

    accumulate(
        &mut acc,
        ComponentKind::Headway,
        patterns
            .headway
            .qualifying(hourly, config.min_headway_observations),
        |s| s.headway.cv(),
        anchors.headway_cv,
    );
    accumulate(
        &mut acc,
        ComponentKind::Schedule,
        patterns
            .adherence
            .qualifying(hourly, config.min_adherence_observations),
        |s| Some(s.on_time_pct()),
        anchors.on_time_pct,
    );
    accumulate(
        &mut acc,
        ComponentKind::JourneyTime,
        patterns
            .journey
            .qualifying(hourly, config.min_journey_observations),
        |s| s.journey.cv(),
        anchors.journey_cv,
    );
    accumulate(
        &mut acc,
        ComponentKind::Delivery,
        patterns
            .delivery
            .qualifying(hourly, config.min_delivery_observations),
        |s| (s.scheduled_trips > 0).then(|| s.delivery_pct()),
        anchors.delivery_pct,
    );

    let mut out: BTreeMap<(ServiceKey, TimeBucket), RouteComponents> = BTreeMap::new();
    for ((service, bucket, kind), a) in acc {
        if let Some(score) = a.finish() {
            *out.entry((service, bucket)).or_default().slot(kind) = Some(score);
        }
    }
    out
}
