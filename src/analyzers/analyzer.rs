use anyhow::Result;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use crate::analyzers::aggregate::{FoldCounts, fold_arrivals};
use crate::analyzers::baseline::HeadwaySample;
use crate::analyzers::bunching::classify;
use crate::analyzers::scoring::component_scores;
use crate::analyzers::sri::{compose_network_rows, compose_route_rows};
use crate::analyzers::stop_events::detect_stop_events;
use crate::analyzers::stop_matcher::StopIndex;
use crate::analyzers::types::{Arrival, ClassifiedArrival, MatchOutcome, UnmatchedReason};
use crate::catalog::{PlannedTrips, StopCatalog};
use crate::config::{PipelineConfig, SriConfigSet};
use crate::state::AnalyticsState;
use crate::store::{PositionStore, StateStore};

/// Vehicles silent for longer than this lose their watermark.
const WATERMARK_HORIZON_DAYS: i64 = 1;

/// What one pass did, for logging and the CLI report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    pub sri_config: String,
    pub positions_read: usize,
    pub already_analysed: usize,
    pub malformed: usize,
    pub stop_events: usize,
    pub arrivals: usize,
    pub unmatched: BTreeMap<UnmatchedReason, usize>,
    pub headways: usize,
    pub bunched: usize,
    pub baselines_updated: usize,
    pub folded: FoldCounts,
    pub route_sri_rows: usize,
    pub network_sri_rows: usize,
    pub marked_processed: usize,
    pub purged: usize,
}

impl PassReport {
    pub fn unmatched_total(&self) -> usize {
        self.unmatched.values().sum()
    }
}

/// The analysis pipeline with its per-run inputs resolved.
pub struct Pipeline {
    index: StopIndex,
    config: PipelineConfig,
    sri_configs: SriConfigSet,
    planned: PlannedTrips,
}

impl Pipeline {
    pub fn new(catalog: &StopCatalog, config: PipelineConfig, sri_configs: SriConfigSet) -> Self {
        let index = StopIndex::build(catalog, config.match_radius_m);
        Self {
            index,
            config,
            sri_configs,
            planned: PlannedTrips::default(),
        }
    }

    pub fn with_planned_trips(mut self, planned: PlannedTrips) -> Self {
        self.planned = planned;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one batch pass: positions to stop events, arrivals, baselines,
    /// bunching, patterns and SRI rows.
    ///
    /// State is saved as a whole before positions are marked processed;
    /// samples at or before a vehicle's watermark are never analysed twice, so
    /// rerunning after a failure anywhere in the pass does not double count.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn run_pass(
        &self,
        positions: &impl PositionStore,
        states: &impl StateStore,
        now: DateTime<Utc>,
    ) -> Result<PassReport> {
        let config = &self.config;
        let offset = config.local_offset();
        let sri = self.sri_configs.active(now.with_timezone(&offset).date_naive())?;

        let mut state = states.load().await?;
        let batch = positions.unprocessed().await?;

        let mut report = PassReport {
            sri_config: sri.name.clone(),
            positions_read: batch.len(),
            ..PassReport::default()
        };

        let mut latest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for p in &batch {
            latest
                .entry(p.vehicle_id.clone())
                .and_modify(|t| *t = (*t).max(p.timestamp))
                .or_insert(p.timestamp);
        }
        let fresh: Vec<_> = batch
            .into_iter()
            .filter(|p| !state.already_seen(&p.vehicle_id, p.timestamp))
            .collect();
        report.already_analysed = report.positions_read - fresh.len();

        let detection = detect_stop_events(&fresh, config.same_location, config.polling_interval_secs);
        report.malformed = detection.malformed;
        report.stop_events = detection.events.len();

        let mut arrivals: Vec<Arrival> = Vec::new();
        for event in &detection.events {
            match self.index.match_event(event) {
                MatchOutcome::Matched(arrival) => arrivals.push(arrival),
                MatchOutcome::Unmatched(reason) => {
                    debug!(vehicle_id = %event.vehicle_id, %reason, "Stop event unmatched");
                    *report.unmatched.entry(reason).or_default() += 1;
                }
            }
        }
        arrivals.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.vehicle_id.cmp(&b.vehicle_id))
                .then_with(|| a.stop_id.cmp(&b.stop_id))
        });
        report.arrivals = arrivals.len();

        let (classified, samples) = classify_arrivals(&mut state, arrivals, config, now);
        report.headways = samples.len();
        report.bunched = classified.iter().filter(|c| c.bunched == Some(true)).count();

        report.baselines_updated = state.baselines.learn(&samples, config, now);

        report.folded = fold_arrivals(
            &mut state.patterns,
            &mut state.trackers,
            &classified,
            &self.planned,
            config,
            now,
        );
        state.patterns.coarsen_all();

        let components = component_scores(&state.patterns, sri, config);
        state.route_sri = compose_route_rows(&components, sri, config.min_sri_observations);
        state.network_sri = compose_network_rows(&state.route_sri, &config.network_name);
        report.route_sri_rows = state.route_sri.len();
        report.network_sri_rows = state.network_sri.len();

        for (vehicle_id, ts) in &latest {
            state.advance_watermark(vehicle_id, *ts);
        }
        state.watermarks.retain(|_, w| *w >= now - Duration::days(WATERMARK_HORIZON_DAYS));
        let headway_window =
            Duration::milliseconds((config.max_measured_headway_minutes * 60_000.0) as i64);
        state.headways.prune(now - headway_window);
        state.trackers.prune(now, config);
        state.last_pass_at = Some(now);

        states.save(&state).await?;

        report.marked_processed = positions.mark_processed(&latest).await?;
        let retention_cutoff = now - Duration::minutes(config.position_retention_minutes);
        report.purged = positions.purge_older_than(retention_cutoff).await?;

        info!(
            positions = report.positions_read,
            events = report.stop_events,
            arrivals = report.arrivals,
            unmatched = report.unmatched_total(),
            headways = report.headways,
            bunched = report.bunched,
            route_rows = report.route_sri_rows,
            "Pass complete"
        );
        Ok(report)
    }
}

/// Measures headways in arrival order and classifies each one against the
/// baseline as it stood before this batch.
fn classify_arrivals(
    state: &mut AnalyticsState,
    arrivals: Vec<Arrival>,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> (Vec<ClassifiedArrival>, Vec<HeadwaySample>) {
    let offset = config.local_offset();
    let mut classified = Vec::with_capacity(arrivals.len());
    let mut samples = Vec::new();

    for arrival in arrivals {
        let hour = arrival.timestamp.with_timezone(&offset).hour();
        let headway = state
            .headways
            .observe(&arrival)
            .filter(|h| *h > 0.0 && *h < config.max_measured_headway_minutes);

        let bunched = headway.map(|h| {
            let baseline = state.baselines.best_baseline(
                &arrival.route_name,
                &arrival.stop_id,
                hour,
                now,
                config,
            );
            let bunched = classify(h, baseline.minutes, config);
            state.bunching.record(
                &arrival.route_name,
                &arrival.stop_id,
                hour,
                bunched,
                baseline.minutes,
                now,
            );
            samples.push(HeadwaySample {
                route_name: arrival.route_name.clone(),
                stop_id: arrival.stop_id.clone(),
                hour,
                minutes: h,
            });
            bunched
        });

        classified.push(ClassifiedArrival {
            arrival,
            headway_minutes: headway,
            bunched,
        });
    }

    (classified, samples)
}
