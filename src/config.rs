//! Pipeline and scoring configuration.
//!
//! [`PipelineConfig`] carries the empirically tuned constants of the
//! detection/matching/learning stages. [`SriConfigSet`] holds one or more
//! scoring configurations; exactly one is resolved per pass with
//! [`SriConfigSet::active`] and handed to the scorer and composer.
//!
//! Both are stored as plain JSON on disk, every field optional:
//! ```json
//! { "match_radius_m": 25.0, "same_location": { "rule": "displacement", "tolerance_m": 5.0 } }
//! ```

use anyhow::{Context, Result, bail};
use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How two adjacent samples are judged to be "in the same place".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SameLocationRule {
    /// Great-circle displacement strictly below `tolerance_m`.
    Displacement { tolerance_m: f64 },
    /// Samples reported in the same polling round (identical timestamps).
    PollingRound,
}

impl Default for SameLocationRule {
    fn default() -> Self {
        SameLocationRule::Displacement { tolerance_m: 5.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upstream polling interval; each dwell sample counts for this many seconds.
    pub polling_interval_secs: u32,
    pub same_location: SameLocationRule,
    pub match_radius_m: f64,

    /// Headways outside this open interval are not learned into baselines.
    pub baseline_min_headway_minutes: f64,
    pub baseline_max_headway_minutes: f64,
    /// Weight of the newest batch when blending into a stored baseline.
    pub baseline_blend: f64,
    /// Hour-specific baselines older than this are ignored by the classifier.
    pub hourly_lookback_days: i64,

    pub bunching_ratio: f64,
    pub bunching_floor_minutes: f64,
    pub default_baseline_minutes: f64,

    /// Headways at or above this are treated as service gaps and not measured.
    pub max_measured_headway_minutes: f64,

    pub min_headway_observations: u64,
    pub min_adherence_observations: u64,
    pub min_journey_observations: u64,
    pub min_delivery_observations: u64,
    pub min_sri_observations: u64,

    pub on_time_window_minutes: f64,
    pub adherence_baseline_min_observations: u64,
    pub journey_min_minutes: f64,
    pub journey_max_minutes: f64,

    pub position_retention_minutes: i64,
    /// Offset applied before deriving hour, weekday and service date.
    pub utc_offset_minutes: i32,
    pub network_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 10,
            same_location: SameLocationRule::default(),
            match_radius_m: 30.0,
            baseline_min_headway_minutes: 1.0,
            baseline_max_headway_minutes: 60.0,
            baseline_blend: 0.3,
            hourly_lookback_days: 7,
            bunching_ratio: 0.5,
            bunching_floor_minutes: 2.0,
            default_baseline_minutes: 10.0,
            max_measured_headway_minutes: 120.0,
            min_headway_observations: 3,
            min_adherence_observations: 5,
            min_journey_observations: 3,
            min_delivery_observations: 3,
            min_sri_observations: 10,
            on_time_window_minutes: 2.0,
            adherence_baseline_min_observations: 10,
            journey_min_minutes: 0.5,
            journey_max_minutes: 60.0,
            position_retention_minutes: 15,
            utc_offset_minutes: 0,
            network_name: "network".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Loads the config from a JSON file at `path`; missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .with_context(|| format!("invalid pipeline config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling_interval_secs == 0 {
            bail!("polling_interval_secs must be positive");
        }
        if let SameLocationRule::Displacement { tolerance_m } = self.same_location {
            if !(tolerance_m > 0.0) {
                bail!("same-location tolerance must be positive, got {tolerance_m}");
            }
        }
        if !(self.match_radius_m > 0.0) {
            bail!("match_radius_m must be positive, got {}", self.match_radius_m);
        }
        if !(self.baseline_blend > 0.0 && self.baseline_blend <= 1.0) {
            bail!("baseline_blend must be in (0, 1], got {}", self.baseline_blend);
        }
        if self.baseline_min_headway_minutes >= self.baseline_max_headway_minutes {
            bail!("baseline headway band is empty");
        }
        if self.journey_min_minutes >= self.journey_max_minutes {
            bail!("journey time band is empty");
        }
        if !(self.default_baseline_minutes > 0.0) {
            bail!("default_baseline_minutes must be positive");
        }
        if self.offset().is_none() {
            bail!("utc_offset_minutes out of range: {}", self.utc_offset_minutes);
        }
        Ok(())
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
    }

    /// The configured offset, falling back to UTC when out of range.
    pub fn local_offset(&self) -> FixedOffset {
        self.offset().unwrap_or_else(|| Utc.fix())
    }
}

/// Weights of the four SRI components. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub headway: f64,
    pub schedule: f64,
    pub journey_time: f64,
    pub delivery: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            headway: 0.4,
            schedule: 0.3,
            journey_time: 0.2,
            delivery: 0.1,
        }
    }
}

impl Weights {
    pub fn sum(&self) -> f64 {
        self.headway + self.schedule + self.journey_time + self.delivery
    }
}

/// Raw values that map to a score of 100 (`excellent`) and 0 (`poor`).
///
/// When `excellent < poor` lower raw values are better (variability);
/// otherwise higher raw values are better (percentages).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub excellent: f64,
    pub poor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchors {
    pub headway_cv: Anchor,
    pub on_time_pct: Anchor,
    pub journey_cv: Anchor,
    pub delivery_pct: Anchor,
}

impl Default for Anchors {
    fn default() -> Self {
        Self {
            headway_cv: Anchor {
                excellent: 0.1,
                poor: 0.8,
            },
            on_time_pct: Anchor {
                excellent: 95.0,
                poor: 50.0,
            },
            journey_cv: Anchor {
                excellent: 0.1,
                poor: 0.5,
            },
            delivery_pct: Anchor {
                excellent: 98.0,
                poor: 80.0,
            },
        }
    }
}

/// One scoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SriConfig {
    pub name: String,
    pub effective_date: NaiveDate,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default)]
    pub anchors: Anchors,
}

fn default_true() -> bool {
    true
}

impl Default for SriConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            effective_date: NaiveDate::default(),
            is_active: true,
            weights: Weights::default(),
            anchors: Anchors::default(),
        }
    }
}

impl SriConfig {
    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        for (label, value) in [
            ("headway", w.headway),
            ("schedule", w.schedule),
            ("journey_time", w.journey_time),
            ("delivery", w.delivery),
        ] {
            if !(value >= 0.0) {
                bail!("config '{}': {label} weight must be non-negative", self.name);
            }
        }
        if (w.sum() - 1.0).abs() > 1e-3 {
            bail!(
                "config '{}': weights must sum to 1.0, got {:.4}",
                self.name,
                w.sum()
            );
        }

        let a = &self.anchors;
        for (label, anchor) in [
            ("headway_cv", a.headway_cv),
            ("on_time_pct", a.on_time_pct),
            ("journey_cv", a.journey_cv),
            ("delivery_pct", a.delivery_pct),
        ] {
            if !anchor.excellent.is_finite()
                || !anchor.poor.is_finite()
                || (anchor.excellent - anchor.poor).abs() < f64::EPSILON
            {
                bail!(
                    "config '{}': {label} anchors must be finite and distinct",
                    self.name
                );
            }
        }
        Ok(())
    }
}

/// All known scoring configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SriConfigSet {
    configs: Vec<SriConfig>,
}

impl Default for SriConfigSet {
    fn default() -> Self {
        Self {
            configs: vec![SriConfig::default()],
        }
    }
}

impl SriConfigSet {
    pub fn new(configs: Vec<SriConfig>) -> Self {
        Self { configs }
    }

    /// Loads a JSON array of [`SriConfig`] from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read SRI config {}", path.display()))?;
        let configs: Vec<SriConfig> = serde_json::from_str(&content)
            .with_context(|| format!("invalid SRI config {}", path.display()))?;
        Ok(Self { configs })
    }

    /// Resolves the single effective configuration on `date`: the active entry
    /// with the latest `effective_date` not after `date`.
    pub fn active(&self, date: NaiveDate) -> Result<&SriConfig> {
        let config = self
            .configs
            .iter()
            .filter(|c| c.is_active && c.effective_date <= date)
            .max_by_key(|c| c.effective_date)
            .ok_or_else(|| anyhow::anyhow!("no active SRI config effective on {date}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SriConfig> {
        self.configs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn named(name: &str, effective: NaiveDate, active: bool) -> SriConfig {
        SriConfig {
            name: name.to_string(),
            effective_date: effective,
            is_active: active,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
        SriConfig::default().validate().unwrap();
        assert!((Weights::default().sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_pipeline_config_takes_defaults() {
        let path = temp_path("transit_sri_test_pipeline.json");
        fs::write(
            &path,
            r#"{ "match_radius_m": 25.0, "same_location": { "rule": "polling_round" } }"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.match_radius_m, 25.0);
        assert_eq!(config.same_location, SameLocationRule::PollingRound);
        assert_eq!(config.polling_interval_secs, 10);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_invalid_pipeline_config_rejected() {
        let config = PipelineConfig {
            match_radius_m: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            same_location: SameLocationRule::Displacement { tolerance_m: -1.0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_active_picks_latest_effective_active_config() {
        let set = SriConfigSet::new(vec![
            named("v1", date(2024, 1, 1), true),
            named("v2", date(2025, 1, 1), true),
            named("v3-draft", date(2025, 2, 1), false),
            named("v4-future", date(2026, 1, 1), true),
        ]);

        assert_eq!(set.active(date(2025, 6, 1)).unwrap().name, "v2");
        assert_eq!(set.active(date(2024, 6, 1)).unwrap().name, "v1");
        assert_eq!(set.active(date(2026, 1, 1)).unwrap().name, "v4-future");
        assert!(set.active(date(2023, 1, 1)).is_err());
    }

    #[test]
    fn test_active_rejects_bad_weights() {
        let mut bad = named("bad", date(2024, 1, 1), true);
        bad.weights.delivery = 0.5;
        let set = SriConfigSet::new(vec![bad]);
        assert!(set.active(date(2025, 1, 1)).is_err());
    }

    #[test]
    fn test_rejects_equal_anchors() {
        let mut bad = SriConfig::default();
        bad.anchors.journey_cv = Anchor {
            excellent: 0.3,
            poor: 0.3,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_load_sri_config_set() {
        let path = temp_path("transit_sri_test_sri_config.json");
        fs::write(
            &path,
            r#"[{ "name": "spring", "effective_date": "2025-03-01",
                  "weights": { "headway": 0.25, "schedule": 0.25, "journey_time": 0.25, "delivery": 0.25 } }]"#,
        )
        .unwrap();

        let set = SriConfigSet::load(&path).unwrap();
        let active = set.active(date(2025, 3, 1)).unwrap();
        assert_eq!(active.name, "spring");
        assert_eq!(active.weights.delivery, 0.25);
        assert_eq!(active.anchors, Anchors::default());

        fs::remove_file(&path).unwrap();
    }
}
