//! The reliability pipeline.
//!
//! Vehicle positions become stop events, stop events are matched to
//! route-stops, arrivals feed headway baselines and bunching counts, and
//! everything is folded into bounded pattern tables that are scored into the
//! Service Reliability Index. [`analyzer::Pipeline::run_pass`] drives one
//! batch through every stage.

pub mod aggregate;
pub mod analyzer;
pub mod baseline;
pub mod buckets;
pub mod bunching;
pub mod grade;
pub mod keyed;
pub mod patterns;
pub mod scoring;
pub mod sri;
pub mod stop_events;
pub mod stop_matcher;
pub mod types;
pub mod utility;
