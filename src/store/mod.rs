//! Persistence seams for the pipeline.
//!
//! [`PositionStore`] is the buffer of recent vehicle positions written by
//! ingestion and drained by analysis passes. [`StateStore`] holds the
//! analytics state between passes. [`MemoryStore`] implements both for
//! tests; [`FilePositionStore`] and [`JsonStateStore`] back the CLI.

mod file;
mod memory;

pub use file::{FilePositionStore, JsonStateStore};
pub use memory::MemoryStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::positions::VehiclePosition;
use crate::state::AnalyticsState;

#[async_trait::async_trait]
pub trait PositionStore: Send + Sync {
    /// Adds new samples, unprocessed.
    async fn append(&self, positions: &[VehiclePosition]) -> Result<usize>;

    /// Every sample not yet marked processed.
    async fn unprocessed(&self) -> Result<Vec<VehiclePosition>>;

    /// Marks each vehicle's samples at or before its watermark as processed.
    /// Returns how many samples changed.
    async fn mark_processed(&self, watermarks: &BTreeMap<String, DateTime<Utc>>) -> Result<usize>;

    /// Deletes samples older than `cutoff`, processed or not.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// The last saved state, or the empty state on first run.
    async fn load(&self) -> Result<AnalyticsState>;

    /// Replaces the saved state as a whole.
    async fn save(&self, state: &AnalyticsState) -> Result<()>;
}

fn covered(p: &VehiclePosition, watermarks: &BTreeMap<String, DateTime<Utc>>) -> bool {
    watermarks
        .get(&p.vehicle_id)
        .is_some_and(|w| p.timestamp <= *w)
}
