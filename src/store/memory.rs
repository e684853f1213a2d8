use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::{PositionStore, StateStore, covered};
use crate::positions::VehiclePosition;
use crate::state::AnalyticsState;

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: Mutex<Vec<VehiclePosition>>,
    state: Mutex<Option<AnalyticsState>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every buffered sample.
    pub async fn positions(&self) -> Vec<VehiclePosition> {
        self.positions.lock().await.clone()
    }

    /// The saved state, if any pass has saved one.
    pub async fn saved_state(&self) -> Option<AnalyticsState> {
        self.state.lock().await.clone()
    }

    pub async fn save_count(&self) -> usize {
        *self.saves.lock().await
    }
}

#[async_trait::async_trait]
impl PositionStore for MemoryStore {
    async fn append(&self, positions: &[VehiclePosition]) -> Result<usize> {
        let mut buffer = self.positions.lock().await;
        buffer.extend(positions.iter().cloned().map(|mut p| {
            p.processed = false;
            p
        }));
        Ok(positions.len())
    }

    async fn unprocessed(&self) -> Result<Vec<VehiclePosition>> {
        let buffer = self.positions.lock().await;
        Ok(buffer.iter().filter(|p| !p.processed).cloned().collect())
    }

    async fn mark_processed(&self, watermarks: &BTreeMap<String, DateTime<Utc>>) -> Result<usize> {
        let mut buffer = self.positions.lock().await;
        let mut changed = 0;
        for p in buffer.iter_mut().filter(|p| !p.processed) {
            if covered(p, watermarks) {
                p.processed = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut buffer = self.positions.lock().await;
        let before = buffer.len();
        buffer.retain(|p| p.timestamp >= cutoff);
        Ok(before - buffer.len())
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<AnalyticsState> {
        Ok(self.state.lock().await.clone().unwrap_or_default())
    }

    async fn save(&self, state: &AnalyticsState) -> Result<()> {
        *self.state.lock().await = Some(state.clone());
        *self.saves.lock().await += 1;
        Ok(())
    }
}
