use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{PositionStore, StateStore, covered};
use crate::output::{append_records, csv_bytes, write_atomic};
use crate::positions::VehiclePosition;
use crate::state::AnalyticsState;

/// Position buffer kept as a single CSV file.
///
/// Appends add rows in place; updates and purges rewrite the whole file
/// through a temporary sibling.
#[derive(Debug)]
pub struct FilePositionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<VehiclePosition>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };

        let mut rdr = csv::Reader::from_reader(&bytes[..]);
        let mut rows = Vec::new();
        for (line, result) in rdr.deserialize::<VehiclePosition>().enumerate() {
            match result {
                Ok(p) => rows.push(p),
                Err(e) => warn!(line = line + 2, error = %e, "Skipping malformed position row"),
            }
        }
        Ok(rows)
    }

    /// An empty CSV carries no header, so an empty buffer removes the file
    /// and the next append starts it afresh.
    async fn rewrite(&self, rows: &[VehiclePosition]) -> Result<()> {
        if rows.is_empty() {
            return match tokio::fs::remove_file(&self.path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e)
                    .with_context(|| format!("failed to remove {}", self.path.display())),
                _ => Ok(()),
            };
        }
        write_atomic(&self.path, &csv_bytes(rows)?).await
    }
}

#[async_trait::async_trait]
impl PositionStore for FilePositionStore {
    async fn append(&self, positions: &[VehiclePosition]) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let rows: Vec<VehiclePosition> = positions
            .iter()
            .cloned()
            .map(|mut p| {
                p.processed = false;
                p
            })
            .collect();
        append_records(&self.path, &rows)?;
        Ok(rows.len())
    }

    async fn unprocessed(&self) -> Result<Vec<VehiclePosition>> {
        let _guard = self.lock.lock().await;
        let rows = self.read_all().await?;
        Ok(rows.into_iter().filter(|p| !p.processed).collect())
    }

    async fn mark_processed(&self, watermarks: &BTreeMap<String, DateTime<Utc>>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut rows = self.read_all().await?;
        let mut changed = 0;
        for p in rows.iter_mut().filter(|p| !p.processed) {
            if covered(p, watermarks) {
                p.processed = true;
                changed += 1;
            }
        }
        if changed > 0 {
            self.rewrite(&rows).await?;
        }
        debug!(changed, "Positions marked processed");
        Ok(changed)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut rows = self.read_all().await?;
        let before = rows.len();
        rows.retain(|p| p.timestamp >= cutoff);
        let purged = before - rows.len();
        if purged > 0 {
            self.rewrite(&rows).await?;
        }
        debug!(purged, %cutoff, "Positions purged");
        Ok(purged)
    }
}

/// Analytics state kept as a JSON snapshot.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<AnalyticsState> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No saved state, starting fresh");
                return Ok(AnalyticsState::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse state {}", self.path.display()))
    }

    async fn save(&self, state: &AnalyticsState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes).await
    }
}
