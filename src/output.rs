//! Output formatting and file persistence helpers.
//!
//! Supports JSON reports, CSV append and atomic replacement.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Logs a value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Appends `rows` to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_records<T: Serialize>(path: impl AsRef<Path>, rows: &[T]) -> Result<()> {
    let path = path.as_ref();
    if rows.is_empty() {
        return Ok(());
    }
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, rows = rows.len(), "Appending CSV records");

    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    Ok(())
}

/// Serializes `rows` as a complete CSV document, header included.
pub fn csv_bytes<T: Serialize>(rows: &[T]) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to finish CSV buffer: {e}"))
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replaces `path` with `bytes` by writing a temporary sibling and renaming
/// it over the target, so readers never see a partial file.
pub async fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "File replaced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::env;
    use std::fs;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Row {
        timestamp: String,
        vehicles: u32,
    }

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&Row::default()).unwrap();
    }

    #[test]
    fn test_append_records_creates_file() {
        let path = temp_path("transit_sri_test_create.csv");
        let _ = fs::remove_file(&path); // clean up any prior run

        append_records(&path, &[Row::default()]).unwrap();

        assert!(Path::new(&path).exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.is_empty());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_records_writes_header_once() {
        let path = temp_path("transit_sri_test_header.csv");
        let _ = fs::remove_file(&path);

        append_records(&path, &[Row::default()]).unwrap();
        append_records(&path, &[Row::default(), Row::default()]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let header_count = content.lines().filter(|l| l.contains("timestamp")).count();
        assert_eq!(header_count, 1);
        // 1 header + 3 data rows
        assert_eq!(content.lines().count(), 4);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_csv_bytes_round_trip() {
        let rows = vec![
            Row {
                timestamp: "a".to_string(),
                vehicles: 1,
            },
            Row {
                timestamp: "b".to_string(),
                vehicles: 2,
            },
        ];
        let bytes = csv_bytes(&rows).unwrap();
        let back: Vec<Row> = csv::Reader::from_reader(&bytes[..])
            .deserialize()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(back, rows);
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_and_leaves_no_temp() {
        let path = temp_path("transit_sri_test_atomic.json");
        fs::write(&path, "old").unwrap();

        write_atomic(&path, b"new").await.unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert!(!Path::new(&format!("{path}.tmp")).exists());
        fs::remove_file(&path).unwrap();
    }
}
