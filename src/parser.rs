//! Protobuf parser for GTFS Realtime vehicle position feeds.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use prost::Message;
use std::io::Read;
use tracing::debug;

use crate::catalog::RouteNames;
use crate::gtfs_rt::FeedMessage;
use crate::positions::VehiclePosition;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes,
/// transparently inflating gzip-compressed payloads.
///
/// # Errors
///
/// Returns an error if the bytes are not valid gzip or not valid protobuf
/// for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut inflated = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut inflated)
            .context("failed to inflate gzip feed")?;
        debug!(compressed = bytes.len(), inflated = inflated.len(), "Feed inflated");
        return Ok(FeedMessage::decode(inflated.as_slice())?);
    }
    Ok(FeedMessage::decode(bytes)?)
}

/// Maps a GTFS `direction_id` onto the direction labels used by the stop
/// catalogue.
pub fn direction_label(direction_id: u32) -> Option<&'static str> {
    match direction_id {
        0 => Some("outbound"),
        1 => Some("inbound"),
        _ => None,
    }
}

/// Converts the vehicle entities of `feed` into position records.
///
/// Entities without a vehicle, a position or any timestamp are dropped, as
/// are deleted entities. The vehicle timestamp wins over the header's.
pub fn positions_from_feed(feed: &FeedMessage, routes: &RouteNames) -> Vec<VehiclePosition> {
    let header_ts = feed.header.timestamp;

    feed.entity
        .iter()
        .filter(|e| !e.is_deleted())
        .filter_map(|e| {
            let v = e.vehicle.as_ref()?;
            let pos = v.position.as_ref()?;
            let secs = v.timestamp.or(header_ts)?;
            let timestamp = DateTime::<Utc>::from_timestamp(i64::try_from(secs).ok()?, 0)?;

            let vehicle_id = v
                .vehicle
                .as_ref()
                .and_then(|d| d.id.clone().or_else(|| d.label.clone()))
                .unwrap_or_else(|| e.id.clone());
            let trip = v.trip.as_ref();

            Some(VehiclePosition {
                vehicle_id,
                route_name: trip
                    .and_then(|t| t.route_id.as_deref())
                    .map(|id| routes.resolve(id).to_string()),
                direction: trip
                    .and_then(|t| t.direction_id)
                    .and_then(direction_label)
                    .map(str::to_string),
                operator: None,
                latitude: Some(f64::from(pos.latitude)),
                longitude: Some(f64::from(pos.longitude)),
                timestamp,
                processed: false,
            })
        })
        .collect()
}
