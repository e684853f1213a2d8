use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gtfs_rt::FeedMessage;

/// Field coverage of one ingested feed. Logged after every ingest so feeds
/// that stop populating trips or timestamps show up early.
#[derive(Debug, Default, Serialize)]
pub struct IngestStats {
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
    pub feed_timestamp: Option<u64>,
    pub total_entities: usize,
    pub deleted: usize,
    pub vehicles: usize,

    // vehicle fields
    pub with_trip: usize,
    pub with_route_id: usize,
    pub with_direction: usize,
    pub with_vehicle_descriptor: usize,
    pub with_position: usize,
    pub with_timestamp: usize,
    pub with_stop_id: usize,

    /// Positions that made it into the buffer.
    pub positions_written: usize,
}

impl IngestStats {
    pub fn from_feed(feed: &FeedMessage) -> Self {
        let mut s = IngestStats {
            timestamp: Utc::now(),
            feed_timestamp: feed.header.timestamp,
            total_entities: feed.entity.len(),
            ..Default::default()
        };

        for e in &feed.entity {
            if e.is_deleted() {
                s.deleted += 1;
            }

            let Some(v) = &e.vehicle else { continue };
            s.vehicles += 1;

            if let Some(trip) = &v.trip {
                s.with_trip += 1;
                if trip.route_id.is_some() {
                    s.with_route_id += 1;
                }
                if trip.direction_id.is_some() {
                    s.with_direction += 1;
                }
            }

            if v.vehicle.is_some() {
                s.with_vehicle_descriptor += 1;
            }

            if v.position.is_some() {
                s.with_position += 1;
            }

            if v.timestamp.is_some() {
                s.with_timestamp += 1;
            }

            if v.stop_id.is_some() {
                s.with_stop_id += 1;
            }
        }

        s
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    pub fn position_pct(&self) -> f64 {
        Self::pct(self.with_position, self.vehicles)
    }

    pub fn route_pct(&self) -> f64 {
        Self::pct(self.with_route_id, self.vehicles)
    }

    pub fn direction_pct(&self) -> f64 {
        Self::pct(self.with_direction, self.vehicles)
    }

    /// Set the file the feed was read from.
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{
        FeedEntity, FeedHeader, FeedMessage, Position, TripDescriptor, VehiclePosition,
    };

    #[test]
    fn test_pct_with_zero_total() {
        assert_eq!(IngestStats::pct(10, 0), 0.0);
    }

    #[test]
    fn test_pct_normal_values() {
        assert_eq!(IngestStats::pct(50, 100), 50.0);
        assert_eq!(IngestStats::pct(1, 4), 25.0);
    }

    #[test]
    fn test_from_feed_empty() {
        let feed = FeedMessage {
            header: create_header(),
            entity: vec![],
        };
        let stats = IngestStats::from_feed(&feed);

        assert_eq!(stats.total_entities, 0);
        assert_eq!(stats.vehicles, 0);
        assert_eq!(stats.feed_timestamp, Some(1234567890));
    }

    #[test]
    fn test_from_feed_with_vehicle() {
        let feed = FeedMessage {
            header: create_header(),
            entity: vec![
                FeedEntity {
                    id: "v1".to_string(),
                    vehicle: Some(VehiclePosition {
                        trip: Some(TripDescriptor {
                            route_id: Some("r-14".to_string()),
                            ..Default::default()
                        }),
                        position: Some(Position {
                            latitude: 42.0,
                            longitude: -71.0,
                            bearing: Some(180.0),
                            speed: Some(10.5),
                            odometer: None,
                        }),
                        timestamp: Some(1234567890),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                FeedEntity {
                    id: "v2".to_string(),
                    is_deleted: Some(true),
                    ..Default::default()
                },
            ],
        };

        let stats = IngestStats::from_feed(&feed).with_source("feed.pb");

        assert_eq!(stats.source.as_deref(), Some("feed.pb"));
        assert_eq!(stats.total_entities, 2);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.vehicles, 1);
        assert_eq!(stats.with_trip, 1);
        assert_eq!(stats.with_route_id, 1);
        assert_eq!(stats.with_direction, 0);
        assert_eq!(stats.with_position, 1);
        assert_eq!(stats.with_timestamp, 1);
        assert_eq!(stats.position_pct(), 100.0);
        assert_eq!(stats.direction_pct(), 0.0);
    }

    #[test]
    fn test_route_pct() {
        let stats = IngestStats {
            vehicles: 100,
            with_route_id: 75,
            ..Default::default()
        };

        assert_eq!(stats.route_pct(), 75.0);
    }

    fn create_header() -> FeedHeader {
        FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp: Some(1234567890),
            feed_version: None,
        }
    }
}
