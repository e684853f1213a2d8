//! Calendar buckets shared by the pattern and SRI tables.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
    Overall,
}

impl Granularity {
    /// The next finer level, whose rows feed this one.
    pub fn finer(&self) -> Option<Granularity> {
        match self {
            Granularity::Hourly => None,
            Granularity::Daily => Some(Granularity::Hourly),
            Granularity::Monthly => Some(Granularity::Daily),
            Granularity::Overall => Some(Granularity::Monthly),
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Granularity::Hourly),
            "daily" => Ok(Granularity::Daily),
            "monthly" => Ok(Granularity::Monthly),
            "overall" => Ok(Granularity::Overall),
            other => Err(anyhow::anyhow!("unknown granularity '{other}'")),
        }
    }
}

/// A time bucket. `Daily` is a day-of-week within a month (0 = Sunday), so a
/// month carries at most seven daily rows per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "granularity", rename_all = "snake_case")]
pub enum TimeBucket {
    Hourly {
        year: i32,
        month: u32,
        day_of_week: u32,
        hour: u32,
    },
    Daily {
        year: i32,
        month: u32,
        day_of_week: u32,
    },
    Monthly {
        year: i32,
        month: u32,
    },
    Overall,
}

impl TimeBucket {
    /// The hourly bucket containing `ts`, evaluated in `offset` local time.
    pub fn hourly_at(ts: DateTime<Utc>, offset: FixedOffset) -> Self {
        let local = ts.with_timezone(&offset);
        TimeBucket::Hourly {
            year: local.year(),
            month: local.month(),
            day_of_week: local.weekday().num_days_from_sunday(),
            hour: local.hour(),
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            TimeBucket::Hourly { .. } => Granularity::Hourly,
            TimeBucket::Daily { .. } => Granularity::Daily,
            TimeBucket::Monthly { .. } => Granularity::Monthly,
            TimeBucket::Overall => Granularity::Overall,
        }
    }

    /// The enclosing bucket one level coarser; `None` for `Overall`.
    pub fn coarsen(&self) -> Option<TimeBucket> {
        match *self {
            TimeBucket::Hourly {
                year,
                month,
                day_of_week,
                ..
            } => Some(TimeBucket::Daily {
                year,
                month,
                day_of_week,
            }),
            TimeBucket::Daily { year, month, .. } => Some(TimeBucket::Monthly { year, month }),
            TimeBucket::Monthly { .. } => Some(TimeBucket::Overall),
            TimeBucket::Overall => None,
        }
    }

    pub fn hour(&self) -> Option<u32> {
        match self {
            TimeBucket::Hourly { hour, .. } => Some(*hour),
            _ => None,
        }
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBucket::Hourly {
                year,
                month,
                day_of_week,
                hour,
            } => write!(f, "{year}-{month:02} dow={day_of_week} {hour:02}:00"),
            TimeBucket::Daily {
                year,
                month,
                day_of_week,
            } => write!(f, "{year}-{month:02} dow={day_of_week}"),
            TimeBucket::Monthly { year, month } => write!(f, "{year}-{month:02}"),
            TimeBucket::Overall => f.write_str("overall"),
        }
    }
}
