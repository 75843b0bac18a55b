use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three processing phases. Each phase has its own key shape and output schema.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// One baseline curve per pixel across all years.
    Climatology,
    /// One curve per pixel per year.
    YearCurve,
    /// Cross-pixel statistics per day of year.
    DailyAnomaly,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Climatology => "climatology",
            Phase::YearCurve => "year-curve",
            Phase::DailyAnomaly => "daily-anomaly",
        }
    }

    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            Phase::Climatology => &["pixel_id"],
            Phase::YearCurve => &["pixel_id", "year"],
            Phase::DailyAnomaly => &["doy"],
        }
    }

    /// Value columns of a result row, in order.
    pub fn value_columns(&self) -> &'static [&'static str] {
        match self {
            Phase::Climatology | Phase::YearCurve => {
                &["intercept", "amplitude", "peak_doy", "rmse", "n_obs"]
            }
            Phase::DailyAnomaly => &["mean", "sd", "n_obs"],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Composite key of one work unit. The derived ordering (variant, then fields in
/// declaration order) is the catalog's enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub enum WorkKey {
    Pixel { pixel_id: u32 },
    PixelYear { pixel_id: u32, year: u16 },
    DayOfYear { doy: u16 },
}

impl WorkKey {
    pub fn phase(&self) -> Phase {
        match self {
            WorkKey::Pixel { .. } => Phase::Climatology,
            WorkKey::PixelYear { .. } => Phase::YearCurve,
            WorkKey::DayOfYear { .. } => Phase::DailyAnomaly,
        }
    }

    /// Key values in the order of `Phase::key_columns`.
    pub fn key_fields(&self) -> Vec<String> {
        match self {
            WorkKey::Pixel { pixel_id } => vec![pixel_id.to_string()],
            WorkKey::PixelYear { pixel_id, year } => vec![pixel_id.to_string(), year.to_string()],
            WorkKey::DayOfYear { doy } => vec![doy.to_string()],
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkKey::Pixel { pixel_id } => write!(f, "pixel {}", pixel_id),
            WorkKey::PixelYear { pixel_id, year } => write!(f, "pixel {} year {}", pixel_id, year),
            WorkKey::DayOfYear { doy } => write!(f, "doy {}", doy),
        }
    }
}
