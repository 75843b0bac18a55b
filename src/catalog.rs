use crate::series::SeriesTable;
use crate::work_unit::{Phase, WorkKey};
use crate::VifitError;
use itertools::Itertools;
use rustc_hash::FxHashSet;

/// The complete, ordered set of work-unit keys for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    phase: Phase,
    keys: Vec<WorkKey>,
}

impl Catalog {
    /// Derive the catalog from the observations. Keys with no data are still enumerated;
    /// they fail with `InsufficientData` rather than being filtered here.
    pub fn from_series(phase: Phase, table: &SeriesTable, years: Option<(u16, u16)>) -> Result<Self, VifitError> {
        if table.is_empty() {
            return Err(VifitError::MissingInput("observation set is empty".to_string()));
        }

        let keys: Vec<WorkKey> = match phase {
            Phase::Climatology => table
                .pixel_ids()
                .into_iter()
                .map(|pixel_id| WorkKey::Pixel { pixel_id })
                .collect(),
            Phase::YearCurve => {
                let (first, last) = match years.or_else(|| table.year_range()) {
                    Some(range) => range,
                    None => return Err(VifitError::MissingInput("no observed years".to_string())),
                };
                if first > last {
                    return Err(VifitError::Config(format!("year range {}..{} is empty", first, last)));
                }
                table
                    .pixel_ids()
                    .into_iter()
                    .cartesian_product(first..=last)
                    .map(|(pixel_id, year)| WorkKey::PixelYear { pixel_id, year })
                    .collect()
            }
            Phase::DailyAnomaly => {
                let last_day = if table.has_leap_days() { 366 } else { 365 };
                (1..=last_day).map(|doy| WorkKey::DayOfYear { doy }).collect()
            }
        };

        Self::from_keys(phase, keys)
    }

    /// Build a catalog from explicit keys. Keys are sorted and deduplicated; a key of
    /// another phase is a configuration error.
    pub fn from_keys(phase: Phase, mut keys: Vec<WorkKey>) -> Result<Self, VifitError> {
        if let Some(foreign) = keys.iter().find(|k| k.phase() != phase) {
            return Err(VifitError::Config(format!("key {} does not belong to phase {}", foreign, phase)));
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(Self { phase, keys })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// All keys in enumeration order: by pixel then year, or by day of year.
    pub fn enumerate_all(&self) -> &[WorkKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_set(&self) -> FxHashSet<WorkKey> {
        self.keys.iter().copied().collect()
    }

    pub fn remaining(&self, completed: &FxHashSet<WorkKey>) -> Vec<WorkKey> {
        remaining(&self.keys, completed)
    }
}

/// Keys of `all` not in `completed`, in the order of `all`. One hash lookup per key.
pub fn remaining(all: &[WorkKey], completed: &FxHashSet<WorkKey>) -> Vec<WorkKey> {
    all.iter().filter(|k| !completed.contains(k)).copied().collect()
}
