use crate::error::VifitError;
use crate::work_unit::WorkKey;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One vegetation-index observation as it appears in the input file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub pixel_id: u32,
    pub year: u16,
    pub doy: u16,
    pub value: f64,
}

/// A point of an input slice. `position` is the day of year relative to the unit's
/// own year, so padded neighbours of a pixel-year fall below 1 or above 365.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlicePoint {
    pub position: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSlice {
    pub points: Vec<SlicePoint>,
}

impl InputSlice {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Supplies the input slice for a key. Absence of data is `None` or an empty slice,
/// never an error. Implementations are shared read-only across workers.
pub trait SliceProvider: Send + Sync {
    fn slice(&self, key: &WorkKey) -> Option<InputSlice>;
}

/// Window sizes used when cutting slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceWindows {
    /// Days borrowed from the neighbouring years for a pixel-year slice.
    pub year_pad_days: u16,
    /// Half width (circular) of the day-of-year window for daily slices.
    pub daily_half_width: u16,
}

impl Default for SliceWindows {
    fn default() -> Self {
        Self {
            year_pad_days: 30,
            daily_half_width: 7,
        }
    }
}

pub fn days_in_year(year: u16) -> u16 {
    let y = year as u32;
    if (y % 4 == 0 && y % 100 != 0) || y % 400 == 0 {
        366
    } else {
        365
    }
}

/// In-memory observation index built from a JSON-lines file.
pub struct SeriesTable {
    by_pixel: FxHashMap<u32, Vec<Observation>>,
    by_doy: FxHashMap<u16, Vec<f64>>,
    windows: SliceWindows,
    observation_count: usize,
}

impl SeriesTable {
    pub fn from_observations(observations: Vec<Observation>, windows: SliceWindows) -> Self {
        let observation_count = observations.len();
        let mut by_pixel: FxHashMap<u32, Vec<Observation>> = FxHashMap::default();
        let mut by_doy: FxHashMap<u16, Vec<f64>> = FxHashMap::default();

        for obs in observations {
            by_doy.entry(obs.doy).or_default().push(obs.value);
            by_pixel.entry(obs.pixel_id).or_default().push(obs);
        }
        for series in by_pixel.values_mut() {
            series.sort_by_key(|o| (o.year, o.doy));
        }

        Self {
            by_pixel,
            by_doy,
            windows,
            observation_count,
        }
    }

    /// Load observations, one JSON object per line. Blank lines are skipped.
    pub fn load_jsonl<P: AsRef<Path>>(path: P, windows: SliceWindows) -> Result<Self, VifitError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VifitError::MissingInput(format!(
                "observation file {} does not exist",
                path.display()
            )));
        }

        let file = File::open(path)
            .map_err(|e| VifitError::MissingInput(format!("{}: {}", path.display(), e)))?;
        let reader = BufReader::new(file);

        let mut observations = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let obs: Observation = serde_json::from_str(trimmed).map_err(|e| {
                VifitError::Config(format!(
                    "{} line {}: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            if obs.doy == 0 || obs.doy > 366 {
                return Err(VifitError::Config(format!(
                    "{} line {}: day of year {} out of range",
                    path.display(),
                    line_no + 1,
                    obs.doy
                )));
            }
            observations.push(obs);
        }

        tracing::info!(
            "Loaded {} observations from {}",
            observations.len(),
            path.display()
        );
        Ok(Self::from_observations(observations, windows))
    }

    pub fn len(&self) -> usize {
        self.observation_count
    }

    pub fn is_empty(&self) -> bool {
        self.observation_count == 0
    }

    /// Distinct pixel ids, ascending.
    pub fn pixel_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.by_pixel.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Inclusive range of observed years.
    pub fn year_range(&self) -> Option<(u16, u16)> {
        self.by_pixel
            .values()
            .flat_map(|series| series.iter().map(|o| o.year))
            .fold(None, |acc, year| match acc {
                None => Some((year, year)),
                Some((lo, hi)) => Some((lo.min(year), hi.max(year))),
            })
    }

    pub fn has_leap_days(&self) -> bool {
        self.by_doy.contains_key(&366)
    }

    fn pixel_slice(&self, pixel_id: u32) -> Option<InputSlice> {
        let series = self.by_pixel.get(&pixel_id)?;
        let points = series
            .iter()
            .map(|o| SlicePoint {
                position: o.doy as f64,
                value: o.value,
            })
            .collect();
        Some(InputSlice { points })
    }

    fn pixel_year_slice(&self, pixel_id: u32, year: u16) -> Option<InputSlice> {
        let series = self.by_pixel.get(&pixel_id)?;
        let pad = self.windows.year_pad_days as i32;
        let prev_len = days_in_year(year.saturating_sub(1)) as i32;
        let this_len = days_in_year(year) as i32;

        let year = year as u32;
        let mut points = Vec::new();
        for obs in series {
            let doy = obs.doy as i32;
            let obs_year = obs.year as u32;
            let position = if obs_year == year {
                Some(doy)
            } else if obs_year + 1 == year && doy > prev_len - pad {
                Some(doy - prev_len)
            } else if obs_year == year + 1 && doy <= pad {
                Some(doy + this_len)
            } else {
                None
            };
            if let Some(position) = position {
                points.push(SlicePoint {
                    position: position as f64,
                    value: obs.value,
                });
            }
        }
        Some(InputSlice { points })
    }

    fn daily_slice(&self, doy: u16) -> Option<InputSlice> {
        let width = self.windows.daily_half_width as i32;
        let mut points = Vec::new();
        for offset in -width..=width {
            let day = (doy as i32 - 1 + offset).rem_euclid(365) + 1;
            if let Some(values) = self.by_doy.get(&(day as u16)) {
                points.extend(values.iter().map(|&value| SlicePoint {
                    position: day as f64,
                    value,
                }));
            }
        }
        if offset_covers_leap(doy, width) {
            if let Some(values) = self.by_doy.get(&366) {
                points.extend(values.iter().map(|&value| SlicePoint {
                    position: 366.0,
                    value,
                }));
            }
        }
        if points.is_empty() { None } else { Some(InputSlice { points }) }
    }
}

/// Day 366 only exists in leap years; it joins windows that reach the end of the year.
fn offset_covers_leap(doy: u16, width: i32) -> bool {
    doy == 366 || (doy as i32 + width) >= 366 || (doy as i32 - width) <= 0
}

impl SliceProvider for SeriesTable {
    fn slice(&self, key: &WorkKey) -> Option<InputSlice> {
        match *key {
            WorkKey::Pixel { pixel_id } => self.pixel_slice(pixel_id),
            WorkKey::PixelYear { pixel_id, year } => self.pixel_year_slice(pixel_id, year),
            WorkKey::DayOfYear { doy } => self.daily_slice(doy),
        }
    }
}
