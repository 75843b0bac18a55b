#![allow(dead_code)]

use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use vifit::catalog::Catalog;
use vifit::config::RunConfig;
use vifit::fit::{FitFactory, FitFunction, FitParams};
use vifit::outcome::{FailureReason, Outcome, ResultRow};
use vifit::series::{InputSlice, SlicePoint, SliceProvider};
use vifit::work_unit::{Phase, WorkKey};

/// Hands every key the same one-point slice. The scripted fitter ignores it.
pub struct SyntheticProvider;

impl SliceProvider for SyntheticProvider {
    fn slice(&self, _key: &WorkKey) -> Option<InputSlice> {
        Some(InputSlice {
            points: vec![SlicePoint {
                position: 1.0,
                value: 0.5,
            }],
        })
    }
}

/// Deterministic stand-in for a real fit: pixels in `fail` fail with `NonConvergence`,
/// `panic_on` panics, everything else succeeds. Counts every attempt.
#[derive(Clone)]
pub struct ScriptedFactory {
    pub fail: Option<RangeInclusive<u32>>,
    pub panic_on: Option<u32>,
    /// Refuse to build a fit context on rayon worker threads.
    pub break_pool: bool,
    /// Like `break_pool`, but only until a fit context is built off the pool.
    pub break_pool_once: Arc<AtomicBool>,
    pub attempts: Arc<AtomicUsize>,
    /// Attempts that ran on rayon worker threads.
    pub pool_attempts: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn succeeding() -> Self {
        Self {
            fail: None,
            panic_on: None,
            break_pool: false,
            break_pool_once: Arc::new(AtomicBool::new(false)),
            attempts: Arc::new(AtomicUsize::new(0)),
            pool_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(fail: RangeInclusive<u32>) -> Self {
        Self {
            fail: Some(fail),
            ..Self::succeeding()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn pool_attempts(&self) -> usize {
        self.pool_attempts.load(Ordering::SeqCst)
    }
}

pub struct ScriptedFitter {
    fail: Option<RangeInclusive<u32>>,
    panic_on: Option<u32>,
    attempts: Arc<AtomicUsize>,
    pool_attempts: Arc<AtomicUsize>,
}

impl FitFunction for ScriptedFitter {
    fn fit(&mut self, key: &WorkKey, _slice: &InputSlice, _params: &FitParams) -> Outcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if rayon::current_thread_index().is_some() {
            self.pool_attempts.fetch_add(1, Ordering::SeqCst);
        }
        let WorkKey::Pixel { pixel_id } = *key else {
            return Outcome::Failure(FailureReason::InsufficientData);
        };
        if self.panic_on == Some(pixel_id) {
            panic!("scripted panic on pixel {}", pixel_id);
        }
        if self.fail.as_ref().is_some_and(|range| range.contains(&pixel_id)) {
            return Outcome::Failure(FailureReason::NonConvergence);
        }
        Outcome::Success(ResultRow::new(
            *key,
            vec![pixel_id as f64 / 1000.0, 0.25, 180.5, 0.0125, 23.0],
        ))
    }
}

impl FitFactory for ScriptedFactory {
    type Fitter = ScriptedFitter;

    fn make_fitter(&self) -> ScriptedFitter {
        let on_pool = rayon::current_thread_index().is_some();
        if on_pool && (self.break_pool || self.break_pool_once.load(Ordering::SeqCst)) {
            panic!("fit context unavailable on pool threads");
        }
        if !on_pool {
            self.break_pool_once.store(false, Ordering::SeqCst);
        }
        ScriptedFitter {
            fail: self.fail.clone(),
            panic_on: self.panic_on,
            attempts: self.attempts.clone(),
            pool_attempts: self.pool_attempts.clone(),
        }
    }
}

/// Pixels `1..=n` for the climatology phase.
pub fn pixel_catalog(n: u32) -> Catalog {
    Catalog::from_keys(
        Phase::Climatology,
        (1..=n).map(|pixel_id| WorkKey::Pixel { pixel_id }).collect(),
    )
    .unwrap()
}

pub fn test_config(dir: &Path, checkpoint_interval: u64, batch_size: usize) -> RunConfig {
    let mut config = RunConfig::custom(
        Phase::Climatology,
        dir.join("vifit_state"),
        dir.join("observations.jsonl"),
        dir.join("output").join("climatology.csv"),
    );
    config.checkpoint_interval = checkpoint_interval;
    config.batch_size = batch_size;
    config.workers = 4;
    config.batches_per_wave = 20;
    config
}

/// Data lines of a CSV file (header excluded).
pub fn data_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

pub fn copy_dir(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), target).unwrap();
        }
    }
}
