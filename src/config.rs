use crate::checkpoint_manager::CheckpointStore;
use crate::fit::FitParams;
use crate::series::SliceWindows;
use crate::work_unit::Phase;
use crate::VifitError;
use std::path::PathBuf;

pub const DEFAULT_STATE_DIR: &str = "./vifit_state";
pub const MAX_WORKERS: usize = 64;
const STOP_FILE: &str = "STOP";

/// Everything one invocation needs. Built from the CLI in `main`, or directly in tests.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub phase: Phase,
    pub state_dir: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Successes between checkpoint saves.
    pub checkpoint_interval: u64,
    pub batch_size: usize,
    pub workers: usize,
    /// Batches per pool lifetime; the pool is rebuilt after each wave.
    pub batches_per_wave: usize,
    /// Attempts between progress lines.
    pub report_every: u64,
    pub fit: FitParams,
    pub windows: SliceWindows,
    /// Re-queue keys whose last attempt failed. When false, recorded failures are final.
    pub retry_failed: bool,
    /// End the run right after this many saves of this invocation.
    pub stop_after_checkpoints: Option<usize>,
    /// Inclusive year range for the year-curve catalog. Defaults to the observed range.
    pub years: Option<(u16, u16)>,
}

impl RunConfig {
    /// Default configuration for production use. `VIFIT_STATE_DIR` overrides the state dir.
    pub fn new(phase: Phase, input: PathBuf, output: PathBuf) -> Self {
        let state_dir = std::env::var("VIFIT_STATE_DIR").unwrap_or_else(|_| DEFAULT_STATE_DIR.to_string());
        Self::custom(phase, PathBuf::from(state_dir), input, output)
    }

    /// Custom configuration for tests
    pub fn custom(phase: Phase, state_dir: PathBuf, input: PathBuf, output: PathBuf) -> Self {
        Self {
            phase,
            state_dir,
            input,
            output,
            checkpoint_interval: 500,
            batch_size: 8,
            workers: 4,
            batches_per_wave: 250,
            report_every: 50,
            fit: FitParams::default(),
            windows: SliceWindows::default(),
            retry_failed: true,
            stop_after_checkpoints: None,
            years: None,
        }
    }

    pub fn validate(&self) -> Result<(), VifitError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(VifitError::Config(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.batch_size == 0 {
            return Err(VifitError::Config("batch size must be at least 1".to_string()));
        }
        if self.checkpoint_interval == 0 {
            return Err(VifitError::Config("checkpoint interval must be at least 1".to_string()));
        }
        if self.batches_per_wave == 0 {
            return Err(VifitError::Config("batches per wave must be at least 1".to_string()));
        }
        if self.stop_after_checkpoints == Some(0) {
            return Err(VifitError::Config("stop-after-checkpoints must be at least 1".to_string()));
        }
        if let Some((first, last)) = self.years {
            if first > last {
                return Err(VifitError::Config(format!("year range {}-{} is empty", first, last)));
            }
        }
        if self.fit.tolerance.is_nan() || self.fit.tolerance <= 0.0 {
            return Err(VifitError::Config(format!("tolerance must be positive, got {}", self.fit.tolerance)));
        }
        Ok(())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        CheckpointStore::checkpoint_dir(&self.state_dir, self.phase)
    }

    /// Creating this file asks a running invocation to stop at the next batch boundary.
    pub fn stop_file(&self) -> PathBuf {
        self.state_dir.join(STOP_FILE)
    }
}

/// Parse `2001-2013` or a single year `2005`.
pub fn parse_year_range(s: &str) -> Result<(u16, u16), String> {
    let parse = |part: &str| {
        part.trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid year '{}': {}", part.trim(), e))
    };
    match s.split_once('-') {
        Some((first, last)) => Ok((parse(first)?, parse(last)?)),
        None => {
            let year = parse(s)?;
            Ok((year, year))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig::custom(
            Phase::Climatology,
            PathBuf::from("/tmp/state"),
            PathBuf::from("obs.jsonl"),
            PathBuf::from("out.csv"),
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 4);
        assert_eq!(config.checkpoint_interval, 500);
    }

    #[test]
    fn test_worker_bounds() {
        let mut config = config();
        config.workers = 0;
        assert!(matches!(config.validate(), Err(VifitError::Config(_))));
        config.workers = 65;
        assert!(matches!(config.validate(), Err(VifitError::Config(_))));
        config.workers = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths() {
        let config = config();
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/tmp/state/checkpoint_climatology"));
        assert_eq!(config.stop_file(), PathBuf::from("/tmp/state/STOP"));
    }

    #[test]
    fn test_parse_year_range() {
        assert_eq!(parse_year_range("2001-2013"), Ok((2001, 2013)));
        assert_eq!(parse_year_range("2005"), Ok((2005, 2005)));
        assert!(parse_year_range("20x1-2013").is_err());
    }
}
