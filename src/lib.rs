pub mod catalog;
pub mod checkpoint;
pub mod checkpoint_manager;
pub mod config;
pub mod error;
pub mod fit;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod outcome;
pub mod output;
pub mod progress;
pub mod segment_log;
pub mod series;
pub mod work_unit;
pub mod worker_pool;

pub use catalog::Catalog;
pub use checkpoint_manager::CheckpointStore;
pub use config::RunConfig;
pub use error::*;
pub use fit::{FitFactory, FitFunction, FitParams, HarmonicFactory};
pub use logging::init_tracing;
pub use orchestrator::{Orchestrator, RunEvent, RunState, StopSignal};
pub use outcome::{FailureReason, Outcome, ResultRow};
pub use output::RunSummary;
pub use series::{InputSlice, SeriesTable, SliceProvider};
pub use work_unit::{Phase, WorkKey};
