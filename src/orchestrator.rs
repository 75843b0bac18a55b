use crate::catalog::Catalog;
use crate::checkpoint::{CheckpointState, RunBuffer};
use crate::checkpoint_manager::CheckpointStore;
use crate::config::RunConfig;
use crate::fit::FitFactory;
use crate::memory::MemorySnapshot;
use crate::output::{OutputWriter, RunSummary};
use crate::progress::{ProgressLine, ProgressTracker};
use crate::series::SliceProvider;
use crate::work_unit::WorkKey;
use crate::worker_pool::{BatchContext, WorkerPool, run_sequential};
use crate::VifitError;
use rustc_hash::FxHashSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    LoadingCheckpoint,
    ComputingRemaining,
    Dispatching,
    Checkpointing,
    Merging,
    Stopped,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::LoadingCheckpoint => "loading-checkpoint",
            RunState::ComputingRemaining => "computing-remaining",
            RunState::Dispatching => "dispatching",
            RunState::Checkpointing => "checkpointing",
            RunState::Merging => "merging",
            RunState::Stopped => "stopped",
            RunState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Cooperative stop request, checked between batches. Tripped by `request_stop` from
/// any thread or by a `STOP` file in the state directory.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    stop_file: Option<PathBuf>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_file(path: PathBuf) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            stop_file: Some(path),
        }
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.stop_file.as_ref().is_some_and(|p| p.exists())
    }

    /// Remove the stop file so the next invocation is not stopped by it too.
    fn consume(&self) -> Result<(), VifitError> {
        if let Some(path) = self.stop_file.as_ref().filter(|p| p.exists()) {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Notifications for observers. Sent synchronously from the orchestrator thread.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    State(RunState),
    CheckpointSaved {
        saves: usize,
        processed_this_run: u64,
        resident_rows: usize,
        bytes: u64,
    },
    Progress(ProgressLine),
    /// The merged output is durable and the checkpoint has not been discarded yet.
    OutputWritten { rows: usize },
}

enum DispatchEnd {
    Exhausted,
    Stopped,
}

/// Drives one phase to completion: load checkpoint, compute remaining keys, dispatch
/// batches, save at thresholds, merge, discard.
pub struct Orchestrator<'a, F: FitFactory> {
    config: RunConfig,
    catalog: &'a Catalog,
    provider: &'a dyn SliceProvider,
    factory: F,
    stop: StopSignal,
    observer: Option<Box<dyn FnMut(&RunEvent) + 'a>>,
    state: RunState,
}

impl<'a, F: FitFactory> Orchestrator<'a, F> {
    pub fn new(config: RunConfig, catalog: &'a Catalog, provider: &'a dyn SliceProvider, factory: F) -> Self {
        let stop = StopSignal::with_stop_file(config.stop_file());
        Self {
            config,
            catalog,
            provider,
            factory,
            stop,
            observer: None,
            state: RunState::Init,
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_observer<O: FnMut(&RunEvent) + 'a>(mut self, observer: O) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn emit(&mut self, event: RunEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!("[orchestrator] {} -> {}", self.state, next);
        self.state = next;
        self.emit(RunEvent::State(next));
    }

    pub fn run(&mut self) -> Result<RunSummary, VifitError> {
        let started = Instant::now();
        self.transition(RunState::Init);
        self.config.validate()?;
        if self.catalog.phase() != self.config.phase {
            return Err(VifitError::Config(format!(
                "catalog is for phase {}, run is for phase {}",
                self.catalog.phase(),
                self.config.phase
            )));
        }
        let writer = OutputWriter::new(&self.config.output, self.config.phase);
        writer.check_writable()?;
        fs::create_dir_all(&self.config.state_dir)?;

        self.transition(RunState::LoadingCheckpoint);
        let mut store = CheckpointStore::open(&self.config.state_dir, self.config.phase)?;
        if !store.exists() {
            if let Some(previous) = self.completed_summary(&writer) {
                tracing::info!(
                    "[orchestrator] {} already complete ({} rows in {}); nothing to do",
                    self.config.phase,
                    previous.succeeded,
                    writer.path().display()
                );
                store.discard()?;
                self.clear_unhonoured_stop()?;
                self.transition(RunState::Done);
                return Ok(RunSummary {
                    attempted_this_run: 0,
                    queued_at_start: 0,
                    checkpoint_saves: 0,
                    elapsed_secs: started.elapsed().as_secs_f64(),
                    ..previous
                });
            }
        }
        if store.load()?.is_none() {
            tracing::info!("[orchestrator] no checkpoint for {}, starting fresh", self.config.phase);
        }
        self.check_within_catalog(store.state())?;

        self.transition(RunState::ComputingRemaining);
        let pending = self.pending_keys(store.state());
        tracing::info!(
            "[orchestrator] {}: {} keys in catalog, {} resident rows, {} queued",
            self.config.phase,
            self.catalog.len(),
            store.state().rows.len(),
            pending.len()
        );

        let mut tracker = ProgressTracker::new(
            store.state().counters,
            self.catalog.len(),
            pending.len(),
            self.config.report_every,
        );
        let mut buffer = RunBuffer::new();
        let mut saves = 0usize;

        let end = self.dispatch(&pending, &mut store, &mut buffer, &mut tracker, &mut saves)?;

        if let DispatchEnd::Stopped = end {
            self.stop.consume()?;
            let state = store.state();
            let summary = RunSummary {
                phase: self.config.phase,
                catalog_size: self.catalog.len(),
                succeeded: state.rows.len(),
                failed: state.failures.len(),
                remaining: pending.len().saturating_sub(tracker.run().attempted() as usize),
                attempted_this_run: tracker.run().attempted(),
                queued_at_start: pending.len(),
                checkpoint_saves: saves,
                elapsed_secs: started.elapsed().as_secs_f64(),
                completed: false,
                finished_at: chrono::Utc::now().to_rfc3339(),
            };
            summary.log();
            self.transition(RunState::Stopped);
            return Ok(summary);
        }

        self.clear_unhonoured_stop()?;
        self.transition(RunState::Merging);
        let (segment, delta) = buffer.take();
        let state = store.finalize(segment, delta)?;
        let rows = writer.write(&state.rows, &state.failures)?;
        let summary = RunSummary {
            phase: self.config.phase,
            catalog_size: self.catalog.len(),
            succeeded: state.rows.len(),
            failed: state.failures.len(),
            remaining: self
                .catalog
                .len()
                .saturating_sub(state.rows.len() + state.failures.len()),
            attempted_this_run: tracker.run().attempted(),
            queued_at_start: pending.len(),
            checkpoint_saves: saves,
            elapsed_secs: started.elapsed().as_secs_f64(),
            completed: true,
            finished_at: chrono::Utc::now().to_rfc3339(),
        };
        writer.write_summary(&summary)?;
        self.emit(RunEvent::OutputWritten { rows });

        store.discard()?;
        summary.log();
        self.transition(RunState::Done);
        Ok(summary)
    }

    /// A stop that found no batch left to interrupt must not carry over to the next
    /// invocation sharing this state directory.
    fn clear_unhonoured_stop(&self) -> Result<(), VifitError> {
        if self.stop.is_requested() {
            tracing::info!("[orchestrator] stop requested with no batch left to stop; clearing it");
            self.stop.consume()?;
        }
        Ok(())
    }

    /// Keys still to attempt. A sealed checkpoint has none; otherwise succeeded keys
    /// are done and failed keys are retried unless failures are final.
    fn pending_keys(&self, state: &CheckpointState) -> Vec<WorkKey> {
        if state.sealed {
            return Vec::new();
        }
        let mut completed = state.completed_keys();
        if !self.config.retry_failed {
            completed.extend(state.failed_keys().copied());
        }
        self.catalog.remaining(&completed)
    }

    fn check_within_catalog(&self, state: &CheckpointState) -> Result<(), VifitError> {
        let known: FxHashSet<WorkKey> = self.catalog.key_set();
        let stray = state
            .rows
            .iter()
            .map(|r| &r.key)
            .chain(state.failed_keys())
            .find(|k| !known.contains(k));
        match stray {
            Some(key) => Err(VifitError::CorruptCheckpoint(format!(
                "checkpoint holds {} which is not in the {} catalog",
                key, self.config.phase
            ))),
            None => Ok(()),
        }
    }

    fn completed_summary(&self, writer: &OutputWriter) -> Option<RunSummary> {
        match writer.read_summary() {
            Ok(Some(summary))
                if summary.completed
                    && summary.phase == self.config.phase
                    && summary.catalog_size == self.catalog.len()
                    && writer.path().exists() =>
            {
                Some(summary)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("[orchestrator] ignoring unreadable summary: {}", e);
                None
            }
        }
    }

    fn dispatch(
        &mut self,
        pending: &[WorkKey],
        store: &mut CheckpointStore,
        buffer: &mut RunBuffer,
        tracker: &mut ProgressTracker,
        saves: &mut usize,
    ) -> Result<DispatchEnd, VifitError> {
        if pending.is_empty() {
            return Ok(DispatchEnd::Exhausted);
        }
        self.transition(RunState::Dispatching);

        let params = self.config.fit.clone();
        let ctx = BatchContext {
            provider: self.provider,
            params: &params,
        };
        let batch_size = self.config.batch_size;
        let wave_len = batch_size.saturating_mul(self.config.batches_per_wave);

        for (wave, wave_keys) in pending.chunks(wave_len).enumerate() {
            let mut pool = match WorkerPool::build(self.config.workers, wave) {
                Ok(pool) => {
                    MemorySnapshot::capture().log(&format!("wave {} pool ready", wave));
                    Some(pool)
                }
                Err(e) => {
                    tracing::warn!("[orchestrator] {}; running wave {} sequentially", e, wave);
                    None
                }
            };

            for batch in wave_keys.chunks(batch_size) {
                if self.stop.is_requested() {
                    tracing::info!("[orchestrator] stop requested, saving progress");
                    if !buffer.is_empty() {
                        self.save(store, buffer, tracker, saves)?;
                    }
                    return Ok(DispatchEnd::Stopped);
                }

                let parallel = pool.as_ref().map(|p| p.run_batch(&self.factory, &ctx, batch));
                let outcomes = match parallel {
                    Some(Ok(outcomes)) => outcomes,
                    Some(Err(e)) if !e.is_fatal() => {
                        tracing::warn!("[orchestrator] {}; running this batch sequentially", e);
                        let outcomes = run_sequential(&self.factory, &ctx, batch)?;
                        // Later batches go back to a fresh pool.
                        pool = match WorkerPool::build(self.config.workers, wave) {
                            Ok(rebuilt) => Some(rebuilt),
                            Err(e) => {
                                tracing::warn!("[orchestrator] {}; rest of wave {} runs sequentially", e, wave);
                                None
                            }
                        };
                        outcomes
                    }
                    Some(Err(e)) => return Err(e),
                    None => run_sequential(&self.factory, &ctx, batch)?,
                };

                let report_due = tracker.record(&outcomes);
                buffer.extend(outcomes);
                if report_due {
                    let line = tracker.report();
                    tracing::info!("[progress] {}", line);
                    self.emit(RunEvent::Progress(line));
                }

                if tracker.checkpoint_due(self.config.checkpoint_interval) {
                    self.save(store, buffer, tracker, saves)?;
                    if self.config.stop_after_checkpoints == Some(*saves) {
                        tracing::info!("[orchestrator] reached {} checkpoint saves, stopping", saves);
                        return Ok(DispatchEnd::Stopped);
                    }
                    self.transition(RunState::Dispatching);
                }
            }
        }
        Ok(DispatchEnd::Exhausted)
    }

    fn save(
        &mut self,
        store: &mut CheckpointStore,
        buffer: &mut RunBuffer,
        tracker: &mut ProgressTracker,
        saves: &mut usize,
    ) -> Result<(), VifitError> {
        self.transition(RunState::Checkpointing);
        let (segment, delta) = buffer.take();
        store.append(segment, delta)?;
        tracker.mark_checkpoint();
        *saves += 1;

        let resident_rows = store.state().rows.len();
        let bytes = store.stats().last_append_bytes;
        tracing::info!(
            "[checkpoint] save {}: {} rows resident, {} bytes written",
            saves,
            resident_rows,
            bytes
        );
        self.emit(RunEvent::CheckpointSaved {
            saves: *saves,
            processed_this_run: tracker.run().processed_this_run,
            resident_rows,
            bytes,
        });
        Ok(())
    }
}
