use crate::outcome::{FailureReason, Outcome, ResultRow};
use crate::work_unit::{Phase, WorkKey};
use bincode::{Decode, Encode};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;

/// Current on-disk layout: manifest plus immutable segment files.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 2;
/// Single-file layout written by earlier releases. Still loadable.
pub const LEGACY_FORMAT_VERSION: u32 = 1;

/// Cumulative counters persisted with the checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
pub struct CheckpointCounters {
    pub attempted_count: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    /// `attempted_count` at the last save. A counter value, not a time.
    pub last_saved_at: u64,
}

/// Counter increments accumulated since the previous save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        self.attempted == 0
    }
}

impl CheckpointCounters {
    pub fn apply(&mut self, delta: CounterDelta) {
        self.attempted_count += delta.attempted;
        self.succeeded_count += delta.succeeded;
        self.failed_count += delta.failed;
        self.last_saved_at = self.attempted_count;
    }
}

/// The unit of durable progress: everything produced since the previous save.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct Segment {
    pub rows: Vec<ResultRow>,
    pub failures: Vec<(WorkKey, FailureReason)>,
}

impl Segment {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.failures.is_empty()
    }
}

/// Run-scoped accumulator of outcomes not yet saved. Only the orchestrator touches it,
/// and `take` is its single flush-and-clear operation.
#[derive(Debug, Default)]
pub struct RunBuffer {
    pending: Segment,
    delta: CounterDelta,
}

impl RunBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: WorkKey, outcome: Outcome) {
        self.delta.attempted += 1;
        match outcome {
            Outcome::Success(row) => {
                self.delta.succeeded += 1;
                self.pending.rows.push(row);
            }
            Outcome::Failure(reason) => {
                self.delta.failed += 1;
                self.pending.failures.push((key, reason));
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = (WorkKey, Outcome)>>(&mut self, outcomes: I) {
        for (key, outcome) in outcomes {
            self.push(key, outcome);
        }
    }

    /// Hand over everything buffered and leave the buffer empty.
    pub fn take(&mut self) -> (Segment, CounterDelta) {
        (
            std::mem::take(&mut self.pending),
            std::mem::take(&mut self.delta),
        )
    }

    pub fn len(&self) -> usize {
        self.delta.attempted as usize
    }

    pub fn is_empty(&self) -> bool {
        self.delta.is_zero()
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.pending.rows
    }
}

/// Everything known about a run's progress: resident rows, the latest failure per
/// key that has not since succeeded, and cumulative counters.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointState {
    pub phase: Phase,
    pub rows: Vec<ResultRow>,
    pub failures: BTreeMap<WorkKey, FailureReason>,
    pub counters: CheckpointCounters,
    pub saved_at: Option<String>,
    /// Set by the final save of a run that attempted every key. A sealed checkpoint
    /// only needs merging.
    pub sealed: bool,
}

impl CheckpointState {
    pub fn empty(phase: Phase) -> Self {
        Self {
            phase,
            rows: Vec::new(),
            failures: BTreeMap::new(),
            counters: CheckpointCounters::default(),
            saved_at: None,
            sealed: false,
        }
    }

    /// Concatenate a segment onto the resident table. Cost is the segment's size.
    pub fn apply_segment(&mut self, segment: Segment) {
        for row in &segment.rows {
            self.failures.remove(&row.key);
        }
        self.rows.extend(segment.rows);
        for (key, reason) in segment.failures {
            self.failures.insert(key, reason);
        }
    }

    pub fn completed_keys(&self) -> FxHashSet<WorkKey> {
        self.rows.iter().map(|r| r.key).collect()
    }

    pub fn failed_keys(&self) -> impl Iterator<Item = &WorkKey> {
        self.failures.keys()
    }

    /// Drop repeated row keys, keeping the first occurrence. Returns how many were dropped.
    pub fn dedup_rows(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen = FxHashSet::default();
        self.rows.retain(|row| seen.insert(row.key));
        before - self.rows.len()
    }
}

/// Fixed-size index of a version 2 checkpoint. Rewritten whole on every save, so it
/// must never grow with the number of rows.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Manifest {
    pub format_version: u32,
    pub phase: Phase,
    /// Segments `0..committed_segments` are part of the checkpoint; later ones are not.
    pub committed_segments: u64,
    pub counters: CheckpointCounters,
    pub saved_at: String,
    pub sealed: bool,
}

impl Manifest {
    pub fn new(phase: Phase, committed_segments: u64, counters: CheckpointCounters) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            phase,
            committed_segments,
            counters,
            saved_at: chrono::Utc::now().to_rfc3339(),
            sealed: false,
        }
    }
}

/// Single-file checkpoint of format version 1: all rows plus counters, no failure
/// dispositions and no phase tag.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyCheckpoint {
    pub rows: Vec<ResultRow>,
    pub attempted_count: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub timestamp: String,
}

// Field order is the version 1 wire layout and must not change.
impl Encode for LegacyCheckpoint {
    fn encode<E: bincode::enc::Encoder>(&self, encoder: &mut E) -> Result<(), bincode::error::EncodeError> {
        self.rows.encode(encoder)?;
        self.attempted_count.encode(encoder)?;
        self.succeeded_count.encode(encoder)?;
        self.failed_count.encode(encoder)?;
        self.timestamp.encode(encoder)?;
        Ok(())
    }
}

impl<Context> Decode<Context> for LegacyCheckpoint {
    fn decode<D: bincode::de::Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, bincode::error::DecodeError> {
        let rows = Vec::<ResultRow>::decode(decoder)?;
        let attempted_count = u64::decode(decoder)?;
        let succeeded_count = u64::decode(decoder)?;
        let failed_count = u64::decode(decoder)?;
        let timestamp = String::decode(decoder)?;
        Ok(LegacyCheckpoint {
            rows,
            attempted_count,
            succeeded_count,
            failed_count,
            timestamp,
        })
    }
}

impl LegacyCheckpoint {
    pub fn into_state(self, phase: Phase) -> CheckpointState {
        CheckpointState {
            phase,
            rows: self.rows,
            failures: BTreeMap::new(),
            counters: CheckpointCounters {
                attempted_count: self.attempted_count,
                succeeded_count: self.succeeded_count,
                failed_count: self.failed_count,
                last_saved_at: self.attempted_count,
            },
            saved_at: Some(self.timestamp),
            sealed: false,
        }
    }
}
