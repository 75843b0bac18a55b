use crate::checkpoint::{
    CHECKPOINT_FORMAT_VERSION, CheckpointState, CounterDelta, LEGACY_FORMAT_VERSION, LegacyCheckpoint, Manifest,
    Segment,
};
use crate::segment_log::SegmentLog;
use crate::work_unit::Phase;
use crate::VifitError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const MANIFEST_FILE: &str = "manifest.bin";
const MANIFEST_TEMP_FILE: &str = "manifest.tmp";
const LEGACY_FILE: &str = "checkpoint.bin";

/// What each save cost. Lets callers verify that saves scale with new work only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteStats {
    pub appends: usize,
    pub rows_written: u64,
    pub bytes_written: u64,
    pub last_append_bytes: u64,
    pub max_append_bytes: u64,
    pub time_in_appends: Duration,
}

/// Result of [`CheckpointStore::inspect`].
#[derive(Debug)]
pub struct CheckpointReport {
    pub state: CheckpointState,
    /// Segment files past the manifest: a save in flight, or debris from a crash.
    pub uncommitted_segments: usize,
    /// Still in the version 1 single-file format.
    pub legacy: bool,
}

/// Durable checkpoint for one phase under `<state_dir>/checkpoint_<phase>/`.
///
/// Each `append` writes one new segment holding only the rows and failures produced
/// since the previous append, then swaps in a fixed-size manifest. Nothing already on
/// disk is re-read or rewritten, so a save costs O(new rows).
pub struct CheckpointStore {
    dir: PathBuf,
    phase: Phase,
    segments: SegmentLog,
    state: CheckpointState,
    /// Rows loaded from a version 1 file that have not been written as a segment yet.
    legacy_pending: bool,
    stats: WriteStats,
}

impl CheckpointStore {
    pub fn checkpoint_dir(state_dir: &Path, phase: Phase) -> PathBuf {
        state_dir.join(format!("checkpoint_{}", phase.name()))
    }

    pub fn open<P: AsRef<Path>>(state_dir: P, phase: Phase) -> Result<Self, VifitError> {
        let dir = Self::checkpoint_dir(state_dir.as_ref(), phase);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let segments = SegmentLog::open(&dir)?;
        Ok(Self {
            dir,
            phase,
            segments,
            state: CheckpointState::empty(phase),
            legacy_pending: false,
            stats: WriteStats::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn stats(&self) -> &WriteStats {
        &self.stats
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    fn legacy_path(&self) -> PathBuf {
        self.dir.join(LEGACY_FILE)
    }

    pub fn exists(&self) -> bool {
        self.manifest_path().exists() || self.legacy_path().exists()
    }

    /// Load the checkpoint into the resident table. `Ok(None)` when there is none.
    /// Corrupt or foreign checkpoints are errors and the files are left in place.
    pub fn load(&mut self) -> Result<Option<&CheckpointState>, VifitError> {
        if self.manifest_path().exists() {
            self.load_segmented()?;
        } else if self.legacy_path().exists() {
            self.load_legacy()?;
        } else {
            return Ok(None);
        }

        let dropped = self.state.dedup_rows();
        if dropped > 0 {
            tracing::warn!("Dropped {} repeated rows while loading checkpoint", dropped);
        }
        tracing::info!(
            "Checkpoint loaded: {} rows, {} failed keys, attempted {}, saved at {}",
            self.state.rows.len(),
            self.state.failures.len(),
            self.state.counters.attempted_count,
            self.state.saved_at.as_deref().unwrap_or("unknown"),
        );
        Ok(Some(&self.state))
    }

    fn load_segmented(&mut self) -> Result<(), VifitError> {
        let manifest = read_manifest(&self.manifest_path())?;
        let committed = manifest.committed_segments;
        let state = replay_segments(&self.dir, &self.segments, self.phase, manifest)?;

        // A segment written after the last manifest swap was never committed.
        let orphans = self.segments.truncate(committed)?;
        if orphans > 0 {
            tracing::warn!("Removed {} uncommitted checkpoint segment(s)", orphans);
        }
        if self.legacy_path().exists() {
            fs::remove_file(self.legacy_path())?;
        }

        self.state = state;
        self.legacy_pending = false;
        Ok(())
    }

    fn load_legacy(&mut self) -> Result<(), VifitError> {
        let legacy = read_legacy(&self.legacy_path(), self.phase)?;
        tracing::info!(
            "Found format version {} checkpoint with {} rows; it will be migrated on the next save",
            LEGACY_FORMAT_VERSION,
            legacy.rows.len()
        );

        // Segments left without a manifest belong to no committed state.
        self.segments.truncate(0)?;
        self.state = legacy.into_state(self.phase);
        self.legacy_pending = !self.state.rows.is_empty();
        Ok(())
    }

    /// Read a checkpoint without writing, creating or deleting anything, so it is safe
    /// against a directory another process is still appending to. Segments past the
    /// committed count are reported, not removed, and a legacy file is not migrated.
    pub fn inspect<P: AsRef<Path>>(state_dir: P, phase: Phase) -> Result<Option<CheckpointReport>, VifitError> {
        let dir = Self::checkpoint_dir(state_dir.as_ref(), phase);
        if !dir.is_dir() {
            return Ok(None);
        }
        let segments = SegmentLog::attach(dir.clone())?;
        let manifest_path = dir.join(MANIFEST_FILE);
        let legacy_path = dir.join(LEGACY_FILE);

        let (mut state, committed, legacy) = if manifest_path.exists() {
            let manifest = read_manifest(&manifest_path)?;
            let committed = manifest.committed_segments;
            (replay_segments(&dir, &segments, phase, manifest)?, committed, false)
        } else if legacy_path.exists() {
            (read_legacy(&legacy_path, phase)?.into_state(phase), 0, true)
        } else {
            return Ok(None);
        };
        state.dedup_rows();

        let uncommitted_segments = segments.indices()?.into_iter().filter(|&index| index >= committed).count();
        Ok(Some(CheckpointReport {
            state,
            uncommitted_segments,
            legacy,
        }))
    }

    /// Persist one flush of the run buffer. Writes only `segment`, then the manifest.
    pub fn append(&mut self, segment: Segment, delta: CounterDelta) -> Result<(), VifitError> {
        self.commit(segment, delta, false)
    }

    fn commit(&mut self, segment: Segment, delta: CounterDelta, sealed: bool) -> Result<(), VifitError> {
        let started = Instant::now();
        let migrating = self.legacy_path().exists();
        let mut bytes = 0u64;
        let mut rows = 0u64;

        if self.legacy_pending {
            let legacy_rows = Segment {
                rows: self.state.rows.clone(),
                failures: Vec::new(),
            };
            bytes += self.segments.append(&legacy_rows)?;
            rows += legacy_rows.rows.len() as u64;
        }
        if !segment.is_empty() {
            bytes += self.segments.append(&segment)?;
            rows += segment.rows.len() as u64;
        }

        let mut counters = self.state.counters;
        counters.apply(delta);
        let mut manifest = Manifest::new(self.phase, self.segments.next_index(), counters);
        manifest.sealed = sealed;
        bytes += self.write_manifest(&manifest)?;

        if migrating {
            fs::remove_file(self.legacy_path())?;
        }

        self.legacy_pending = false;
        self.state.apply_segment(segment);
        self.state.counters = counters;
        self.state.saved_at = Some(manifest.saved_at);
        self.state.sealed = sealed;

        let stats = &mut self.stats;
        stats.appends += 1;
        stats.rows_written += rows;
        stats.bytes_written += bytes;
        stats.last_append_bytes = bytes;
        stats.max_append_bytes = stats.max_append_bytes.max(bytes);
        stats.time_in_appends += started.elapsed();
        Ok(())
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<u64, VifitError> {
        let bytes = bincode::encode_to_vec(manifest, bincode::config::standard())?;
        let temp = self.dir.join(MANIFEST_TEMP_FILE);
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.manifest_path())?;
        Ok(bytes.len() as u64)
    }

    /// Persist whatever is still pending, seal the checkpoint and return the complete
    /// state. Called once every key has been attempted, before the output is written.
    pub fn finalize(&mut self, segment: Segment, delta: CounterDelta) -> Result<&CheckpointState, VifitError> {
        let nothing_new = segment.is_empty() && delta.is_zero() && !self.legacy_pending;
        if !(nothing_new && (self.state.sealed || !self.exists())) {
            self.commit(segment, delta, true)?;
        }
        Ok(&self.state)
    }

    /// Remove the checkpoint. Only called once the merged output is durable.
    pub fn discard(&mut self) -> Result<(), VifitError> {
        if self.dir.exists() {
            self.segments.truncate(0)?;
            fs::remove_dir_all(&self.dir)?;
        }
        self.state = CheckpointState::empty(self.phase);
        self.legacy_pending = false;
        Ok(())
    }
}

fn read_manifest(path: &Path) -> Result<Manifest, VifitError> {
    let bytes = fs::read(path)?;
    let config = bincode::config::standard();
    let (version, _): (u32, usize) = bincode::decode_from_slice(&bytes, config)
        .map_err(|e| VifitError::CorruptCheckpoint(format!("manifest header: {}", e)))?;
    if version != CHECKPOINT_FORMAT_VERSION {
        return Err(VifitError::CorruptCheckpoint(format!(
            "unsupported checkpoint format version {} (this build reads {} and {})",
            version, LEGACY_FORMAT_VERSION, CHECKPOINT_FORMAT_VERSION
        )));
    }
    let (manifest, _): (Manifest, usize) = bincode::decode_from_slice(&bytes, config)
        .map_err(|e| VifitError::CorruptCheckpoint(format!("manifest: {}", e)))?;
    Ok(manifest)
}

/// Rebuild the committed state from segments `0..committed_segments`. Reads only.
fn replay_segments(
    dir: &Path,
    segments: &SegmentLog,
    phase: Phase,
    manifest: Manifest,
) -> Result<CheckpointState, VifitError> {
    if manifest.phase != phase {
        return Err(VifitError::CorruptCheckpoint(format!(
            "{} belongs to phase {}, expected {}",
            dir.display(),
            manifest.phase,
            phase
        )));
    }

    let present = segments.indices()?;
    let mut state = CheckpointState::empty(phase);
    for index in 0..manifest.committed_segments {
        if present.binary_search(&index).is_err() {
            return Err(VifitError::CorruptCheckpoint(format!(
                "manifest lists {} segments but segment {} is missing",
                manifest.committed_segments, index
            )));
        }
        state.apply_segment(segments.read(index)?);
    }
    state.counters = manifest.counters;
    state.saved_at = Some(manifest.saved_at);
    state.sealed = manifest.sealed;
    Ok(state)
}

fn read_legacy(path: &Path, phase: Phase) -> Result<LegacyCheckpoint, VifitError> {
    let bytes = fs::read(path)?;
    let (legacy, _): (LegacyCheckpoint, usize) = bincode::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| VifitError::CorruptCheckpoint(format!("legacy checkpoint {}: {}", path.display(), e)))?;
    if let Some(row) = legacy.rows.iter().find(|r| r.key.phase() != phase) {
        return Err(VifitError::CorruptCheckpoint(format!(
            "legacy checkpoint holds {} which is not a {} key",
            row.key, phase
        )));
    }
    Ok(legacy)
}
