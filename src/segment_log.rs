use crate::checkpoint::Segment;
use crate::VifitError;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const SEGMENT_PREFIX: &str = "segment_";

/// Append-only directory of immutable segment files `segment_00000000.bin`, ...
/// Writing a segment never touches existing ones.
pub struct SegmentLog {
    dir: PathBuf,
    next_index: u64,
}

impl SegmentLog {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, VifitError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Self::attach(dir)
    }

    /// Open without creating anything. A missing directory reads as empty.
    pub fn attach(dir: PathBuf) -> Result<Self, VifitError> {
        let next_index = Self::scan_indices(&dir)?
            .last()
            .map_or(0, |last| last + 1);
        Ok(Self { dir, next_index })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn segment_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{}{:08}.bin", SEGMENT_PREFIX, index))
    }

    /// Indices of segment files present on disk, ascending.
    pub fn indices(&self) -> Result<Vec<u64>, VifitError> {
        Self::scan_indices(&self.dir)
    }

    fn scan_indices(dir: &Path) -> Result<Vec<u64>, VifitError> {
        let mut indices = Vec::new();
        if !dir.is_dir() {
            return Ok(indices);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "bin") {
                continue;
            }
            let index = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix(SEGMENT_PREFIX))
                .and_then(|counter| counter.parse::<u64>().ok());
            if let Some(index) = index {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Write `segment` as the next file and return the number of bytes written.
    pub fn append(&mut self, segment: &Segment) -> Result<u64, VifitError> {
        let path = self.segment_path(self.next_index);
        let bytes = bincode::encode_to_vec(segment, bincode::config::standard())?;

        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        self.next_index += 1;
        Ok(bytes.len() as u64)
    }

    pub fn read(&self, index: u64) -> Result<Segment, VifitError> {
        let path = self.segment_path(index);
        let file = File::open(&path).map_err(|e| {
            VifitError::CorruptCheckpoint(format!("segment {} unreadable: {}", path.display(), e))
        })?;
        let mut reader = BufReader::new(file);
        bincode::decode_from_std_read(&mut reader, bincode::config::standard()).map_err(|e| {
            VifitError::CorruptCheckpoint(format!("segment {} undecodable: {}", path.display(), e))
        })
    }

    /// Delete segment files with index >= `from` and continue numbering at `from`.
    pub fn truncate(&mut self, from: u64) -> Result<usize, VifitError> {
        let mut removed = 0;
        for index in self.indices()? {
            if index >= from {
                fs::remove_file(self.segment_path(index))?;
                removed += 1;
            }
        }
        self.next_index = from;
        Ok(removed)
    }
}
