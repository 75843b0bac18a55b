use crate::outcome::{FailureReason, ResultRow};
use crate::work_unit::{Phase, WorkKey};
use crate::VifitError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes the merged result table and its failure listing. Every file goes through a
/// sibling temp file and a rename, so a reader never sees a partial table.
pub struct OutputWriter {
    path: PathBuf,
    phase: Phase,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl OutputWriter {
    pub fn new<P: AsRef<Path>>(path: P, phase: Phase) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            phase,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn failures_path(&self) -> PathBuf {
        with_suffix(&self.path, ".failures.csv")
    }

    pub fn summary_path(&self) -> PathBuf {
        with_suffix(&self.path, ".summary.json")
    }

    /// Fail before any fitting if the output can never be written.
    pub fn check_writable(&self) -> Result<(), VifitError> {
        let unwritable = |reason: String| VifitError::OutputUnwritable(format!("{}: {}", self.path.display(), reason));

        if self.path.is_dir() {
            return Err(unwritable("is a directory".to_string()));
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| unwritable(e.to_string()))?;
        }
        let probe = with_suffix(&self.path, ".probe");
        File::create(&probe).map_err(|e| unwritable(e.to_string()))?;
        fs::remove_file(&probe).map_err(|e| unwritable(e.to_string()))?;
        Ok(())
    }

    /// Write rows in catalog order plus the failure listing. Returns the row count.
    pub fn write(&self, rows: &[ResultRow], failures: &BTreeMap<WorkKey, FailureReason>) -> Result<usize, VifitError> {
        let mut ordered: Vec<&ResultRow> = rows.iter().collect();
        ordered.sort_by_key(|row| row.key);

        let key_columns = self.phase.key_columns();
        let value_columns = self.phase.value_columns();

        write_atomic(&self.path, |out| {
            let header: Vec<&str> = key_columns.iter().chain(value_columns).copied().collect();
            writeln!(out, "{}", header.join(","))?;
            for row in &ordered {
                let mut fields = row.key.key_fields();
                fields.extend(
                    value_columns
                        .iter()
                        .zip(&row.values)
                        .map(|(column, value)| format_value(column, *value)),
                );
                writeln!(out, "{}", fields.join(","))?;
            }
            Ok(())
        })?;

        write_atomic(&self.failures_path(), |out| {
            writeln!(out, "{},reason", key_columns.join(","))?;
            for (key, reason) in failures {
                writeln!(out, "{},{}", key.key_fields().join(","), reason)?;
            }
            Ok(())
        })?;

        tracing::info!(
            "[output] wrote {} rows to {} and {} failures to {}",
            ordered.len(),
            self.path.display(),
            failures.len(),
            self.failures_path().display()
        );
        Ok(ordered.len())
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<(), VifitError> {
        let json = serde_json::to_string_pretty(summary)?;
        write_atomic(&self.summary_path(), |out| writeln!(out, "{}", json))
    }

    pub fn read_summary(&self) -> Result<Option<RunSummary>, VifitError> {
        let path = self.summary_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }
}

/// Counts are integers; everything else has six fixed decimals so reruns are byte identical.
fn format_value(column: &str, value: f64) -> String {
    if column == "n_obs" {
        format!("{}", value.round() as u64)
    } else {
        format!("{:.6}", value)
    }
}

fn write_atomic<F>(path: &Path, body: F) -> Result<(), VifitError>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let temp = with_suffix(path, ".tmp");
    let file = File::create(&temp)
        .map_err(|e| VifitError::OutputUnwritable(format!("{}: {}", temp.display(), e)))?;
    let mut writer = BufWriter::new(file);
    body(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    fs::rename(&temp, path)?;
    Ok(())
}

/// Final account of a run, logged and written next to the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub phase: Phase,
    pub catalog_size: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remaining: usize,
    pub attempted_this_run: u64,
    pub queued_at_start: usize,
    pub checkpoint_saves: usize,
    pub elapsed_secs: f64,
    /// False when the run stopped early; the checkpoint then holds the progress.
    pub completed: bool,
    pub finished_at: String,
}

impl RunSummary {
    pub fn log(&self) {
        tracing::info!(
            "[summary] {}: {} succeeded, {} failed, {} remaining of {} | {} attempted this run, {} saves, {:.1}s{}",
            self.phase,
            self.succeeded,
            self.failed,
            self.remaining,
            self.catalog_size,
            self.attempted_this_run,
            self.checkpoint_saves,
            self.elapsed_secs,
            if self.completed { "" } else { " (stopped early)" }
        );
    }
}
