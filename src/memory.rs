use sysinfo::System;

const MIB: u64 = 1_048_576;

/// Memory reading taken when the worker pool is rebuilt. All figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub used_bytes: u64,
    pub total_bytes: u64,
    /// Resident set of this process, when the platform reports it.
    pub process_bytes: Option<u64>,
}

impl MemorySnapshot {
    pub fn capture() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let process_bytes = sysinfo::get_current_pid().ok().and_then(|pid| {
            sys.refresh_process(pid);
            sys.process(pid).map(|p| p.memory())
        });

        Self {
            used_bytes: sys.used_memory(),
            total_bytes: sys.total_memory(),
            process_bytes,
        }
    }

    pub fn headroom_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    pub fn log(&self, context: &str) {
        tracing::info!(
            "[memory] {}: process {} MB, system {} / {} MB used, {} MB free",
            context,
            self.process_bytes.map_or(0, |b| b / MIB),
            self.used_bytes / MIB,
            self.total_bytes / MIB,
            self.headroom_bytes() / MIB,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_is_consistent() {
        let snapshot = MemorySnapshot::capture();
        assert!(snapshot.used_bytes <= snapshot.total_bytes);
        assert_eq!(snapshot.headroom_bytes(), snapshot.total_bytes - snapshot.used_bytes);
        // A KiB reading would put any real machine below this.
        assert!(snapshot.total_bytes >= 64 * MIB, "total {} looks like KiB", snapshot.total_bytes);
    }

    #[test]
    fn test_headroom_saturates() {
        let snapshot = MemorySnapshot {
            used_bytes: 10 * MIB,
            total_bytes: 8 * MIB,
            process_bytes: None,
        };
        assert_eq!(snapshot.headroom_bytes(), 0);
    }
}
