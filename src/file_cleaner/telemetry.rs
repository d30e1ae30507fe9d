use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StatsSnapshot {
    pub total_scans: u64,
    pub total_cleans: u64,
    pub files_scanned: u64,
    pub files_cleaned: u64,
    pub bytes_freed: u64,
    pub errors: u64,
    pub last_scan_ms: u64,
}

/// Engine-wide counters. Persisted as JSON after every change when a path is set.
pub struct CleanerStats {
    snapshot: StatsSnapshot,
    scan_timer: Option<Instant>,
    persist_path: Option<PathBuf>,
}

impl CleanerStats {
    pub fn new() -> Self {
        Self {
            snapshot: StatsSnapshot::default(),
            scan_timer: None,
            persist_path: None,
        }
    }

    /// Resumes from a previously persisted snapshot at `path`, if one can be read.
    pub fn persisted_at(path: PathBuf) -> Self {
        let snapshot = fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        Self {
            snapshot,
            scan_timer: None,
            persist_path: Some(path),
        }
    }

    pub fn start_scan(&mut self) {
        self.scan_timer = Some(Instant::now());
    }

    pub fn finish_scan(&mut self, files: usize) {
        self.snapshot.total_scans = self.snapshot.total_scans.saturating_add(1);
        self.snapshot.files_scanned = self.snapshot.files_scanned.saturating_add(files as u64);
        if let Some(t0) = self.scan_timer.take() {
            self.snapshot.last_scan_ms = t0.elapsed().as_millis() as u64;
        }
        self.persist_quietly();
    }

    pub fn record_clean(&mut self, files: usize, bytes: u64, errors: usize) {
        self.snapshot.total_cleans = self.snapshot.total_cleans.saturating_add(1);
        self.snapshot.files_cleaned = self.snapshot.files_cleaned.saturating_add(files as u64);
        self.snapshot.bytes_freed = self.snapshot.bytes_freed.saturating_add(bytes);
        self.snapshot.errors = self.snapshot.errors.saturating_add(errors as u64);
        self.persist_quietly();
    }

    pub fn get_snapshot(&self) -> StatsSnapshot {
        self.snapshot.clone()
    }

    fn persist_quietly(&self) {
        if let Err(err) = self.persist() {
            log::debug!("Could not persist cleaner stats: {}", err);
        }
    }

    fn persist(&self) -> std::io::Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(&self.snapshot).unwrap_or_else(|_| b"{}".to_vec());
        fs::write(path, data)
    }
}

impl Default for CleanerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn counters_accumulate() {
        let mut stats = CleanerStats::new();
        stats.start_scan();
        stats.finish_scan(12);
        stats.record_clean(3, 4096, 1);
        stats.record_clean(2, 1024, 0);

        let snap = stats.get_snapshot();
        assert_eq!(snap.total_scans, 1);
        assert_eq!(snap.files_scanned, 12);
        assert_eq!(snap.total_cleans, 2);
        assert_eq!(snap.files_cleaned, 5);
        assert_eq!(snap.bytes_freed, 5120);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn persisted_counters_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats").join("telemetry.json");

        let mut first = CleanerStats::persisted_at(path.clone());
        first.record_clean(4, 100, 0);

        let second = CleanerStats::persisted_at(path);
        assert_eq!(second.get_snapshot().files_cleaned, 4);
    }
}
