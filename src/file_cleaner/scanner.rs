use futures::stream::{self, Stream, StreamExt};
use lazy_static::lazy_static;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

use super::types::{is_hidden_entry, FileRecord};
use crate::config::{normalize_extension, Settings};

/// Files modified more recently than this are never yielded.
pub const MIN_AGE_DAYS: f64 = 1.0;
const YIELD_EVERY: usize = 256;
const CHANNEL_CAPACITY: usize = 1024;

lazy_static! {
    static ref SYSTEM_DIRECTORIES: HashSet<&'static str> = [
        "windows",
        "program files",
        "program files (x86)",
        "system32",
        "syswow64",
        "$recycle.bin",
        "system volume information",
    ]
    .into_iter()
    .collect();
}

const HIDDEN_ALLOWED_KEYWORDS: &[&str] = &["appdata", "cache", "temp", "temporary internet files"];

/// Inclusion filters shared by every walk of one scanner.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub excluded_extensions: HashSet<String>,
    pub min_size: u64,
    /// When set, only files at least this many days old are yielded.
    pub older_than_days: Option<f64>,
    pub max_depth: Option<usize>,
}

impl ScanFilter {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            excluded_extensions: settings
                .excluded_extensions
                .iter()
                .map(|ext| normalize_extension(ext))
                .collect(),
            min_size: settings.min_file_size_bytes(),
            older_than_days: None,
            max_depth: None,
        }
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_older_than_days(mut self, days: f64) -> Self {
        self.older_than_days = Some(days);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn includes(&self, record: &FileRecord) -> bool {
        if !record.extension.is_empty() && self.excluded_extensions.contains(&record.extension) {
            return false;
        }
        if record.size < self.min_size {
            return false;
        }
        let age = record.age_days();
        if age < MIN_AGE_DAYS {
            return false;
        }
        match self.older_than_days {
            Some(days) => age >= days,
            None => true,
        }
    }
}

/// Decides whether the walk descends into `entry`. Roots are always entered.
pub fn should_scan_directory(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy().to_lowercase();
    if SYSTEM_DIRECTORIES.contains(name.as_str()) {
        return false;
    }
    let hidden = match entry.metadata() {
        Ok(metadata) => is_hidden_entry(entry.path(), &metadata),
        Err(_) => return false,
    };
    if hidden {
        return HIDDEN_ALLOWED_KEYWORDS.iter().any(|kw| name.contains(kw));
    }
    true
}

#[derive(Debug, Clone)]
pub struct Scanner {
    filter: Arc<ScanFilter>,
}

impl Scanner {
    pub fn new(filter: ScanFilter) -> Self {
        Self {
            filter: Arc::new(filter),
        }
    }

    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    /// Same walk rules, different inclusion filter.
    pub fn with_filter(&self, filter: ScanFilter) -> Self {
        Self::new(filter)
    }

    /// Lazy, synchronous walk of `root`. Unreadable entries are skipped; an unreadable
    /// root produces nothing.
    pub fn walk(&self, root: &Path) -> impl Iterator<Item = FileRecord> + Send + 'static {
        let filter = Arc::clone(&self.filter);
        let mut walker = WalkDir::new(root).follow_links(false);
        if let Some(depth) = filter.max_depth {
            walker = walker.max_depth(depth);
        }

        walker
            .into_iter()
            .filter_entry(|entry| !entry.file_type().is_dir() || should_scan_directory(entry))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    log::debug!("Skipping unreadable entry: {}", err);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                FileRecord::from_metadata(entry.path(), &metadata)
            })
            .filter(move |record| filter.includes(record))
    }

    /// Walks on a blocking worker and hands records over a bounded channel.
    pub fn stream(&self, root: PathBuf) -> impl Stream<Item = FileRecord> + Send + 'static {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let scanner = self.clone();
        task::spawn_blocking(move || {
            for record in scanner.walk(&root) {
                if tx.blocking_send(record).is_err() {
                    break;
                }
            }
        });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|record| (record, rx)) })
    }

    /// Collects a walk, yielding to the scheduler every few hundred records.
    pub async fn scan_path(&self, root: &Path, cancel: &CancellationToken) -> Vec<FileRecord> {
        let mut records = Vec::new();
        let mut stream = Box::pin(self.stream(root.to_path_buf()));
        while let Some(record) = stream.next().await {
            records.push(record);
            if records.len() % YIELD_EVERY == 0 {
                if cancel.is_cancelled() {
                    break;
                }
                task::yield_now().await;
            }
        }
        records
    }

    pub async fn scan_paths(&self, roots: &[PathBuf], cancel: &CancellationToken) -> Vec<FileRecord> {
        let mut records = Vec::new();
        for root in roots {
            if cancel.is_cancelled() {
                break;
            }
            if !root.exists() {
                log::debug!("Scan root does not exist: {}", root.display());
                continue;
            }
            records.extend(self.scan_path(root, cancel).await);
        }
        records
    }
}
