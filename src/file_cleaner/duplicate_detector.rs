use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task;
use tokio_util::sync::CancellationToken;

use super::cache::HashCache;
use super::types::{FailedItem, FileRecord};
use crate::error::{CleanerError, Result};
use crate::format::format_bytes;

pub const HASH_CHUNK_SIZE: usize = 64 * 1024;
const TOP_GROUPS: usize = 10;

/// Called with `(hashed, total)` as phase two progresses.
pub type HashProgress = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepStrategy {
    #[default]
    Newest,
    Oldest,
    ShortestPath,
    LongestPath,
}

impl KeepStrategy {
    /// Unknown names fall back to `newest`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "newest" => KeepStrategy::Newest,
            "oldest" => KeepStrategy::Oldest,
            "shortest_path" => KeepStrategy::ShortestPath,
            "longest_path" => KeepStrategy::LongestPath,
            other => {
                log::debug!("Unknown keep strategy {:?}, using newest", other);
                KeepStrategy::Newest
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub hash: String,
    pub size: u64,
    /// Members in encounter order.
    pub files: Vec<FileRecord>,
}

#[derive(Debug)]
pub struct KeepSelection<'a> {
    pub keep: &'a FileRecord,
    pub remove: Vec<&'a FileRecord>,
}

impl DuplicateGroup {
    pub fn duplicate_count(&self) -> usize {
        self.files.len().saturating_sub(1)
    }

    pub fn wasted_space(&self) -> u64 {
        self.size * self.duplicate_count() as u64
    }

    /// Exactly one member is kept; ties go to the member encountered first.
    pub fn select(&self, strategy: KeepStrategy) -> Option<KeepSelection<'_>> {
        let path_len = |r: &FileRecord| r.path.to_string_lossy().chars().count();
        let mut keep_idx = 0;
        for (idx, candidate) in self.files.iter().enumerate().skip(1) {
            let current = &self.files[keep_idx];
            let better = match strategy {
                KeepStrategy::Newest => candidate.modified > current.modified,
                KeepStrategy::Oldest => candidate.modified < current.modified,
                KeepStrategy::ShortestPath => path_len(candidate) < path_len(current),
                KeepStrategy::LongestPath => path_len(candidate) > path_len(current),
            };
            if better {
                keep_idx = idx;
            }
        }

        let keep = self.files.get(keep_idx)?;
        let remove = self
            .files
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != keep_idx)
            .map(|(_, record)| record)
            .collect();
        Some(KeepSelection { keep, remove })
    }

    fn summary(&self) -> GroupSummary {
        GroupSummary {
            hash: self.hash.clone(),
            file_count: self.files.len(),
            duplicates_count: self.duplicate_count(),
            file_size: self.size,
            wasted_space: self.wasted_space(),
            files: self.files.iter().map(|f| f.path.clone()).collect(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DuplicateScanResult {
    pub operation_id: String,
    pub groups: Vec<DuplicateGroup>,
    pub analyzed_files: usize,
    pub skipped: Vec<FailedItem>,
}

impl DuplicateScanResult {
    pub fn total_duplicates(&self) -> usize {
        self.groups.iter().map(DuplicateGroup::duplicate_count).sum()
    }

    pub fn wasted_space(&self) -> u64 {
        self.groups.iter().map(DuplicateGroup::wasted_space).sum()
    }

    pub fn by_hash(&self) -> HashMap<&str, &[FileRecord]> {
        self.groups
            .iter()
            .map(|g| (g.hash.as_str(), g.files.as_slice()))
            .collect()
    }

    pub fn report(&self) -> DuplicateReport {
        let wasted = self.wasted_space();
        DuplicateReport {
            duplicate_groups: self.groups.len(),
            total_duplicates: self.total_duplicates(),
            total_wasted_space: wasted,
            total_wasted_space_formatted: format_bytes(wasted),
            largest_groups: rank_by_count(&self.groups)
                .into_iter()
                .take(TOP_GROUPS)
                .map(DuplicateGroup::summary)
                .collect(),
            most_wasted_groups: rank_by_wasted_space(&self.groups)
                .into_iter()
                .take(TOP_GROUPS)
                .map(DuplicateGroup::summary)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub hash: String,
    pub file_count: usize,
    pub duplicates_count: usize,
    pub file_size: u64,
    pub wasted_space: u64,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub duplicate_groups: usize,
    pub total_duplicates: usize,
    pub total_wasted_space: u64,
    pub total_wasted_space_formatted: String,
    pub largest_groups: Vec<GroupSummary>,
    pub most_wasted_groups: Vec<GroupSummary>,
}

pub fn rank_by_count(groups: &[DuplicateGroup]) -> Vec<&DuplicateGroup> {
    let mut ranked: Vec<_> = groups.iter().collect();
    ranked.sort_by(|a, b| b.files.len().cmp(&a.files.len()));
    ranked
}

pub fn rank_by_wasted_space(groups: &[DuplicateGroup]) -> Vec<&DuplicateGroup> {
    let mut ranked: Vec<_> = groups.iter().collect();
    ranked.sort_by(|a, b| b.wasted_space().cmp(&a.wasted_space()));
    ranked
}

pub struct DuplicateDetector {
    hash_cache: HashCache,
    pool: Option<rayon::ThreadPool>,
}

impl DuplicateDetector {
    pub fn new(threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("dup-hash-{}", i))
            .build()
            .map_err(|e| log::warn!("Falling back to the global hashing pool: {}", e))
            .ok();
        Self {
            hash_cache: HashCache::default(),
            pool,
        }
    }

    pub fn hash_cache(&self) -> &HashCache {
        &self.hash_cache
    }

    /// Runs both phases on a blocking worker.
    pub async fn find_duplicates(
        self: &Arc<Self>,
        records: Vec<FileRecord>,
        min_size: u64,
        cancel: CancellationToken,
        progress: Option<HashProgress>,
    ) -> Result<DuplicateScanResult> {
        let detector = Arc::clone(self);
        task::spawn_blocking(move || detector.find_in_records(records, min_size, &cancel, progress))
            .await
            .map_err(|e| CleanerError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
    }

    /// Phase one buckets by exact size; phase two hashes only members of shared buckets.
    pub fn find_in_records(
        &self,
        records: Vec<FileRecord>,
        min_size: u64,
        cancel: &CancellationToken,
        progress: Option<HashProgress>,
    ) -> Result<DuplicateScanResult> {
        let mut result = DuplicateScanResult::default();

        let eligible: Vec<FileRecord> = records
            .into_iter()
            .filter(|r| r.size >= min_size)
            .collect();
        let mut bucket_sizes: HashMap<u64, usize> = HashMap::new();
        for record in &eligible {
            *bucket_sizes.entry(record.size).or_insert(0) += 1;
        }
        let candidates: Vec<FileRecord> = eligible
            .into_iter()
            .filter(|r| bucket_sizes.get(&r.size).copied().unwrap_or(0) > 1)
            .collect();

        if candidates.is_empty() {
            return Ok(result);
        }

        let total = candidates.len();
        let hashed = AtomicUsize::new(0);
        let hash_one = |record: &FileRecord| -> std::result::Result<String, String> {
            if cancel.is_cancelled() {
                return Err("cancelled".into());
            }
            let outcome = self.hash_current(record);
            let done = hashed.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(cb) = &progress {
                cb(done, total);
            }
            outcome
        };
        let hashes: Vec<std::result::Result<String, String>> = match &self.pool {
            Some(pool) => pool.install(|| candidates.par_iter().map(hash_one).collect()),
            None => candidates.par_iter().map(hash_one).collect(),
        };

        if cancel.is_cancelled() {
            return Err(CleanerError::Cancelled);
        }

        let mut index: HashMap<(u64, String), usize> = HashMap::new();
        let mut groups: Vec<DuplicateGroup> = Vec::new();
        for (record, outcome) in candidates.into_iter().zip(hashes) {
            match outcome {
                Ok(hash) => {
                    result.analyzed_files += 1;
                    let key = (record.size, hash.clone());
                    match index.get(&key) {
                        Some(&idx) => groups[idx].files.push(record),
                        None => {
                            index.insert(key, groups.len());
                            groups.push(DuplicateGroup {
                                hash,
                                size: record.size,
                                files: vec![record],
                            });
                        }
                    }
                }
                Err(reason) => {
                    log::debug!("Dropping duplicate candidate {}: {}", record.path.display(), reason);
                    result.skipped.push(FailedItem::new(record.path, reason));
                }
            }
        }

        result.groups = groups.into_iter().filter(|g| g.files.len() > 1).collect();
        Ok(result)
    }

    /// Hash of the file as it is now. A file whose size moved since the scan is dropped.
    fn hash_current(&self, record: &FileRecord) -> std::result::Result<String, String> {
        let metadata = fs::metadata(&record.path).map_err(|e| e.to_string())?;
        if metadata.len() != record.size {
            return Err("file changed since scan".into());
        }
        let modified = metadata.modified().map_err(|e| e.to_string())?;
        if let Some(hash) = self.hash_cache.get(&record.path, record.size, modified) {
            return Ok(hash);
        }
        let hash = hash_file(&record.path).map_err(|e| e.to_string())?;
        self.hash_cache
            .insert(&record.path, record.size, modified, hash.clone());
        Ok(hash)
    }
}

/// SHA-256 of the whole file, streamed in fixed-size chunks.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
