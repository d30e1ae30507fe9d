use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::types::FileRecord;
use crate::format::format_bytes;

const TOP_N: usize = 10;
const NO_EXTENSION: &str = "(none)";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExtensionUsage {
    pub extension: String,
    pub file_count: usize,
    pub total_size: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LargeFile {
    pub path: PathBuf,
    pub size: u64,
    pub size_formatted: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScanStatistics {
    pub total_files: usize,
    pub total_size: u64,
    pub total_size_formatted: String,
    /// Keys: `0_7_days`, `7_30_days`, `30_plus_days`.
    pub age_groups: BTreeMap<String, usize>,
    pub top_extensions: Vec<ExtensionUsage>,
    pub largest_files: Vec<LargeFile>,
}

impl ScanStatistics {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a FileRecord>) -> Self {
        Self::at(records, Utc::now())
    }

    pub fn at<'a>(records: impl IntoIterator<Item = &'a FileRecord>, now: DateTime<Utc>) -> Self {
        let mut age_groups: BTreeMap<String, usize> = ["0_7_days", "7_30_days", "30_plus_days"]
            .iter()
            .map(|k| (k.to_string(), 0))
            .collect();
        let mut by_ext: HashMap<String, (usize, u64)> = HashMap::new();
        let mut all: Vec<&FileRecord> = Vec::new();
        let mut total_size = 0u64;

        for record in records {
            total_size += record.size;
            let age = record.age_days_at(now);
            let group = if age < 7.0 {
                "0_7_days"
            } else if age < 30.0 {
                "7_30_days"
            } else {
                "30_plus_days"
            };
            *age_groups.entry(group.to_string()).or_insert(0) += 1;

            let ext = if record.extension.is_empty() {
                NO_EXTENSION.to_string()
            } else {
                record.extension.clone()
            };
            let slot = by_ext.entry(ext).or_insert((0, 0));
            slot.0 += 1;
            slot.1 += record.size;
            all.push(record);
        }

        let mut top_extensions: Vec<ExtensionUsage> = by_ext
            .into_iter()
            .map(|(extension, (file_count, total_size))| ExtensionUsage {
                extension,
                file_count,
                total_size,
            })
            .collect();
        top_extensions.sort_by(|a, b| {
            b.total_size
                .cmp(&a.total_size)
                .then_with(|| a.extension.cmp(&b.extension))
        });
        top_extensions.truncate(TOP_N);

        all.sort_by(|a, b| b.size.cmp(&a.size));
        let largest_files = all
            .iter()
            .take(TOP_N)
            .map(|r| LargeFile {
                path: r.path.clone(),
                size: r.size,
                size_formatted: format_bytes(r.size),
            })
            .collect();

        Self {
            total_files: all.len(),
            total_size,
            total_size_formatted: format_bytes(total_size),
            age_groups,
            top_extensions,
            largest_files,
        }
    }
}
