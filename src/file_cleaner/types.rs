use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::format::format_bytes;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Snapshot of one file taken at scan time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub name: String,
    /// Lowercased, with the leading dot (`.tmp`); empty when the file has none.
    pub extension: String,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    pub accessed: Option<DateTime<Utc>>,
    pub parent_dir: PathBuf,
    pub is_hidden: bool,
}

impl FileRecord {
    pub fn from_metadata(path: &Path, metadata: &Metadata) -> Option<Self> {
        let modified = metadata.modified().ok()?;
        let name = path.file_name()?.to_string_lossy().into_owned();
        Some(Self {
            path: path.to_path_buf(),
            extension: extension_of(path),
            is_hidden: is_hidden(path, metadata),
            name,
            size: metadata.len(),
            created: metadata.created().ok().map(DateTime::<Utc>::from),
            modified: DateTime::<Utc>::from(modified),
            accessed: metadata.accessed().ok().map(DateTime::<Utc>::from),
            parent_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
        })
    }

    /// Stats `path` (without following a final symlink) and builds a record.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::symlink_metadata(path)?;
        Self::from_metadata(path, &metadata).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("incomplete metadata for {}", path.display()),
            )
        })
    }

    pub fn age_days(&self) -> f64 {
        self.age_days_at(Utc::now())
    }

    pub fn age_days_at(&self, now: DateTime<Utc>) -> f64 {
        now.signed_duration_since(self.modified).num_milliseconds() as f64
            / 1000.0
            / SECONDS_PER_DAY
    }

    pub fn modified_system_time(&self) -> SystemTime {
        SystemTime::from(self.modified)
    }
}

pub(crate) fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

#[cfg(windows)]
fn is_hidden(_path: &Path, metadata: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(windows))]
fn is_hidden(path: &Path, _metadata: &Metadata) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

pub(crate) fn is_hidden_entry(path: &Path, metadata: &Metadata) -> bool {
    is_hidden(path, metadata)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SafeToDelete,
    PotentiallyDangerous,
    CriticalSystem,
    UserData,
    Cache,
    Temp,
    Log,
    Backup,
    /// Classification could not be completed.
    Unknown,
}

impl Category {
    pub const fn label(&self) -> &'static str {
        match self {
            Category::SafeToDelete => "safe_to_delete",
            Category::PotentiallyDangerous => "potentially_dangerous",
            Category::CriticalSystem => "critical_system",
            Category::UserData => "user_data",
            Category::Cache => "cache",
            Category::Temp => "temp",
            Category::Log => "log",
            Category::Backup => "backup",
            Category::Unknown => "unknown",
        }
    }
}

/// Category labels a general clean selects when the caller names none.
pub const DEFAULT_GENERAL_CLEAN: [&str; 4] = [
    Category::SafeToDelete.label(),
    Category::Temp.label(),
    Category::Cache.label(),
    Category::Log.label(),
];

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered confidence that deleting a file is harmless. Lower is safer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    VerySafe = 1,
    Safe = 2,
    Moderate = 3,
    Risky = 4,
    Dangerous = 5,
}

impl SafetyLevel {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn is_cleanable(self) -> bool {
        self <= SafetyLevel::Safe
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub safety: SafetyLevel,
}

impl Classification {
    pub const fn new(category: Category, safety: SafetyLevel) -> Self {
        Self { category, safety }
    }

    pub const fn unreadable() -> Self {
        Self::new(Category::UserData, SafetyLevel::Risky)
    }

    pub const fn failed() -> Self {
        Self::new(Category::Unknown, SafetyLevel::Dangerous)
    }

    pub fn is_cleanable(&self) -> bool {
        self.safety.is_cleanable()
    }

    /// Raises an otherwise unremarkable verdict to `category`/Safe for files found in a
    /// location whose contents are disposable. Critical and risky verdicts are kept.
    pub fn with_location_hint(self, category: Category) -> Self {
        match self.category {
            Category::CriticalSystem | Category::PotentiallyDangerous | Category::Unknown => self,
            _ if self.safety > SafetyLevel::Moderate => self,
            _ if self.safety.is_cleanable() => self,
            _ => Self::new(category, SafetyLevel::Safe),
        }
    }
}

/// A scanned file together with the verdict it was given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedFile {
    pub record: FileRecord,
    pub classification: Classification,
    pub cleanable: bool,
}

impl ScannedFile {
    pub fn new(record: FileRecord, classification: Classification) -> Self {
        Self {
            cleanable: classification.is_cleanable(),
            record,
            classification,
        }
    }

    pub fn path(&self) -> &Path {
        &self.record.path
    }
}

/// Output of every per-category scan entrypoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategorizedScan {
    pub operation_id: String,
    pub categories: BTreeMap<String, Vec<ScannedFile>>,
}

impl CategorizedScan {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            categories: BTreeMap::new(),
        }
    }

    pub fn with_labels(operation_id: impl Into<String>, labels: &[&str]) -> Self {
        let mut scan = Self::new(operation_id);
        for label in labels {
            scan.categories.insert((*label).to_string(), Vec::new());
        }
        scan
    }

    pub fn push(&mut self, label: &str, file: ScannedFile) {
        self.categories.entry(label.to_string()).or_default().push(file);
    }

    pub fn files(&self, label: &str) -> &[ScannedFile] {
        self.categories.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.categories
            .iter()
            .map(|(label, files)| (label.clone(), files.len()))
            .collect()
    }

    pub fn total_files(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.categories
            .values()
            .flat_map(|files| files.iter())
            .map(|file| file.record.size)
            .sum()
    }

    pub fn size_analysis(&self) -> BTreeMap<String, SizeSummary> {
        self.categories
            .iter()
            .map(|(label, files)| {
                let total: u64 = files.iter().map(|f| f.record.size).sum();
                (
                    label.clone(),
                    SizeSummary {
                        file_count: files.len(),
                        total_size_bytes: total,
                        total_size_formatted: format_bytes(total),
                    },
                )
            })
            .collect()
    }

    /// Collects the files of the given labels, in label order.
    pub fn select(&self, labels: &[&str]) -> Vec<ScannedFile> {
        labels
            .iter()
            .flat_map(|label| self.files(label).iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SizeSummary {
    pub file_count: usize,
    pub total_size_bytes: u64,
    pub total_size_formatted: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedItem {
    pub path: PathBuf,
    pub reason: String,
}

impl FailedItem {
    pub fn new(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Counts returned by every clean entrypoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanResult {
    pub operation_id: String,
    pub files_deleted: usize,
    pub files_truncated: usize,
    pub bytes_freed: u64,
    pub failed_deletions: Vec<FailedItem>,
    pub directories_removed: usize,
    pub backup: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl CleanResult {
    pub fn succeeded(&self) -> usize {
        self.files_deleted + self.files_truncated
    }

    pub fn bytes_freed_formatted(&self) -> String {
        format_bytes(self.bytes_freed)
    }
}
