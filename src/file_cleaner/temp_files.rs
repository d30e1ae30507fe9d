use std::path::{Path, PathBuf};

use super::classifier::context::{is_within, normalize};
use super::types::{Category, Classification, FileRecord};

pub const LARGE_TEMP_BYTES: u64 = 100 * 1024 * 1024;
pub const TEMP_EXTENSIONS: &[&str] = &[
    ".tmp", ".temp", ".~", ".bak", ".old", ".cache", ".log", ".pid", ".lock", ".swp", ".swo",
];

pub const OLD_TEMP_FILES: &str = "old_temp_files";
pub const LARGE_TEMP_FILES: &str = "large_temp_files";
pub const BROWSER_CACHE: &str = "browser_cache";
pub const SYSTEM_TEMP: &str = "system_temp";
pub const LOCKED_FILES: &str = "locked_files";

pub const TEMP_LABELS: [&str; 5] = [
    OLD_TEMP_FILES,
    LARGE_TEMP_FILES,
    BROWSER_CACHE,
    SYSTEM_TEMP,
    LOCKED_FILES,
];
pub const DEFAULT_TEMP_CLEAN: [&str; 2] = [OLD_TEMP_FILES, BROWSER_CACHE];

/// Where temp files live and what makes one worth reporting.
#[derive(Debug, Clone)]
pub struct TempLayout {
    roots: Vec<String>,
    browser_caches: Vec<String>,
    system_temp: String,
    max_age_days: f64,
}

impl TempLayout {
    pub fn new(
        roots: &[PathBuf],
        browser_caches: &[PathBuf],
        system_temp: &Path,
        max_age_days: u32,
    ) -> Self {
        let norm = |p: &Path| normalize(&p.to_string_lossy()).trim_end_matches('/').to_string();
        Self {
            roots: roots.iter().map(|p| norm(p)).collect(),
            browser_caches: browser_caches.iter().map(|p| norm(p)).collect(),
            system_temp: norm(system_temp),
            max_age_days: f64::from(max_age_days),
        }
    }

    pub fn is_candidate(&self, record: &FileRecord) -> bool {
        record.age_days() >= self.max_age_days
            || record.size >= LARGE_TEMP_BYTES
            || has_temp_extension(record)
    }

    /// Category label for a candidate. In-use files always land in `locked_files`.
    pub fn label(&self, record: &FileRecord, in_use: bool) -> &'static str {
        if in_use {
            return LOCKED_FILES;
        }
        let lower = normalize(&record.path.to_string_lossy());
        if self.browser_caches.iter().any(|dir| is_within(&lower, dir)) {
            BROWSER_CACHE
        } else if is_within(&lower, &self.system_temp) {
            SYSTEM_TEMP
        } else if record.size >= LARGE_TEMP_BYTES {
            LARGE_TEMP_FILES
        } else {
            OLD_TEMP_FILES
        }
    }

    pub fn in_temp_root(&self, path: &Path) -> bool {
        let lower = normalize(&path.to_string_lossy());
        self.roots.iter().any(|root| is_within(&lower, root))
    }

    /// Applies the temp-location hint to a general verdict.
    pub fn hint(&self, record: &FileRecord, base: Classification) -> Classification {
        if !self.in_temp_root(&record.path) {
            return base;
        }
        let category = match record.extension.as_str() {
            ".bak" | ".old" => Category::Backup,
            _ => Category::Temp,
        };
        base.with_location_hint(category)
    }
}

pub fn has_temp_extension(record: &FileRecord) -> bool {
    TEMP_EXTENSIONS.contains(&record.extension.as_str())
}
