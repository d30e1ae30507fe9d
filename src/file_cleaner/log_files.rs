use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

use super::classifier::context::{is_within, normalize};
use super::types::{Category, Classification, FileRecord};

pub const LARGE_LOG_BYTES: u64 = 10 * 1024 * 1024;
const ACTIVE_WINDOW_SECS: i64 = 3600;

pub const ERROR_LOGS: &str = "error_logs";
pub const SYSTEM_LOGS: &str = "system_logs";
pub const LARGE_LOGS: &str = "large_logs";
pub const OLD_LOGS: &str = "old_logs";
pub const APPLICATION_LOGS: &str = "application_logs";

pub const LOG_LABELS: [&str; 5] = [ERROR_LOGS, SYSTEM_LOGS, LARGE_LOGS, OLD_LOGS, APPLICATION_LOGS];
pub const DEFAULT_LOG_CLEAN: [&str; 2] = [OLD_LOGS, LARGE_LOGS];

lazy_static! {
    static ref LOG_NAME: Regex = Regex::new(r"(?i)log|trace|debug|error|warn").unwrap();
    static ref ERROR_NAME: Regex = Regex::new(r"(?i)err|exception|crash|dump").unwrap();
    static ref ACTIVE_NAME: Regex = Regex::new(r"(?i)current|today|latest|active").unwrap();
}

/// `.log`/`.trace` files, anything named like a log, or anything inside a log directory.
pub fn is_log_file(record: &FileRecord) -> bool {
    if matches!(record.extension.as_str(), ".log" | ".trace") {
        return true;
    }
    if LOG_NAME.is_match(&record.name) {
        return true;
    }
    record
        .parent_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase().contains("log"))
        .unwrap_or(false)
}

/// Recently written or named as the live log. These are truncated, never removed.
pub fn is_active_log(record: &FileRecord, now: DateTime<Utc>) -> bool {
    if now.signed_duration_since(record.modified).num_seconds() < ACTIVE_WINDOW_SECS {
        return true;
    }
    ACTIVE_NAME.is_match(&record.name)
}

#[derive(Debug, Clone)]
pub struct LogLayout {
    system_root: String,
    max_age_days: f64,
}

impl LogLayout {
    pub fn new(system_root: &Path, max_age_days: u32) -> Self {
        Self {
            system_root: normalize(&system_root.to_string_lossy())
                .trim_end_matches('/')
                .to_string(),
            max_age_days: f64::from(max_age_days),
        }
    }

    pub fn is_candidate(&self, record: &FileRecord) -> bool {
        is_log_file(record) && (self.is_old(record) || record.size >= LARGE_LOG_BYTES)
    }

    fn is_old(&self, record: &FileRecord) -> bool {
        record.age_days() >= self.max_age_days
    }

    pub fn label(&self, record: &FileRecord) -> &'static str {
        if ERROR_NAME.is_match(&record.name) {
            return ERROR_LOGS;
        }
        if is_within(&normalize(&record.path.to_string_lossy()), &self.system_root) {
            return SYSTEM_LOGS;
        }
        match (record.size >= LARGE_LOG_BYTES, self.is_old(record)) {
            (true, true) => LARGE_LOGS,
            (false, true) => OLD_LOGS,
            _ => APPLICATION_LOGS,
        }
    }

    pub fn hint(&self, base: Classification) -> Classification {
        base.with_location_hint(Category::Log)
    }
}
