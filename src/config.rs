// src/config.rs

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CleanerError, Result};

const APP_DIR: &str = ".appdata_cleaner";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Roots
    pub scan_paths: Vec<PathBuf>,           // Default: APPDATA, LOCALAPPDATA, TEMP, C:\Windows\Temp

    // Backups
    pub backup_enabled: bool,               // Default: true
    pub backup_required: bool,              // Default: true, a failed backup aborts the clean
    pub backup_path: PathBuf,               // Default: ~/.appdata_cleaner/backups
    pub compress_backups: bool,             // Default: true
    pub backup_max_age_days: u32,           // Default: 30
    pub backup_max_count: usize,            // Default: 10

    // Safety
    pub safe_mode: bool,                    // Default: true
    pub dry_run: bool,                      // Default: false

    // Filters
    pub max_file_age_days: u32,             // Default: 30
    pub min_file_size_mb: f64,              // Default: 1.0
    pub excluded_extensions: Vec<String>,   // Default: .exe .dll .sys .ini

    // Duplicates
    pub duplicate_min_size: u64,            // Default: 1024 bytes
    pub keep_strategy: String,              // Default: newest
    pub hash_threads: usize,                // Default: num_cpus::get()

    // Browsers
    pub history_days_to_keep: u32,          // Default: 30

    // Optional JSON file replacing the embedded AppData rule tables
    pub appdata_rules_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            scan_paths: default_scan_paths(),
            backup_enabled: true,
            backup_required: true,
            backup_path: app_dir().join("backups"),
            compress_backups: true,
            backup_max_age_days: 30,
            backup_max_count: 10,
            safe_mode: true,
            dry_run: false,
            max_file_age_days: 30,
            min_file_size_mb: 1.0,
            excluded_extensions: [".exe", ".dll", ".sys", ".ini"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            duplicate_min_size: 1024,
            keep_strategy: "newest".into(),
            hash_threads: num_cpus::get(),
            history_days_to_keep: 30,
            appdata_rules_path: None,
        }
    }
}

impl Settings {
    pub fn default_path() -> PathBuf {
        app_dir().join(CONFIG_FILE)
    }

    /// Reads settings from `path`, merging present keys over the defaults.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let mut settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| CleanerError::Config(format!("{}: {}", path.display(), e)))?;
        settings.normalize();
        Ok(settings)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                log::warn!("Falling back to default settings: {}", err);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn min_file_size_bytes(&self) -> u64 {
        if self.min_file_size_mb <= 0.0 {
            return 0;
        }
        (self.min_file_size_mb * 1024.0 * 1024.0) as u64
    }

    fn normalize(&mut self) {
        self.excluded_extensions = self
            .excluded_extensions
            .iter()
            .map(|ext| normalize_extension(ext))
            .filter(|ext| !ext.is_empty())
            .collect();
        self.hash_threads = self.hash_threads.max(1);
    }
}

/// Lowercases and ensures a leading dot, so `EXE` and `.exe` compare equal.
pub fn normalize_extension(ext: &str) -> String {
    let trimmed = ext.trim().to_lowercase();
    if trimmed.is_empty() || trimmed.starts_with('.') {
        trimmed
    } else {
        format!(".{}", trimmed)
    }
}

fn app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

fn default_scan_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = ["APPDATA", "LOCALAPPDATA", "TEMP"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .map(PathBuf::from)
        .collect();
    if cfg!(windows) {
        paths.push(PathBuf::from(r"C:\Windows\Temp"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert!(settings.backup_enabled);
        assert!(settings.safe_mode);
        assert_eq!(settings.max_file_age_days, 30);
        assert_eq!(settings.min_file_size_bytes(), 1024 * 1024);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "safe_mode": false, "excluded_extensions": ["EXE", "msi", ""] }"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert!(!settings.safe_mode);
        assert!(settings.backup_enabled);
        assert_eq!(settings.excluded_extensions, vec![".exe", ".msi"]);
    }

    #[test]
    fn malformed_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(Settings::load(&path).is_err());
        let settings = Settings::load_or_default(&path);
        assert_eq!(settings.keep_strategy, "newest");
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut settings = Settings::default();
        settings.dry_run = true;
        settings.history_days_to_keep = 7;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert!(loaded.dry_run);
        assert_eq!(loaded.history_days_to_keep, 7);
    }
}
