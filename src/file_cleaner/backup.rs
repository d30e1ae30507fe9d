use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::types::FailedItem;
use crate::error::{CleanerError, Result};

pub const MANIFEST_NAME: &str = "backup_manifest.json";
const ARCHIVE_EXTENSION: &str = "zip";
const DEFAULT_STAGING: &str = "appdata_cleaner_restore";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub original_path: PathBuf,
    /// Name inside the archive, or inside the backup directory.
    pub archive_name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub compressed: bool,
    pub files: Vec<ManifestEntry>,
}

impl BackupManifest {
    fn new(label: &str, compressed: bool) -> Self {
        Self {
            label: label.to_string(),
            created_at: Utc::now(),
            compressed,
            files: Vec::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Archive,
    Directory,
}

/// A freshly written backup and the sources that could not be included.
#[derive(Debug, Clone, Serialize)]
pub struct BackupHandle {
    pub path: PathBuf,
    pub kind: BackupKind,
    pub manifest: BackupManifest,
    pub skipped: Vec<FailedItem>,
}

impl BackupHandle {
    pub fn contains(&self, original: &Path) -> bool {
        self.manifest.files.iter().any(|e| e.original_path == original)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub kind: BackupKind,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    pub failed: Vec<FailedItem>,
}

impl RestoreReport {
    pub fn is_success(&self) -> bool {
        !self.restored.is_empty()
    }
}

/// Owns every backup under `root`. Backups are only removed by explicit cleanup.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    staging_dir: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staging_dir: std::env::temp_dir().join(DEFAULT_STAGING),
        }
    }

    pub fn with_staging_dir(mut self, staging_dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = staging_dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// `compress` selects a single zip archive; otherwise files are copied into a directory.
    pub fn create_backup(&self, files: &[PathBuf], label: &str, compress: bool) -> Result<BackupHandle> {
        fs::create_dir_all(&self.root)?;
        let handle = if compress {
            self.create_archive(files, label)?
        } else {
            self.create_directory(files, label)?
        };

        if handle.manifest.files.is_empty() && !files.is_empty() {
            let _ = remove_backup_path(&handle.path);
            return Err(CleanerError::BackupFailed(format!(
                "none of the {} files could be backed up",
                files.len()
            )));
        }

        log::info!(
            "Created backup {} with {} files",
            handle.path.display(),
            handle.manifest.files.len()
        );
        Ok(handle)
    }

    fn create_archive(&self, files: &[PathBuf], label: &str) -> Result<BackupHandle> {
        let path = self.fresh_path(label, Some(ARCHIVE_EXTENSION));
        let mut manifest = BackupManifest::new(label, true);
        let mut skipped = Vec::new();

        let written = (|| -> Result<()> {
            let mut zip = ZipWriter::new(File::create(&path)?);
            let mut taken = reserved_names();

            for source in files {
                let (mut reader, size, modified) = match open_source(source) {
                    Ok(opened) => opened,
                    Err(err) => {
                        log::warn!("Skipping {} in backup: {}", source.display(), err);
                        skipped.push(FailedItem::new(source.clone(), err));
                        continue;
                    }
                };
                let name = unique_name(&mut taken, &source_file_name(source));
                zip.start_file(name.as_str(), entry_options())?;
                io::copy(&mut reader, &mut zip)?;
                manifest.files.push(ManifestEntry {
                    original_path: source.clone(),
                    archive_name: name,
                    size,
                    modified,
                });
            }

            zip.start_file(MANIFEST_NAME, entry_options())?;
            zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
            zip.finish()?;
            Ok(())
        })();

        if let Err(err) = written {
            let _ = fs::remove_file(&path);
            return Err(err);
        }

        Ok(BackupHandle {
            path,
            kind: BackupKind::Archive,
            manifest,
            skipped,
        })
    }

    fn create_directory(&self, files: &[PathBuf], label: &str) -> Result<BackupHandle> {
        let path = self.fresh_path(label, None);
        fs::create_dir_all(&path)?;
        let mut manifest = BackupManifest::new(label, false);
        let mut skipped = Vec::new();
        let mut taken = reserved_names();

        for source in files {
            let metadata = match fs::metadata(source) {
                Ok(m) if m.is_file() => m,
                Ok(_) => {
                    skipped.push(FailedItem::new(source.clone(), "not a regular file"));
                    continue;
                }
                Err(err) => {
                    skipped.push(FailedItem::new(source.clone(), err));
                    continue;
                }
            };
            let name = unique_name(&mut taken, &source_file_name(source));
            if let Err(err) = fs::copy(source, path.join(&name)) {
                log::warn!("Skipping {} in backup: {}", source.display(), err);
                taken.remove(&name);
                skipped.push(FailedItem::new(source.clone(), err));
                continue;
            }
            manifest.files.push(ManifestEntry {
                original_path: source.clone(),
                archive_name: name,
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        fs::write(path.join(MANIFEST_NAME), serde_json::to_vec_pretty(&manifest)?)?;
        Ok(BackupHandle {
            path,
            kind: BackupKind::Directory,
            manifest,
            skipped,
        })
    }

    /// Newest first. Backups without a readable manifest are left out.
    pub fn list_backups(&self) -> Vec<BackupInfo> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut backups: Vec<BackupInfo> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                match read_manifest(&path) {
                    Ok((manifest, kind)) => Some(BackupInfo {
                        kind,
                        label: manifest.label.clone(),
                        created_at: manifest.created_at,
                        file_count: manifest.files.len(),
                        total_size: manifest.total_size(),
                        path,
                    }),
                    Err(err) => {
                        log::debug!("Ignoring {}: {}", path.display(), err);
                        None
                    }
                }
            })
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        backups
    }

    /// Replays the manifest either onto the original paths or into the staging directory.
    pub fn restore_backup(&self, backup: &Path, to_original: bool) -> Result<RestoreReport> {
        if !backup.exists() {
            return Err(CleanerError::BackupNotFound(backup.to_path_buf()));
        }
        let (manifest, kind) = read_manifest(backup)?;
        let staging = self.staging_dir.join(
            backup
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "backup".into()),
        );
        let mut archive = match kind {
            BackupKind::Archive => Some(ZipArchive::new(File::open(backup)?)?),
            BackupKind::Directory => None,
        };

        let mut report = RestoreReport::default();
        for entry in &manifest.files {
            let target = if to_original {
                entry.original_path.clone()
            } else {
                staging.join(&entry.archive_name)
            };
            let restored = (|| -> Result<()> {
                if !is_plain_name(&entry.archive_name) {
                    return Err(CleanerError::InvalidBackup {
                        path: backup.to_path_buf(),
                        reason: format!("unsafe entry name {:?}", entry.archive_name),
                    });
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                match archive.as_mut() {
                    Some(zip) => {
                        let mut source = zip.by_name(&entry.archive_name)?;
                        let mut out = File::create(&target)?;
                        io::copy(&mut source, &mut out)?;
                    }
                    None => {
                        fs::copy(backup.join(&entry.archive_name), &target)?;
                    }
                }
                Ok(())
            })();

            match restored {
                Ok(()) => report.restored.push(target),
                Err(err) => {
                    log::warn!("Failed to restore {}: {}", entry.original_path.display(), err);
                    report.failed.push(FailedItem::new(entry.original_path.clone(), err));
                }
            }
        }
        Ok(report)
    }

    /// Keeps the `max_count` newest backups; older ones are deleted once past `max_age`.
    pub fn cleanup_old_backups(&self, max_age: chrono::Duration, max_count: usize) -> usize {
        let now = Utc::now();
        let mut deleted = 0;
        for backup in self.list_backups().into_iter().skip(max_count) {
            if now.signed_duration_since(backup.created_at) <= max_age {
                continue;
            }
            match remove_backup_path(&backup.path) {
                Ok(()) => {
                    log::info!("Removed old backup {}", backup.path.display());
                    deleted += 1;
                }
                Err(err) => log::warn!("Failed to remove backup {}: {}", backup.path.display(), err),
            }
        }
        deleted
    }

    pub fn delete_backup(&self, backup: &Path) -> Result<()> {
        if !backup.starts_with(&self.root) || !backup.exists() {
            return Err(CleanerError::BackupNotFound(backup.to_path_buf()));
        }
        read_manifest(backup)?;
        remove_backup_path(backup)?;
        Ok(())
    }

    fn fresh_path(&self, label: &str, extension: Option<&str>) -> PathBuf {
        let base = format!("{}_{}", sanitize_label(label), Utc::now().format("%Y%m%d_%H%M%S"));
        let with_ext = |name: String| match extension {
            Some(ext) => format!("{}.{}", name, ext),
            None => name,
        };
        let mut candidate = self.root.join(with_ext(base.clone()));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.root.join(with_ext(format!("{}_{}", base, n)));
            n += 1;
        }
        candidate
    }
}

pub fn read_manifest(path: &Path) -> Result<(BackupManifest, BackupKind)> {
    if path.is_dir() {
        let raw = fs::read(path.join(MANIFEST_NAME))?;
        return Ok((serde_json::from_slice(&raw)?, BackupKind::Directory));
    }
    let is_zip = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
        .unwrap_or(false);
    if !is_zip {
        return Err(CleanerError::InvalidBackup {
            path: path.to_path_buf(),
            reason: "not a backup archive or directory".into(),
        });
    }
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut raw = String::new();
    archive.by_name(MANIFEST_NAME)?.read_to_string(&mut raw)?;
    Ok((serde_json::from_str(&raw)?, BackupKind::Archive))
}

fn open_source(path: &Path) -> io::Result<(File, u64, Option<DateTime<Utc>>)> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
    }
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
    Ok((file, metadata.len(), modified))
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn remove_backup_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn reserved_names() -> HashSet<String> {
    HashSet::from([MANIFEST_NAME.to_string()])
}

fn source_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into())
}

/// Appends `_<n>` before the extension until the name is free, then claims it.
fn unique_name(taken: &mut HashSet<String>, name: &str) -> String {
    let mut candidate = name.to_string();
    let (base, ext) = split_name_ext(name);
    let mut n = 1;
    while taken.contains(&candidate) {
        candidate = if ext.is_empty() {
            format!("{}_{}", base, n)
        } else {
            format!("{}_{}.{}", base, n, ext)
        };
        n += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

fn split_name_ext(name: &str) -> (String, String) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => {
            let (base, ext) = name.split_at(idx);
            (base.to_string(), ext.trim_start_matches('.').to_string())
        }
        _ => (name.to_string(), String::new()),
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "backup".into()
    } else {
        cleaned
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    let single = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
    single && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn manager(dir: &TempDir) -> BackupManager {
        BackupManager::new(dir.path().join("backups")).with_staging_dir(dir.path().join("staging"))
    }

    #[test]
    fn names_get_counter_before_extension() {
        let mut taken = reserved_names();
        assert_eq!(unique_name(&mut taken, "a.txt"), "a.txt");
        assert_eq!(unique_name(&mut taken, "a.txt"), "a_1.txt");
        assert_eq!(unique_name(&mut taken, "a.txt"), "a_2.txt");
        assert_eq!(unique_name(&mut taken, "README"), "README");
        assert_eq!(unique_name(&mut taken, "README"), "README_1");
        assert_eq!(unique_name(&mut taken, MANIFEST_NAME), "backup_manifest_1.json");
    }

    #[test]
    fn archive_round_trip_into_staging() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "src/one/report.txt", b"alpha contents");
        let b = write(dir.path(), "src/two/report.txt", &vec![42u8; 70_000]);
        let mgr = manager(&dir);

        let handle = mgr.create_backup(&[a.clone(), b.clone()], "test", true).unwrap();
        assert_eq!(handle.kind, BackupKind::Archive);
        let (manifest, _) = read_manifest(&handle.path).unwrap();
        assert_eq!(manifest.files.len(), 2);
        let names: HashSet<_> = manifest.files.iter().map(|e| e.archive_name.clone()).collect();
        assert_eq!(names.len(), 2);

        let report = mgr.restore_backup(&handle.path, false).unwrap();
        assert!(report.is_success());
        assert_eq!(report.restored.len(), 2);
        for entry in &manifest.files {
            let restored = report
                .restored
                .iter()
                .find(|p| p.ends_with(&entry.archive_name))
                .unwrap();
            assert!(restored.starts_with(mgr.staging_dir()));
            assert_eq!(fs::read(restored).unwrap(), fs::read(&entry.original_path).unwrap());
        }
    }

    #[test]
    fn directory_backup_restores_to_original_paths() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "src/cache/blob.bin", b"blob");
        let mgr = manager(&dir);

        let handle = mgr.create_backup(&[a.clone()], "dir test", false).unwrap();
        assert_eq!(handle.kind, BackupKind::Directory);
        assert!(handle.path.join(MANIFEST_NAME).is_file());

        fs::remove_dir_all(a.parent().unwrap()).unwrap();
        let report = mgr.restore_backup(&handle.path, true).unwrap();
        assert_eq!(report.restored, vec![a.clone()]);
        assert_eq!(fs::read(&a).unwrap(), b"blob");
    }

    #[test]
    fn unreadable_sources_are_skipped() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "src/a.log", b"a");
        let missing = dir.path().join("src/missing.log");
        let mgr = manager(&dir);

        let handle = mgr.create_backup(&[a.clone(), missing.clone()], "partial", true).unwrap();
        assert!(handle.contains(&a));
        assert!(!handle.contains(&missing));
        assert_eq!(handle.skipped.len(), 1);

        let err = mgr.create_backup(&[missing], "empty", true).unwrap_err();
        assert!(matches!(err, CleanerError::BackupFailed(_)));
        assert_eq!(mgr.list_backups().len(), 1);
    }

    #[test]
    fn listing_is_newest_first_and_skips_junk() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "src/a.log", b"a");
        let mgr = manager(&dir);

        let first = mgr.create_backup(&[a.clone()], "first", true).unwrap();
        let second = mgr.create_backup(&[a.clone()], "second", false).unwrap();
        fs::create_dir_all(mgr.root().join("no_manifest")).unwrap();
        fs::write(mgr.root().join("garbage.zip"), b"not a zip").unwrap();

        let listed = mgr.list_backups();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, second.path);
        assert_eq!(listed[1].path, first.path);
        assert_eq!(listed[0].file_count, 1);
    }

    fn backdate(path: &Path, days: i64) {
        let manifest_path = path.join(MANIFEST_NAME);
        let mut manifest: BackupManifest =
            serde_json::from_slice(&fs::read(&manifest_path).unwrap()).unwrap();
        manifest.created_at = Utc::now() - chrono::Duration::days(days);
        fs::write(&manifest_path, serde_json::to_vec(&manifest).unwrap()).unwrap();
    }

    #[test]
    fn cleanup_keeps_recent_count_and_young_backups() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "src/a.log", b"a");
        let mgr = manager(&dir);

        let ages = [1, 5, 60, 90, 2];
        let mut paths = Vec::new();
        for (i, age) in ages.iter().enumerate() {
            let handle = mgr.create_backup(&[a.clone()], &format!("b{}", i), false).unwrap();
            backdate(&handle.path, *age);
            paths.push(handle.path);
        }

        // Newest two (ages 1 and 2) are always kept; of the rest only those past 30 days go.
        let deleted = mgr.cleanup_old_backups(chrono::Duration::days(30), 2);
        assert_eq!(deleted, 2);
        assert!(paths[0].exists());
        assert!(paths[1].exists());
        assert!(!paths[2].exists());
        assert!(!paths[3].exists());
        assert!(paths[4].exists());
    }

    #[test]
    fn delete_backup_requires_a_managed_backup() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "src/a.log", b"a");
        let mgr = manager(&dir);
        let handle = mgr.create_backup(&[a], "x", true).unwrap();

        assert!(mgr.delete_backup(&dir.path().join("src")).is_err());
        mgr.delete_backup(&handle.path).unwrap();
        assert!(mgr.list_backups().is_empty());
    }

    #[test]
    fn plain_names_only() {
        assert!(is_plain_name("a.txt"));
        assert!(!is_plain_name("../a.txt"));
        assert!(!is_plain_name("dir/a.txt"));
        assert!(!is_plain_name(".."));
    }
}
