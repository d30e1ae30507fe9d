use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task;
use tokio_util::sync::CancellationToken;

use super::backup::{BackupHandle, BackupInfo, BackupManager, RestoreReport};
use super::browser::{self, BrowserCacheSummary, HistoryCleanResult};
use super::classifier::context::{is_within, normalize};
use super::classifier::{AppDataClassifier, AppDataRules, AppDataVerdict, Classifier};
use super::duplicate_detector::{
    hash_file, DuplicateDetector, DuplicateGroup, DuplicateScanResult, HashProgress, KeepStrategy,
};
use super::log_files::{self, LogLayout, DEFAULT_LOG_CLEAN, LOG_LABELS};
use super::paths::{AppDataKind, PathCatalog};
use super::safety_gate::SafetyGate;
use super::scanner::{ScanFilter, Scanner};
use super::statistics::ScanStatistics;
use super::telemetry::{CleanerStats, StatsSnapshot};
use super::temp_files::{TempLayout, DEFAULT_TEMP_CLEAN, LOCKED_FILES, TEMP_LABELS};
use super::types::{
    CategorizedScan, Category, Classification, CleanResult, FailedItem, FileRecord, SafetyLevel,
    ScannedFile,
};
use crate::config::Settings;
use crate::error::{CleanerError, Result};
use crate::format::format_duration;
use crate::ops::{Operation, OperationTracker};

const YIELD_EVERY: usize = 64;

/// How the pipeline disposes of an approved file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposal {
    Delete,
    /// Active logs are emptied in place, everything else is deleted.
    TruncateActiveLogs,
}

/// Facade over every scan and clean entrypoint. Construct once and share behind an `Arc`.
pub struct CleanerEngine {
    settings: Arc<Settings>,
    catalog: PathCatalog,
    classifier: Classifier,
    appdata: AppDataClassifier,
    scanner: Scanner,
    gate: SafetyGate,
    duplicates: Arc<DuplicateDetector>,
    backups: BackupManager,
    tracker: OperationTracker,
    stats: Mutex<CleanerStats>,
}

impl CleanerEngine {
    pub fn new(settings: Settings, catalog: PathCatalog, tracker: OperationTracker) -> Result<Self> {
        let rules = AppDataRules::load(settings.appdata_rules_path.as_deref())?;
        let appdata_roots: Vec<PathBuf> = catalog
            .appdata_candidates()
            .into_iter()
            .map(|(_, path)| path)
            .collect();

        Ok(Self {
            classifier: Classifier::new(),
            appdata: AppDataClassifier::new(&appdata_roots, rules),
            scanner: Scanner::new(ScanFilter::from_settings(&settings)),
            gate: SafetyGate::new(catalog.protected_dirs()),
            duplicates: Arc::new(DuplicateDetector::new(settings.hash_threads)),
            backups: BackupManager::new(settings.backup_path.clone()),
            stats: Mutex::new(CleanerStats::new()),
            settings: Arc::new(settings),
            catalog,
            tracker,
        })
    }

    pub fn with_gate(mut self, gate: SafetyGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_backup_manager(mut self, backups: BackupManager) -> Self {
        self.backups = backups;
        self
    }

    pub fn with_stats(mut self, stats: CleanerStats) -> Self {
        self.stats = Mutex::new(stats);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &PathCatalog {
        &self.catalog
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    pub fn duplicate_detector(&self) -> &DuplicateDetector {
        &self.duplicates
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn progress(&self, operation_id: &str) -> Option<Operation> {
        self.tracker.get(operation_id)
    }

    pub fn cancel(&self, operation_id: &str) -> bool {
        self.tracker.cancel(operation_id)
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats().get_snapshot()
    }

    pub fn statistics(&self, scan: &CategorizedScan) -> ScanStatistics {
        ScanStatistics::from_records(scan.categories.values().flatten().map(|f| &f.record))
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, CleanerStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, prefix: &str, name: &str) -> (String, CancellationToken) {
        let id = OperationTracker::next_id(prefix);
        self.tracker.create(&id, name, 0);
        self.tracker.start(&id, None);
        let token = self.tracker.token(&id).unwrap_or_default();
        (id, token)
    }

    fn finish_scan(&self, scan: CategorizedScan, token: &CancellationToken) -> Result<CategorizedScan> {
        if token.is_cancelled() {
            self.tracker.mark_cancelled(&scan.operation_id);
            return Err(CleanerError::Cancelled);
        }
        let total = scan.total_files();
        self.stats().finish_scan(total);
        self.tracker.update(
            &scan.operation_id,
            Some(total as u64),
            None,
            Some(&format!("Found {} files", total)),
        );
        self.tracker.complete(Some(&scan.operation_id), true);
        log::info!("Scan {} finished with {} files", scan.operation_id, total);
        Ok(scan)
    }

    fn unfiltered_scanner(&self) -> Scanner {
        self.scanner
            .with_filter(self.scanner.filter().clone().with_min_size(0))
    }

    // ---------- scans ----------

    /// Walks the configured scan paths and groups files by their general category.
    pub async fn scan_general(&self) -> Result<CategorizedScan> {
        let (id, token) = self.begin("general_scan", "Scanning configured paths");
        self.stats().start_scan();

        let records = self.scanner.scan_paths(&self.settings.scan_paths, &token).await;
        self.tracker.set_total(&id, records.len() as u64);
        let classifier = self.classifier;
        let scanned = task::spawn_blocking(move || classifier.classify_batch(records))
            .await
            .map_err(join_error)?;

        let mut scan = CategorizedScan::new(id);
        for file in scanned {
            scan.push(file.classification.category.label(), file);
        }
        self.finish_scan(scan, &token)
    }

    /// AppData files grouped by override verdict. `kinds` limits the roots scanned.
    pub async fn scan_appdata(&self, kinds: Option<&[AppDataKind]>) -> Result<CategorizedScan> {
        let (id, token) = self.begin("appdata_scan", "Scanning AppData directories");
        self.stats().start_scan();

        let roots: Vec<PathBuf> = self
            .catalog
            .appdata_roots()
            .into_iter()
            .filter(|(kind, _)| kinds.map(|k| k.contains(kind)).unwrap_or(true))
            .map(|(_, path)| path)
            .collect();
        let records = dedup_records(self.unfiltered_scanner().scan_paths(&roots, &token).await);
        self.tracker.set_total(&id, records.len() as u64);

        let appdata = self.appdata.clone();
        let tracker = self.tracker.clone();
        let op_id = id.clone();
        let assessed = task::spawn_blocking(move || {
            records
                .into_iter()
                .enumerate()
                .map(|(idx, record)| {
                    let assessment = appdata.assess(&record.path);
                    tracker.update(&op_id, Some(idx as u64 + 1), Some(&record.name), None);
                    (assessment.verdict, ScannedFile::new(record, assessment.classification))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(join_error)?;

        let mut scan = CategorizedScan::with_labels(id, &AppDataVerdict::LABELS);
        for (verdict, file) in assessed {
            scan.push(verdict.label(), file);
        }
        self.finish_scan(scan, &token)
    }

    pub async fn scan_temp(&self) -> Result<CategorizedScan> {
        let (id, token) = self.begin("temp_scan", "Scanning temporary files");
        self.stats().start_scan();

        let roots = self.catalog.temp_locations();
        let layout = TempLayout::new(
            &roots,
            &self.catalog.browser_cache_locations(),
            &self.catalog.system_temp(),
            self.settings.max_file_age_days,
        );
        let records = dedup_records(self.unfiltered_scanner().scan_paths(&roots, &token).await);
        self.tracker.set_total(&id, records.len() as u64);

        let classifier = self.classifier;
        let labelled = task::spawn_blocking(move || {
            records
                .into_iter()
                .filter(|record| layout.is_candidate(record))
                .map(|record| {
                    let classification = layout.hint(&record, classify_path(&classifier, &record.path));
                    let label = layout.label(&record, SafetyGate::is_in_use(&record.path));
                    (label, ScannedFile::new(record, classification))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(join_error)?;

        let mut scan = CategorizedScan::with_labels(id, &TEMP_LABELS);
        for (label, file) in labelled {
            scan.push(label, file);
        }
        self.finish_scan(scan, &token)
    }

    /// Cache files per browser id. `browsers` limits the ids considered.
    pub async fn scan_browser_cache(&self, browsers: Option<&[String]>) -> Result<CategorizedScan> {
        let (id, token) = self.begin("browser_cache_scan", "Scanning browser caches");
        self.stats().start_scan();

        let scanner = self.unfiltered_scanner();
        let mut scan = CategorizedScan::new(id);
        for install in self.catalog.browsers() {
            if !wanted(browsers, &install.id) {
                continue;
            }
            scan.categories.entry(install.id.clone()).or_default();
            let records = scanner.scan_paths(&install.cache_dirs(), &token).await;
            for record in records {
                let classification =
                    classify_path(&self.classifier, &record.path).with_location_hint(Category::Cache);
                scan.push(&install.id, ScannedFile::new(record, classification));
            }
        }
        self.finish_scan(scan, &token)
    }

    /// Cache size per installed browser.
    pub fn browser_analysis(&self) -> Vec<BrowserCacheSummary> {
        self.catalog.browsers().iter().map(browser::analyze_cache).collect()
    }

    pub async fn scan_logs(&self) -> Result<CategorizedScan> {
        let (id, token) = self.begin("log_scan", "Scanning log files");
        self.stats().start_scan();

        let roots = self.catalog.log_locations();
        let layout = LogLayout::new(self.catalog.system_root(), self.settings.max_file_age_days);
        let records = dedup_records(self.unfiltered_scanner().scan_paths(&roots, &token).await);
        self.tracker.set_total(&id, records.len() as u64);

        let classifier = self.classifier;
        let labelled = task::spawn_blocking(move || {
            records
                .into_iter()
                .filter(|record| layout.is_candidate(record))
                .map(|record| {
                    let classification = layout.hint(classify_path(&classifier, &record.path));
                    (layout.label(&record), ScannedFile::new(record, classification))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(join_error)?;

        let mut scan = CategorizedScan::with_labels(id, &LOG_LABELS);
        for (label, file) in labelled {
            scan.push(label, file);
        }
        self.finish_scan(scan, &token)
    }

    /// Duplicate groups under `roots`, or under the configured scan paths when empty.
    pub async fn scan_duplicates(&self, roots: &[PathBuf]) -> Result<DuplicateScanResult> {
        let (id, token) = self.begin("duplicate_scan", "Finding duplicate files");
        self.stats().start_scan();

        let roots = if roots.is_empty() {
            self.settings.scan_paths.clone()
        } else {
            roots.to_vec()
        };
        let min_size = self.settings.duplicate_min_size;
        let scanner = self
            .scanner
            .with_filter(self.scanner.filter().clone().with_min_size(min_size));
        let records = scanner.scan_paths(&roots, &token).await;
        let analyzed = records.len();

        let tracker = self.tracker.clone();
        let op_id = id.clone();
        let progress: HashProgress = Arc::new(move |done, total| {
            if done == 1 {
                tracker.set_total(&op_id, total as u64);
            }
            tracker.update(&op_id, Some(done as u64), None, Some("Hashing candidates"));
        });

        let outcome = self
            .duplicates
            .find_duplicates(records, min_size, token.clone(), Some(progress))
            .await;
        match outcome {
            Ok(mut result) => {
                result.operation_id = id.clone();
                self.stats().finish_scan(analyzed);
                self.tracker.complete(Some(&id), true);
                log::info!(
                    "Duplicate scan {} found {} groups wasting {} bytes",
                    id,
                    result.groups.len(),
                    result.wasted_space()
                );
                Ok(result)
            }
            Err(CleanerError::Cancelled) => {
                self.tracker.mark_cancelled(&id);
                Err(CleanerError::Cancelled)
            }
            Err(err) => {
                self.tracker.fail(&id, &err.to_string());
                Err(err)
            }
        }
    }

    // ---------- cleans ----------

    /// Cleans the given labels of any categorized scan.
    pub async fn clean_categories(
        &self,
        scan: &CategorizedScan,
        labels: &[&str],
        backup: bool,
    ) -> Result<CleanResult> {
        let files = scan.select(labels);
        self.clean_files("clean", "Cleaning files", files, Vec::new(), backup, Disposal::Delete)
            .await
    }

    /// Defaults to old temp files and browser cache. In-use files are never selected.
    pub async fn clean_temp(
        &self,
        scan: &CategorizedScan,
        labels: Option<&[&str]>,
        backup: bool,
    ) -> Result<CleanResult> {
        let labels: Vec<&str> = labels
            .unwrap_or(&DEFAULT_TEMP_CLEAN)
            .iter()
            .copied()
            .filter(|label| *label != LOCKED_FILES)
            .collect();
        let files = scan.select(&labels);
        self.clean_files("temp_clean", "Cleaning temporary files", files, Vec::new(), backup, Disposal::Delete)
            .await
    }

    /// Defaults to old and large logs. Active logs are truncated instead of deleted.
    pub async fn clean_logs(
        &self,
        scan: &CategorizedScan,
        labels: Option<&[&str]>,
        backup: bool,
    ) -> Result<CleanResult> {
        let files = scan.select(labels.unwrap_or(&DEFAULT_LOG_CLEAN));
        self.clean_files(
            "log_clean",
            "Cleaning log files",
            files,
            Vec::new(),
            backup,
            Disposal::TruncateActiveLogs,
        )
        .await
    }

    /// Only `safe_to_clean` AppData files are ever removed.
    pub async fn clean_appdata(&self, scan: &CategorizedScan, backup: bool) -> Result<CleanResult> {
        let files = scan.select(&[AppDataVerdict::SafeToClean.label()]);
        self.clean_files("appdata_clean", "Cleaning AppData files", files, Vec::new(), backup, Disposal::Delete)
            .await
    }

    pub async fn clean_browser_cache(&self, scan: &CategorizedScan, backup: bool) -> Result<CleanResult> {
        let labels: Vec<&str> = scan.categories.keys().map(String::as_str).collect();
        let files = scan.select(&labels);
        self.clean_files(
            "browser_cache_clean",
            "Cleaning browser caches",
            files,
            Vec::new(),
            backup,
            Disposal::Delete,
        )
        .await
    }

    /// Cleans an explicit path list. Each path is stat'ed and classified afresh.
    pub async fn clean_paths(&self, paths: &[PathBuf], backup: bool) -> Result<CleanResult> {
        let mut files = Vec::new();
        let mut failed = Vec::new();
        for path in paths {
            match fs::symlink_metadata(path) {
                Ok(metadata) if metadata.is_file() => match FileRecord::from_metadata(path, &metadata) {
                    Some(record) => {
                        let classification = self.classifier.classify(path, Some(&metadata));
                        files.push(ScannedFile::new(record, classification));
                    }
                    None => failed.push(FailedItem::new(path.clone(), "incomplete metadata")),
                },
                Ok(_) => failed.push(FailedItem::new(path.clone(), "not a regular file")),
                Err(err) => failed.push(FailedItem::new(path.clone(), err)),
            }
        }
        self.clean_files("path_clean", "Cleaning selected files", files, failed, backup, Disposal::Delete)
            .await
    }

    /// Keeps one member per group and removes the rest. A member whose content no longer
    /// matches the group hash, or a group whose kept copy is gone, is left alone.
    pub async fn remove_duplicates(
        &self,
        groups: &[DuplicateGroup],
        strategy: KeepStrategy,
        backup: bool,
    ) -> Result<CleanResult> {
        let plan: Vec<(FileRecord, Vec<FileRecord>, String)> = groups
            .iter()
            .filter_map(|group| {
                let selection = group.select(strategy)?;
                Some((
                    selection.keep.clone(),
                    selection.remove.into_iter().cloned().collect(),
                    group.hash.clone(),
                ))
            })
            .collect();

        let classifier = self.classifier;
        let (files, failed) = task::spawn_blocking(move || verify_duplicate_plan(&classifier, plan))
            .await
            .map_err(join_error)?;
        let planned: Vec<PathBuf> = files.iter().map(|f| f.path().to_path_buf()).collect();

        let result = self
            .clean_files(
                "duplicate_clean",
                "Removing duplicate files",
                files,
                failed,
                backup,
                Disposal::Delete,
            )
            .await?;

        let cache = self.duplicates.hash_cache();
        for path in planned.iter().filter(|p| fs::symlink_metadata(p).is_err()) {
            cache.invalidate(path);
        }
        Ok(result)
    }

    /// Trims history stores of the selected browsers to the last `days_to_keep` days.
    pub async fn clean_browser_history(
        &self,
        browsers: Option<&[String]>,
        days_to_keep: u32,
    ) -> Result<HistoryCleanResult> {
        let (id, token) = self.begin("history_clean", "Cleaning browser history");
        let mut result = HistoryCleanResult {
            operation_id: id.clone(),
            dry_run: self.settings.dry_run,
            ..Default::default()
        };

        let installs: Vec<_> = self
            .catalog
            .browsers()
            .into_iter()
            .filter(|install| wanted(browsers, &install.id))
            .collect();
        let stores: Vec<PathBuf> = installs.iter().flat_map(|i| i.history_stores()).collect();
        self.tracker.set_total(&id, stores.len() as u64);

        if let Err(err) = self.run_preflight(&stores).await {
            self.tracker.fail(&id, &err.to_string());
            return Err(err);
        }

        let approved: Vec<PathBuf> = stores
            .iter()
            .filter(|store| match self.gate.check_directory(store) {
                Ok(()) => true,
                Err(refusal) => {
                    result.errors.push(format!("{}: {}", store.display(), refusal));
                    false
                }
            })
            .cloned()
            .collect();

        if result.dry_run {
            result.browsers_processed = installs.iter().map(|i| i.id.clone()).collect();
            self.tracker.complete(Some(&id), true);
            return Ok(result);
        }

        if self.settings.backup_enabled && !approved.is_empty() {
            match self.backup(&approved, "browser_history").await {
                Ok(handle) => result.backup = Some(handle.path),
                Err(err) if self.settings.backup_required => {
                    self.tracker.fail(&id, &err.to_string());
                    return Err(err);
                }
                Err(err) => log::warn!("Continuing without history backup: {}", err),
            }
        }

        let now = Utc::now();
        let mut done = 0u64;
        for install in &installs {
            if token.is_cancelled() {
                self.tracker.mark_cancelled(&id);
                return Ok(result);
            }
            let cutoff = browser::history_cutoff(install.kind, now, days_to_keep);
            let mut processed = false;
            for store in install.history_stores() {
                if !approved.contains(&store) {
                    continue;
                }
                done += 1;
                let kind = install.kind;
                let target = store.clone();
                let outcome = task::spawn_blocking(move || browser::clean_history_store(&target, kind, cutoff))
                    .await
                    .map_err(join_error)
                    .and_then(|r| r);
                match outcome {
                    Ok(deleted) => {
                        result.entries_deleted += deleted;
                        processed = true;
                        self.tracker.update(&id, Some(done), Some(&install.name), None);
                    }
                    Err(err) => {
                        log::warn!("History cleanup failed for {}: {}", store.display(), err);
                        self.tracker
                            .record_failure(&id, &store.to_string_lossy(), &err.to_string());
                        result.errors.push(format!("{}: {}", install.id, err));
                    }
                }
            }
            if processed {
                result.browsers_processed.push(install.id.clone());
            }
        }

        self.tracker.complete(Some(&id), true);
        Ok(result)
    }

    // ---------- backups ----------

    pub fn list_backups(&self) -> Vec<BackupInfo> {
        self.backups.list_backups()
    }

    pub fn restore_backup(&self, backup: &Path, to_original: bool) -> Result<RestoreReport> {
        self.backups.restore_backup(backup, to_original)
    }

    pub fn delete_backup(&self, backup: &Path) -> Result<()> {
        self.backups.delete_backup(backup)
    }

    /// Applies the configured retention: newest `backup_max_count` kept, older ones expire
    /// after `backup_max_age_days`.
    pub fn cleanup_backups(&self) -> usize {
        self.backups.cleanup_old_backups(
            chrono::Duration::days(i64::from(self.settings.backup_max_age_days)),
            self.settings.backup_max_count,
        )
    }

    async fn backup(&self, files: &[PathBuf], label: &str) -> Result<BackupHandle> {
        let backups = self.backups.clone();
        let files = files.to_vec();
        let label = label.to_string();
        let compress = self.settings.compress_backups;
        task::spawn_blocking(move || backups.create_backup(&files, &label, compress))
            .await
            .map_err(join_error)?
    }

    // ---------- pipeline ----------

    async fn run_preflight(&self, paths: &[PathBuf]) -> Result<Vec<String>> {
        let report = self.gate.preflight(paths).await;
        if report.can_proceed {
            return Ok(report.warnings);
        }
        let summary = report.warnings.join("; ");
        if self.settings.safe_mode {
            log::error!("Preflight failed, aborting: {}", summary);
            return Err(CleanerError::Preflight(summary));
        }
        log::warn!("Preflight failed, continuing outside safe mode: {}", summary);
        Ok(report.warnings)
    }

    /// Preflight, gate filter, backup, then per-file re-check and disposal.
    async fn clean_files(
        &self,
        prefix: &str,
        name: &str,
        files: Vec<ScannedFile>,
        pre_failed: Vec<FailedItem>,
        backup: bool,
        disposal: Disposal,
    ) -> Result<CleanResult> {
        let (id, token) = self.begin(prefix, name);
        self.tracker.set_total(&id, files.len() as u64);
        let mut result = CleanResult {
            operation_id: id.clone(),
            dry_run: self.settings.dry_run,
            failed_deletions: pre_failed,
            ..Default::default()
        };

        let paths: Vec<PathBuf> = files.iter().map(|f| f.path().to_path_buf()).collect();
        match self.run_preflight(&paths).await {
            Ok(warnings) => result.warnings.extend(warnings),
            Err(err) => {
                self.tracker.fail(&id, &err.to_string());
                return Err(err);
            }
        }

        let mut approved = Vec::with_capacity(files.len());
        for file in files {
            match self.gate.check(file.path(), &file.classification) {
                Ok(()) => approved.push(file),
                Err(refusal) => {
                    self.tracker
                        .record_failure(&id, &file.path().to_string_lossy(), &refusal.to_string());
                    result.failed_deletions.push(FailedItem::new(file.path(), refusal));
                }
            }
        }

        let now = Utc::now();
        let truncates = |file: &ScannedFile| {
            disposal == Disposal::TruncateActiveLogs && log_files::is_active_log(&file.record, now)
        };

        if result.dry_run {
            for file in &approved {
                if truncates(file) {
                    result.files_truncated += 1;
                } else {
                    result.files_deleted += 1;
                }
                result.bytes_freed += file.record.size;
            }
            self.tracker.complete(Some(&id), true);
            log::info!("Dry run {}: {} files would be cleaned", id, approved.len());
            return Ok(result);
        }

        if backup && self.settings.backup_enabled && !approved.is_empty() {
            let sources: Vec<PathBuf> = approved.iter().map(|f| f.path().to_path_buf()).collect();
            match self.backup(&sources, prefix).await {
                Ok(handle) => {
                    if self.settings.backup_required {
                        let (kept, missing): (Vec<_>, Vec<_>) =
                            approved.into_iter().partition(|f| handle.contains(f.path()));
                        approved = kept;
                        for file in missing {
                            result
                                .failed_deletions
                                .push(FailedItem::new(file.path(), "not included in backup"));
                        }
                    } else if !handle.skipped.is_empty() {
                        result.warnings.push(format!(
                            "{} files could not be backed up",
                            handle.skipped.len()
                        ));
                    }
                    result.backup = Some(handle.path);
                }
                Err(err) if self.settings.backup_required => {
                    log::error!("Backup failed, nothing was deleted: {}", err);
                    self.tracker.fail(&id, &err.to_string());
                    return Err(CleanerError::BackupFailed(err.to_string()));
                }
                Err(err) => {
                    log::warn!("Backup failed, continuing without one: {}", err);
                    result.warnings.push(format!("Backup failed: {}", err));
                }
            }
        }

        let mut touched_dirs = BTreeSet::new();
        for (idx, file) in approved.iter().enumerate() {
            if token.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let path = file.path();

            if let Err(refusal) = self.gate.check(path, &file.classification) {
                self.tracker
                    .record_failure(&id, &path.to_string_lossy(), &refusal.to_string());
                result.failed_deletions.push(FailedItem::new(path, refusal));
                continue;
            }

            let size = fs::symlink_metadata(path)
                .map(|m| m.len())
                .unwrap_or(file.record.size);
            let truncate = truncates(file);
            let outcome = if truncate { truncate_file(path) } else { fs::remove_file(path) };

            match outcome {
                Ok(()) => {
                    result.bytes_freed += size;
                    if truncate {
                        result.files_truncated += 1;
                    } else {
                        result.files_deleted += 1;
                        touched_dirs.insert(file.record.parent_dir.clone());
                    }
                    let parent = file
                        .record
                        .parent_dir
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    self.tracker.update(
                        &id,
                        Some(idx as u64 + 1),
                        Some(&file.record.name),
                        Some(&format!("Cleaned from {}", parent)),
                    );
                }
                Err(err) => {
                    log::warn!("Failed to clean {}: {}", path.display(), err);
                    self.tracker
                        .record_failure(&id, &path.to_string_lossy(), &err.to_string());
                    result.failed_deletions.push(FailedItem::new(path, err));
                }
            }

            if (idx + 1) % YIELD_EVERY == 0 {
                task::yield_now().await;
            }
        }

        result.directories_removed = self.remove_empty_dirs(touched_dirs);

        self.stats().record_clean(
            result.succeeded(),
            result.bytes_freed,
            result.failed_deletions.len(),
        );
        if result.cancelled {
            self.tracker.mark_cancelled(&id);
        } else {
            let success = result.failed_deletions.is_empty() || result.succeeded() > 0;
            self.tracker.complete(Some(&id), success);
        }
        let elapsed = self
            .tracker
            .get(&id)
            .and_then(|op| op.elapsed_time)
            .unwrap_or_default();
        log::info!(
            "{} finished in {}: {} deleted, {} truncated, {} freed, {} failed",
            id,
            format_duration(elapsed),
            result.files_deleted,
            result.files_truncated,
            result.bytes_freed_formatted(),
            result.failed_deletions.len()
        );
        Ok(result)
    }

    /// Removes directories left empty by a clean, deepest first, when their name marks
    /// them as disposable. A removal puts the parent up for the same check, so nested
    /// cache trees collapse up to the first kept directory. Scan roots are never removed.
    fn remove_empty_dirs(&self, dirs: BTreeSet<PathBuf>) -> usize {
        let roots: Vec<String> = self
            .catalog
            .temp_locations()
            .into_iter()
            .chain(self.settings.scan_paths.iter().cloned())
            .chain(self.catalog.appdata_candidates().into_iter().map(|(_, p)| p))
            .map(|p| normalize(&p.to_string_lossy()).trim_end_matches('/').to_string())
            .collect();

        let mut pending: BTreeSet<(Reverse<usize>, PathBuf)> = dirs
            .into_iter()
            .map(|d| (Reverse(d.components().count()), d))
            .collect();

        let mut removed = 0;
        while let Some((Reverse(depth), dir)) = pending.pop_first() {
            let lower = normalize(&dir.to_string_lossy());
            let lower = lower.trim_end_matches('/');
            if roots.iter().any(|root| root == lower || is_within(root, lower)) {
                continue;
            }
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !self.appdata.rules().is_safe_directory_name(&name) {
                continue;
            }
            if self.gate.check_directory(&dir).is_err() {
                continue;
            }
            let empty = fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty && fs::remove_dir(&dir).is_ok() {
                log::debug!("Removed empty directory {}", dir.display());
                removed += 1;
                if let Some(parent) = dir.parent() {
                    pending.insert((Reverse(depth.saturating_sub(1)), parent.to_path_buf()));
                }
            }
        }
        removed
    }
}

fn classify_path(classifier: &Classifier, path: &Path) -> Classification {
    let metadata = fs::symlink_metadata(path).ok();
    classifier.classify(path, metadata.as_ref())
}

/// Confirmed copies are disposable unless the path itself says otherwise.
fn duplicate_classification(base: Classification) -> Classification {
    match base.category {
        Category::CriticalSystem | Category::PotentiallyDangerous | Category::Unknown => base,
        _ if base.safety > SafetyLevel::Moderate => base,
        _ => Classification::new(Category::SafeToDelete, SafetyLevel::Safe),
    }
}

fn verify_duplicate_plan(
    classifier: &Classifier,
    plan: Vec<(FileRecord, Vec<FileRecord>, String)>,
) -> (Vec<ScannedFile>, Vec<FailedItem>) {
    let mut files = Vec::new();
    let mut failed = Vec::new();
    for (keep, remove, hash) in plan {
        if hash_file(&keep.path).ok().as_deref() != Some(hash.as_str()) {
            for record in remove {
                failed.push(FailedItem::new(record.path, "kept copy is missing or changed"));
            }
            continue;
        }
        for record in remove {
            match hash_file(&record.path) {
                Ok(current) if current == hash => {
                    let classification = duplicate_classification(classify_path(classifier, &record.path));
                    files.push(ScannedFile::new(record, classification));
                }
                Ok(_) => failed.push(FailedItem::new(record.path, "content changed since scan")),
                Err(err) => failed.push(FailedItem::new(record.path, err)),
            }
        }
    }
    (files, failed)
}

/// Nested roots would otherwise report the same file twice.
fn dedup_records(mut records: Vec<FileRecord>) -> Vec<FileRecord> {
    let mut seen = HashSet::new();
    records.retain(|record| seen.insert(record.path.clone()));
    records
}

fn truncate_file(path: &Path) -> io::Result<()> {
    OpenOptions::new().write(true).open(path)?.set_len(0)
}

fn wanted(filter: Option<&[String]>, id: &str) -> bool {
    filter
        .map(|ids| ids.iter().any(|wanted| wanted.eq_ignore_ascii_case(id)))
        .unwrap_or(true)
}

fn join_error(err: task::JoinError) -> CleanerError {
    CleanerError::Io(io::Error::new(io::ErrorKind::Other, err.to_string()))
}
