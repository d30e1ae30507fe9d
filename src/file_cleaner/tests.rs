#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::config::Settings;
    use crate::error::CleanerError;
    use crate::ops::{Operation, OperationStatus, OperationTracker};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Profile {
        _dir: TempDir,
        root: PathBuf,
        user: PathBuf,
        catalog: PathCatalog,
    }

    impl Profile {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().to_path_buf();
            let user = root.join("Users").join("ann");
            let system = root.join("Windows");
            fs::create_dir_all(user.join("AppData/Local/Temp")).unwrap();
            fs::create_dir_all(user.join("AppData/Roaming")).unwrap();
            fs::create_dir_all(system.join("Temp")).unwrap();
            let catalog = PathCatalog::for_profile(&user, &system);
            Profile {
                _dir: dir,
                root,
                user,
                catalog,
            }
        }

        fn local(&self, relative: &str) -> PathBuf {
            self.catalog.local_appdata().join(relative)
        }

        fn roaming(&self, relative: &str) -> PathBuf {
            self.catalog.roaming_appdata().join(relative)
        }

        fn settings(&self) -> Settings {
            Settings {
                scan_paths: vec![self.user.clone()],
                backup_path: self.root.join("backups"),
                hash_threads: 2,
                ..Settings::default()
            }
        }

        fn engine_with(&self, settings: Settings) -> CleanerEngine {
            let gate = SafetyGate::new(self.catalog.protected_dirs()).with_process_check(false);
            CleanerEngine::new(settings, self.catalog.clone(), OperationTracker::new())
                .unwrap()
                .with_gate(gate)
        }

        fn engine(&self) -> CleanerEngine {
            self.engine_with(self.settings())
        }
    }

    fn write_aged(path: &Path, bytes: &[u8], days: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(days * 86_400))
            .unwrap();
    }

    fn names(files: &[ScannedFile]) -> Vec<String> {
        let mut names: Vec<_> = files.iter().map(|f| f.record.name.clone()).collect();
        names.sort();
        names
    }

    // Temp cleaner

    #[tokio::test]
    async fn test_temp_scan_labels_candidates() {
        let profile = Profile::new();
        write_aged(&profile.local("Temp/old_report.dat"), b"stale", 40);
        write_aged(&profile.local("Temp/recent.tmp"), b"scratch", 2);
        write_aged(&profile.local("Temp/notes.txt"), b"keep me", 2);
        write_aged(&profile.local("Temp/setup.exe"), b"MZ", 40);
        write_aged(&profile.catalog.system_temp().join("wu.tmp"), b"sys", 40);

        let scan = profile.engine().scan_temp().await.unwrap();

        assert_eq!(
            names(scan.files("old_temp_files")),
            vec!["old_report.dat", "recent.tmp"]
        );
        assert_eq!(names(scan.files("system_temp")), vec!["wu.tmp"]);
        assert!(scan.files("locked_files").is_empty());
        assert_eq!(scan.categories.len(), 5);
        assert!(scan.files("old_temp_files").iter().all(|f| f.cleanable));
    }

    #[tokio::test]
    async fn test_temp_clean_backs_up_then_restores() {
        let profile = Profile::new();
        let stale = profile.local("Temp/old_report.dat");
        let scratch = profile.local("Temp/recent.tmp");
        write_aged(&stale, b"stale", 40);
        write_aged(&scratch, b"scratch", 2);

        let engine = profile.engine();
        let scan = engine.scan_temp().await.unwrap();
        let result = engine.clean_temp(&scan, None, true).await.unwrap();

        assert_eq!(result.files_deleted, 2);
        assert_eq!(result.bytes_freed, 12);
        assert!(result.failed_deletions.is_empty());
        assert!(!stale.exists() && !scratch.exists());
        // the temp root itself is never pruned
        assert!(profile.local("Temp").is_dir());

        let backup = result.backup.expect("backup path");
        assert_eq!(engine.list_backups().len(), 1);
        let report = engine.restore_backup(&backup, true).unwrap();
        assert!(report.is_success());
        assert_eq!(fs::read(&stale).unwrap(), b"stale");
        assert_eq!(fs::read(&scratch).unwrap(), b"scratch");
    }

    #[tokio::test]
    async fn test_system_temp_is_refused_by_gate() {
        let profile = Profile::new();
        let system_file = profile.catalog.system_temp().join("wu.tmp");
        write_aged(&system_file, b"sys", 40);

        let engine = profile.engine();
        let scan = engine.scan_temp().await.unwrap();
        let result = engine
            .clean_temp(&scan, Some(&["system_temp"][..]), false)
            .await
            .unwrap();

        assert_eq!(result.files_deleted, 0);
        assert_eq!(result.failed_deletions.len(), 1);
        assert!(result.failed_deletions[0].reason.contains("protected"));
        assert!(system_file.exists());
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_deleting() {
        let profile = Profile::new();
        let stale = profile.local("Temp/old_report.dat");
        write_aged(&stale, b"stale", 40);

        let engine = profile.engine_with(Settings {
            dry_run: true,
            ..profile.settings()
        });
        let scan = engine.scan_temp().await.unwrap();
        let result = engine.clean_temp(&scan, None, true).await.unwrap();

        assert!(result.dry_run);
        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.bytes_freed, 5);
        assert!(result.backup.is_none());
        assert!(stale.exists());
        assert!(engine.list_backups().is_empty());
    }

    // Backup policy

    #[tokio::test]
    async fn test_required_backup_failure_aborts_clean() {
        let profile = Profile::new();
        let stale = profile.local("Temp/old_report.dat");
        write_aged(&stale, b"stale", 40);
        let blocked = profile.root.join("not_a_dir");
        fs::write(&blocked, b"file in the way").unwrap();

        let engine = profile.engine_with(Settings {
            backup_path: blocked,
            ..profile.settings()
        });
        let scan = engine.scan_temp().await.unwrap();
        let err = engine.clean_temp(&scan, None, true).await.unwrap_err();

        assert!(matches!(err, CleanerError::BackupFailed(_)));
        assert!(stale.exists());
        assert!(engine
            .tracker()
            .all()
            .iter()
            .any(|op| op.status == OperationStatus::Failed));
    }

    #[tokio::test]
    async fn test_optional_backup_failure_only_warns() {
        let profile = Profile::new();
        let stale = profile.local("Temp/old_report.dat");
        write_aged(&stale, b"stale", 40);
        let blocked = profile.root.join("not_a_dir");
        fs::write(&blocked, b"file in the way").unwrap();

        let engine = profile.engine_with(Settings {
            backup_path: blocked,
            backup_required: false,
            ..profile.settings()
        });
        let scan = engine.scan_temp().await.unwrap();
        let result = engine.clean_temp(&scan, None, true).await.unwrap();

        assert_eq!(result.files_deleted, 1);
        assert!(result.backup.is_none());
        assert!(result.warnings.iter().any(|w| w.starts_with("Backup failed")));
        assert!(!stale.exists());
    }

    // AppData cleaner

    #[tokio::test]
    async fn test_appdata_clean_only_touches_safe_verdicts() {
        let profile = Profile::new();
        let blob = profile.local("Acme/Cache/blob.bin");
        let settings = profile.local("Acme/profile.json");
        let credentials = profile.roaming("Microsoft/Credentials/token.tmp");
        write_aged(&blob, b"cached", 40);
        write_aged(&settings, b"{}", 40);
        write_aged(&credentials, b"secret", 40);

        let engine = profile.engine();
        let scan = engine.scan_appdata(None).await.unwrap();

        assert_eq!(names(scan.files("safe_to_clean")), vec!["blob.bin"]);
        assert_eq!(names(scan.files("preserve")), vec!["token.tmp"]);
        assert_eq!(scan.total_files(), 3);

        let result = engine.clean_appdata(&scan, false).await.unwrap();
        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.directories_removed, 1);
        assert!(!blob.exists());
        assert!(!profile.local("Acme/Cache").exists());
        assert!(settings.exists());
        assert!(credentials.exists());
    }

    #[tokio::test]
    async fn test_appdata_scan_respects_kind_filter() {
        let profile = Profile::new();
        write_aged(&profile.local("Acme/Cache/blob.bin"), b"cached", 40);
        write_aged(&profile.roaming("Acme/Cache/blob2.bin"), b"cached", 40);

        let scan = profile
            .engine()
            .scan_appdata(Some(&[AppDataKind::Roaming][..]))
            .await
            .unwrap();
        assert_eq!(names(scan.files("safe_to_clean")), vec!["blob2.bin"]);
    }

    // Log cleaner

    #[tokio::test]
    async fn test_log_clean_truncates_active_logs() {
        let profile = Profile::new();
        let logs = profile.roaming("Acme/logs");
        write_aged(&logs.join("old.log"), b"old lines", 40);
        write_aged(&logs.join("current.log"), b"live lines", 40);
        write_aged(&logs.join("crash-error.log"), b"stack", 40);

        let engine = profile.engine();
        let scan = engine.scan_logs().await.unwrap();
        assert_eq!(names(scan.files("old_logs")), vec!["current.log", "old.log"]);
        assert_eq!(names(scan.files("error_logs")), vec!["crash-error.log"]);

        let result = engine.clean_logs(&scan, None, false).await.unwrap();
        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.files_truncated, 1);
        assert!(!logs.join("old.log").exists());
        assert_eq!(fs::metadata(logs.join("current.log")).unwrap().len(), 0);
        assert!(logs.join("crash-error.log").exists());
    }

    // Duplicates

    #[tokio::test]
    async fn test_duplicate_removal_keeps_newest_copy() {
        let profile = Profile::new();
        let downloads = profile.user.join("Downloads");
        let content = vec![7u8; 4096];
        write_aged(&downloads.join("photo (1).jpg"), &content, 5);
        write_aged(&downloads.join("photo.jpg"), &content, 3);
        write_aged(&downloads.join("other.jpg"), &vec![9u8; 4096], 3);

        let engine = profile.engine();
        let scan = engine.scan_duplicates(&[downloads.clone()]).await.unwrap();
        assert_eq!(scan.groups.len(), 1);
        assert_eq!(scan.total_duplicates(), 1);
        assert_eq!(scan.wasted_space(), 4096);

        let result = engine
            .remove_duplicates(&scan.groups, KeepStrategy::Newest, false)
            .await
            .unwrap();
        assert_eq!(result.files_deleted, 1);
        assert!(downloads.join("photo.jpg").exists());
        assert!(!downloads.join("photo (1).jpg").exists());
        assert!(downloads.join("other.jpg").exists());
    }

    #[tokio::test]
    async fn test_duplicate_changed_since_scan_is_kept() {
        let profile = Profile::new();
        let downloads = profile.user.join("Downloads");
        let content = vec![7u8; 4096];
        write_aged(&downloads.join("a.bin"), &content, 5);
        write_aged(&downloads.join("b.bin"), &content, 3);

        let engine = profile.engine();
        let scan = engine.scan_duplicates(&[downloads.clone()]).await.unwrap();
        fs::write(downloads.join("a.bin"), vec![1u8; 4096]).unwrap();

        let result = engine
            .remove_duplicates(&scan.groups, KeepStrategy::Newest, false)
            .await
            .unwrap();
        assert_eq!(result.files_deleted, 0);
        assert_eq!(result.failed_deletions.len(), 1);
        assert_eq!(result.failed_deletions[0].reason, "content changed since scan");
        assert!(downloads.join("a.bin").exists());
    }

    #[tokio::test]
    async fn test_duplicate_group_without_kept_copy_is_skipped() {
        let profile = Profile::new();
        let downloads = profile.user.join("Downloads");
        let content = vec![7u8; 4096];
        write_aged(&downloads.join("a.bin"), &content, 5);
        write_aged(&downloads.join("b.bin"), &content, 3);

        let engine = profile.engine();
        let scan = engine.scan_duplicates(&[downloads.clone()]).await.unwrap();
        fs::remove_file(downloads.join("b.bin")).unwrap();

        let result = engine
            .remove_duplicates(&scan.groups, KeepStrategy::Newest, false)
            .await
            .unwrap();
        assert_eq!(result.files_deleted, 0);
        assert_eq!(result.failed_deletions[0].reason, "kept copy is missing or changed");
        assert!(downloads.join("a.bin").exists());
    }

    // General scan, paths, progress

    #[tokio::test]
    async fn test_general_scan_groups_by_category() {
        let profile = Profile::new();
        let docs = profile.user.join("Documents");
        write_aged(&docs.join("letter.odt"), &vec![1u8; 2 * 1024 * 1024], 10);
        write_aged(&docs.join("draft.tmp"), &vec![1u8; 2 * 1024 * 1024], 10);
        write_aged(&docs.join("tiny.tmp"), b"below minimum size", 10);

        let scan = profile.engine().scan_general().await.unwrap();
        assert_eq!(names(scan.files("user_data")), vec!["letter.odt"]);
        assert_eq!(names(scan.files("temp")), vec!["draft.tmp"]);
        assert_eq!(scan.total_files(), 2);
    }

    #[tokio::test]
    async fn test_clean_paths_refuses_user_data() {
        let profile = Profile::new();
        let docs = profile.user.join("Documents");
        let letter = docs.join("letter.odt");
        let draft = docs.join("draft.tmp");
        write_aged(&letter, b"dear", 10);
        write_aged(&draft, b"scratch", 10);

        let result = profile
            .engine()
            .clean_paths(&[letter.clone(), draft.clone(), docs.join("missing.tmp")], false)
            .await
            .unwrap();

        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.failed_deletions.len(), 2);
        assert!(letter.exists());
        assert!(!draft.exists());
    }

    #[tokio::test]
    async fn test_tracker_and_stats_follow_a_clean() {
        let profile = Profile::new();
        write_aged(&profile.local("Temp/a.tmp"), b"a", 40);
        write_aged(&profile.local("Temp/b.tmp"), b"b", 40);

        let engine = profile.engine();
        let scan = engine.scan_temp().await.unwrap();
        let result = engine.clean_temp(&scan, None, false).await.unwrap();

        let scan_op = engine.progress(&scan.operation_id).unwrap();
        assert_eq!(scan_op.status, OperationStatus::Completed);

        let op = engine.progress(&result.operation_id).unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.total, 2);
        assert_eq!(op.percentage, 100.0);
        assert!(op.end_time.is_some());

        let stats = engine.stats_snapshot();
        assert_eq!(stats.total_scans, 1);
        assert_eq!(stats.total_cleans, 1);
        assert_eq!(stats.files_cleaned, 2);
        assert_eq!(stats.bytes_freed, 2);
    }

    #[tokio::test]
    async fn test_statistics_summarize_scan() {
        let profile = Profile::new();
        write_aged(&profile.local("Temp/a.tmp"), &vec![0u8; 300], 40);
        write_aged(&profile.local("Temp/b.bak"), &vec![0u8; 100], 40);

        let engine = profile.engine();
        let scan = engine.scan_temp().await.unwrap();
        let stats = engine.statistics(&scan);

        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_size, 400);
        assert_eq!(stats.largest_files[0].size, 300);
    }

    // Preflight and cancellation

    #[tokio::test]
    async fn test_failed_preflight_aborts_in_safe_mode() {
        let profile = Profile::new();
        let stale = profile.local("Temp/old_report.dat");
        write_aged(&stale, b"stale", 40);

        let degraded = ProcessSnapshot::from_names(["explorer.exe"]);
        let gate = SafetyGate::new(profile.catalog.protected_dirs()).with_process_snapshot(degraded);
        let engine = profile.engine().with_gate(gate);
        let scan = engine.scan_temp().await.unwrap();

        let err = engine.clean_temp(&scan, None, false).await.unwrap_err();
        assert!(matches!(err, CleanerError::Preflight(_)));
        assert!(stale.exists());

        let clean_op = engine
            .tracker()
            .all()
            .into_iter()
            .find(|op| op.id.starts_with("temp_clean"))
            .unwrap();
        assert_eq!(clean_op.status, OperationStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_preflight_only_warns_outside_safe_mode() {
        let profile = Profile::new();
        let stale = profile.local("Temp/old_report.dat");
        write_aged(&stale, b"stale", 40);

        let degraded = ProcessSnapshot::from_names(["explorer.exe"]);
        let gate = SafetyGate::new(profile.catalog.protected_dirs()).with_process_snapshot(degraded);
        let engine = profile
            .engine_with(Settings {
                safe_mode: false,
                ..profile.settings()
            })
            .with_gate(gate);
        let scan = engine.scan_temp().await.unwrap();

        let result = engine.clean_temp(&scan, None, false).await.unwrap();
        assert_eq!(result.files_deleted, 1);
        assert!(result.warnings.iter().any(|w| w.contains("critical system processes")));
    }

    #[tokio::test]
    async fn test_cancel_stops_clean_after_current_file() {
        use std::sync::{Arc, OnceLock, Weak};

        let profile = Profile::new();
        let files: Vec<PathBuf> = (0..4)
            .map(|i| profile.local(&format!("Temp/stale_{}.tmp", i)))
            .collect();
        for file in &files {
            write_aged(file, b"stale", 40);
        }

        let engine = Arc::new(profile.engine());
        let scan = engine.scan_temp().await.unwrap();
        assert_eq!(scan.files("old_temp_files").len(), 4);

        let handle: Arc<OnceLock<Weak<CleanerEngine>>> = Arc::new(OnceLock::new());
        let _ = handle.set(Arc::downgrade(&engine));
        let listener_handle = Arc::clone(&handle);
        engine.tracker().add_listener(Arc::new(move |op: &Operation| {
            if op.id.starts_with("temp_clean")
                && op.status == OperationStatus::Running
                && op.current == 1
            {
                if let Some(engine) = listener_handle.get().and_then(Weak::upgrade) {
                    engine.cancel(&op.id);
                }
            }
        }));

        let result = engine.clean_temp(&scan, None, false).await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.files_deleted, 1);
        assert_eq!(files.iter().filter(|f| f.exists()).count(), 3);

        let op = engine.progress(&result.operation_id).unwrap();
        assert_eq!(op.status, OperationStatus::Cancelled);
        assert_eq!(engine.stats_snapshot().files_cleaned, 1);
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_error() {
        use std::sync::{Arc, Mutex};

        let profile = Profile::new();
        write_aged(&profile.local("Temp/stale.tmp"), b"stale", 40);

        let engine = profile.engine();
        let tracker = engine.tracker().clone();
        let created = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&created);
        engine.tracker().add_listener(Arc::new(move |op: &Operation| {
            if op.status == OperationStatus::Pending {
                seen.lock().unwrap().push(op.id.clone());
                tracker.cancel(&op.id);
            }
        }));

        let err = engine.scan_temp().await.unwrap_err();
        assert!(matches!(err, CleanerError::Cancelled));

        let id = created.lock().unwrap()[0].clone();
        assert!(id.starts_with("temp_scan"));
        assert_eq!(engine.progress(&id).unwrap().status, OperationStatus::Cancelled);
    }

    // Follow-up housekeeping

    #[tokio::test]
    async fn test_nested_cache_directories_collapse_upward() {
        let profile = Profile::new();
        let blob = profile.local("Acme/Cache/Cache_Data/f_000001");
        let settings = profile.local("Acme/profile.json");
        write_aged(&blob, b"cached", 40);
        write_aged(&settings, b"{}", 40);

        let engine = profile.engine();
        let scan = engine.scan_appdata(None).await.unwrap();
        let result = engine.clean_appdata(&scan, false).await.unwrap();

        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.directories_removed, 2);
        assert!(!profile.local("Acme/Cache").exists());
        assert!(profile.local("Acme").exists());
        assert!(settings.exists());
    }

    #[tokio::test]
    async fn test_removed_duplicates_leave_the_hash_cache() {
        let profile = Profile::new();
        let downloads = profile.user.join("Downloads");
        let content = vec![7u8; 4096];
        write_aged(&downloads.join("a.bin"), &content, 5);
        write_aged(&downloads.join("b.bin"), &content, 3);

        let engine = profile.engine();
        let scan = engine.scan_duplicates(&[downloads.clone()]).await.unwrap();
        assert_eq!(engine.duplicate_detector().hash_cache().len(), 2);

        let result = engine
            .remove_duplicates(&scan.groups, KeepStrategy::Newest, false)
            .await
            .unwrap();
        assert_eq!(result.files_deleted, 1);
        assert_eq!(engine.duplicate_detector().hash_cache().len(), 1);
    }

    #[tokio::test]
    async fn test_general_clean_defaults_match_scan_labels() {
        let profile = Profile::new();
        let docs = profile.user.join("Documents");
        let letter = docs.join("letter.odt");
        let draft = docs.join("draft.tmp");
        write_aged(&letter, &vec![1u8; 2 * 1024 * 1024], 10);
        write_aged(&draft, &vec![1u8; 2 * 1024 * 1024], 10);

        let engine = profile.engine();
        let scan = engine.scan_general().await.unwrap();
        assert!(scan
            .categories
            .keys()
            .filter(|label| label.as_str() != Category::UserData.label())
            .all(|label| DEFAULT_GENERAL_CLEAN.contains(&label.as_str())));

        let result = engine
            .clean_categories(&scan, &DEFAULT_GENERAL_CLEAN, false)
            .await
            .unwrap();
        assert_eq!(result.files_deleted, 1);
        assert!(!draft.exists());
        assert!(letter.exists());
    }
}
