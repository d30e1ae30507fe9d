mod appdata;
pub(crate) mod context;
mod rules;

use std::fs::{self, Metadata};
use std::path::Path;

use super::types::{Classification, FileRecord, ScannedFile};
use context::PathContext;

pub use appdata::{AppDataAssessment, AppDataClassifier, AppDataRules, AppDataVerdict, ApplicationRule};

/// Assigns a `(Category, SafetyLevel)` verdict from a path and its already-fetched metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Classifier
    }

    /// `metadata` is `None` when the caller could not stat the file. Apart from the
    /// critical-system rule, that resolves to UserData/Risky.
    pub fn classify(&self, path: &Path, metadata: Option<&Metadata>) -> Classification {
        let ctx = PathContext::new(path);
        if rules::is_critical(&ctx) {
            return rules::RULES[0].verdict;
        }
        if metadata.is_none() {
            return Classification::unreadable();
        }
        Self::evaluate(&ctx)
    }

    /// Name of the rule that decides `path`, `"default"` when none matches.
    pub fn matched_rule(&self, path: &Path) -> &'static str {
        rules::first_match(&PathContext::new(path))
            .map(|rule| rule.name)
            .unwrap_or("default")
    }

    pub fn is_critical_path(path: &Path) -> bool {
        rules::is_critical(&PathContext::new(path))
    }

    /// Re-stats and classifies every record on its own. A record that can no longer be
    /// stat'ed is reported as unknown/Dangerous instead of aborting the batch.
    pub fn classify_batch(&self, records: Vec<FileRecord>) -> Vec<ScannedFile> {
        records
            .into_iter()
            .map(|record| {
                let classification = match fs::symlink_metadata(&record.path) {
                    Ok(metadata) => self.classify(&record.path, Some(&metadata)),
                    Err(err) => {
                        log::debug!("Classification failed for {}: {}", record.path.display(), err);
                        Classification::failed()
                    }
                };
                ScannedFile::new(record, classification)
            })
            .collect()
    }

    pub(crate) fn evaluate(ctx: &PathContext) -> Classification {
        rules::first_match(ctx)
            .map(|rule| rule.verdict)
            .unwrap_or(rules::DEFAULT_VERDICT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_cleaner::types::{Category, SafetyLevel};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn classify_existing(path: &Path) -> Classification {
        let metadata = fs::metadata(path).unwrap();
        Classifier::new().classify(path, Some(&metadata))
    }

    #[test]
    fn first_match_wins_over_later_rules() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let file = cache.join("session.tmp");
        fs::write(&file, b"x").unwrap();

        let verdict = classify_existing(&file);
        assert_eq!(verdict.category, Category::Temp);
        assert_eq!(verdict.safety, SafetyLevel::VerySafe);
    }

    #[test]
    fn plain_files_default_to_user_data() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("letter.odt");
        fs::write(&file, b"dear").unwrap();

        let verdict = classify_existing(&file);
        assert_eq!(verdict, Classification::new(Category::UserData, SafetyLevel::Moderate));
        assert!(!verdict.is_cleanable());
    }

    #[test]
    fn executables_are_risky() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("setup.exe");
        fs::write(&file, b"MZ").unwrap();

        let verdict = classify_existing(&file);
        assert_eq!(verdict.category, Category::PotentiallyDangerous);
        assert_eq!(verdict.safety, SafetyLevel::Risky);
    }

    #[test]
    fn system32_is_critical_even_without_metadata() {
        let path = PathBuf::from(r"C:\Windows\System32\Temp\scratch.tmp");
        let verdict = Classifier::new().classify(&path, None);
        assert_eq!(verdict.category, Category::CriticalSystem);
        assert_eq!(verdict.safety, SafetyLevel::Dangerous);
        assert_eq!(Classifier::new().matched_rule(&path), "critical_system");
    }

    #[test]
    fn missing_metadata_fails_toward_caution() {
        let path = PathBuf::from("/somewhere/cache/blob.tmp");
        assert_eq!(Classifier::new().classify(&path, None), Classification::unreadable());
    }

    #[test]
    fn batch_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("run.log");
        fs::write(&kept, b"line").unwrap();
        let vanished = dir.path().join("gone.tmp");
        fs::write(&vanished, b"x").unwrap();

        let records = vec![
            FileRecord::from_path(&kept).unwrap(),
            FileRecord::from_path(&vanished).unwrap(),
        ];
        fs::remove_file(&vanished).unwrap();

        let results = Classifier::new().classify_batch(records);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].classification.category, Category::Log);
        assert!(results[0].cleanable);
        assert_eq!(results[1].classification, Classification::failed());
        assert!(!results[1].cleanable);
    }
}
