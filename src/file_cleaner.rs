pub mod backup;
pub mod browser;
mod cache;
pub mod classifier;
pub mod duplicate_detector;
mod engine;
pub mod log_files;
pub mod paths;
pub mod process_snapshot;
pub mod safety_gate;
pub mod scanner;
pub mod statistics;
pub mod telemetry;
pub mod temp_files;
pub mod types;

#[cfg(test)]
mod tests;

pub use backup::{BackupHandle, BackupInfo, BackupManager, BackupManifest, RestoreReport};
pub use browser::{BrowserCacheSummary, HistoryCleanResult};
pub use cache::HashCache;
pub use classifier::{AppDataClassifier, AppDataRules, AppDataVerdict, Classifier};
pub use duplicate_detector::{DuplicateDetector, DuplicateGroup, DuplicateReport, DuplicateScanResult, KeepStrategy};
pub use engine::CleanerEngine;
pub use paths::{AppDataKind, BrowserInstall, BrowserKind, PathCatalog};
pub use process_snapshot::ProcessSnapshot;
pub use safety_gate::{GateRefusal, PreflightReport, SafetyGate};
pub use scanner::{ScanFilter, Scanner};
pub use statistics::ScanStatistics;
pub use telemetry::{CleanerStats, StatsSnapshot};
pub use types::{
    CategorizedScan, Category, Classification, CleanResult, FailedItem, FileRecord, SafetyLevel,
    ScannedFile, DEFAULT_GENERAL_CLEAN,
};
