pub mod config;
pub mod error;
pub mod file_cleaner;
pub mod format;
pub mod ops;

pub use config::Settings;
pub use error::{CleanerError, Result};
pub use file_cleaner::{
    BackupManager, CategorizedScan, Category, Classification, Classifier, CleanResult, CleanerEngine,
    DuplicateDetector, FileRecord, KeepStrategy, PathCatalog, SafetyGate, SafetyLevel, Scanner,
};
pub use ops::{Operation, OperationStatus, OperationTracker};
