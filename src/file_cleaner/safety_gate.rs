use serde::Serialize;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::classifier::context::{is_within, normalize};
use super::classifier::Classifier;
use super::process_snapshot::ProcessSnapshot;
use super::types::{Classification, SafetyLevel, ScannedFile};

/// Processes a healthy Windows session always runs.
pub const CRITICAL_PROCESSES: &[&str] = &[
    "explorer", "winlogon", "csrss", "smss", "wininit", "services", "lsass", "dwm",
];
const MIN_CRITICAL_RATIO: f64 = 0.8;

/// Why the gate refused a destructive action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRefusal {
    CriticalPath,
    Protected(PathBuf),
    NotCleanable(SafetyLevel),
    Vanished,
    InUse(String),
}

impl fmt::Display for GateRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateRefusal::CriticalPath => write!(f, "path is inside a critical system location"),
            GateRefusal::Protected(dir) => write!(f, "path is inside protected directory {}", dir.display()),
            GateRefusal::NotCleanable(level) => write!(f, "safety level {:?} is not cleanable", level),
            GateRefusal::Vanished => write!(f, "file no longer exists"),
            GateRefusal::InUse(reason) => write!(f, "file is in use: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
    pub can_proceed: bool,
    pub warnings: Vec<String>,
}

/// Independent re-check run right before anything is deleted, truncated or removed.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    protected: Vec<(PathBuf, String)>,
    process_check: bool,
    pinned_snapshot: Option<ProcessSnapshot>,
}

impl SafetyGate {
    pub fn new(protected_dirs: Vec<PathBuf>) -> Self {
        let protected = protected_dirs
            .into_iter()
            .flat_map(|dir| {
                let mut forms = vec![(dir.clone(), normalize(&dir.to_string_lossy()))];
                if let Ok(canonical) = fs::canonicalize(&dir) {
                    forms.push((dir, normalize_canonical(&canonical)));
                }
                forms
            })
            .collect();
        Self {
            protected,
            process_check: cfg!(all(windows, feature = "process-check")),
            pinned_snapshot: None,
        }
    }

    pub fn with_process_check(mut self, enabled: bool) -> Self {
        self.process_check = enabled;
        self
    }

    /// Runs the process check against `snapshot` instead of capturing the live process list.
    pub fn with_process_snapshot(mut self, snapshot: ProcessSnapshot) -> Self {
        self.process_check = true;
        self.pinned_snapshot = Some(snapshot);
        self
    }

    pub fn is_safe_to_delete(&self, file: &ScannedFile) -> bool {
        self.check(file.path(), &file.classification).is_ok()
    }

    pub fn check(&self, path: &Path, classification: &Classification) -> Result<(), GateRefusal> {
        self.check_location(path)?;
        if !classification.is_cleanable() {
            return Err(GateRefusal::NotCleanable(classification.safety));
        }
        match fs::symlink_metadata(path) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(GateRefusal::Vanished),
            Err(err) => return Err(GateRefusal::InUse(err.to_string())),
        }
        probe_exclusive(path).map_err(|err| GateRefusal::InUse(err.to_string()))
    }

    /// True when another handle holds the file exclusively.
    pub fn is_in_use(path: &Path) -> bool {
        probe_exclusive(path).is_err()
    }

    /// Location-only check for empty directory removal.
    pub fn check_directory(&self, dir: &Path) -> Result<(), GateRefusal> {
        self.check_location(dir)
    }

    fn check_location(&self, path: &Path) -> Result<(), GateRefusal> {
        if Classifier::is_critical_path(path) {
            return Err(GateRefusal::CriticalPath);
        }
        let mut forms = vec![normalize(&path.to_string_lossy())];
        if let Ok(canonical) = fs::canonicalize(path) {
            forms.push(normalize_canonical(&canonical));
        }
        for (dir, protected) in &self.protected {
            if forms.iter().any(|form| is_within(form, protected)) {
                return Err(GateRefusal::Protected(dir.clone()));
            }
        }
        Ok(())
    }

    pub async fn preflight(&self, paths: &[PathBuf]) -> PreflightReport {
        let snapshot = if let Some(pinned) = &self.pinned_snapshot {
            pinned.clone()
        } else if self.process_check {
            ProcessSnapshot::capture().await
        } else {
            ProcessSnapshot::empty()
        };
        self.preflight_with(&snapshot, paths)
    }

    pub fn preflight_with(&self, snapshot: &ProcessSnapshot, paths: &[PathBuf]) -> PreflightReport {
        let mut report = PreflightReport {
            can_proceed: true,
            warnings: Vec::new(),
        };

        if self.process_check {
            let ratio = snapshot.running_ratio(CRITICAL_PROCESSES);
            if ratio < MIN_CRITICAL_RATIO {
                report.can_proceed = false;
                report.warnings.push(format!(
                    "Only {:.0}% of critical system processes are running",
                    ratio * 100.0
                ));
            }
        }

        let protected = paths.iter().filter(|p| self.check_location(p).is_err()).count();
        if protected > 0 {
            report
                .warnings
                .push(format!("{} paths are inside protected locations and will be skipped", protected));
        }

        let inaccessible = paths.iter().filter(|p| fs::symlink_metadata(p).is_err()).count();
        if inaccessible > 0 {
            report
                .warnings
                .push(format!("{} paths are not accessible", inaccessible));
        }

        report
    }
}

fn normalize_canonical(path: &Path) -> String {
    let normalized = normalize(&path.to_string_lossy());
    normalized
        .strip_prefix("//?/")
        .map(str::to_string)
        .unwrap_or(normalized)
}

#[cfg(windows)]
fn probe_exclusive(path: &Path) -> io::Result<()> {
    use std::os::windows::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(0)
        .open(path)
        .map(|_| ())
}

#[cfg(unix)]
fn probe_exclusive(path: &Path) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is owned by `file`, which outlives both calls.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::flock(fd, libc::LOCK_UN) };
    Ok(())
}

#[cfg(not(any(windows, unix)))]
fn probe_exclusive(path: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).write(true).open(path).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_cleaner::types::{Category, FileRecord};
    use tempfile::TempDir;

    const SAFE: Classification = Classification::new(Category::Temp, SafetyLevel::VerySafe);

    fn gate(protected: &Path) -> SafetyGate {
        SafetyGate::new(vec![protected.to_path_buf()]).with_process_check(false)
    }

    #[test]
    fn protected_directories_are_refused() {
        let dir = TempDir::new().unwrap();
        let system = dir.path().join("Windows");
        fs::create_dir_all(&system).unwrap();
        let file = system.join("notes.tmp");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(gate(&system).check(&file, &SAFE), Err(GateRefusal::Protected(_))));
        assert!(gate(&system).check(&system, &SAFE).is_err());
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_protected() {
        let dir = TempDir::new().unwrap();
        let protected = dir.path().join("Windows");
        let sibling = dir.path().join("WindowsApps");
        fs::create_dir_all(&sibling).unwrap();
        let file = sibling.join("cache.tmp");
        fs::write(&file, b"x").unwrap();

        assert!(gate(&protected).check(&file, &SAFE).is_ok());
    }

    #[test]
    fn system32_paths_refused_even_when_called_safe() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("Windows").join("System32").join("scratch.tmp");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"x").unwrap();

        let record = FileRecord::from_path(&file).unwrap();
        let scanned = ScannedFile::new(record, SAFE);
        let gate = SafetyGate::new(Vec::new()).with_process_check(false);
        assert!(!gate.is_safe_to_delete(&scanned));
        assert_eq!(gate.check(&file, &SAFE), Err(GateRefusal::CriticalPath));
    }

    #[test]
    fn unsafe_levels_are_refused() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("letter.odt");
        fs::write(&file, b"x").unwrap();
        let verdict = Classification::new(Category::UserData, SafetyLevel::Moderate);

        assert_eq!(
            gate(&dir.path().join("Windows")).check(&file, &verdict),
            Err(GateRefusal::NotCleanable(SafetyLevel::Moderate))
        );
    }

    #[test]
    fn vanished_files_are_refused() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("gone.tmp");
        assert_eq!(gate(&dir.path().join("Windows")).check(&file, &SAFE), Err(GateRefusal::Vanished));
    }

    #[cfg(unix)]
    #[test]
    fn exclusively_locked_files_are_in_use() {
        use std::os::unix::io::AsRawFd;
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("busy.tmp");
        fs::write(&file, b"x").unwrap();

        let holder = OpenOptions::new().write(true).open(&file).unwrap();
        let rc = unsafe { libc::flock(holder.as_raw_fd(), libc::LOCK_EX) };
        assert_eq!(rc, 0);

        let g = gate(&dir.path().join("Windows"));
        assert!(matches!(g.check(&file, &SAFE), Err(GateRefusal::InUse(_))));
        drop(holder);
        assert!(g.check(&file, &SAFE).is_ok());
    }

    #[test]
    fn preflight_requires_most_critical_processes() {
        let gate = SafetyGate::new(Vec::new()).with_process_check(true);
        let healthy = ProcessSnapshot::from_names(CRITICAL_PROCESSES.iter().map(|n| format!("{}.exe", n)));
        assert!(gate.preflight_with(&healthy, &[]).can_proceed);

        let degraded = ProcessSnapshot::from_names(["explorer.exe", "dwm.exe"]);
        let report = gate.preflight_with(&degraded, &[]);
        assert!(!report.can_proceed);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn preflight_without_process_check_only_warns() {
        let dir = TempDir::new().unwrap();
        let gate = gate(dir.path());
        let report = gate.preflight(&[dir.path().join("inside.tmp")]).await;
        assert!(report.can_proceed);
        assert_eq!(report.warnings.len(), 2);
    }
}
