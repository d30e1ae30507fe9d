use serde::Serialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::classifier::context::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserKind {
    Chromium,
    Firefox,
}

/// One installed browser and the per-profile locations the adapters touch.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserInstall {
    pub id: String,
    pub name: String,
    pub kind: BrowserKind,
    pub root: PathBuf,
    pub profiles: Vec<PathBuf>,
}

impl BrowserInstall {
    pub fn cache_dirs(&self) -> Vec<PathBuf> {
        let names: &[&str] = match self.kind {
            BrowserKind::Chromium => &["Cache", "Code Cache", "GPUCache"],
            BrowserKind::Firefox => &["cache2"],
        };
        self.profiles
            .iter()
            .flat_map(|profile| names.iter().map(move |name| profile.join(name)))
            .filter(|dir| dir.is_dir())
            .collect()
    }

    pub fn history_stores(&self) -> Vec<PathBuf> {
        let file = match self.kind {
            BrowserKind::Chromium => "History",
            BrowserKind::Firefox => "places.sqlite",
        };
        self.profiles
            .iter()
            .map(|profile| profile.join(file))
            .filter(|store| store.is_file())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppDataKind {
    Local,
    Roaming,
    LocalLow,
}

/// Candidate roots for every cleaner, resolved once from the environment (or a test profile).
#[derive(Debug, Clone)]
pub struct PathCatalog {
    user_profile: PathBuf,
    local_appdata: PathBuf,
    roaming_appdata: PathBuf,
    temp_dir: PathBuf,
    /// `std::env::temp_dir()` of the running process, absent for test profiles.
    process_temp: Option<PathBuf>,
    system_root: PathBuf,
    program_files: Vec<PathBuf>,
}

impl PathCatalog {
    pub fn from_env() -> Self {
        let user_profile = env::var_os("USERPROFILE")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .unwrap_or_default();
        let local_appdata = env::var_os("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_profile.join("AppData").join("Local"));
        let roaming_appdata = env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_profile.join("AppData").join("Roaming"));
        let temp_dir = env::var_os("TEMP")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        let system_root = env::var_os("SYSTEMROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Windows"));
        let program_files = ["PROGRAMFILES", "PROGRAMFILES(X86)"]
            .iter()
            .map(|var| env::var_os(var).map(PathBuf::from))
            .zip([r"C:\Program Files", r"C:\Program Files (x86)"])
            .map(|(value, fallback)| value.unwrap_or_else(|| PathBuf::from(fallback)))
            .collect();

        Self {
            user_profile,
            local_appdata,
            roaming_appdata,
            temp_dir,
            process_temp: Some(env::temp_dir()),
            system_root,
            program_files,
        }
    }

    /// Catalog rooted at an explicit profile directory laid out like a Windows user profile.
    pub fn for_profile(user_profile: &Path, system_root: &Path) -> Self {
        let appdata = user_profile.join("AppData");
        Self {
            user_profile: user_profile.to_path_buf(),
            local_appdata: appdata.join("Local"),
            roaming_appdata: appdata.join("Roaming"),
            temp_dir: appdata.join("Local").join("Temp"),
            process_temp: None,
            system_root: system_root.to_path_buf(),
            program_files: vec![system_root.join("Program Files")],
        }
    }

    pub fn user_profile(&self) -> &Path {
        &self.user_profile
    }

    pub fn local_appdata(&self) -> &Path {
        &self.local_appdata
    }

    pub fn roaming_appdata(&self) -> &Path {
        &self.roaming_appdata
    }

    pub fn system_root(&self) -> &Path {
        &self.system_root
    }

    pub fn system_temp(&self) -> PathBuf {
        self.system_root.join("Temp")
    }

    /// All AppData variants, accessible or not.
    pub fn appdata_candidates(&self) -> Vec<(AppDataKind, PathBuf)> {
        vec![
            (AppDataKind::Local, self.local_appdata.clone()),
            (AppDataKind::Roaming, self.roaming_appdata.clone()),
            (AppDataKind::LocalLow, self.user_profile.join("AppData").join("LocalLow")),
        ]
    }

    /// AppData roots that exist, can be listed and are writable.
    pub fn appdata_roots(&self) -> Vec<(AppDataKind, PathBuf)> {
        self.appdata_candidates()
            .into_iter()
            .filter(|(kind, path)| {
                let ok = is_accessible(path, true);
                if ok {
                    log::info!("AppData {:?} location accessible: {}", kind, path.display());
                } else {
                    log::warn!("AppData {:?} location not accessible: {}", kind, path.display());
                }
                ok
            })
            .collect()
    }

    pub fn temp_locations(&self) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = self.process_temp.iter().cloned().collect();
        candidates.extend([
            self.temp_dir.clone(),
            self.system_temp(),
            self.local_appdata
                .join("Microsoft")
                .join("Windows")
                .join("INetCache"),
            self.local_appdata
                .join("Microsoft")
                .join("Edge")
                .join("User Data")
                .join("Default")
                .join("Cache"),
            self.local_appdata
                .join("Google")
                .join("Chrome")
                .join("User Data")
                .join("Default")
                .join("Cache"),
        ]);
        dedup_existing(candidates)
    }

    /// Temp locations belonging to a browser, used to label browser cache files.
    pub fn browser_cache_locations(&self) -> Vec<PathBuf> {
        vec![
            self.local_appdata.join("Microsoft").join("Windows").join("INetCache"),
            self.local_appdata.join("Microsoft").join("Edge").join("User Data"),
            self.local_appdata.join("Google").join("Chrome").join("User Data"),
        ]
    }

    pub fn log_locations(&self) -> Vec<PathBuf> {
        let mut candidates = vec![
            self.system_root.join("Logs"),
            self.system_root.join("System32").join("LogFiles"),
            self.temp_dir.clone(),
            self.local_appdata.join("CrashDumps"),
        ];
        for (_, root) in self.appdata_candidates() {
            let Ok(entries) = fs::read_dir(&root) else {
                continue;
            };
            for entry in entries.flatten() {
                let logs = entry.path().join("logs");
                if logs.is_dir() {
                    candidates.push(logs);
                }
            }
        }
        dedup_existing(candidates)
    }

    pub fn browsers(&self) -> Vec<BrowserInstall> {
        let specs = [
            (
                "chrome",
                "Google Chrome",
                BrowserKind::Chromium,
                self.local_appdata.join("Google").join("Chrome").join("User Data"),
            ),
            (
                "edge",
                "Microsoft Edge",
                BrowserKind::Chromium,
                self.local_appdata.join("Microsoft").join("Edge").join("User Data"),
            ),
            (
                "firefox",
                "Mozilla Firefox",
                BrowserKind::Firefox,
                self.roaming_appdata.join("Mozilla").join("Firefox").join("Profiles"),
            ),
        ];

        specs
            .into_iter()
            .filter(|(_, _, _, root)| root.is_dir())
            .map(|(id, name, kind, root)| {
                log::info!("Found {} at {}", name, root.display());
                let profiles = discover_profiles(&root, kind);
                BrowserInstall {
                    id: id.to_string(),
                    name: name.to_string(),
                    kind,
                    root,
                    profiles,
                }
            })
            .collect()
    }

    /// Directories no deletion may touch: the system root and program files trees.
    pub fn protected_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.system_root.clone(),
            self.system_root.join("System32"),
            self.system_root.join("SysWOW64"),
        ];
        dirs.extend(self.program_files.iter().cloned());
        dirs
    }
}

fn discover_profiles(root: &Path, kind: BrowserKind) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut profiles: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match kind {
                BrowserKind::Chromium => name == "Default" || name.starts_with("Profile "),
                BrowserKind::Firefox => !name.starts_with('.'),
            }
        })
        .collect();
    profiles.sort();
    profiles
}

/// Exists and can be listed; with `writable`, also not flagged read-only.
pub fn is_accessible(path: &Path, writable: bool) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_dir() || fs::read_dir(path).is_err() {
        return false;
    }
    !writable || !metadata.permissions().readonly()
}

fn dedup_existing(candidates: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|path| path.is_dir())
        .filter(|path| seen.insert(normalize(&path.to_string_lossy())))
        .collect()
}
