use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::context::{is_within, normalize, PathContext};
use super::{rules, Classifier};
use crate::error::{CleanerError, Result};
use crate::file_cleaner::types::{Category, Classification, SafetyLevel};

/// Tables driving the AppData override. The embedded copy lives in `rules/appdata_rules.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDataRules {
    pub never_clean: Vec<String>,
    pub safe_extensions: Vec<String>,
    pub safe_names: Vec<String>,
    pub safe_directories: Vec<String>,
    pub applications: Vec<ApplicationRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRule {
    pub name: String,
    /// Location of the application's data beneath an AppData root, e.g. `Google/Chrome`.
    pub path: String,
    #[serde(default)]
    pub safe_clean: Vec<String>,
    #[serde(default)]
    pub preserve: Vec<String>,
}

impl AppDataRules {
    pub fn embedded() -> Result<Self> {
        let raw = include_str!("../../../rules/appdata_rules.json");
        Self::parse(raw)
    }

    /// Loads `path` when given, the embedded tables otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                Self::parse(&raw)
            }
            None => Self::embedded(),
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        let rules: AppDataRules = serde_json::from_str(raw)
            .map_err(|e| CleanerError::Config(format!("Failed to parse AppData rules: {}", e)))?;
        Ok(rules.normalized())
    }

    fn normalized(mut self) -> Self {
        let lower = |items: &mut Vec<String>| {
            for item in items.iter_mut() {
                *item = normalize(item);
            }
        };
        lower(&mut self.never_clean);
        lower(&mut self.safe_extensions);
        lower(&mut self.safe_names);
        lower(&mut self.safe_directories);
        for app in &mut self.applications {
            app.path = normalize(&app.path).trim_matches('/').to_string();
            lower(&mut app.safe_clean);
            lower(&mut app.preserve);
        }
        self
    }

    pub(crate) fn is_safe_directory_name(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.safe_directories.iter().any(|kw| name.contains(kw.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppDataVerdict {
    SafeToClean,
    PotentiallySafe,
    Preserve,
    Unknown,
}

impl AppDataVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            AppDataVerdict::SafeToClean => "safe_to_clean",
            AppDataVerdict::PotentiallySafe => "potentially_safe",
            AppDataVerdict::Preserve => "preserve",
            AppDataVerdict::Unknown => "unknown",
        }
    }

    pub const LABELS: [&'static str; 4] = ["safe_to_clean", "potentially_safe", "preserve", "unknown"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppDataAssessment {
    pub verdict: AppDataVerdict,
    /// Verdict expressed on the general scale, so the SafetyGate can enforce it.
    pub classification: Classification,
}

/// Application-aware override consulted before the general classifier for AppData files.
#[derive(Debug, Clone)]
pub struct AppDataClassifier {
    roots: Vec<String>,
    rules: AppDataRules,
    classifier: Classifier,
}

impl AppDataClassifier {
    pub fn new(roots: &[PathBuf], rules: AppDataRules) -> Self {
        Self {
            roots: roots
                .iter()
                .map(|root| normalize(&root.to_string_lossy()).trim_end_matches('/').to_string())
                .collect(),
            rules,
            classifier: Classifier::new(),
        }
    }

    pub fn rules(&self) -> &AppDataRules {
        &self.rules
    }

    pub fn assess(&self, path: &Path) -> AppDataAssessment {
        let ctx = PathContext::new(path);
        let base = Classifier::evaluate(&ctx);

        if rules::is_critical(&ctx) {
            return AppDataAssessment {
                verdict: AppDataVerdict::Preserve,
                classification: base,
            };
        }

        let Some(relative) = self.relative_segments(&ctx) else {
            return AppDataAssessment {
                verdict: AppDataVerdict::Unknown,
                classification: Classification::failed(),
            };
        };

        let verdict = self.verdict_for(&ctx, &relative, base);
        AppDataAssessment {
            verdict,
            classification: Self::to_classification(verdict, base),
        }
    }

    pub fn verdict(&self, path: &Path) -> AppDataVerdict {
        self.assess(path).verdict
    }

    fn verdict_for(&self, ctx: &PathContext, relative: &[String], base: Classification) -> AppDataVerdict {
        // A bare file in Local/Roaming belongs to no identifiable application.
        if relative.len() < 2 {
            return AppDataVerdict::Preserve;
        }

        if self.rules.never_clean.iter().any(|p| ctx.contains_keyword(p)) {
            return AppDataVerdict::Preserve;
        }

        if self.rules.safe_extensions.iter().any(|ext| ext == ctx.extension())
            || self.rules.safe_names.iter().any(|name| name == ctx.name())
        {
            return AppDataVerdict::SafeToClean;
        }

        if self.rules.is_safe_directory_name(ctx.parent_name()) {
            return AppDataVerdict::SafeToClean;
        }

        let relative_path = relative.join("/");
        for app in &self.rules.applications {
            let Some(subpath) = relative_path
                .strip_prefix(app.path.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
            else {
                continue;
            };
            if app.preserve.iter().any(|p| subpath.contains(p.as_str())) {
                return AppDataVerdict::Preserve;
            }
            if app.safe_clean.iter().any(|p| subpath.contains(p.as_str())) {
                return AppDataVerdict::SafeToClean;
            }
        }

        match base.safety {
            SafetyLevel::VerySafe | SafetyLevel::Safe => AppDataVerdict::SafeToClean,
            SafetyLevel::Moderate => AppDataVerdict::PotentiallySafe,
            _ => AppDataVerdict::Preserve,
        }
    }

    fn to_classification(verdict: AppDataVerdict, base: Classification) -> Classification {
        match verdict {
            AppDataVerdict::SafeToClean if base.is_cleanable() => base,
            AppDataVerdict::SafeToClean => Classification::new(Category::SafeToDelete, SafetyLevel::Safe),
            AppDataVerdict::PotentiallySafe => Classification::new(base.category, SafetyLevel::Moderate),
            AppDataVerdict::Preserve if base.safety >= SafetyLevel::Risky => base,
            AppDataVerdict::Preserve => Classification::new(base.category, SafetyLevel::Risky),
            AppDataVerdict::Unknown => Classification::failed(),
        }
    }

    /// Segments beneath the AppData root holding `ctx`. Falls back to the segment after
    /// `appdata/<variant>` when the path is outside every configured root.
    fn relative_segments(&self, ctx: &PathContext) -> Option<Vec<String>> {
        for root in &self.roots {
            if is_within(ctx.lower(), root) {
                let rest = &ctx.lower()[root.len()..];
                return Some(
                    rest.split('/')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                );
            }
        }

        let segments = ctx.segments_lower();
        let idx = segments.iter().position(|s| s == "appdata")?;
        Some(segments.iter().skip(idx + 2).cloned().collect())
    }
}
