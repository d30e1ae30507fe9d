use super::context::PathContext;
use crate::file_cleaner::types::{Category, Classification, SafetyLevel};

pub(crate) const CRITICAL_SEGMENTS: &[&str] = &["windows/system32", "windows/syswow64", "program files"];

const TEMP_EXTENSIONS: &[&str] = &[".tmp", ".temp", ".~"];
const CACHE_KEYWORDS: &[&str] = &["cache", "thumbnails"];
const CACHE_NAMES: &[&str] = &["thumbs.db", "desktop.ini"];
const DANGEROUS_EXTENSIONS: &[&str] = &[
    ".exe", ".dll", ".sys", ".ini", ".reg", ".bat", ".cmd", ".ps1", ".vbs", ".scr",
];

/// One predicate/verdict pair of the classification chain.
pub(crate) struct Rule {
    pub(crate) name: &'static str,
    pub(crate) matches: fn(&PathContext) -> bool,
    pub(crate) verdict: Classification,
}

/// Evaluated top to bottom, first match wins. `critical_system` must stay first.
pub(crate) const RULES: &[Rule] = &[
    Rule {
        name: "critical_system",
        matches: is_critical,
        verdict: Classification::new(Category::CriticalSystem, SafetyLevel::Dangerous),
    },
    Rule {
        name: "temp",
        matches: is_temp,
        verdict: Classification::new(Category::Temp, SafetyLevel::VerySafe),
    },
    Rule {
        name: "cache",
        matches: is_cache,
        verdict: Classification::new(Category::Cache, SafetyLevel::Safe),
    },
    Rule {
        name: "log",
        matches: is_log,
        verdict: Classification::new(Category::Log, SafetyLevel::Safe),
    },
    Rule {
        name: "dangerous_extension",
        matches: has_dangerous_extension,
        verdict: Classification::new(Category::PotentiallyDangerous, SafetyLevel::Risky),
    },
];

pub(crate) const DEFAULT_VERDICT: Classification =
    Classification::new(Category::UserData, SafetyLevel::Moderate);

pub(crate) fn is_critical(ctx: &PathContext) -> bool {
    CRITICAL_SEGMENTS
        .iter()
        .any(|segment| ctx.contains_keyword(segment))
}

fn is_temp(ctx: &PathContext) -> bool {
    TEMP_EXTENSIONS.contains(&ctx.extension())
        || ctx.name().contains("temp")
        || ctx.name().starts_with('~')
}

fn is_cache(ctx: &PathContext) -> bool {
    CACHE_KEYWORDS.iter().any(|kw| ctx.contains_keyword(kw)) || CACHE_NAMES.contains(&ctx.name())
}

fn is_log(ctx: &PathContext) -> bool {
    ctx.extension() == ".log" || ctx.name().contains("log")
}

fn has_dangerous_extension(ctx: &PathContext) -> bool {
    DANGEROUS_EXTENSIONS.contains(&ctx.extension())
}

/// First rule whose predicate holds, or `None` when the default applies.
pub(crate) fn first_match(ctx: &PathContext) -> Option<&'static Rule> {
    RULES.iter().find(|rule| (rule.matches)(ctx))
}
