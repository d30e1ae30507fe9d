use std::path::Path;

/// Lowercased, separator-normalized view of a path that the rule predicates match against.
#[derive(Debug)]
pub(crate) struct PathContext {
    lower: String,
    name: String,
    extension: String,
    segments_lower: Vec<String>,
}

impl PathContext {
    pub(crate) fn new(path: &Path) -> Self {
        let lower = normalize(&path.to_string_lossy());
        let segments_lower: Vec<String> = lower
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.to_string())
            .collect();
        let name = segments_lower.last().cloned().unwrap_or_default();
        let extension = match name.rfind('.') {
            Some(idx) if idx > 0 => name[idx..].to_string(),
            _ => String::new(),
        };

        Self {
            extension,
            lower,
            name,
            segments_lower,
        }
    }

    pub(crate) fn lower(&self) -> &str {
        &self.lower
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn extension(&self) -> &str {
        &self.extension
    }

    pub(crate) fn contains_keyword(&self, keyword: &str) -> bool {
        self.lower.contains(keyword)
    }

    pub(crate) fn parent_name(&self) -> &str {
        let len = self.segments_lower.len();
        if len < 2 {
            return "";
        }
        &self.segments_lower[len - 2]
    }

    pub(crate) fn segments_lower(&self) -> &[String] {
        &self.segments_lower
    }

    pub(crate) fn segment_contains_any(&self, keywords: &[&str]) -> bool {
        self.segments_lower
            .iter()
            .any(|segment| keywords.iter().any(|keyword| segment.contains(keyword)))
    }
}

/// Lowercases and rewrites `\` as `/` so Windows paths and patterns compare uniformly.
pub(crate) fn normalize(raw: &str) -> String {
    raw.replace('\\', "/").to_lowercase()
}

/// Component-wise containment: `child` equals `parent` or lies beneath it.
pub(crate) fn is_within(child: &str, parent: &str) -> bool {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        return false;
    }
    child == parent
        || child
            .strip_prefix(parent)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}
