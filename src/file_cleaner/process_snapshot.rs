use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use sysinfo::System;
use tokio::task;

/// Lowercased names of the processes running at capture time, without `.exe`.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    process_names: Arc<HashSet<String>>,
}

impl ProcessSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            process_names: Arc::new(names.into_iter().map(|n| canonical_name(n.as_ref())).collect()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.process_names.is_empty()
    }

    pub fn has_process_named(&self, name: &str) -> bool {
        self.process_names.contains(&canonical_name(name))
    }

    /// Share of `expected` that is currently running, in `0.0..=1.0`.
    pub fn running_ratio(&self, expected: &[&str]) -> f64 {
        if expected.is_empty() {
            return 1.0;
        }
        let running = expected.iter().filter(|name| self.has_process_named(name)).count();
        running as f64 / expected.len() as f64
    }

    pub async fn capture() -> Self {
        match task::spawn_blocking(capture_snapshot).await {
            Ok(snapshot) => snapshot,
            Err(join_err) => {
                debug!("Failed to capture process snapshot: {}", join_err);
                Self::empty()
            }
        }
    }
}

fn canonical_name(name: &str) -> String {
    let lower = name.to_lowercase();
    lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
}

fn capture_snapshot() -> ProcessSnapshot {
    let mut system = System::new();
    system.refresh_processes();
    ProcessSnapshot::from_names(system.processes().values().map(|process| process.name()))
}
