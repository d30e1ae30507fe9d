use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::paths::{BrowserInstall, BrowserKind};
use crate::error::Result;
use crate::format::format_bytes;

/// Microseconds between 1601-01-01 and 1970-01-01, the offset of Chromium timestamps.
const CHROMIUM_EPOCH_OFFSET_US: i64 = 11_644_473_600_000_000;
const WORKING_COPY_SUFFIX: &str = "cleaning";

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryCleanResult {
    pub operation_id: String,
    pub browsers_processed: Vec<String>,
    pub entries_deleted: u64,
    /// `"<browser id>: <reason>"`, one per failed store.
    pub errors: Vec<String>,
    pub backup: Option<PathBuf>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowserCacheSummary {
    pub id: String,
    pub name: String,
    pub cache_dirs: usize,
    pub total_size: u64,
    pub total_size_formatted: String,
}

/// Oldest timestamp kept, in the browser's own representation.
pub fn history_cutoff(kind: BrowserKind, now: DateTime<Utc>, days_to_keep: u32) -> i64 {
    let unix_us = (now - Duration::days(i64::from(days_to_keep))).timestamp_micros();
    match kind {
        BrowserKind::Chromium => unix_us + CHROMIUM_EPOCH_OFFSET_US,
        BrowserKind::Firefox => unix_us,
    }
}

/// Deletes visits older than `cutoff`, then the parent rows they orphaned. Works on a
/// sibling copy that replaces the store only after the transaction committed, so a failure
/// leaves the original untouched. Returns the number of visit rows removed.
pub fn clean_history_store(store: &Path, kind: BrowserKind, cutoff: i64) -> Result<u64> {
    let working = working_copy_path(store);
    fs::copy(store, &working)?;

    let outcome = prune_history(&working, kind, cutoff);
    match outcome {
        Ok(deleted) => {
            if let Err(err) = fs::rename(&working, store) {
                let _ = fs::remove_file(&working);
                return Err(err.into());
            }
            log::info!("Removed {} history visits from {}", deleted, store.display());
            Ok(deleted)
        }
        Err(err) => {
            let _ = fs::remove_file(&working);
            Err(err)
        }
    }
}

fn prune_history(db: &Path, kind: BrowserKind, cutoff: i64) -> Result<u64> {
    let mut conn = Connection::open(db)?;
    let tx = conn.transaction()?;
    let deleted = match kind {
        BrowserKind::Chromium => {
            let visits = tx.execute("DELETE FROM visits WHERE visit_time < ?1", params![cutoff])?;
            let urls = tx.execute(
                "DELETE FROM urls WHERE last_visit_time < ?1
                 AND NOT EXISTS (SELECT 1 FROM visits v WHERE v.url = urls.id)",
                params![cutoff],
            )?;
            log::debug!("Chromium store: {} visits, {} urls removed", visits, urls);
            visits
        }
        BrowserKind::Firefox => {
            let visits = tx.execute(
                "DELETE FROM moz_historyvisits WHERE visit_date < ?1",
                params![cutoff],
            )?;
            let orphan_sql = if table_exists(&tx, "moz_bookmarks")? {
                "DELETE FROM moz_places
                 WHERE NOT EXISTS (SELECT 1 FROM moz_historyvisits v WHERE v.place_id = moz_places.id)
                 AND id NOT IN (SELECT fk FROM moz_bookmarks WHERE fk IS NOT NULL)"
            } else {
                "DELETE FROM moz_places
                 WHERE NOT EXISTS (SELECT 1 FROM moz_historyvisits v WHERE v.place_id = moz_places.id)"
            };
            let places = tx.execute(orphan_sql, [])?;
            log::debug!("Firefox store: {} visits, {} places removed", visits, places);
            visits
        }
    };
    tx.commit()?;
    Ok(deleted as u64)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn working_copy_path(store: &Path) -> PathBuf {
    let name = store
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    store.with_file_name(format!("{}.{}", name, WORKING_COPY_SUFFIX))
}

pub fn analyze_cache(install: &BrowserInstall) -> BrowserCacheSummary {
    let dirs = install.cache_dirs();
    let total_size = dirs.iter().map(|dir| directory_size(dir)).sum();
    BrowserCacheSummary {
        id: install.id.clone(),
        name: install.name.clone(),
        cache_dirs: dirs.len(),
        total_size,
        total_size_formatted: format_bytes(total_size),
    }
}

fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}
