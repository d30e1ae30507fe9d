// src/file_cleaner/cache.rs

use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

const DEFAULT_CAPACITY: usize = 10_000;

/// Content hashes keyed by path. An entry is only served while the file's size and
/// modification time still match what was seen when it was hashed.
pub struct HashCache {
    cache: Mutex<LruCache<PathBuf, CachedHash>>,
}

#[derive(Clone)]
struct CachedHash {
    hash: String,
    size: u64,
    modified: SystemTime,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        HashCache {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, path: &Path, size: u64, modified: SystemTime) -> Option<String> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(path) {
            Some(cached) if cached.size == size && cached.modified == modified => Some(cached.hash.clone()),
            Some(_) => {
                cache.pop(path);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, path: &Path, size: u64, modified: SystemTime, hash: String) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(path.to_path_buf(), CachedHash { hash, size, modified });
    }

    pub fn invalidate(&self, path: &Path) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.pop(path);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HashCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
