//! Cache Server State - on-disk entries and their LRU index
//!
//! Entries live in `<dir>/<key>/<index>`. The index is rebuilt from disk at
//! start; access order comes from a logical clock seeded by file mtimes.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use kiln_core::netcache::DEFAULT_PORT;

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_CLEAN_RATIO: f64 = 0.8;

/// Cache server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub dir: PathBuf,
    /// Trimming starts once stored bytes reach this
    pub max_bytes: u64,
    /// Trimming stops below `clean_ratio * max_bytes`
    pub clean_ratio: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: format!("{}:{}", gethostname::gethostname().to_string_lossy(), DEFAULT_PORT),
            dir: default_dir(),
            max_bytes: DEFAULT_MAX_BYTES,
            clean_ratio: DEFAULT_CLEAN_RATIO,
        }
    }
}

/// `~/.kiln/server`
fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiln")
        .join("server")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    last_access: u64,
    size: u64,
}

/// key -> (last access, size) over the entries on disk
#[derive(Debug)]
pub struct CacheIndex {
    dir: PathBuf,
    entries: HashMap<String, Entry>,
    total: u64,
    clock: u64,
    max_bytes: u64,
    clean_ratio: f64,
}

impl CacheIndex {
    /// Scan `dir` and index what is already there
    pub fn open(dir: impl AsRef<Path>, max_bytes: u64, clean_ratio: f64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;

        let mut found: Vec<(SystemTime, String, u64)> = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().to_string();
            let mut size = 0;
            let mut newest = SystemTime::UNIX_EPOCH;
            for file in WalkDir::new(entry.path()).min_depth(1).into_iter().flatten() {
                if let Ok(meta) = file.metadata() {
                    if meta.is_file() {
                        size += meta.len();
                        newest = newest.max(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));
                    }
                }
            }
            found.push((newest, key, size));
        }
        found.sort();

        let mut index = Self {
            dir,
            entries: HashMap::new(),
            total: 0,
            clock: 0,
            max_bytes,
            clean_ratio,
        };
        for (_, key, size) in found {
            index.clock += 1;
            index.total += size;
            index.entries.insert(
                key,
                Entry {
                    last_access: index.clock,
                    size,
                },
            );
        }
        info!(
            "Cache index: {} entries, {} bytes in {:?}",
            index.entries.len(),
            index.total,
            index.dir
        );
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of one output of an entry
    pub fn path(&self, key: &str, index: usize) -> PathBuf {
        self.dir.join(key).join(index.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys, most recently used last
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<(&String, &Entry)> = self.entries.iter().collect();
        keys.sort_by_key(|(_, e)| e.last_access);
        keys.into_iter().map(|(k, _)| k.clone()).collect()
    }

    /// Record a read
    pub fn touch(&mut self, key: &str) {
        self.clock += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_access = self.clock;
        }
    }

    /// Record a write of `size` bytes replacing `replaced` bytes
    pub fn add(&mut self, key: &str, size: u64, replaced: u64) {
        self.clock += 1;
        let entry = self.entries.entry(key.to_string()).or_insert(Entry {
            last_access: 0,
            size: 0,
        });
        entry.last_access = self.clock;
        entry.size = entry.size.saturating_sub(replaced) + size;
        self.total = self.total.saturating_sub(replaced) + size;
    }

    /// Evict least recently used entries once the budget is reached; returns the evicted keys
    pub fn trim(&mut self) -> Vec<String> {
        if self.total < self.max_bytes {
            return Vec::new();
        }
        let target = (self.max_bytes as f64 * self.clean_ratio) as u64;
        let mut evicted = Vec::new();

        for key in self.keys() {
            if self.total < target {
                break;
            }
            let entry_dir = self.dir.join(&key);
            if let Err(e) = fs::remove_dir_all(&entry_dir) {
                warn!("cannot evict {:?}: {}", entry_dir, e);
                continue;
            }
            if let Some(entry) = self.entries.remove(&key) {
                self.total = self.total.saturating_sub(entry.size);
            }
            debug!("evicted {}", key);
            evicted.push(key);
        }
        info!(
            "Trimmed {} entries, {} bytes left",
            evicted.len(),
            self.total
        );
        evicted
    }
}
