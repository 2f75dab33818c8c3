//! Artifact Cache - outputs keyed by task signature
//!
//! Layout: `<root>/<hex signature>/<output basename>`. Entries are write-once:
//! a writer fills a temporary directory next to the entries and renames it
//! into place, and never replaces an entry that already exists.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::hasher::Digest;

/// Somewhere task outputs can be restored from
pub trait ArtifactCache: Send + Sync {
    /// Restore `outputs` for `key`; `Ok(false)` on a miss
    fn retrieve(&self, key: &Digest, outputs: &[PathBuf]) -> Result<bool>;

    fn store(&self, key: &Digest, outputs: &[PathBuf]) -> Result<()>;
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .with_context(|| format!("output {} has no file name", path.display()))
}

/// Entries hold outputs by basename, so two outputs sharing one cannot be cached
fn names_collide(outputs: &[PathBuf]) -> bool {
    let mut seen = HashSet::new();
    outputs.iter().any(|o| !seen.insert(o.file_name()))
}

fn modified(path: &Path) -> Result<SystemTime> {
    Ok(fs::metadata(path)?.modified()?)
}

/// Copy `src` over `dst` through a sibling temporary file
pub(crate) fn copy_into_place(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dst.with_extension(format!(
        "kiln-{}-{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::copy(src, &tmp).with_context(|| format!("copy {} failed", src.display()))?;
    if let Err(e) = fs::rename(&tmp, dst) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Cache directory on the local machine
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `~/.kiln/cache`
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kiln")
            .join("cache")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry(&self, key: &Digest) -> PathBuf {
        self.root.join(key.to_hex())
    }

    fn restore(&self, dir: &Path, outputs: &[PathBuf]) -> Result<bool> {
        let before = modified(dir)?;
        for output in outputs {
            copy_into_place(&dir.join(file_name(output)?), output)?;
        }
        // rewritten while we copied
        Ok(modified(dir)? == before)
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .with_context(|| format!("cannot remove {}", self.root.display()))?;
        }
        tracing::info!("Cleared artifact cache {:?}", self.root);
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            entries: 0,
            bytes: 0,
            cache_dir: self.root.clone(),
        };
        for entry in WalkDir::new(&self.root).min_depth(1).into_iter().flatten() {
            if entry.depth() == 1 && entry.file_type().is_dir() {
                stats.entries += 1;
            } else if entry.file_type().is_file() {
                stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        stats
    }
}

impl ArtifactCache for LocalCache {
    fn retrieve(&self, key: &Digest, outputs: &[PathBuf]) -> Result<bool> {
        let dir = self.entry(key);
        if !dir.is_dir() || names_collide(outputs) {
            return Ok(false);
        }
        match self.restore(&dir, outputs) {
            Ok(true) => {
                tracing::debug!("cache: restored {} from {:?}", outputs.len(), dir);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                tracing::debug!("cache: unusable entry {:?}: {:#}", dir, e);
                Ok(false)
            }
        }
    }

    fn store(&self, key: &Digest, outputs: &[PathBuf]) -> Result<()> {
        let dir = self.entry(key);
        if dir.exists() {
            return Ok(());
        }
        if names_collide(outputs) {
            tracing::debug!("cache: outputs under {} share a file name, not cached", key);
            return Ok(());
        }
        fs::create_dir_all(&self.root)?;

        let tmp = self.root.join(format!(
            ".tmp-{}-{}-{}",
            key.to_hex(),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir(&tmp)?;
        let filled = outputs.iter().try_for_each(|output| -> Result<()> {
            fs::copy(output, tmp.join(file_name(output)?))
                .with_context(|| format!("cannot cache {}", output.display()))?;
            Ok(())
        });
        if let Err(e) = filled {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }

        // another writer got there first: keep its entry
        if fs::rename(&tmp, &dir).is_err() {
            let _ = fs::remove_dir_all(&tmp);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub cache_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_then_retrieve() {
        let work = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(cache_dir.path().join("cache"));
        let key = Digest::of(b"sig");

        let outputs = vec![work.path().join("a.o"), work.path().join("sub/b.o")];
        fs::create_dir_all(work.path().join("sub")).unwrap();
        fs::write(&outputs[0], "aaa").unwrap();
        fs::write(&outputs[1], "bbb").unwrap();

        assert!(!cache.retrieve(&key, &outputs).unwrap());
        cache.store(&key, &outputs).unwrap();
        assert!(cache.root().join(key.to_hex()).join("b.o").is_file());

        fs::remove_file(&outputs[0]).unwrap();
        fs::remove_dir_all(work.path().join("sub")).unwrap();
        assert!(cache.retrieve(&key, &outputs).unwrap());
        assert_eq!(fs::read_to_string(&outputs[0]).unwrap(), "aaa");
        assert_eq!(fs::read_to_string(&outputs[1]).unwrap(), "bbb");

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 6);
    }

    #[test]
    fn test_entries_are_write_once() {
        let work = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(work.path().join("cache"));
        let key = Digest::of(b"sig");
        let out = vec![work.path().join("x")];

        fs::write(&out[0], "first").unwrap();
        cache.store(&key, &out).unwrap();
        fs::write(&out[0], "second").unwrap();
        cache.store(&key, &out).unwrap();

        assert!(cache.retrieve(&key, &out).unwrap());
        assert_eq!(fs::read_to_string(&out[0]).unwrap(), "first");
    }

    #[test]
    fn test_shared_basenames_are_not_cached() {
        let work = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(work.path().join("cache"));
        let key = Digest::of(b"sig");
        let outputs = vec![work.path().join("x/lib.o"), work.path().join("y/lib.o")];
        for (output, content) in outputs.iter().zip(["first", "second"]) {
            fs::create_dir_all(output.parent().unwrap()).unwrap();
            fs::write(output, content).unwrap();
        }

        cache.store(&key, &outputs).unwrap();
        assert!(!cache.root().join(key.to_hex()).exists());

        // an entry written by someone else is not trusted either
        fs::create_dir_all(cache.root().join(key.to_hex())).unwrap();
        fs::write(cache.root().join(key.to_hex()).join("lib.o"), "second").unwrap();
        assert!(!cache.retrieve(&key, &outputs).unwrap());
        assert_eq!(fs::read_to_string(&outputs[0]).unwrap(), "first");
    }

    #[test]
    fn test_incomplete_entry_is_a_miss() {
        let work = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(work.path().join("cache"));
        let key = Digest::of(b"sig");
        fs::create_dir_all(cache.root().join(key.to_hex())).unwrap();

        let out = vec![work.path().join("missing.o")];
        assert!(!cache.retrieve(&key, &out).unwrap());

        cache.clear().unwrap();
        assert!(!cache.root().exists());
    }
}
