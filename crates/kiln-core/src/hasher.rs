//! Kiln Hasher - BLAKE3-based artifact digests
//!
//! Features:
//! - Lazily computed, memoized content digest per artifact
//! - Parallel hashing of output sets with Rayon
//! - Digests that serialize as hex

use blake3::Hasher as Blake3Hasher;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::artifact::Artifact;
use crate::error::{EngineError, Result};

/// 32-byte BLAKE3 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn of(data: &[u8]) -> Self {
        Digest(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Digest(*h.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Digest(*hash.as_bytes())
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_hex()
    }
}

impl TryFrom<String> for Digest {
    type Error = String;

    fn try_from(hex: String) -> std::result::Result<Self, Self::Error> {
        Digest::from_hex(&hex).ok_or_else(|| format!("invalid digest: {}", hex))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash a file's content
pub fn hash_file(path: impl AsRef<Path>) -> std::io::Result<Digest> {
    let content = fs::read(path.as_ref())?;
    Ok(Digest::of(&content))
}

/// Hash several files in parallel, preserving order
pub fn hash_files(paths: &[PathBuf]) -> std::io::Result<Vec<Digest>> {
    paths.par_iter().map(hash_file).collect()
}

/// What the engine needs from the file layer
pub trait ArtifactStore: Send + Sync {
    /// Content digest; fails with `MissingArtifactDigest` when the file cannot be read
    fn hash(&self, artifact: &Artifact) -> Result<Digest>;

    fn exists(&self, artifact: &Artifact) -> bool;

    /// Forget a memoized digest after the file was rewritten
    fn invalidate(&self, artifact: &Artifact);

    /// Warm the digest memo for many artifacts at once; returns how many were hashed.
    /// Unreadable files are left out and reported later by `hash`.
    fn prefetch(&self, artifacts: &[Artifact]) -> usize;

    fn abspath(&self, artifact: &Artifact) -> PathBuf;
}

/// Filesystem-backed artifact store rooted at a directory
pub struct FileHasher {
    root: PathBuf,
    cache: Mutex<HashMap<Artifact, Digest>>,
}

impl FileHasher {
    /// Create a new hasher for the given root directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl ArtifactStore for FileHasher {
    fn hash(&self, artifact: &Artifact) -> Result<Digest> {
        if let Some(digest) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(artifact)
        {
            return Ok(*digest);
        }

        // the task field is filled in by the signature engine
        let path = artifact.abspath(&self.root);
        let digest = hash_file(&path).map_err(|_| EngineError::MissingArtifactDigest {
            artifact: artifact.to_string(),
            task: String::new(),
        })?;

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(artifact.clone(), digest);
        Ok(digest)
    }

    fn exists(&self, artifact: &Artifact) -> bool {
        artifact.abspath(&self.root).exists()
    }

    fn invalidate(&self, artifact: &Artifact) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(artifact);
    }

    fn prefetch(&self, artifacts: &[Artifact]) -> usize {
        let missing: Vec<&Artifact> = {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            artifacts.iter().filter(|a| !cache.contains_key(*a)).collect()
        };

        let results: Vec<(Artifact, Digest)> = missing
            .par_iter()
            .filter_map(|a| {
                hash_file(a.abspath(&self.root))
                    .ok()
                    .map(|d| ((*a).clone(), d))
            })
            .collect();

        let count = results.len();
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(results);
        count
    }

    fn abspath(&self, artifact: &Artifact) -> PathBuf {
        artifact.abspath(&self.root)
    }
}

/// Running hash used while folding signature components
pub(crate) struct Fold(Blake3Hasher);

impl Fold {
    pub(crate) fn new() -> Self {
        Fold(Blake3Hasher::new())
    }

    pub(crate) fn str(&mut self, s: &str) -> &mut Self {
        // length prefix keeps ("ab","c") and ("a","bc") apart
        self.0.update(&(s.len() as u64).to_le_bytes());
        self.0.update(s.as_bytes());
        self
    }

    pub(crate) fn digest(&mut self, d: &Digest) -> &mut Self {
        self.0.update(d.as_bytes());
        self
    }

    pub(crate) fn finish(&self) -> Digest {
        self.0.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip_and_serde() {
        let d = Digest::of(b"kiln");
        assert_eq!(Digest::from_hex(&d.to_hex()), Some(d));

        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(Digest::from_hex("zz").is_none());
    }

    #[test]
    fn test_hash_is_memoized_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        let hasher = FileHasher::new(dir.path());
        let a = Artifact::new("a.txt");

        let first = hasher.hash(&a).unwrap();
        fs::write(dir.path().join("a.txt"), "two").unwrap();
        assert_eq!(hasher.hash(&a).unwrap(), first);

        hasher.invalidate(&a);
        assert_ne!(hasher.hash(&a).unwrap(), first);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = FileHasher::new(dir.path());
        let err = hasher.hash(&Artifact::new("nope.c")).unwrap_err();
        assert!(matches!(err, EngineError::MissingArtifactDigest { .. }));
        assert!(!hasher.exists(&Artifact::new("nope.c")));
    }

    #[test]
    fn test_prefetch_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifacts = Vec::new();
        for i in 0..20 {
            let name = format!("f{}.txt", i);
            fs::write(dir.path().join(&name), i.to_string()).unwrap();
            artifacts.push(Artifact::new(name));
        }
        artifacts.push(Artifact::new("absent.txt"));

        let hasher = FileHasher::new(dir.path());
        assert_eq!(hasher.prefetch(&artifacts), 20);
        // memoized: a rewrite is not seen until invalidated
        fs::write(dir.path().join("f0.txt"), "changed").unwrap();
        assert_eq!(hasher.hash(&artifacts[0]).unwrap(), Digest::of(b"0"));
        assert_eq!(hasher.prefetch(&artifacts), 0);
    }

    #[test]
    fn test_fold_is_order_sensitive() {
        let a = Fold::new().str("a").str("b").finish();
        let b = Fold::new().str("b").str("a").finish();
        let c = Fold::new().str("ab").finish();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
