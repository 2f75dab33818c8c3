//! Scanners discover dependencies a task does not declare (included headers and the like)

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::Artifact;

/// What a scanner sees of a task
pub struct ScanInput<'a> {
    pub root: &'a Path,
    pub label: &'a str,
    pub inputs: &'a [Artifact],
}

/// Scanner result: resolved artifacts and names that could not be resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub resolved: Vec<Artifact>,
    pub unresolved: Vec<String>,
}

/// Must be deterministic for identical file content
pub trait Scanner: Send + Sync {
    fn scan(&self, input: &ScanInput<'_>) -> Result<ScanResult>;
}

/// Follows lines of the form `<prefix>name<terminator>` recursively.
///
/// Names resolve against the including file's directory first, then the
/// search directories (root-relative).
pub struct PrefixScanner {
    prefix: String,
    terminator: char,
    search: Vec<PathBuf>,
}

impl PrefixScanner {
    pub fn new(prefix: impl Into<String>, terminator: char) -> Self {
        Self {
            prefix: prefix.into(),
            terminator,
            search: Vec::new(),
        }
    }

    /// `#include "name"` style
    pub fn includes() -> Self {
        Self::new("#include \"", '"')
    }

    pub fn search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search.push(dir.into());
        self
    }

    fn names(&self, content: &str) -> Vec<String> {
        content
            .lines()
            .filter_map(|line| line.trim_start().strip_prefix(&self.prefix))
            .filter_map(|rest| rest.split(self.terminator).next())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect()
    }

    fn resolve(&self, root: &Path, from: &Artifact, name: &str) -> Option<Artifact> {
        let mut candidates = Vec::new();
        match from.parent() {
            Some(dir) => candidates.push(Artifact::new(Path::new(dir.as_str()).join(name))),
            None => candidates.push(Artifact::new(name)),
        }
        for dir in &self.search {
            candidates.push(Artifact::new(dir.join(name)));
        }
        candidates.into_iter().find(|c| c.abspath(root).is_file())
    }
}

impl Scanner for PrefixScanner {
    fn scan(&self, input: &ScanInput<'_>) -> Result<ScanResult> {
        let mut result = ScanResult::default();
        let mut pending: Vec<Artifact> = input.inputs.to_vec();
        let mut seen: std::collections::HashSet<Artifact> = pending.iter().cloned().collect();

        while let Some(file) = pending.pop() {
            let content = match fs::read_to_string(file.abspath(input.root)) {
                Ok(c) => c,
                Err(e) if input.inputs.contains(&file) => {
                    return Err(anyhow::anyhow!("cannot scan {}: {}", file, e))
                }
                Err(_) => continue,
            };
            for name in self.names(&content) {
                match self.resolve(input.root, &file, &name) {
                    Some(found) => {
                        if seen.insert(found.clone()) {
                            result.resolved.push(found.clone());
                            pending.push(found);
                        }
                    }
                    None => {
                        if !result.unresolved.contains(&name) {
                            result.unresolved.push(name);
                        }
                    }
                }
            }
        }

        result.resolved.sort();
        result.unresolved.sort();
        tracing::debug!(
            "deps: scanner for {} returned {:?} {:?}",
            input.label,
            result.resolved,
            result.unresolved
        );
        Ok(result)
    }
}
