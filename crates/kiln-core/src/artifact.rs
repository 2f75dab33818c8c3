//! Artifacts - files identified by their normalized path

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A source or build-produced file, identified by its root-relative path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact(String);

impl Artifact {
    /// Normalize `path` lexically: `.` is dropped, `..` pops, separators become `/`
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut parts: Vec<String> = Vec::new();
        for component in path.as_ref().components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.last().is_some_and(|p| p != "..") {
                        parts.pop();
                    } else {
                        parts.push("..".into());
                    }
                }
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::RootDir => parts.push(String::new()),
                Component::Prefix(prefix) => {
                    parts.push(prefix.as_os_str().to_string_lossy().into_owned())
                }
            }
        }
        Self(parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Directory part, empty for top-level files
    pub fn parent(&self) -> Option<Artifact> {
        self.0.rfind('/').map(|idx| Artifact(self.0[..idx].to_string()))
    }

    /// Absolute location under `root`
    pub fn abspath(&self, root: &Path) -> PathBuf {
        if self.0.starts_with('/') {
            PathBuf::from(&self.0)
        } else {
            root.join(&self.0)
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Artifact {
    fn from(path: &str) -> Self {
        Artifact::new(path)
    }
}

impl From<String> for Artifact {
    fn from(path: String) -> Self {
        Artifact::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(Artifact::new("./src/../src/a.c").as_str(), "src/a.c");
        assert_eq!(Artifact::new("out//b.o").as_str(), "out/b.o");
        assert_eq!(Artifact::new("../shared/x.h").as_str(), "../shared/x.h");
        assert_eq!(Artifact::new("src/a.c"), Artifact::from("src/./a.c"));
    }

    #[test]
    fn test_name_and_parent() {
        let a = Artifact::new("fonts/build/Test-Regular.ttf");
        assert_eq!(a.name(), "Test-Regular.ttf");
        assert_eq!(a.parent().unwrap().as_str(), "fonts/build");
        assert!(Artifact::new("top.txt").parent().is_none());
    }
}
