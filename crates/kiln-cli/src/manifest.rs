//! Task manifest - action kinds and task declarations as JSON
//!
//! ```json
//! {
//!   "env": {"CC": "cc", "CFLAGS": ["-O2"]},
//!   "actions": {
//!     "cc": {"command": "${CC} ${CFLAGS} -c ${SRC} -o ${TGT}", "produces": ["o"], "scanner": {}}
//!   },
//!   "groups": [[{"action": "cc", "inputs": ["a.c"], "outputs": ["a.o"]}]]
//! }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::{
    ActionKind, Build, BuildState, CommandAction, ConfigSet, EngineConfig, Precedence,
    PrefixScanner, Registry, TaskSpec,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub env: ConfigSet,
    pub actions: BTreeMap<String, ActionDecl>,
    pub groups: Vec<Vec<TaskSpec>>,
}

#[derive(Debug, Deserialize)]
pub struct ActionDecl {
    pub command: String,
    #[serde(flatten)]
    pub precedence: Precedence,
    /// Configuration keys beyond those the command references
    #[serde(default)]
    pub vars: Vec<String>,
    #[serde(default)]
    pub always_run: bool,
    #[serde(default)]
    pub content_verified: bool,
    #[serde(default)]
    pub scanner: Option<ScannerDecl>,
}

/// Prefix scanner settings; `{}` scans `#include "..."` lines
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScannerDecl {
    pub prefix: String,
    pub terminator: char,
    pub search: Vec<PathBuf>,
}

impl Default for ScannerDecl {
    fn default() -> Self {
        Self {
            prefix: "#include \"".into(),
            terminator: '"',
            search: Vec::new(),
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read manifest {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid manifest {}", path.display()))
    }

    /// Action kinds; a command's variable references become its signature keys
    pub fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();
        for (name, decl) in &self.actions {
            let action = CommandAction::parse(&decl.command)
                .with_context(|| format!("action '{}'", name))?;
            let vars = action.template().vars().to_vec();

            let mut kind = ActionKind::new(name.clone(), action)
                .vars(vars)
                .vars(decl.vars.iter().cloned())
                .precedence(decl.precedence.clone());
            if decl.always_run {
                kind = kind.always_run();
            }
            if decl.content_verified {
                kind = kind.content_verified();
            }
            if let Some(scan) = &decl.scanner {
                let scanner = scan
                    .search
                    .iter()
                    .fold(PrefixScanner::new(scan.prefix.clone(), scan.terminator), |s, dir| {
                        s.search_dir(dir.clone())
                    });
                kind = kind.scanner(scanner);
            }
            registry.register(kind);
        }
        Ok(registry)
    }

    /// Build rooted at `root` with one group per manifest group
    pub fn build(&self, root: &Path, state: BuildState, config: &EngineConfig) -> Result<Build> {
        let mut build = Build::new(root, Arc::new(self.registry()?), state)
            .with_env(self.env.clone())
            .with_tmp_dir(config.tmp_path(root));
        for group in &self.groups {
            build.add_group();
            for spec in group {
                build.add_task(spec.clone())?;
            }
        }
        Ok(build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Scheduler, TaskState};
    use std::fs;

    const MANIFEST: &str = r#"{
        "env": {"GREETING": "hello"},
        "actions": {
            "copy": {"command": "cp ${SRC} ${TGT}", "produces": ["txt"]},
            "greet": {"command": "echo ${GREETING} > ${TGT}", "always_run": true},
            "cc": {"command": "cat ${SRC} > ${TGT}", "scanner": {"search": ["include"]}}
        },
        "groups": [
            [{"action": "copy", "inputs": ["a.src"], "outputs": ["a.txt"]}],
            [{"action": "greet", "name": "greet", "outputs": ["hi.txt"]}]
        ]
    }"#;

    #[test]
    fn test_registry_from_manifest() {
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        let registry = manifest.registry().unwrap();
        assert_eq!(registry.len(), 3);

        let greet = registry.get("greet").unwrap();
        assert_eq!(greet.vars, vec!["GREETING".to_string()]);
        assert!(greet.always_run);
        assert_eq!(registry.get("copy").unwrap().precedence.produces, vec!["txt"]);
        assert!(registry.get("cc").unwrap().scanner.is_some());
    }

    #[test]
    fn test_bad_command_names_the_action() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"actions": {"broken": {"command": "cc ${SRC"}}}"#,
        )
        .unwrap();
        let err = manifest.registry().unwrap_err();
        assert!(format!("{:#}", err).contains("broken"));
    }

    #[tokio::test]
    async fn test_manifest_builds() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.src"), "payload").unwrap();
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        let config = EngineConfig::default();

        let mut build = manifest
            .build(dir.path(), BuildState::in_memory(), &config)
            .unwrap();
        let report = Scheduler::new(2).run(&mut build).await.unwrap();

        assert_eq!(report.executed, 2);
        assert_eq!(build.find("greet").unwrap().state(), TaskState::Success);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "payload");
        assert_eq!(fs::read_to_string(dir.path().join("hi.txt")).unwrap().trim(), "hello");
    }
}
