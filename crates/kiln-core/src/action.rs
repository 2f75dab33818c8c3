//! Action kinds and the registry the build driver owns

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ConfigSet;
use crate::error::EngineError;
use crate::scanner::Scanner;
use crate::task::TaskSpec;

/// Everything an action may look at while it runs
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub root: PathBuf,
    pub label: String,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    /// Temporary copy of the target for modify steps
    pub dep: Option<PathBuf>,
    pub env: Arc<ConfigSet>,
}

/// Result of one action invocation
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Follow-on tasks discovered while running
    pub more_tasks: Vec<TaskSpec>,
}

impl ActionOutput {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn with_more_tasks(mut self, tasks: Vec<TaskSpec>) -> Self {
        self.more_tasks = tasks;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Captured output for failure reports
    pub fn captured(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// The work a task performs
pub trait Action: Send + Sync {
    /// Stable across processes for the same logical action
    fn identity(&self) -> String;

    fn run(&self, cx: &ActionContext) -> Result<ActionOutput>;
}

/// Action backed by a closure
pub struct FnAction<F> {
    identity: String,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&ActionContext) -> Result<ActionOutput> + Send + Sync + 'static,
{
    pub fn new(identity: impl Into<String>, f: F) -> Self {
        Self {
            identity: identity.into(),
            f,
        }
    }
}

impl<F> Action for FnAction<F>
where
    F: Fn(&ActionContext) -> Result<ActionOutput> + Send + Sync + 'static,
{
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn run(&self, cx: &ActionContext) -> Result<ActionOutput> {
        (self.f)(cx)
    }
}

/// Ordering declaration of an action kind.
///
/// `produces`/`consumes` name artifact kinds (file extensions, typically);
/// `before`/`after` name other action kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Precedence {
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub consumes: Vec<String>,
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

impl Precedence {
    pub fn is_empty(&self) -> bool {
        self.produces.is_empty()
            && self.consumes.is_empty()
            && self.before.is_empty()
            && self.after.is_empty()
    }
}

/// A registered kind of action
pub struct ActionKind {
    pub name: String,
    pub action: Arc<dyn Action>,
    /// Configuration keys that affect the signature
    pub vars: Vec<String>,
    pub precedence: Precedence,
    pub scanner: Option<Arc<dyn Scanner>>,
    pub always_run: bool,
    pub content_verified: bool,
}

impl ActionKind {
    pub fn new(name: impl Into<String>, action: impl Action + 'static) -> Self {
        Self {
            name: name.into(),
            action: Arc::new(action),
            vars: Vec::new(),
            precedence: Precedence::default(),
            scanner: None,
            always_run: false,
            content_verified: false,
        }
    }

    pub fn vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for var in vars {
            let var = var.into();
            if !self.vars.contains(&var) {
                self.vars.push(var);
            }
        }
        self
    }

    pub fn precedence(mut self, precedence: Precedence) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn scanner(mut self, scanner: impl Scanner + 'static) -> Self {
        self.scanner = Some(Arc::new(scanner));
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn content_verified(mut self) -> Self {
        self.content_verified = true;
        self
    }
}

impl std::fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionKind")
            .field("name", &self.name)
            .field("vars", &self.vars)
            .field("precedence", &self.precedence)
            .field("always_run", &self.always_run)
            .field("content_verified", &self.content_verified)
            .finish()
    }
}

/// Name -> action kind table, populated at startup by the build driver
#[derive(Debug, Default)]
pub struct Registry {
    kinds: HashMap<String, Arc<ActionKind>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind; a later registration under the same name replaces it
    pub fn register(&mut self, kind: ActionKind) -> Arc<ActionKind> {
        let kind = Arc::new(kind);
        self.kinds.insert(kind.name.clone(), Arc::clone(&kind));
        kind
    }

    pub fn get(&self, name: &str) -> Result<Arc<ActionKind>, EngineError> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Configuration(format!("unknown action kind '{}'", name)))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
