//! Tasks - the smallest schedulable unit of build work
//!
//! Tasks live in an arena owned by `Build` and refer to each other by `TaskId`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::action::ActionKind;
use crate::artifact::Artifact;
use crate::config::{ConfigSet, ConfigValue};
use crate::hasher::{Digest, Fold};

/// Index into the task arena of one build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    NotRun,
    Skipped,
    Success,
    Crashed,
    Exception,
    Missing,
}

impl TaskState {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TaskState::Crashed | TaskState::Exception | TaskState::Missing
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::NotRun => "not run",
            TaskState::Skipped => "skipped",
            TaskState::Success => "success",
            TaskState::Crashed => "crashed",
            TaskState::Exception => "exception",
            TaskState::Missing => "missing",
        };
        f.write_str(s)
    }
}

/// Immediate scheduling verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    AskLater,
    SkipMe,
    RunMe,
}

/// Declaration of a task, as given by the build driver or injected by a running action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    /// Registered action kind
    #[serde(rename = "action")]
    pub kind: String,
    /// Display name, also part of the task identity
    pub name: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Extra dependency artifacts, hashed but not passed to the command
    pub deps: Vec<String>,
    /// In-place mutation of an existing output
    pub modifies: Option<String>,
    /// Order this modify step after the non-late steps of the same target
    pub late: bool,
    /// Configuration overrides for this task
    pub env: BTreeMap<String, ConfigValue>,
    /// Configuration keys beyond the kind's own
    pub vars: Vec<String>,
    pub always_run: Option<bool>,
    pub content_verified: Option<bool>,
    /// Tasks released once this one finishes (run or skipped)
    pub follow_on: Vec<TaskSpec>,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    pub fn deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn modifies(mut self, target: impl Into<String>) -> Self {
        self.modifies = Some(target.into());
        self
    }

    pub fn late(mut self) -> Self {
        self.late = true;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vars.extend(vars.into_iter().map(Into::into));
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = Some(true);
        self
    }

    pub fn content_verified(mut self) -> Self {
        self.content_verified = Some(true);
        self
    }

    pub fn follow_on(mut self, spec: TaskSpec) -> Self {
        self.follow_on.push(spec);
        self
    }
}

/// A task instance inside one build
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) uid: Digest,
    pub(crate) kind: Arc<ActionKind>,
    pub(crate) label: String,
    pub(crate) group: usize,
    pub(crate) inputs: Vec<Artifact>,
    pub(crate) outputs: Vec<Artifact>,
    pub(crate) deps: Vec<Artifact>,
    pub(crate) modifies: Option<Artifact>,
    pub(crate) late: bool,
    /// Last step of its modify chain; only that step stamps the target
    pub(crate) chain_last: bool,
    /// Previous entry of its modify chain
    pub(crate) chain_prev: Option<TaskId>,
    pub(crate) run_after: BTreeSet<TaskId>,
    /// Tasks whose signatures fold into this one
    pub(crate) sig_deps: Vec<TaskId>,
    pub(crate) env: Arc<ConfigSet>,
    pub(crate) config_keys: Vec<String>,
    pub(crate) always_run: bool,
    pub(crate) content_verified: bool,
    pub(crate) follow_on: Vec<TaskSpec>,
    pub(crate) state: TaskState,
    /// Skipped because a predecessor failed
    pub(crate) blocked: bool,
    /// Outputs were restored from the artifact cache
    pub(crate) cached: bool,
    pub(crate) signature: Option<Digest>,
    pub(crate) diagnostic: Option<String>,
}

impl Task {
    /// Stable identity: kind, identity of its action, name, ordered inputs and outputs
    pub(crate) fn compute_uid(
        kind: &ActionKind,
        name: Option<&str>,
        inputs: &[Artifact],
        outputs: &[Artifact],
        modifies: Option<&Artifact>,
    ) -> Digest {
        let mut fold = Fold::new();
        fold.str(&kind.name)
            .str(&kind.action.identity())
            .str(name.unwrap_or(""));
        for a in inputs {
            fold.str("i").str(a.as_str());
        }
        for a in outputs {
            fold.str("o").str(a.as_str());
        }
        if let Some(target) = modifies {
            fold.str("m").str(target.as_str());
        }
        fold.finish()
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn uid(&self) -> Digest {
        self.uid
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn inputs(&self) -> &[Artifact] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Artifact] {
        &self.outputs
    }

    pub fn deps(&self) -> &[Artifact] {
        &self.deps
    }

    pub fn modifies(&self) -> Option<&Artifact> {
        self.modifies.as_ref()
    }

    pub fn run_after(&self) -> &BTreeSet<TaskId> {
        &self.run_after
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn was_cached(&self) -> bool {
        self.cached
    }

    pub fn signature(&self) -> Option<Digest> {
        self.signature
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub fn env(&self) -> &ConfigSet {
        &self.env
    }

    pub fn is_always_run(&self) -> bool {
        self.always_run
    }

    pub fn is_content_verified(&self) -> bool {
        self.content_verified
    }

    /// Files this task leaves behind: declared outputs plus a modify target
    pub fn products(&self) -> Vec<Artifact> {
        let mut products = self.outputs.clone();
        if let Some(target) = &self.modifies {
            if !products.contains(target) {
                products.push(target.clone());
            }
        }
        products
    }

    /// Inputs and extra dependencies, in declared order
    pub(crate) fn explicit_deps(&self) -> impl Iterator<Item = &Artifact> {
        self.inputs.iter().chain(self.deps.iter())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state)
            .field("run_after", &self.run_after)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionOutput, FnAction};

    fn kind(name: &str) -> ActionKind {
        ActionKind::new(name, FnAction::new(name, |_| Ok(ActionOutput::success())))
    }

    #[test]
    fn test_uid_is_stable_and_order_sensitive() {
        let cc = kind("cc");
        let a = [Artifact::new("a.c"), Artifact::new("b.c")];
        let b = [Artifact::new("b.c"), Artifact::new("a.c")];
        let out = [Artifact::new("x.o")];

        let first = Task::compute_uid(&cc, None, &a, &out, None);
        assert_eq!(first, Task::compute_uid(&cc, None, &a, &out, None));
        assert_ne!(first, Task::compute_uid(&cc, None, &b, &out, None));
        assert_ne!(first, Task::compute_uid(&kind("cxx"), None, &a, &out, None));
        assert_ne!(first, Task::compute_uid(&cc, Some("x"), &a, &out, None));

        let cc_v2 = ActionKind::new("cc", FnAction::new("cc-v2", |_| Ok(ActionOutput::success())));
        assert_ne!(first, Task::compute_uid(&cc_v2, None, &a, &out, None));
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"action": "cc", "inputs": ["a.c"], "outputs": ["a.o"], "env": {"CFLAGS": ["-O2"]}}"#,
        )
        .unwrap();
        assert_eq!(spec.kind, "cc");
        assert_eq!(spec.inputs, vec!["a.c"]);
        assert!(spec.modifies.is_none());
        assert!(!spec.late);
        assert_eq!(
            spec.env.get("CFLAGS"),
            Some(&ConfigValue::List(vec!["-O2".into()]))
        );
    }

    #[test]
    fn test_failure_states() {
        assert!(TaskState::Crashed.is_failure());
        assert!(TaskState::Missing.is_failure());
        assert!(!TaskState::Skipped.is_failure());
        assert!(!TaskState::NotRun.is_failure());
    }
}
