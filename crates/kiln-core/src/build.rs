//! Build - the task arena of one invocation
//!
//! Owns the tasks, their groups, the persisted state and the artifact store.
//! Groups are synchronization barriers: `BuildIterator::next_group` hands them
//! out one at a time, topologically sorted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::action::{ActionContext, Registry};
use crate::artifact::Artifact;
use crate::config::ConfigSet;
use crate::error::{EngineError, Result};
use crate::graph;
use crate::hasher::{ArtifactStore, Digest, FileHasher};
use crate::state::BuildState;
use crate::task::{Task, TaskId, TaskSpec, TaskState};

pub struct Build {
    root: PathBuf,
    tmp_dir: PathBuf,
    registry: Arc<Registry>,
    env: Arc<ConfigSet>,
    store: Arc<dyn ArtifactStore>,
    pub(crate) state: BuildState,
    pub(crate) tasks: Vec<Task>,
    groups: Vec<Vec<TaskId>>,
    producers: HashMap<Artifact, Vec<TaskId>>,
    modify_targets: HashSet<Artifact>,
    uids: HashMap<Digest, TaskId>,
    prepared: bool,
}

impl Build {
    pub fn new(root: impl AsRef<Path>, registry: Arc<Registry>, state: BuildState) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            tmp_dir: root.join(".kiln").join("tmp"),
            store: Arc::new(FileHasher::new(&root)),
            root,
            registry,
            env: Arc::new(ConfigSet::new()),
            state,
            tasks: Vec::new(),
            groups: Vec::new(),
            producers: HashMap::new(),
            modify_targets: HashSet::new(),
            uids: HashMap::new(),
            prepared: false,
        }
    }

    /// Base configuration every task derives from
    pub fn with_env(mut self, env: ConfigSet) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Where modify steps keep the temporary copy of their target
    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut BuildState {
        &mut self.state
    }

    /// Start a new group; later tasks go into it
    pub fn add_group(&mut self) -> usize {
        self.groups.push(Vec::new());
        self.groups.len() - 1
    }

    pub fn groups(&self) -> &[Vec<TaskId>] {
        &self.groups
    }

    /// Declare a task in the current group
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<TaskId> {
        if self.groups.is_empty() {
            self.add_group();
        }
        let group = self.groups.len() - 1;
        self.insert_task(spec, group)
    }

    fn insert_task(&mut self, spec: TaskSpec, group: usize) -> Result<TaskId> {
        let kind = self.registry.get(&spec.kind)?;
        let inputs: Vec<Artifact> = spec.inputs.iter().map(Artifact::new).collect();
        let outputs: Vec<Artifact> = spec.outputs.iter().map(Artifact::new).collect();
        let deps: Vec<Artifact> = spec.deps.iter().map(Artifact::new).collect();
        let modifies = spec.modifies.as_deref().map(Artifact::new);

        let uid = Task::compute_uid(
            &kind,
            spec.name.as_deref(),
            &inputs,
            &outputs,
            modifies.as_ref(),
        );
        if let Some(other) = self.uids.get(&uid) {
            return Err(EngineError::Configuration(format!(
                "task '{}' is declared twice (same action, name and files as {})",
                self.tasks[other.0].label, other
            )));
        }

        let env = if spec.env.is_empty() {
            Arc::clone(&self.env)
        } else {
            Arc::new(self.env.derive(&spec.env))
        };

        let mut config_keys = kind.vars.clone();
        for var in &spec.vars {
            if !config_keys.contains(var) {
                config_keys.push(var.clone());
            }
        }

        let label = spec
            .name
            .clone()
            .unwrap_or_else(|| describe(&kind.name, &inputs, &outputs, modifies.as_ref()));

        let id = TaskId(self.tasks.len());
        for output in &outputs {
            self.producers.entry(output.clone()).or_default().push(id);
        }
        if let Some(target) = &modifies {
            self.modify_targets.insert(target.clone());
        }
        self.uids.insert(uid, id);
        self.groups[group].push(id);

        self.tasks.push(Task {
            id,
            uid,
            always_run: spec.always_run.unwrap_or(kind.always_run),
            content_verified: spec.content_verified.unwrap_or(kind.content_verified),
            kind,
            label,
            group,
            inputs,
            outputs,
            deps,
            modifies,
            late: spec.late,
            chain_last: false,
            chain_prev: None,
            run_after: Default::default(),
            sig_deps: Vec::new(),
            env,
            config_keys,
            follow_on: spec.follow_on,
            state: TaskState::NotRun,
            blocked: false,
            cached: false,
            signature: None,
            diagnostic: None,
        });
        Ok(id)
    }

    /// Add tasks discovered during the run to `group` and link them by file overlap
    pub(crate) fn inject(&mut self, specs: Vec<TaskSpec>, group: usize) -> Result<Vec<TaskId>> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(self.insert_task(spec, group)?);
        }
        graph::link_injected(self, &ids);
        Ok(ids)
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.0]
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Look a task up by its label
    pub fn find(&self, label: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.label == label)
    }

    pub fn total(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn producers_of(&self, artifact: &Artifact) -> &[TaskId] {
        self.producers
            .get(artifact)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn is_modify_target(&self, artifact: &Artifact) -> bool {
        self.modify_targets.contains(artifact)
    }

    /// Hash the source files `ids` read, in parallel, ahead of their evaluation
    pub(crate) fn prefetch_sources(&self, ids: &[TaskId]) -> usize {
        let mut seen = HashSet::new();
        let sources: Vec<Artifact> = ids
            .iter()
            .flat_map(|id| self.task(*id).explicit_deps())
            .filter(|a| self.producers_of(a).is_empty() && !self.is_modify_target(a))
            .filter(|a| seen.insert(*a))
            .cloned()
            .collect();
        self.store.prefetch(&sources)
    }

    /// Products whose stamps `id` owns; a modified target belongs to the last step of its chain
    pub(crate) fn stamped_products(&self, id: TaskId) -> Vec<Artifact> {
        let task = self.task(id);
        task.products()
            .into_iter()
            .filter(|a| task.chain_last || !self.is_modify_target(a))
            .collect()
    }

    /// A predecessor failed, or was itself skipped because of a failure
    pub(crate) fn upstream_failed(&self, id: TaskId) -> bool {
        self.task(id).run_after.iter().any(|p| {
            let pred = self.task(*p);
            pred.state.is_failure() || pred.blocked
        })
    }

    /// Fail before anything runs when an input can never exist
    pub fn validate(&self) -> Result<()> {
        for task in &self.tasks {
            for artifact in task.explicit_deps() {
                if self.producers.contains_key(artifact) || self.store.exists(artifact) {
                    continue;
                }
                return Err(EngineError::Configuration(format!(
                    "missing required input '{}' for '{}'",
                    artifact, task.label
                )));
            }
            if let Some(target) = &task.modifies {
                if !self.producers.contains_key(target) {
                    return Err(EngineError::Configuration(format!(
                        "'{}' modifies '{}' but no task produces it",
                        task.label, target
                    )));
                }
            }
        }
        Ok(())
    }

    /// Temporary copy location of a modify target
    pub(crate) fn tmp_path(&self, target: &Artifact) -> PathBuf {
        self.tmp_dir.join(target.as_str().trim_start_matches('/'))
    }

    pub(crate) fn action_context(&self, id: TaskId) -> ActionContext {
        let task = self.task(id);
        ActionContext {
            root: self.root.clone(),
            label: task.label.clone(),
            inputs: task.inputs.iter().map(|a| self.store.abspath(a)).collect(),
            outputs: task
                .products()
                .iter()
                .map(|a| self.store.abspath(a))
                .collect(),
            dep: task.modifies.as_ref().map(|t| self.tmp_path(t)),
            env: Arc::clone(&task.env),
        }
    }

    pub fn iter(&self) -> BuildIterator {
        BuildIterator { next: 0 }
    }

    pub(crate) fn mark_prepared(&mut self) -> bool {
        std::mem::replace(&mut self.prepared, true)
    }
}

/// Default label in the form `kind: inputs -> outputs`
fn describe(kind: &str, inputs: &[Artifact], outputs: &[Artifact], modifies: Option<&Artifact>) -> String {
    let ins: Vec<&str> = inputs.iter().map(Artifact::as_str).collect();
    let mut outs: Vec<&str> = outputs.iter().map(Artifact::as_str).collect();
    if let Some(target) = modifies {
        outs.push(target.as_str());
    }
    if outs.is_empty() {
        format!("{}: {}", kind, ins.join(" "))
    } else {
        format!("{}: {} -> {}", kind, ins.join(" "), outs.join(" "))
    }
}

/// Hands out groups in order; ordering edges are built on the first call
pub struct BuildIterator {
    next: usize,
}

impl BuildIterator {
    /// Next group, topologically sorted; `None` once every group was handed out
    pub fn next_group(&mut self, build: &mut Build) -> Result<Option<Vec<TaskId>>> {
        if !build.mark_prepared() {
            graph::prepare(build)?;
        }
        while self.next < build.groups.len() {
            let group = build.groups[self.next].clone();
            self.next += 1;
            if group.is_empty() {
                continue;
            }
            return graph::topo_sort(build, &group).map(Some);
        }
        Ok(None)
    }

    /// Index of the group handed out last
    pub fn current(&self) -> usize {
        self.next.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, ActionOutput, FnAction};

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register(
            ActionKind::new("copy", FnAction::new("copy", |_| Ok(ActionOutput::success())))
                .vars(["MODE"]),
        );
        Arc::new(registry)
    }

    #[test]
    fn test_add_task_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = Build::new(dir.path(), registry(), BuildState::in_memory())
            .with_env(ConfigSet::new().with("MODE", "fast"));

        let a = build
            .add_task(TaskSpec::new("copy").inputs(["a.txt"]).outputs(["b.txt"]))
            .unwrap();
        let b = build
            .add_task(
                TaskSpec::new("copy")
                    .name("second")
                    .inputs(["b.txt"])
                    .outputs(["c.txt"])
                    .env("MODE", "slow")
                    .vars(["EXTRA"]),
            )
            .unwrap();

        assert_eq!(build.task(a).label(), "copy: a.txt -> b.txt");
        assert_eq!(build.task(b).label(), "second");
        assert_eq!(build.task(a).env().get_flat("MODE"), "fast");
        assert_eq!(build.task(b).env().get_flat("MODE"), "slow");
        assert_eq!(build.task(b).config_keys, vec!["MODE", "EXTRA"]);
        assert_eq!(build.producers_of(&Artifact::new("b.txt")), &[a]);
        assert_eq!(build.groups().len(), 1);
    }

    #[test]
    fn test_prefetch_hashes_sources_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "stale").unwrap();
        let mut build = Build::new(dir.path(), registry(), BuildState::in_memory());
        let first = build
            .add_task(TaskSpec::new("copy").inputs(["a.txt"]).outputs(["b.txt"]))
            .unwrap();
        let second = build
            .add_task(TaskSpec::new("copy").inputs(["b.txt", "a.txt"]).outputs(["c.txt"]))
            .unwrap();

        // b.txt has a producer; a.txt is hashed once
        assert_eq!(build.prefetch_sources(&[first, second]), 1);
        assert_eq!(build.prefetch_sources(&[first, second]), 0);
    }

    #[test]
    fn test_duplicate_and_unknown_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = Build::new(dir.path(), registry(), BuildState::in_memory());
        let spec = TaskSpec::new("copy").inputs(["a"]).outputs(["b"]);
        build.add_task(spec.clone()).unwrap();
        assert!(matches!(
            build.add_task(spec),
            Err(EngineError::Configuration(_))
        ));
        assert!(build.add_task(TaskSpec::new("link")).is_err());
    }

    #[test]
    fn test_validate_reports_missing_inputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "x").unwrap();
        let mut build = Build::new(dir.path(), registry(), BuildState::in_memory());
        build
            .add_task(TaskSpec::new("copy").inputs(["present.txt"]).outputs(["mid.txt"]))
            .unwrap();
        build
            .add_task(TaskSpec::new("copy").inputs(["mid.txt"]).outputs(["end.txt"]))
            .unwrap();
        build.validate().unwrap();

        build
            .add_task(TaskSpec::new("copy").inputs(["absent.txt"]).outputs(["x.txt"]))
            .unwrap();
        let err = build.validate().unwrap_err();
        assert!(err.to_string().contains("absent.txt"));
    }

    #[test]
    fn test_modify_target_needs_producer() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = Build::new(dir.path(), registry(), BuildState::in_memory());
        build
            .add_task(TaskSpec::new("copy").name("patch").modifies("font.ttf"))
            .unwrap();
        assert!(build.validate().is_err());
    }

    #[test]
    fn test_iterator_skips_empty_groups() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "x").unwrap();
        let mut build = Build::new(dir.path(), registry(), BuildState::in_memory());
        build.add_group();
        build.add_group();
        let t = build
            .add_task(TaskSpec::new("copy").inputs(["a"]).outputs(["b"]))
            .unwrap();

        let mut iter = build.iter();
        assert_eq!(iter.next_group(&mut build).unwrap(), Some(vec![t]));
        assert_eq!(iter.current(), 1);
        assert_eq!(iter.next_group(&mut build).unwrap(), None);
    }
}
