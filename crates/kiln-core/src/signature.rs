//! Signature Engine
//!
//! A task signature folds, in order: the action identity, the explicit
//! dependencies, the relevant configuration values, the signatures of tasks it
//! depends on by signature, and the implicit dependencies found by its scanner.
//! Signatures are memoized on the task for the rest of the build.

use tracing::{debug, trace};

use crate::artifact::Artifact;
use crate::build::Build;
use crate::error::{EngineError, Result};
use crate::hasher::{Digest, Fold};
use crate::scanner::ScanInput;
use crate::state::ImplicitDeps;
use crate::task::{TaskId, TaskState};

/// Signature of `id`, computed once per build.
///
/// Fails with `NotReady` while a produced dependency still waits on its producer.
pub fn signature(build: &mut Build, id: TaskId) -> Result<Digest> {
    if let Some(sig) = build.task(id).signature {
        return Ok(sig);
    }

    let sig = match compute(build, id) {
        Err(EngineError::RescanRequired) => match compute(build, id) {
            Err(EngineError::RescanRequired) => {
                return Err(EngineError::ScanDiverged(build.task(id).label.clone()))
            }
            other => other?,
        },
        other => other?,
    };

    trace!("signature {} = {}", build.task(id).label, sig);
    build.task_mut(id).signature = Some(sig);
    Ok(sig)
}

fn compute(build: &mut Build, id: TaskId) -> Result<Digest> {
    let mut fold = Fold::new();

    let task = build.task(id);
    fold.str(&task.kind.name).str(&task.kind.action.identity());

    for artifact in task.explicit_deps() {
        // covered by the signature of the chain step it is attached to
        if build.is_modify_target(artifact) {
            continue;
        }
        fold.str(artifact.as_str());
        fold.digest(&artifact_digest(build, id, artifact)?);
    }

    fold.digest(&task.env.hash_keys(&task.config_keys));

    let sig_deps = task.sig_deps.clone();
    for dep in sig_deps {
        if build.task(dep).state == TaskState::NotRun {
            return Err(EngineError::NotReady {
                task: build.task(id).label.clone(),
                artifact: build.task(dep).label.clone(),
            });
        }
        fold.digest(&signature(build, dep)?);
    }

    if build.task(id).kind.scanner.is_some() {
        let basis = fold.finish();
        fold.digest(&implicit_digest(build, id, basis)?);
    }

    Ok(fold.finish())
}

/// Digest of one dependency: the stamp for produced artifacts, the content otherwise
fn artifact_digest(build: &Build, id: TaskId, artifact: &Artifact) -> Result<Digest> {
    let producers = build.producers_of(artifact);
    if !producers.is_empty() {
        if producers
            .iter()
            .any(|p| *p != id && build.task(*p).state == TaskState::NotRun)
        {
            return Err(EngineError::NotReady {
                task: build.task(id).label.clone(),
                artifact: artifact.to_string(),
            });
        }
        return build
            .state
            .artifact_signature(artifact)
            .ok_or_else(|| EngineError::MissingArtifactDigest {
                artifact: artifact.to_string(),
                task: build.task(id).label.clone(),
            });
    }

    build.store().hash(artifact).map_err(|e| match e {
        EngineError::MissingArtifactDigest { artifact, .. } => EngineError::MissingArtifactDigest {
            artifact,
            task: build.task(id).label.clone(),
        },
        other => other,
    })
}

fn nodes_digest(build: &Build, id: TaskId, nodes: &[Artifact]) -> Result<Digest> {
    let mut fold = Fold::new();
    for node in nodes {
        fold.str(node.as_str());
        fold.digest(&artifact_digest(build, id, node)?);
    }
    Ok(fold.finish())
}

/// Implicit dependency digest, from the cached scan when it still holds.
///
/// `basis` is everything folded before the implicit part. A cached scan is
/// only reused when both `basis` and the digest of its nodes are unchanged.
fn implicit_digest(build: &mut Build, id: TaskId, basis: Digest) -> Result<Digest> {
    let uid = build.task(id).uid;

    if let Some(cached) = build.state.implicit_deps(&uid).cloned() {
        if cached.basis != basis {
            debug!("sources of {} changed, rescanning", build.task(id).label);
            build.state.remove_implicit_deps(&uid);
        } else {
            match nodes_digest(build, id, &cached.nodes) {
                Ok(digest) if digest == cached.digest => return Ok(digest),
                Err(e @ EngineError::NotReady { .. }) => return Err(e),
                Ok(_) | Err(_) => {
                    debug!("implicit deps of {} changed", build.task(id).label);
                    build.state.remove_implicit_deps(&uid);
                    return Err(EngineError::RescanRequired);
                }
            }
        }
    }

    let task = build.task(id);
    let Some(scanner) = task.kind.scanner.clone() else {
        return Ok(Fold::new().finish());
    };
    let result = scanner
        .scan(&ScanInput {
            root: build.root(),
            label: &task.label,
            inputs: &task.inputs,
        })
        .map_err(|e| EngineError::Scanner {
            task: task.label.clone(),
            message: format!("{:#}", e),
        })?;

    debug!(
        "scanned {}: {} resolved, {} unresolved",
        task.label,
        result.resolved.len(),
        result.unresolved.len()
    );

    let digest = nodes_digest(build, id, &result.resolved)?;
    build.state.set_implicit_deps(
        uid,
        ImplicitDeps {
            nodes: result.resolved,
            names: result.unresolved,
            basis,
            digest,
        },
    );
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, ActionOutput, FnAction, Registry};
    use crate::config::ConfigSet;
    use crate::scanner::PrefixScanner;
    use crate::state::BuildState;
    use crate::task::TaskSpec;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register(
            ActionKind::new("cc", FnAction::new("cc-v1", |_| Ok(ActionOutput::success())))
                .vars(["CFLAGS"])
                .scanner(PrefixScanner::includes()),
        );
        registry.register(ActionKind::new(
            "cat",
            FnAction::new("cat-v1", |_| Ok(ActionOutput::success())),
        ));
        Arc::new(registry)
    }

    fn single(root: &Path, spec: TaskSpec, env: ConfigSet, state: BuildState) -> (Build, TaskId) {
        let mut build = Build::new(root, registry(), state).with_env(env);
        let id = build.add_task(spec).unwrap();
        (build, id)
    }

    #[test]
    fn test_signature_tracks_inputs_and_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        fs::write(dir.path().join("b.txt"), "two").unwrap();
        let spec = TaskSpec::new("cat").inputs(["a.txt", "b.txt"]).outputs(["out"]);

        let (mut build, id) = single(dir.path(), spec.clone(), ConfigSet::new(), BuildState::in_memory());
        let first = signature(&mut build, id).unwrap();
        assert_eq!(signature(&mut build, id).unwrap(), first);

        // reordered inputs
        let reordered = TaskSpec::new("cat").inputs(["b.txt", "a.txt"]).outputs(["out"]);
        let (mut build, id) = single(dir.path(), reordered, ConfigSet::new(), BuildState::in_memory());
        assert_ne!(signature(&mut build, id).unwrap(), first);

        // irrelevant configuration
        let env = ConfigSet::new().with("UNUSED", "x");
        let (mut build, id) = single(dir.path(), spec.clone(), env, BuildState::in_memory());
        assert_eq!(signature(&mut build, id).unwrap(), first);

        // relevant configuration
        let spec = spec.vars(["MODE"]);
        let (mut build, id) = single(dir.path(), spec.clone(), ConfigSet::new().with("MODE", "a"), BuildState::in_memory());
        let with_a = signature(&mut build, id).unwrap();
        let (mut build, id) = single(dir.path(), spec, ConfigSet::new().with("MODE", "b"), BuildState::in_memory());
        assert_ne!(signature(&mut build, id).unwrap(), with_a);
    }

    #[test]
    fn test_missing_source_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let spec = TaskSpec::new("cat").inputs(["gone.txt"]).outputs(["out"]);
        let (mut build, id) = single(dir.path(), spec, ConfigSet::new(), BuildState::in_memory());
        match signature(&mut build, id) {
            Err(EngineError::MissingArtifactDigest { artifact, task }) => {
                assert_eq!(artifact, "gone.txt");
                assert_eq!(task, "cat: gone.txt -> out");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_produced_input_waits_for_producer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        let mut build = Build::new(dir.path(), registry(), BuildState::in_memory());
        build
            .add_task(TaskSpec::new("cat").inputs(["a.txt"]).outputs(["mid"]))
            .unwrap();
        let reader = build
            .add_task(TaskSpec::new("cat").inputs(["mid"]).outputs(["end"]))
            .unwrap();
        assert!(matches!(
            signature(&mut build, reader),
            Err(EngineError::NotReady { .. })
        ));
        assert!(build.task(reader).signature.is_none());
    }

    #[test]
    fn test_implicit_deps_are_cached_and_rescanned() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.c"), "#include \"util.h\"\n#include \"sys.h\"\n").unwrap();
        fs::write(dir.path().join("util.h"), "int x;\n").unwrap();
        let spec = TaskSpec::new("cc").inputs(["main.c"]).outputs(["main.o"]);

        let (mut build, id) = single(dir.path(), spec.clone(), ConfigSet::new(), BuildState::in_memory());
        let first = signature(&mut build, id).unwrap();
        let uid = build.task(id).uid;
        let cached = build.state.implicit_deps(&uid).cloned().unwrap();
        assert_eq!(cached.nodes, vec![Artifact::new("util.h")]);
        assert_eq!(cached.names, vec!["sys.h".to_string()]);

        // cached scan is reused as long as the header is unchanged
        let state = std::mem::replace(build.state_mut(), BuildState::in_memory());
        let (mut build, id) = single(dir.path(), spec.clone(), ConfigSet::new(), state);
        assert_eq!(signature(&mut build, id).unwrap(), first);

        // header edits restart the computation with a fresh scan
        fs::write(dir.path().join("util.h"), "int y;\n").unwrap();
        let state = std::mem::replace(build.state_mut(), BuildState::in_memory());
        let (mut build, id) = single(dir.path(), spec, ConfigSet::new(), state);
        let changed = signature(&mut build, id).unwrap();
        assert_ne!(changed, first);
        assert_ne!(build.state.implicit_deps(&uid).unwrap().digest, cached.digest);
    }

    #[test]
    fn test_added_include_is_tracked() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.c"), "#include \"util.h\"\n").unwrap();
        fs::write(dir.path().join("util.h"), "int x;\n").unwrap();
        fs::write(dir.path().join("extra.h"), "int e;\n").unwrap();
        let spec = TaskSpec::new("cc").inputs(["main.c"]).outputs(["main.o"]);

        let rerun = |state: BuildState| {
            let (mut build, id) = single(dir.path(), spec.clone(), ConfigSet::new(), state);
            let sig = signature(&mut build, id).unwrap();
            let uid = build.task(id).uid;
            let nodes = build.state.implicit_deps(&uid).unwrap().nodes.clone();
            let state = std::mem::replace(build.state_mut(), BuildState::in_memory());
            (sig, nodes, state)
        };

        let (_, nodes, state) = rerun(BuildState::in_memory());
        assert_eq!(nodes, vec![Artifact::new("util.h")]);

        fs::write(
            dir.path().join("main.c"),
            "#include \"util.h\"\n#include \"extra.h\"\n",
        )
        .unwrap();
        let (with_extra, nodes, state) = rerun(state);
        assert_eq!(nodes, vec![Artifact::new("extra.h"), Artifact::new("util.h")]);

        let (unchanged, _, state) = rerun(state);
        assert_eq!(unchanged, with_extra);

        fs::write(dir.path().join("extra.h"), "int f;\n").unwrap();
        let (edited, _, _) = rerun(state);
        assert_ne!(edited, with_extra);
    }
}
