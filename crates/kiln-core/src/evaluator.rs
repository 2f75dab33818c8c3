//! Task State Machine
//!
//! An `Evaluator` gives the immediate verdict for a task before it runs and
//! commits its stamps once it ran. `Base` implements the signature checks;
//! the other evaluators wrap an inner one and adjust its verdicts:
//!
//! - `ContentVerified`: skip a rerun whose outputs still hash to their stamps
//! - `AlwaysRun`: never skip tasks flagged always-run
//! - `Forced`: never skip producers of outputs matching a glob
//! - `WithReasons`: log why a task runs under the `kiln::reason` target

use tracing::debug;

use crate::artifact::Artifact;
use crate::build::Build;
use crate::error::{EngineError, Result};
use crate::hasher::Digest;
use crate::signature::signature;
use crate::task::{TaskId, TaskState, Verdict};

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, build: &mut Build, id: TaskId) -> Result<Verdict>;

    /// Commit the result of a successful run; `content` holds output digests
    /// computed by the worker for content-verified tasks
    fn post_run(&self, build: &mut Build, id: TaskId, content: &[(Artifact, Digest)]) -> Result<()>;
}

/// Why a task with signature `sig` has to run, or `None` when it is up to date
fn stale_reason(build: &Build, id: TaskId, sig: Digest) -> Option<String> {
    let task = build.task(id);
    let Some(prev) = build.state().task_signature(&task.uid) else {
        return Some("never run, or the action changed".into());
    };

    if let Some(prev_step) = task.chain_prev {
        if build.task(prev_step).state == TaskState::Success {
            return Some(format!(
                "previous step '{}' rewrote the target",
                build.task(prev_step).label
            ));
        }
    }

    let stamped = build.stamped_products(id);
    for product in task.products() {
        if !build.store().exists(&product) {
            return Some(format!("output {} is missing", product));
        }
        if stamped.contains(&product) && build.state().artifact_signature(&product) != Some(sig) {
            return Some(format!("output {} was stamped by another run", product));
        }
    }

    if sig != prev {
        return Some("signature changed".into());
    }
    None
}

/// Signature checks against the persisted tables
pub struct Base;

impl Evaluator for Base {
    fn evaluate(&self, build: &mut Build, id: TaskId) -> Result<Verdict> {
        let task = build.task(id);
        if task
            .run_after
            .iter()
            .any(|p| build.task(*p).state == TaskState::NotRun)
        {
            return Ok(Verdict::AskLater);
        }

        let sig = match signature(build, id) {
            Ok(sig) => sig,
            Err(EngineError::NotReady { task, artifact }) => {
                debug!("{} postponed, waiting on {}", task, artifact);
                return Ok(Verdict::AskLater);
            }
            Err(e) => return Err(e),
        };

        Ok(match stale_reason(build, id, sig) {
            Some(_) => Verdict::RunMe,
            None => Verdict::SkipMe,
        })
    }

    fn post_run(&self, build: &mut Build, id: TaskId, content: &[(Artifact, Digest)]) -> Result<()> {
        let task = build.task(id);
        let sig = task.signature.ok_or_else(|| {
            EngineError::State(format!("'{}' ran without a signature", task.label))
        })?;
        let uid = task.uid;
        let content_verified = task.content_verified;
        let products = task.products();

        let missing: Vec<String> = products
            .iter()
            .filter(|a| !build.store().exists(a))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::MissingOutputs(missing));
        }

        for product in &products {
            build.store().invalidate(product);
        }

        for product in build.stamped_products(id) {
            let stamp = if content_verified {
                match content.iter().find(|(a, _)| *a == product) {
                    Some((_, digest)) => *digest,
                    None => build.store().hash(&product)?,
                }
            } else {
                sig
            };
            build.state.set_artifact_signature(product, stamp);
        }
        build.state.set_task_signature(uid, sig);
        Ok(())
    }
}

/// Turns a rerun into a skip when every output still hashes to its stamp
pub struct ContentVerified<E> {
    inner: E,
}

impl<E: Evaluator> ContentVerified<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

fn outputs_unchanged(build: &Build, id: TaskId) -> bool {
    let task = build.task(id);
    let Some(sig) = task.signature else {
        return false;
    };
    if build.state().task_signature(&task.uid) != Some(sig) {
        return false;
    }
    if task
        .chain_prev
        .is_some_and(|p| build.task(p).state == TaskState::Success)
    {
        return false;
    }
    if !task.products().iter().all(|p| build.store().exists(p)) {
        return false;
    }
    build.stamped_products(id).iter().all(|p| {
        build.store().invalidate(p);
        match (build.store().hash(p), build.state().artifact_signature(p)) {
            (Ok(current), Some(stamp)) => current == stamp,
            _ => false,
        }
    })
}

impl<E: Evaluator> Evaluator for ContentVerified<E> {
    fn evaluate(&self, build: &mut Build, id: TaskId) -> Result<Verdict> {
        let verdict = self.inner.evaluate(build, id)?;
        if verdict == Verdict::RunMe
            && build.task(id).content_verified
            && outputs_unchanged(build, id)
        {
            return Ok(Verdict::SkipMe);
        }
        Ok(verdict)
    }

    fn post_run(&self, build: &mut Build, id: TaskId, content: &[(Artifact, Digest)]) -> Result<()> {
        self.inner.post_run(build, id, content)
    }
}

pub struct AlwaysRun<E> {
    inner: E,
}

impl<E: Evaluator> AlwaysRun<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: Evaluator> Evaluator for AlwaysRun<E> {
    fn evaluate(&self, build: &mut Build, id: TaskId) -> Result<Verdict> {
        let verdict = self.inner.evaluate(build, id)?;
        if verdict == Verdict::SkipMe && build.task(id).always_run {
            return Ok(Verdict::RunMe);
        }
        Ok(verdict)
    }

    fn post_run(&self, build: &mut Build, id: TaskId, content: &[(Artifact, Digest)]) -> Result<()> {
        self.inner.post_run(build, id, content)
    }
}

/// Reruns producers of outputs matching any of the patterns
pub struct Forced<E> {
    inner: E,
    patterns: Vec<glob::Pattern>,
}

impl<E: Evaluator> Forced<E> {
    pub fn new(inner: E, patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    EngineError::Configuration(format!("invalid force pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { inner, patterns })
    }

    fn matches(&self, build: &Build, id: TaskId) -> bool {
        build
            .task(id)
            .products()
            .iter()
            .any(|a| self.patterns.iter().any(|p| p.matches(a.as_str())))
    }
}

impl<E: Evaluator> Evaluator for Forced<E> {
    fn evaluate(&self, build: &mut Build, id: TaskId) -> Result<Verdict> {
        let verdict = self.inner.evaluate(build, id)?;
        if verdict == Verdict::SkipMe && self.matches(build, id) {
            return Ok(Verdict::RunMe);
        }
        Ok(verdict)
    }

    fn post_run(&self, build: &mut Build, id: TaskId, content: &[(Artifact, Digest)]) -> Result<()> {
        self.inner.post_run(build, id, content)
    }
}

pub struct WithReasons<E> {
    inner: E,
}

impl<E: Evaluator> WithReasons<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: Evaluator> Evaluator for WithReasons<E> {
    fn evaluate(&self, build: &mut Build, id: TaskId) -> Result<Verdict> {
        let verdict = self.inner.evaluate(build, id)?;
        if verdict == Verdict::RunMe {
            let task = build.task(id);
            let reason = match task.signature {
                Some(sig) => stale_reason(build, id, sig),
                None => None,
            };
            let reason = reason.unwrap_or_else(|| {
                if task.always_run {
                    "always run".into()
                } else {
                    "forced".into()
                }
            });
            debug!(target: "kiln::reason", "{}: {}", task.label, reason);
        }
        Ok(verdict)
    }

    fn post_run(&self, build: &mut Build, id: TaskId, content: &[(Artifact, Digest)]) -> Result<()> {
        self.inner.post_run(build, id, content)
    }
}

/// The evaluator stack used by the scheduler
pub fn standard() -> Box<dyn Evaluator> {
    Box::new(WithReasons::new(AlwaysRun::new(ContentVerified::new(Base))))
}

/// `standard` plus forced rebuilds of outputs matching `force`
pub fn with_force(force: &[String]) -> Result<Box<dyn Evaluator>> {
    if force.is_empty() {
        return Ok(standard());
    }
    Ok(Box::new(WithReasons::new(Forced::new(
        AlwaysRun::new(ContentVerified::new(Base)),
        force,
    )?)))
}
