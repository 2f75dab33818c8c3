//! Parallel Task Scheduler
//!
//! One coordinator owns the `Build` and its state tables; workers only run
//! actions and report back through a channel.
//!
//! - Groups are barriers: the next group is fetched once nothing is in flight
//! - Postponed tasks are retried after every completion; a retry round that
//!   makes no progress with nothing in flight is a deadlock
//! - Semaphore for concurrency control, `spawn_blocking` for the actions
//! - Stops dispatching on the first failure unless keep-going is set, and
//!   drains what is already running

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::action::{Action, ActionContext, ActionOutput};
use crate::artifact::Artifact;
use crate::build::{Build, BuildIterator};
use crate::cache::{copy_into_place, ArtifactCache, LocalCache};
use crate::config::EngineConfig;
use crate::error::{BuildError, BuildReport, EngineError, Result, TaskFailure};
use crate::evaluator::{self, Evaluator};
use crate::hasher::{hash_files, Digest};
use crate::netcache::NetCache;
use crate::task::{TaskId, TaskSpec, TaskState, Verdict};

/// In-flight tasks allowed beyond the worker count before the coordinator waits
const GAP: usize = 10;
const MAXJOBS: usize = 999;

/// How a worker's run ended
#[derive(Debug)]
enum Outcome {
    Success,
    Crashed(String),
    Exception(String),
}

/// What a worker sends back; the coordinator commits it
struct JobResult {
    id: TaskId,
    outcome: Outcome,
    /// The action was invoked
    ran: bool,
    cached: bool,
    content: Vec<(Artifact, Digest)>,
    more_tasks: Vec<TaskSpec>,
}

impl JobResult {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            outcome: Outcome::Success,
            ran: false,
            cached: false,
            content: Vec::new(),
            more_tasks: Vec::new(),
        }
    }
}

/// Everything a worker needs, detached from the build
struct Job {
    id: TaskId,
    action: Arc<dyn Action>,
    cx: ActionContext,
    products: Vec<Artifact>,
    signature: Digest,
    caches: Vec<Arc<dyn ArtifactCache>>,
    /// (target, temporary copy) of a modify step
    tempcopy: Option<(PathBuf, PathBuf)>,
    content_verified: bool,
}

impl Job {
    fn new(build: &Build, id: TaskId, signature: Digest, caches: &[Arc<dyn ArtifactCache>]) -> Self {
        let task = build.task(id);
        let products = task.products();
        let cacheable = !products.is_empty() && !task.always_run;
        Self {
            id,
            action: Arc::clone(&task.kind.action),
            cx: build.action_context(id),
            products,
            signature,
            caches: if cacheable { caches.to_vec() } else { Vec::new() },
            tempcopy: task
                .modifies
                .as_ref()
                .map(|t| (build.store().abspath(t), build.tmp_path(t))),
            content_verified: task.content_verified,
        }
    }

    fn run_action(&self) -> std::result::Result<ActionOutput, Outcome> {
        if let Some((target, copy)) = &self.tempcopy {
            copy_into_place(target, copy).map_err(|e| {
                Outcome::Exception(format!("cannot copy {} for modification: {:#}", target.display(), e))
            })?;
        }

        let output = self
            .action
            .run(&self.cx)
            .map_err(|e| Outcome::Exception(format!("{:#}", e)))?;
        if !output.succeeded() {
            return Err(Outcome::Crashed(format!(
                "exit status {}\n{}",
                output.exit_code,
                output.captured()
            )));
        }

        if let Some((_, copy)) = &self.tempcopy {
            let _ = std::fs::remove_file(copy);
        }
        Ok(output)
    }

    /// Restore from a cache or run the action; never touches the build state
    fn execute(self) -> JobResult {
        let mut result = JobResult::new(self.id);

        for cache in &self.caches {
            match cache.retrieve(&self.signature, &self.cx.outputs) {
                Ok(true) => {
                    result.cached = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => debug!("cache: retrieve for {} failed: {:#}", self.cx.label, e),
            }
        }

        if !result.cached {
            result.ran = true;
            match self.run_action() {
                Ok(output) => result.more_tasks = output.more_tasks,
                Err(outcome) => {
                    result.outcome = outcome;
                    return result;
                }
            }
        }

        if self.content_verified {
            match hash_files(&self.cx.outputs) {
                Ok(digests) => result.content = self.products.iter().cloned().zip(digests).collect(),
                Err(e) => debug!("cannot hash outputs of {}: {}", self.cx.label, e),
            }
        }

        if !result.cached {
            for cache in &self.caches {
                if let Err(e) = cache.store(&self.signature, &self.cx.outputs) {
                    warn!("cache: cannot store outputs of {}: {:#}", self.cx.label, e);
                }
            }
        }
        result
    }
}

/// Parallel task scheduler
pub struct Scheduler {
    jobs: usize,
    keep_going: bool,
    evaluator: Box<dyn Evaluator>,
    caches: Vec<Arc<dyn ArtifactCache>>,
}

impl Scheduler {
    /// Create new scheduler with a worker limit
    pub fn new(jobs: usize) -> Self {
        Self {
            jobs: jobs.max(1),
            keep_going: false,
            evaluator: evaluator::standard(),
            caches: Vec::new(),
        }
    }

    /// Create scheduler with default concurrency (CPU cores)
    pub fn with_default_concurrency() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self::new(cpus)
    }

    /// Scheduler, evaluator stack and caches as configured
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut scheduler = Self::new(config.jobs)
            .keep_going(config.keep_going)
            .evaluator(evaluator::with_force(&config.force)?);
        if !config.no_cache {
            let root = config
                .cache_dir
                .clone()
                .unwrap_or_else(LocalCache::default_root);
            scheduler = scheduler.cache(Arc::new(LocalCache::new(root)));
            if let Some(addr) = &config.net_cache {
                scheduler = scheduler.cache(Arc::new(NetCache::new(addr.clone())));
            }
        }
        Ok(scheduler)
    }

    /// Keep running independent tasks after a failure
    pub fn keep_going(mut self, enabled: bool) -> Self {
        self.keep_going = enabled;
        self
    }

    pub fn evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Add an artifact cache; caches are probed in the order they were added
    pub fn cache(mut self, cache: Arc<dyn ArtifactCache>) -> Self {
        self.caches.push(cache);
        self
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Run every group of `build`.
    ///
    /// Fails with `EngineError::Build` when any task failed; the state of the
    /// tasks that succeeded is flushed either way.
    pub async fn run(&self, build: &mut Build) -> Result<BuildReport> {
        let start = Instant::now();
        build.validate()?;

        let mut run = Run::new(self, build);
        let outcome = run.start().await;
        let drained = run.drain().await;
        let flushed = run.build.state.flush();
        outcome?;
        drained?;
        flushed?;

        let report = run.report;
        debug!("at most {} tasks in flight", run.peak_in_flight);
        info!(
            "Scheduler completed {} tasks in {:?} ({} executed, {} from cache, {} up to date)",
            report.total,
            start.elapsed(),
            report.executed,
            report.cached,
            report.skipped
        );

        if run.errors.is_empty() {
            return Ok(report);
        }
        let failures = run
            .errors
            .iter()
            .map(|id| {
                let task = run.build.task(*id);
                TaskFailure {
                    label: task.label.clone(),
                    uid: task.uid.to_hex(),
                    state: task.state,
                    output: task.diagnostic.clone().unwrap_or_default(),
                }
            })
            .collect();
        Err(BuildError { failures, report }.into())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_default_concurrency()
    }
}

/// Runtime state of one scheduler run
struct Run<'a> {
    scheduler: &'a Scheduler,
    build: &'a mut Build,
    groups: BuildIterator,
    outstanding: VecDeque<TaskId>,
    frozen: VecDeque<TaskId>,
    in_flight: usize,
    peak_in_flight: usize,
    total: usize,
    processed: usize,
    errors: Vec<TaskId>,
    stop: bool,
    /// `processed` when the postponed tasks were last retried with nothing in flight
    deadlock: Option<usize>,
    report: BuildReport,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<JobResult>,
    rx: mpsc::UnboundedReceiver<JobResult>,
}

impl<'a> Run<'a> {
    fn new(scheduler: &'a Scheduler, build: &'a mut Build) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            scheduler,
            groups: build.iter(),
            total: build.total(),
            build,
            outstanding: VecDeque::new(),
            frozen: VecDeque::new(),
            in_flight: 0,
            peak_in_flight: 0,
            processed: 0,
            errors: Vec::new(),
            stop: false,
            deadlock: None,
            report: BuildReport::default(),
            semaphore: Arc::new(Semaphore::new(scheduler.jobs)),
            tx,
            rx,
        }
    }

    async fn start(&mut self) -> Result<()> {
        while !self.stop {
            if !self.refill().await? || self.stop {
                break;
            }
            let Some(id) = self.outstanding.pop_front() else {
                continue;
            };
            self.process(id)?;
        }
        self.report.total = self.total;
        Ok(())
    }

    /// Wait for the tasks still running
    async fn drain(&mut self) -> Result<()> {
        while self.in_flight > 0 {
            self.get_out().await?;
        }
        self.report.total = self.total;
        Ok(())
    }

    /// Make sure there is something to pop; `false` once the build is done
    async fn refill(&mut self) -> Result<bool> {
        let jobs = self.scheduler.jobs;
        while self.in_flight > jobs + GAP || self.in_flight >= MAXJOBS {
            self.get_out().await?;
        }

        while self.outstanding.is_empty() {
            if self.stop {
                return Ok(false);
            }
            if self.in_flight > 0 {
                self.get_out().await?;
                // a completion may have queued follow-on or discovered tasks
                if !self.outstanding.is_empty() {
                    break;
                }
            } else if !self.frozen.is_empty() {
                if self.deadlock == Some(self.processed) {
                    return Err(self.deadlock_error());
                }
                self.deadlock = Some(self.processed);
            }

            if !self.frozen.is_empty() {
                self.outstanding.extend(self.frozen.drain(..));
            } else if self.in_flight == 0 {
                self.build.state.flush()?;
                match self.groups.next_group(self.build)? {
                    Some(group) => {
                        let warmed = self.build.prefetch_sources(&group);
                        debug!(
                            "group {}: {} tasks, {} sources hashed",
                            self.groups.current(),
                            group.len(),
                            warmed
                        );
                        self.outstanding.extend(group);
                    }
                    None => return Ok(false),
                }
            }
        }
        Ok(true)
    }

    fn process(&mut self, id: TaskId) -> Result<()> {
        if self.build.upstream_failed(id) {
            self.processed += 1;
            let task = self.build.task_mut(id);
            task.state = TaskState::Skipped;
            task.blocked = true;
            debug!("{} not run, a dependency failed", task.label);
            return Ok(());
        }

        match self.scheduler.evaluator.evaluate(self.build, id) {
            Err(e) => {
                self.processed += 1;
                self.fail(id, TaskState::Exception, e.to_string());
            }
            Ok(Verdict::AskLater) => self.postpone(id),
            Ok(Verdict::SkipMe) => {
                self.processed += 1;
                self.report.skipped += 1;
                self.build.task_mut(id).state = TaskState::Skipped;
                self.add_more_tasks(id, Vec::new())?;
            }
            Ok(Verdict::RunMe) => {
                self.processed += 1;
                self.dispatch(id);
            }
        }
        Ok(())
    }

    /// Retry later; predecessors still queued are moved to the front
    fn postpone(&mut self, id: TaskId) {
        self.frozen.push_back(id);
        let preds: Vec<TaskId> = self.build.task(id).run_after.iter().copied().collect();
        for pred in preds {
            if let Some(pos) = self.outstanding.iter().position(|t| *t == pred) {
                if let Some(pred) = self.outstanding.remove(pos) {
                    self.outstanding.push_front(pred);
                }
            }
        }
    }

    fn dispatch(&mut self, id: TaskId) {
        let Some(signature) = self.build.task(id).signature else {
            self.fail(id, TaskState::Exception, "selected to run without a signature".into());
            return;
        };
        let job = Job::new(self.build, id, signature, &self.scheduler.caches);
        info!("[{}/{}] {}", self.processed, self.total, self.build.task(id).label);

        self.in_flight += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
        if self.scheduler.jobs == 1 {
            let _ = self.tx.send(job.execute());
            return;
        }

        let tx = self.tx.clone();
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result = tokio::task::spawn_blocking(move || job.execute())
                .await
                .unwrap_or_else(|e| JobResult {
                    ran: true,
                    outcome: Outcome::Exception(format!("worker panicked: {}", e)),
                    ..JobResult::new(id)
                });
            let _ = tx.send(result);
        });
    }

    /// Receive one finished job and commit it
    async fn get_out(&mut self) -> Result<()> {
        let result = self
            .rx
            .recv()
            .await
            .ok_or_else(|| EngineError::State("worker channel closed".into()))?;
        self.in_flight -= 1;
        self.complete(result)
    }

    fn complete(&mut self, result: JobResult) -> Result<()> {
        let id = result.id;
        if result.ran {
            self.report.executed += 1;
        }
        self.build.task_mut(id).cached = result.cached;

        let failure = match result.outcome {
            Outcome::Success => match self.scheduler.evaluator.post_run(self.build, id, &result.content) {
                Ok(()) => None,
                Err(e @ EngineError::MissingOutputs(_)) => Some((TaskState::Missing, e.to_string())),
                Err(e) => Some((TaskState::Exception, e.to_string())),
            },
            Outcome::Crashed(output) => Some((TaskState::Crashed, output)),
            Outcome::Exception(message) => Some((TaskState::Exception, message)),
        };

        match failure {
            None => {
                self.build.task_mut(id).state = TaskState::Success;
                if result.cached {
                    self.report.cached += 1;
                }
                self.add_more_tasks(id, result.more_tasks)?;
            }
            Some((state, output)) => self.fail(id, state, output),
        }
        Ok(())
    }

    fn fail(&mut self, id: TaskId, state: TaskState, output: String) {
        let task = self.build.task_mut(id);
        task.state = state;
        error!("{} {}: {}", task.label, state, output.lines().next().unwrap_or(""));
        task.diagnostic = Some(output);
        self.errors.push(id);
        if !self.scheduler.keep_going {
            self.stop = true;
        }
    }

    /// Queue the follow-on tasks of a finished task and those its action discovered
    fn add_more_tasks(&mut self, id: TaskId, more: Vec<TaskSpec>) -> Result<()> {
        let task = self.build.task(id);
        let mut specs = task.follow_on.clone();
        specs.extend(more);
        if specs.is_empty() {
            return Ok(());
        }

        let group = task.group;
        let ids = self.build.inject(specs, group)?;
        debug!("{} added {} tasks", self.build.task(id).label, ids.len());
        self.total += ids.len();
        self.outstanding.extend(ids);
        Ok(())
    }

    fn deadlock_error(&self) -> EngineError {
        let waiting = self
            .frozen
            .iter()
            .map(|id| {
                let task = self.build.task(*id);
                let preds: Vec<&str> = task
                    .run_after
                    .iter()
                    .map(|p| self.build.task(*p))
                    .filter(|p| p.state == TaskState::NotRun)
                    .map(|p| p.label.as_str())
                    .collect();
                if preds.is_empty() {
                    format!("{} waits on an artifact no earlier task produced", task.label)
                } else {
                    format!("{} waits on {}", task.label, preds.join(", "))
                }
            })
            .collect();
        EngineError::Deadlock(waiting)
    }
}
