//! Engine errors
//!
//! `NotReady` and `RescanRequired` are transient conditions handled inside the
//! signature engine and the state machine; they never reach the build driver.

use std::fmt;

use crate::task::TaskState;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("missing signature for {artifact} (required by {task})")]
    MissingArtifactDigest { artifact: String, task: String },

    #[error("{task} is waiting on {artifact}")]
    NotReady { task: String, artifact: String },

    #[error("implicit dependencies changed, rescan required")]
    RescanRequired,

    #[error("implicit dependency scan did not settle for {0}")]
    ScanDiverged(String),

    #[error("scanner failed for {task}: {message}")]
    Scanner { task: String, message: String },

    #[error("missing output files: {}", .0.join(", "))]
    MissingOutputs(Vec<String>),

    #[error("contradictory ordering between '{0}' and '{1}'")]
    PrecedenceConflict(String, String),

    #[error("dependency cycle between: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("deadlock detected, check the build order: {}", .0.join("; "))]
    Deadlock(Vec<String>),

    #[error("build state: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Build(#[from] BuildError),
}

impl From<sled::Error> for EngineError {
    fn from(e: sled::Error) -> Self {
        EngineError::State(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::State(e.to_string())
    }
}

/// Counters for one scheduler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Tasks considered by the scheduler, including injected ones
    pub total: usize,
    /// Actions actually executed
    pub executed: usize,
    /// Tasks whose outputs were restored from the artifact cache
    pub cached: usize,
    /// Tasks found up to date
    pub skipped: usize,
}

/// One failed task in the aggregated report
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub label: String,
    pub uid: String,
    pub state: TaskState,
    pub output: String,
}

/// Raised once scheduling concludes with at least one failed task
#[derive(Debug, Clone)]
pub struct BuildError {
    pub failures: Vec<TaskFailure>,
    pub report: BuildReport,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "build failed: {} task(s) in error", self.failures.len())?;
        for failure in &self.failures {
            writeln!(
                f,
                " -> {} [{}] {}",
                failure.label,
                failure.state,
                &failure.uid[..12.min(failure.uid.len())]
            )?;
            for line in failure.output.lines() {
                writeln!(f, "    {}", line)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for BuildError {}
