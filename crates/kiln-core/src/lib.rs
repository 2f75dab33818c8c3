//! Kiln Core - Incremental Build Engine
//!
//! Features:
//! - BLAKE3 task signatures over inputs, configuration and upstream signatures
//! - Implicit dependency scanning, cached between runs
//! - Ordering from file overlap, kind precedence and modify chains
//! - Parallel scheduler with build groups, postponement and deadlock detection
//! - Local and remote artifact caches keyed by signature
//! - Persistent build state in sled

pub mod action;
pub mod artifact;
pub mod build;
pub mod cache;
pub mod command;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod hasher;
pub mod netcache;
pub mod runner;
pub mod scanner;
pub mod scheduler;
pub mod signature;
pub mod state;
pub mod task;

pub use action::{Action, ActionContext, ActionKind, ActionOutput, FnAction, Precedence, Registry};
pub use artifact::Artifact;
pub use build::{Build, BuildIterator};
pub use cache::{ArtifactCache, CacheStats, LocalCache};
pub use config::{get_config_path, load_config, save_config, ConfigSet, ConfigValue, EngineConfig};
pub use error::{BuildError, BuildReport, EngineError, Result, TaskFailure};
pub use evaluator::Evaluator;
pub use hasher::{ArtifactStore, Digest, FileHasher};
pub use netcache::NetCache;
pub use runner::CommandAction;
pub use scanner::{PrefixScanner, ScanInput, ScanResult, Scanner};
pub use scheduler::Scheduler;
pub use state::BuildState;
pub use task::{Task, TaskId, TaskSpec, TaskState, Verdict};
