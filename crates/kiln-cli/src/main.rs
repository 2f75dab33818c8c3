//! Kiln CLI - Incremental Build Driver
//!
//! Commands:
//! - kiln build          - Run the tasks of a manifest
//! - kiln graph          - Show the execution order (or Graphviz DOT)
//! - kiln clear-cache    - Remove the local artifact cache
//! - kiln cache-server   - Serve a remote artifact cache

mod manifest;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use kiln_core::{graph, load_config, BuildState, EngineConfig, EngineError, LocalCache, Scheduler};
use kiln_daemon::{CacheServer, ServerConfig};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::Level;

use crate::manifest::Manifest;

/// Kiln - Incremental Build Engine
#[derive(Parser)]
#[command(name = "kiln", version, about = "Incremental build engine")]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task of the manifest that is out of date
    Build(BuildArgs),
    /// Show the per-group execution order
    Graph {
        /// Task manifest
        #[arg(short = 'f', long, default_value = "kiln.json")]
        file: PathBuf,
        /// Print Graphviz DOT instead
        #[arg(long)]
        dot: bool,
    },
    /// Remove the local artifact cache
    ClearCache,
    /// Serve a remote artifact cache
    CacheServer {
        /// Listen address (default: <hostname>:51200)
        #[arg(long)]
        addr: Option<String>,
        /// Storage directory
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Trim least recently used entries beyond this many bytes
        #[arg(long)]
        max_bytes: Option<u64>,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Task manifest
    #[arg(short = 'f', long, default_value = "kiln.json")]
    file: PathBuf,
    /// Worker count (default: CPU cores)
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Keep running independent tasks after a failure
    #[arg(short, long)]
    keep_going: bool,
    /// Do not use the artifact cache
    #[arg(long)]
    no_cache: bool,
    /// Rebuild outputs matching this glob
    #[arg(long)]
    force: Vec<String>,
    /// Build variant
    #[arg(long)]
    variant: Option<String>,
    /// Remote cache server (host:port)
    #[arg(long)]
    net_cache: Option<String>,
}

impl BuildArgs {
    /// CLI flags over ~/.kiln/config.json
    fn config(&self) -> Result<EngineConfig> {
        let mut config = load_config()?;
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        config.keep_going |= self.keep_going;
        config.no_cache |= self.no_cache;
        config.force.extend(self.force.iter().cloned());
        if let Some(variant) = &self.variant {
            config.variant = variant.clone();
        }
        if let Some(addr) = &self.net_cache {
            config.net_cache = Some(addr.clone());
        }
        Ok(config)
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::WARN,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(verbose > 0)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let cwd = std::env::current_dir()?;

    match cli.command {
        Commands::Build(args) => {
            if !run_build(&cwd, &args).await? {
                std::process::exit(1);
            }
        }

        Commands::Graph { file, dot } => {
            show_graph(&cwd, &file, dot)?;
        }

        Commands::ClearCache => {
            let config = load_config()?;
            let cache = LocalCache::new(config.cache_dir.unwrap_or_else(LocalCache::default_root));
            let stats = cache.stats();
            cache.clear()?;
            println!(
                "🗑️  Cache cleared! ({} entries, {} bytes)",
                stats.entries, stats.bytes
            );
        }

        Commands::CacheServer { addr, dir, max_bytes } => {
            let mut config = ServerConfig::default();
            if let Some(addr) = addr {
                config.addr = addr;
            }
            if let Some(dir) = dir {
                config.dir = dir;
            }
            if let Some(max_bytes) = max_bytes {
                config.max_bytes = max_bytes;
            }
            CacheServer::new(config)?.start().await?;
        }
    }

    Ok(())
}

/// Returns `false` when a task failed; the failure report is already printed
async fn run_build(cwd: &Path, args: &BuildArgs) -> Result<bool> {
    let start = Instant::now();
    let config = args.config()?;
    let manifest = Manifest::load(&cwd.join(&args.file))?;
    let state = BuildState::open(config.state_path(cwd))?;
    let mut build = manifest.build(cwd, state, &config)?;
    let scheduler = Scheduler::from_config(&config)?;

    println!("🔨 kiln build ({} tasks, {} jobs)", build.total(), scheduler.jobs());
    match scheduler.run(&mut build).await {
        Ok(report) => {
            println!(
                "✅ {} tasks in {:?}: {} executed, {} from cache, {} up to date",
                report.total,
                start.elapsed(),
                report.executed,
                report.cached,
                report.skipped
            );
            Ok(true)
        }
        Err(EngineError::Build(err)) => {
            eprint!("❌ {}", err);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Print each group's tasks in execution order, or the whole graph as DOT
fn show_graph(cwd: &Path, file: &Path, dot: bool) -> Result<()> {
    let manifest = Manifest::load(&cwd.join(file))?;
    let mut build = manifest.build(cwd, BuildState::in_memory(), &EngineConfig::default())?;
    let mut groups = build.iter();

    let mut lines = Vec::new();
    let mut position = 0;
    while let Some(group) = groups.next_group(&mut build)? {
        lines.push(format!("   group {}:", groups.current()));
        for id in group {
            position += 1;
            let task = build.task(id);
            let after: Vec<&str> = task
                .run_after()
                .iter()
                .map(|p| build.task(*p).label())
                .collect();
            if after.is_empty() {
                lines.push(format!("   {}. {}", position, task.label()));
            } else {
                lines.push(format!("   {}. {} (after {})", position, task.label(), after.join(", ")));
            }
        }
    }

    if dot {
        print!("{}", graph::to_dot(&build));
    } else {
        println!("📋 Execution order:");
        for line in lines {
            println!("{}", line);
        }
    }
    Ok(())
}
