//! # TM Shadow Calc: The Main Entry Point
//!
//! This module handles Command Line Interface (CLI) parsing, logging initialization,
//! and dispatching commands to the locator and the runner.
//!
//! The `run` command must be started from inside the game's `Maps` folder, since the
//! game resolves the folder given to `/computeallshadows` relative to it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{LevelFilter, error, info, trace, warn};
use simplelog::{Config, SimpleLogger};
use tokio::sync::mpsc;

mod error;
mod invariant_ppt;
mod locator;
mod preference;
mod runner;
mod system;

use crate::error::ShadowError;
use crate::locator::{ScanEvent, TARGET_EXECUTABLE};
use crate::preference::{FilePreferenceStore, PreferenceStore};
use crate::runner::{CancelToken, Quality, RunOutcome, Runner, RunnerSettings, ShadowJobRequest};
use crate::system::{HostSystem, SystemOps};

/// The primary Command Line Interface (CLI) configuration.
#[derive(Parser)]
#[command(name = "tm-shadow-calc")]
#[command(about = "Batch-compute Trackmania map shadows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Use this preference file instead of the per-user default.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Turn on verbose logging.
    ///
    /// - `-v`: Debug
    /// - `-vv`: Trace (includes every directory visited during a scan)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Search every local fixed drive for Trackmania.exe.
    Locate {
        /// Remember the chosen candidate for later runs.
        #[arg(long)]
        save: bool,

        /// Index of the candidate to save when several are found.
        #[arg(long, default_value_t = 0)]
        pick: usize,
    },
    /// Compute shadows for a map folder and wait until the game has finished.
    ///
    /// This command will:
    /// 1. Check that the current directory is named `Maps`.
    /// 2. Use `--exe`, the saved executable, or a drive scan, in that order.
    /// 3. Kill any running Trackmania and launch it in shadow-computation mode.
    /// 4. Wait until no Trackmania process is left, including re-spawned ones.
    Run {
        /// Map folder, relative to `Maps` or a full path through it.
        folder: String,

        /// Path to Trackmania.exe.
        #[arg(long, value_name = "PATH")]
        exe: Option<PathBuf>,

        /// Lightmap quality.
        #[arg(short, long, value_enum, ignore_case = true, default_value_t = Quality::High)]
        quality: Quality,

        /// Refuse to start if Trackmania is already running instead of killing it.
        #[arg(long)]
        strict: bool,

        /// Index of the candidate to use when a scan finds several.
        #[arg(long, default_value_t = 0)]
        pick: usize,
    },
    /// Report whether Trackmania is currently running.
    Check,
    /// Show the saved Trackmania path.
    Saved {
        /// Forget the saved path.
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Determine log level based on verbosity flag
    let log_level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    // Logging failure shouldn't stop the tool
    let _ = SimpleLogger::init(log_level, Config::default());

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        let _ = Cli::command().print_help();
        return;
    };

    let store = match cli.config {
        Some(path) => FilePreferenceStore::new(path),
        None => match FilePreferenceStore::default_location() {
            Some(store) => store,
            None => {
                error!("Could not determine a configuration directory; pass --config <FILE>.");
                std::process::exit(1);
            }
        },
    };
    let system = Arc::new(HostSystem);

    let result = match command {
        Commands::Locate { save, pick } => locate(system, &store, save, pick).await,
        Commands::Run {
            folder,
            exe,
            quality,
            strict,
            pick,
        } => run(system, &store, &folder, exe, quality, strict, pick).await,
        Commands::Check => check(system.as_ref()),
        Commands::Saved { clear } => saved(&store, clear),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn locate<S: SystemOps + 'static>(
    system: Arc<S>,
    store: &impl PreferenceStore,
    save: bool,
    pick: usize,
) -> Result<()> {
    let candidates = find_candidates(system).await?;

    for (i, path) in candidates.iter().enumerate() {
        println!("[{}] {}", i, path.display());
    }

    if save {
        let chosen = pick_candidate(&candidates, pick)?;
        preference::save_executable(store, chosen)?;
        info!("Saved {:?} to {}", chosen, store.location());
    }
    Ok(())
}

async fn run<S: SystemOps + 'static>(
    system: Arc<S>,
    store: &impl PreferenceStore,
    folder: &str,
    exe: Option<PathBuf>,
    quality: Quality,
    strict: bool,
    pick: usize,
) -> Result<()> {
    let cwd = std::env::current_dir().context("reading the current directory")?;
    runner::ensure_maps_folder(&cwd)?;

    let exe = resolve_executable(&system, store, exe, pick).await?;
    let request = runner::prepare_request(system.as_ref(), &cwd, &exe, folder, quality)?;

    match run_job(system.as_ref(), store, &request, strict, RunnerSettings::default()).await? {
        RunOutcome::Finished { watched } => {
            info!(
                "Shadow calculation completed ({} Trackmania process(es) watched).",
                watched.len()
            );
        }
        RunOutcome::Cancelled { watching } => {
            warn!("Stopped waiting on Trackmania (pid {}).", watching);
        }
    }
    Ok(())
}

/// Picks the executable for a run: `--exe`, then the saved preference, then a drive scan.
async fn resolve_executable<S: SystemOps + 'static>(
    system: &Arc<S>,
    store: &impl PreferenceStore,
    explicit: Option<PathBuf>,
    pick: usize,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(path) = preference::load_saved_executable(store) {
        info!("Using saved executable {:?}", path);
        return Ok(path);
    }

    info!("No saved executable; scanning local drives for {}...", TARGET_EXECUTABLE);
    let candidates = find_candidates(system.clone()).await?;
    if candidates.len() > 1 {
        warn!("Found {} copies of {}:", candidates.len(), TARGET_EXECUTABLE);
        for (i, path) in candidates.iter().enumerate() {
            warn!("  [{}] {}", i, path.display());
        }
    }
    Ok(pick_candidate(&candidates, pick)?.to_path_buf())
}

/// Kill-then-launch for a validated request, saving the executable once the game has started.
async fn run_job<S: SystemOps>(
    system: &S,
    store: &impl PreferenceStore,
    request: &ShadowJobRequest,
    strict: bool,
    settings: RunnerSettings,
) -> Result<RunOutcome> {
    let runner = Runner::new(system, settings);
    if strict {
        runner.ensure_not_running()?;
    }

    let outcome = runner
        .launch(request, &CancelToken::new(), |pid| {
            if let Err(e) = preference::save_executable(store, &request.executable) {
                warn!("Could not save the executable path: {:#}", e);
            }
            info!(
                "Computing shadows for '{}' at {} quality; waiting for Trackmania (pid {}) to finish...",
                request.subfolder, request.quality, pid
            );
        })
        .await?;
    Ok(outcome)
}

fn check(system: &impl SystemOps) -> Result<()> {
    Runner::new(system, RunnerSettings::default()).ensure_not_running()?;
    info!("{} is not running.", TARGET_EXECUTABLE);
    Ok(())
}

fn saved(store: &impl PreferenceStore, clear: bool) -> Result<()> {
    if clear {
        store.clear()?;
        info!("Forgot the saved executable ({}).", store.location());
        return Ok(());
    }
    match preference::load_saved_executable(store) {
        Some(path) => println!("{}", path.display()),
        None => info!("No saved executable in {}.", store.location()),
    }
    Ok(())
}

/// Scans the drives and fails when no copy of the game turns up.
async fn find_candidates<S: SystemOps + 'static>(system: Arc<S>) -> Result<Vec<PathBuf>> {
    let candidates = scan_in_background(system).await?;
    if candidates.is_empty() {
        return Err(ShadowError::ExecutableNotFound(TARGET_EXECUTABLE.to_string()).into());
    }
    Ok(candidates)
}

/// Runs the locator on a blocking worker and logs its progress as it arrives.
async fn scan_in_background<S: SystemOps + 'static>(system: Arc<S>) -> Result<Vec<PathBuf>> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let worker = tokio::task::spawn_blocking(move || {
        locator::scan(system.as_ref(), TARGET_EXECUTABLE, |event| {
            let _ = tx.send(event);
        })
    });

    // Only every tenth percent per volume is worth a log line.
    let mut reported: HashMap<String, u8> = HashMap::new();
    while let Some(event) = rx.recv().await {
        match event {
            ScanEvent::Directory(dir) => trace!("Scanning {}", dir.display()),
            ScanEvent::Progress { volume, percent } => {
                let decile = percent / 10;
                let last = reported.entry(volume.clone()).or_insert(0);
                if decile > *last {
                    *last = decile;
                    info!("[{}] {}%", volume, percent);
                }
            }
        }
    }

    worker.await.context("drive scan worker failed")
}

fn pick_candidate(candidates: &[PathBuf], pick: usize) -> Result<&Path> {
    match candidates.get(pick) {
        Some(path) => Ok(path),
        None => bail!(
            "--pick {} is out of range: only {} candidate(s) found",
            pick,
            candidates.len()
        ),
    }
}
