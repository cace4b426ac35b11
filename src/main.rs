// src/main.rs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use packforge::cache::{DerivedCache, DirectoryCache, NoCache};
use packforge::config::{DEFAULT_BASE_PACKAGE, DEFAULT_DB_PATH};
use packforge::db::models::{Package, SessionState};
use packforge::install::{self, Progress};
use packforge::{ArchiveSource, EngineConfig, HandlerRegistry, Orchestrator, StepResult};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser)]
#[command(name = "packforge")]
#[command(author, version, about = "Package installation engine with resumable installation runs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Options shared by every command that touches installed packages
#[derive(Args)]
struct EngineArgs {
    /// Database path
    #[arg(short, long, default_value = DEFAULT_DB_PATH)]
    db_path: String,
    /// Install root directory
    #[arg(short, long, default_value = "/")]
    root: PathBuf,
    /// Directory for downloads and extracted archives
    #[arg(short, long)]
    work_dir: Option<PathBuf>,
    /// Cache directory flushed after each finished run
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Preferred language for package names
    #[arg(short, long, default_value = "en")]
    language: String,
    /// Identifier of the base package every package requires
    #[arg(long, default_value = DEFAULT_BASE_PACKAGE)]
    base_package: String,
}

impl EngineArgs {
    fn config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            db_path: PathBuf::from(&self.db_path),
            install_root: self.root.clone(),
            work_dir: self.work_dir.clone().unwrap_or(defaults.work_dir),
            cache_dir: self.cache_dir.clone(),
            base_package: self.base_package.clone(),
            language: self.language.clone(),
            ..defaults
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the Packforge database
    Init {
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Install or update a package from a local archive or an http(s) URL
    Install {
        /// Path or URL of the package archive
        source: String,
        /// Give up fetching and extracting after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Uninstall a package by identifier or id
    Uninstall {
        /// Package identifier or numeric id
        package: String,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Resume an interrupted or waiting process
    Resume {
        /// Process number printed when the process was created
        process_no: i64,
        /// JSON file answering the document the process is waiting on
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Drop an unfinished process so its packages can be processed again
    Discard {
        /// Process number printed when the process was created
        process_no: i64,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Query installed packages and unfinished processes
    Query {
        /// Package name pattern (optional, shows all if omitted)
        pattern: Option<String>,
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
}

fn print_progress(progress: &Progress) {
    println!("[{:>3}%] {}", progress.percentage, progress.label);
}

/// Drive a process until it completes or waits for input
fn drive(mut orchestrator: Orchestrator<'_>) -> Result<()> {
    let process_no = orchestrator.state().process_no;
    let mut sink = |progress: &Progress| print_progress(progress);

    match orchestrator.run(&mut sink)? {
        StepResult::AwaitingInput { document, .. } => {
            println!("Process {} is waiting for input:", process_no);
            println!("{}", serde_json::to_string_pretty(&document)?);
            println!(
                "Resume with: packforge resume {} --input <FILE>",
                process_no
            );
        }
        StepResult::Completed(_) | StepResult::Continue(_) => {}
    }

    Ok(())
}

fn derived_cache(config: &EngineConfig) -> Box<dyn DerivedCache> {
    match &config.cache_dir {
        Some(dir) => Box::new(DirectoryCache::new(dir)),
        None => Box::new(NoCache),
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Init { db_path }) => {
            info!("Initializing Packforge database at: {}", db_path);
            packforge::db::init(&db_path)?;
            println!("Database initialized successfully at: {}", db_path);
            Ok(())
        }
        Some(Commands::Install {
            source,
            timeout,
            engine,
        }) => {
            let mut config = engine.config();
            config.deadline = timeout.map(|secs| Instant::now() + Duration::from_secs(secs));
            let mut conn = packforge::db::open(&config.db_path)?;

            info!("Installing package from: {}", source);
            let archive_path = ArchiveSource::parse(&source).materialize(
                &config.work_dir,
                config.http_timeout,
                config.deadline,
            )?;

            let plan = install::plan_install(&mut conn, &config, &archive_path)?;
            println!(
                "Process {}: {} {}",
                plan.process_no,
                plan.action.as_str(),
                plan.package
            );
            if let Some(report) = &plan.report {
                for requirement in &report.requirements {
                    println!("  requires {} ({:?})", requirement.name, requirement.status);
                }
            }

            let handlers = HandlerRegistry::with_defaults();
            let cache = derived_cache(&config);
            let orchestrator =
                Orchestrator::new(&mut conn, &config, &handlers, cache.as_ref(), plan.session);
            drive(orchestrator)
        }
        Some(Commands::Uninstall { package, engine }) => {
            let config = engine.config();
            let mut conn = packforge::db::open(&config.db_path)?;

            let plan = install::plan_uninstall(&mut conn, &config, &package)?;
            println!("Process {}: uninstall {}", plan.process_no, plan.package);

            let handlers = HandlerRegistry::with_defaults();
            let cache = derived_cache(&config);
            let orchestrator =
                Orchestrator::new(&mut conn, &config, &handlers, cache.as_ref(), plan.session);
            drive(orchestrator)
        }
        Some(Commands::Resume {
            process_no,
            input,
            engine,
        }) => {
            let config = engine.config();
            let mut conn = packforge::db::open(&config.db_path)?;
            let handlers = HandlerRegistry::with_defaults();
            let cache = derived_cache(&config);

            let mut orchestrator =
                Orchestrator::resume(&mut conn, &config, &handlers, cache.as_ref(), process_no)?;
            if let Some(path) = input {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read input file {}", path.display()))?;
                let value: serde_json::Value = serde_json::from_str(&content)
                    .with_context(|| format!("Input file {} is not valid JSON", path.display()))?;
                orchestrator = orchestrator.with_input(value);
            }
            drive(orchestrator)
        }
        Some(Commands::Discard { process_no, engine }) => {
            let config = engine.config();
            let mut conn = packforge::db::open(&config.db_path)?;

            install::discard_process(&mut conn, &config, process_no)?;
            println!("Process {} discarded", process_no);
            Ok(())
        }
        Some(Commands::Query { pattern, db_path }) => {
            let conn = packforge::db::open(&db_path)?;

            let packages = match pattern {
                Some(pattern) => Package::search(&conn, &pattern)?,
                None => Package::list_all(&conn)?,
            };

            if packages.is_empty() {
                println!("No packages found.");
            } else {
                println!("Installed packages:");
                for package in &packages {
                    print!("  {} {} ({})", package.package, package.version, package.package_name);
                    if package.is_application {
                        print!(" [application]");
                    }
                    println!();
                }
                println!("\nTotal: {} package(s)", packages.len());
            }

            let pending = SessionState::list_pending(&conn)?;
            if !pending.is_empty() {
                println!("\nUnfinished processes:");
                for session in &pending {
                    println!(
                        "  {} at step {} (queue {})",
                        session.process_no,
                        session.step.as_str(),
                        session.queue_id
                    );
                }
            }

            Ok(())
        }
        None => {
            println!("Packforge Package Installer v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'packforge --help' for usage information");
            Ok(())
        }
    }
}

fn main() {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        match e.downcast_ref::<packforge::Error>() {
            Some(err) => {
                eprintln!("Error: {}", err);
                eprintln!(
                    "{}",
                    serde_json::to_string_pretty(&err.payload()).unwrap_or_default()
                );
            }
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}
