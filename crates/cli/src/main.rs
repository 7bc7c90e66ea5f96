//! kiln: command-line frontend for the kiln build system.
//!
//! Reads a build description, attaches the persistent result database, and
//! brings the requested target up to date:
//! - `kiln` - build the default target of `build.kiln`
//! - `kiln -f other.kiln mytarget` - build `mytarget` from another file
//! - `kiln --serial -v --trace trace.jsonl` - one command at a time, with
//!   debug logging and an engine trace

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_build::doc::Span;
use kiln_build::{
    default_lane_count, BuildSystem, BuildSystemConfig, BuildSystemDelegate,
};
use owo_colors::OwoColorize;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

/// The client name build descriptions must declare.
const CLIENT_NAME: &str = "kiln";

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Incremental, persistent build system")]
struct Cli {
    /// Change into PATH before doing anything else
    #[arg(short = 'C', long = "chdir", value_name = "PATH")]
    chdir: Option<PathBuf>,

    /// Path of the persistent build database
    #[arg(long, value_name = "PATH", default_value = "build.db")]
    db: PathBuf,

    /// Do not persist build results
    #[arg(long)]
    no_db: bool,

    /// Path of the build description
    #[arg(short = 'f', value_name = "PATH", default_value = "build.kiln")]
    file: PathBuf,

    /// Run commands strictly one at a time
    #[arg(long)]
    serial: bool,

    /// Cap on the number of parallel command lanes
    #[arg(short = 'j', long = "jobs", value_name = "N")]
    jobs: Option<usize>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Write a JSON-lines engine trace to PATH
    #[arg(long, value_name = "PATH")]
    trace: Option<PathBuf>,

    /// Target to build (defaults to the first declared target)
    target: Option<String>,

    /// Arguments after `-` are forwarded to the client
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    client_args: Vec<String>,
}

/// Prints diagnostics as they arrive from the loader and the build.
struct FrontendDelegate;

impl BuildSystemDelegate for FrontendDelegate {
    fn client_name(&self) -> &str {
        CLIENT_NAME
    }

    fn error(&mut self, filename: &str, span: Option<Span>, message: &str) {
        match span {
            Some(span) => eprintln!(
                "{} {filename}:{}: {message}",
                "error:".red().bold(),
                span.offset
            ),
            None => eprintln!("{} {message}", "error:".red().bold()),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging.
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    if let Some(dir) = &cli.chdir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("unable to change into '{}'", dir.display()))?;
    }

    let client_args: Vec<&str> = cli
        .client_args
        .iter()
        .skip_while(|arg| *arg == "-")
        .map(String::as_str)
        .collect();
    if !client_args.is_empty() {
        debug!(?client_args, "forwarding client arguments");
    }

    let source = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("unable to read build description '{}'", cli.file.display()))?;

    let lanes = if cli.serial {
        1
    } else {
        default_lane_count(cli.jobs.unwrap_or(usize::MAX))
    };
    debug!(lanes, "configuring execution queue");

    let mut system = BuildSystem::new(
        Box::new(FrontendDelegate),
        cli.file.display().to_string(),
        BuildSystemConfig { lanes },
    );

    if let Err(err) = system.load(&source) {
        eprintln!("{} {err}", "error:".red().bold());
        return Ok(false);
    }

    if !cli.no_db {
        system
            .attach_db(&cli.db)
            .with_context(|| format!("unable to open build database '{}'", cli.db.display()))?;
    }
    if let Some(path) = &cli.trace {
        system
            .enable_tracing(path)
            .with_context(|| format!("unable to open trace file '{}'", path.display()))?;
    }

    let target = cli.target.as_deref().unwrap_or("");
    let results = system.build(target)?;

    if results.success() {
        println!("{}", "Build complete".green().bold());
        Ok(true)
    } else {
        println!(
            "{} {} error(s), {} failed command(s)",
            "Build failed:".red().bold(),
            results.num_errors,
            results.num_failed_commands
        );
        Ok(false)
    }
}
