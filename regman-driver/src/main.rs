//! Register Manager Driver
//!
//! Command-line front end for exercising the register manager outside a
//! compiler: replay allocation scripts against a target and inspect the
//! built-in target descriptions.

mod script;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use regman_backend::AllocOptions;
use regman_codegen::{Target, TargetConfig, PRESETS};
use script::{format_summary, replay, Script};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "regman")]
#[command(about = "Register manager driver")]
#[command(version = "0.1.0")]
struct Cli {
    /// Log allocator decisions
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay an allocation script and print the resulting spill code
    Replay {
        /// Allocation script (JSON)
        script: PathBuf,

        /// Built-in target name or path to a target description (JSON)
        #[arg(short, long, default_value = "x86")]
        target: String,

        /// Compile with minimal optimization (no content tracking)
        #[arg(long)]
        min_opts: bool,

        /// Output file for the listing
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the built-in targets
    Targets,

    /// Print a built-in target description as JSON
    ShowTarget {
        /// Target name
        name: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Commands::Replay {
            script,
            target,
            min_opts,
            output,
        } => replay_command(&script, &target, min_opts, output.as_deref()),
        Commands::Targets => {
            for name in PRESETS {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::ShowTarget { name } => show_target(&name),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_target(name: &str) -> Result<Target> {
    if PRESETS.contains(&name) {
        return Ok(Target::preset(name)?);
    }
    let text = fs::read_to_string(name).with_context(|| format!("cannot read target description {}", name))?;
    let config = TargetConfig::from_json(&text)?;
    Ok(Target::from_config(&config)?)
}

fn replay_command(script_path: &Path, target: &str, min_opts: bool, output: Option<&Path>) -> Result<()> {
    let target = load_target(target)?;
    let text = fs::read_to_string(script_path)
        .with_context(|| format!("cannot read script {}", script_path.display()))?;
    let mut script = Script::from_json(&text)?;
    if min_opts {
        script.options = AllocOptions {
            min_opts: true,
            ..script.options
        };
    }

    let result = replay(&script, target.clone())?;
    let summary = format_summary(&result.summary, &target);

    match output {
        Some(path) => {
            fs::write(path, &result.listing)?;
            info!("Listing written to {}", path.display());
        }
        None => print!("{}", result.listing),
    }
    print!("{}", summary);
    Ok(())
}

fn show_target(name: &str) -> Result<()> {
    let config = TargetConfig::preset(name)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
