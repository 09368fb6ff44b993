//! # strata CLI
//!
//! Command-line interface for the Strata block store.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use strata_config::path::normalize_or_original;
use strata_config::{log_cli_debug, log_cli_info, Config, PROJECT_CONFIG};
use strata_kv::KvStore;

mod gc;
mod status;

/// Strata - chunked, deduplicating block store
#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Store root directory (overrides config and STRATA_ROOT)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value read from FILE, or stdin if omitted
    Put {
        key: String,

        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,

        /// Replace an existing value
        #[arg(long)]
        overwrite: bool,
    },

    /// Write a value to stdout or a file
    Get {
        key: String,

        /// Output file (stdout if omitted)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Check whether a key exists (exit code 1 if not)
    Stat { key: String },

    /// Remove a key (blocks are reclaimed by `clean`)
    Rm { key: String },

    /// List stored keys
    Ls,

    /// Delete unreferenced blocks and report corrupt keys
    Clean,

    /// Display store statistics
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file locations
    Path,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(root) = &cli.root {
        config.storage.root = root.clone();
    }
    strata_config::init_logging(config.logging.level.raised(cli.verbose));

    match cli.command {
        Commands::Config { command } => cmd_config(&config, command),
        command => {
            if let Commands::Put {
                overwrite: true, ..
            } = &command
            {
                config.storage.block.overwrite = true;
            }
            let root = config.store_root();
            log_cli_debug!("Opening store", root = tracing::field::display(root.display()));
            let kv = KvStore::open(&root, config.storage.block.clone())
                .with_context(|| format!("Failed to open store at {}", root.display()))?;

            let code = dispatch(&kv, &config, command);
            kv.close().context("Failed to close store")?;
            code
        }
    }
}

fn dispatch(kv: &KvStore, config: &Config, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Put { key, file, .. } => cmd_put(kv, &key, file),
        Commands::Get { key, output } => cmd_get(kv, &key, output),
        Commands::Stat { key } => {
            if kv.has(&key)? {
                println!("{}", key);
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{} not found", key);
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Rm { key } => {
            kv.delete(&key)
                .with_context(|| format!("Failed to remove {}", key))?;
            log_cli_info!("Key removed", key = key.as_str());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ls => {
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            for key in kv.iter()? {
                if let Err(e) = writeln!(out, "{}", key) {
                    return stdout_result(e);
                }
            }
            if let Err(e) = out.flush() {
                return stdout_result(e);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Clean => gc::run(kv),
        Commands::Status { json } => status::run(kv, json),
        Commands::Config { command } => cmd_config(config, command),
    }
}

fn cmd_put(kv: &KvStore, key: &str, file: Option<PathBuf>) -> Result<ExitCode> {
    let reader: Box<dyn Read> = match &file {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    };
    kv.put_stream(key, reader)
        .with_context(|| format!("Failed to store {}", key))?;

    eprintln!("{} {}", style("stored").green(), key);
    Ok(ExitCode::SUCCESS)
}

fn cmd_get(kv: &KvStore, key: &str, output: Option<PathBuf>) -> Result<ExitCode> {
    let mut reader = kv
        .get_stream(key)
        .with_context(|| format!("Failed to read {}", key))?;

    match output {
        Some(path) => {
            let mut file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            if let Err(e) = io::copy(&mut reader, &mut file) {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(strata_store::StoreError::from_io(e, &path))
                    .with_context(|| format!("Failed to read {}", key));
            }
            Ok(ExitCode::SUCCESS)
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(strata_store::StoreError::from_io(e, key))
                            .with_context(|| format!("Failed to read {}", key))
                    }
                };
                if let Err(e) = out.write_all(&buf[..n]) {
                    return stdout_result(e);
                }
            }
            if let Err(e) = out.flush() {
                return stdout_result(e);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// A closed pipe downstream (`strata ls | head`) is not an error.
fn stdout_result(e: io::Error) -> Result<ExitCode> {
    if e.kind() == io::ErrorKind::BrokenPipe {
        return Ok(ExitCode::SUCCESS);
    }
    Err(e).context("Failed to write to stdout")
}

fn cmd_config(config: &Config, command: ConfigCommands) -> Result<ExitCode> {
    match command {
        ConfigCommands::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Path => {
            let mark = |path: &std::path::Path| {
                if path.exists() {
                    style("(found)").green().to_string()
                } else {
                    style("(not found)").dim().to_string()
                }
            };
            if let Some(global) = Config::global_config_path() {
                println!("global:  {} {}", global.display(), mark(&global));
            }
            let project = normalize_or_original(PROJECT_CONFIG);
            println!("project: {} {}", project.display(), mark(&project));
            println!("store:   {}", config.store_root().display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
