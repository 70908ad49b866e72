//! `hw` - operator CLI for homewatch.
//!
//! Exit codes: `hw health` exits 0 (PASS), 1 (WARNING) or 2 (CRITICAL).
//! Other commands exit 0 on success and 1 on error; `hw ingest` also exits 1
//! when any row was rejected. A store or registry that cannot be written stops
//! `hw ingest` immediately instead of counting rows as invalid.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use homewatch_core::config::Config;
use homewatch_core::error::format_error_with_remediation;
use homewatch_core::health::{FnValidator, HealthCheck, ValidatorResult, default_validators};
use homewatch_core::logging::{LogConfig, LoggingHandle, init_logging};
use homewatch_core::registry::DeviceRegistry;
use homewatch_core::storage::{ReadingStore, StoreOptions};
use homewatch_core::{DeviceType, Reading};
use serde::Serialize;
use tracing::{debug, warn};

/// homewatch - resilience toolkit for home telemetry collectors
#[derive(Parser, Debug)]
#[command(name = "hw", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "HOMEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every validator and print the aggregate report
    Health {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Inspect and rename registered devices
    Devices {
        #[command(subcommand)]
        command: DevicesCommand,
    },

    /// Reading store maintenance
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },

    /// Insert JSON-lines readings from a file or stdin
    Ingest {
        /// Input file (stdin when omitted)
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
enum DevicesCommand {
    /// List registered devices
    List {
        /// Only this device type (e.g. hue_sensor)
        #[arg(long = "type", value_parser = parse_device_type)]
        device_type: Option<DeviceType>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Set a device's display name
    Rename {
        id: String,
        name: String,

        /// Also rewrite the name on already stored readings
        #[arg(long)]
        rewrite_history: bool,
    },
}

#[derive(Subcommand, Debug)]
enum StoreCommand {
    /// Create or migrate the database
    Init,

    /// Row counts, time range and file size
    Stats {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_device_type(s: &str) -> std::result::Result<DeviceType, String> {
    s.parse()
}

#[derive(Debug, Default, Serialize)]
struct IngestSummary {
    inserted: u64,
    duplicates: u64,
    invalid: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            match err.downcast_ref::<homewatch_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<&Path>) -> homewatch_core::Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Logging problems never stop a command; they are reported and skipped.
fn start_logging(config: Option<&Config>, verbose: bool) -> LoggingHandle {
    let log_config = config.map_or_else(LogConfig::default, LogConfig::from_config).verbose(verbose);
    match init_logging(&log_config) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("hw: logging disabled: {e}");
            LoggingHandle::default()
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let Cli {
        config,
        verbose,
        command,
    } = cli;
    let config_path = config.as_deref();

    match command {
        Commands::Health { format } => Ok(health(config_path, verbose, format)),
        Commands::Devices { command } => {
            with_config(config_path, verbose, |config| devices(config, command))
        }
        Commands::Store { command } => {
            with_config(config_path, verbose, |config| store(config, command))
        }
        Commands::Ingest { file, format } => with_config(config_path, verbose, |config| {
            ingest(config, file.as_deref(), format)
        }),
    }
}

/// Load and validate configuration, start logging, then run `f`.
fn with_config(
    path: Option<&Path>,
    verbose: bool,
    f: impl FnOnce(&Config) -> Result<u8>,
) -> Result<u8> {
    let config = load_config(path)?;
    config.validate()?;
    let logging = start_logging(Some(&config), verbose);
    let code = f(&config);
    logging.flush();
    code
}

fn health(config_path: Option<&Path>, verbose: bool, format: OutputFormat) -> u8 {
    let loaded = load_config(config_path);
    let logging = start_logging(loaded.as_ref().ok(), verbose);

    let check = match loaded {
        Ok(config) => HealthCheck::from_config(&config),
        Err(err) => {
            // Keep checking everything else against defaults.
            let config = Config::default();
            let message = err.to_string();
            let guidance = err.remediation();
            let mut check = HealthCheck::new(config.health_timeout());
            check.push(Arc::new(FnValidator::new("config", true, move || {
                let failed = ValidatorResult::fail(message.clone());
                Ok(match &guidance {
                    Some(remediation) => failed.with_guidance(remediation),
                    None => failed,
                })
            })));
            for validator in default_validators(&config) {
                if validator.name() != "config" {
                    check.push(validator);
                }
            }
            check
        }
    };

    let report = check.run();
    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => match report.render_json() {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("hw: cannot render JSON report: {e}"),
        },
    }
    logging.flush();
    u8::try_from(report.exit_code).unwrap_or(2)
}

fn open_store(config: &Config) -> homewatch_core::Result<ReadingStore> {
    ReadingStore::open(&config.db_path(), StoreOptions::from(&config.storage))
}

fn devices(config: &Config, command: DevicesCommand) -> Result<u8> {
    let registry = DeviceRegistry::new(config.registry_path());
    match command {
        DevicesCommand::List {
            device_type,
            format,
        } => {
            let devices = registry.list(device_type)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&devices)?),
                OutputFormat::Text => {
                    if devices.is_empty() {
                        println!("No devices registered.");
                        return Ok(0);
                    }
                    println!(
                        "{:<24} {:<16} {:<28} {:<16} LAST SEEN",
                        "ID", "TYPE", "NAME", "LOCATION"
                    );
                    for d in &devices {
                        println!(
                            "{:<24} {:<16} {:<28} {:<16} {}",
                            d.unique_id,
                            d.device_type.as_str(),
                            d.name,
                            d.location.as_deref().unwrap_or("-"),
                            d.last_seen.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
            }
        }
        DevicesCommand::Rename {
            id,
            name,
            rewrite_history,
        } => {
            if rewrite_history {
                let store = open_store(config)?;
                let rows = registry.set_name_with_history(&id, &name, &store)?;
                println!("Renamed {id} to \"{}\" and updated {rows} stored readings.", name.trim());
            } else {
                registry.set_name(&id, &name)?;
                println!("Renamed {id} to \"{}\".", name.trim());
            }
        }
    }
    Ok(0)
}

fn store(config: &Config, command: StoreCommand) -> Result<u8> {
    let store = open_store(config)?;
    match command {
        StoreCommand::Init => {
            println!(
                "Store ready at {} (schema v{}, journal_mode {})",
                config.db_path().display(),
                store.schema_version()?,
                store.journal_mode()?
            );
        }
        StoreCommand::Stats { format } => {
            let stats = store.stats()?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Text => {
                    println!("Database:   {}", config.db_path().display());
                    println!("Readings:   {}", stats.total_readings);
                    println!("Devices:    {}", stats.devices);
                    println!("Anomalies:  {}", stats.anomalies);
                    println!("Oldest:     {}", stats.oldest.as_deref().unwrap_or("-"));
                    println!("Newest:     {}", stats.newest.as_deref().unwrap_or("-"));
                    if let Some(bytes) = stats.db_size_bytes {
                        println!("Size:       {bytes} bytes");
                    }
                    println!("Journal:    {}", stats.journal_mode);
                    println!("Schema:     v{}", stats.schema_version);
                }
            }
        }
    }
    Ok(0)
}

fn ingest(config: &Config, file: Option<&Path>, format: OutputFormat) -> Result<u8> {
    let store = open_store(config)?;
    let registry = DeviceRegistry::new(config.registry_path());

    let reader: Box<dyn BufRead> = match file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let mut summary = IngestSummary::default();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.context("failed to read input")?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let mut reading: Reading = match serde_json::from_str(text) {
            Ok(reading) => reading,
            Err(e) => {
                summary.invalid += 1;
                eprintln!("line {line_no}: not a reading: {e}");
                continue;
            }
        };
        if let Err(e) = reading.validate() {
            summary.invalid += 1;
            eprintln!("line {line_no}: {e}");
            continue;
        }

        match registry.register(
            &reading.device_id,
            reading.device_type,
            reading.location.as_deref(),
            None,
        ) {
            Ok(name) => {
                if reading.name.is_none() {
                    reading.name = Some(name);
                }
            }
            Err(e) if e.is_rejected_input() => {
                summary.invalid += 1;
                eprintln!("line {line_no}: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        match store.insert(&reading) {
            Ok(true) => summary.inserted += 1,
            Ok(false) => summary.duplicates += 1,
            Err(e) if e.is_rejected_input() => {
                summary.invalid += 1;
                eprintln!("line {line_no}: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!(
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        invalid = summary.invalid,
        "Ingest finished"
    );
    if summary.invalid > 0 {
        warn!(invalid = summary.invalid, "Rejected readings during ingest");
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&summary)?),
        OutputFormat::Text => println!(
            "inserted {}, duplicates {}, invalid {}",
            summary.inserted, summary.duplicates, summary.invalid
        ),
    }
    Ok(u8::from(summary.invalid > 0))
}
