//! Binary entry point for the `strata-cli` administrative tool.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use strata::db::Database;
use strata::txn::VerifyLevel;
use strata::{Config, StorageError};

#[derive(Parser, Debug)]
#[command(
    name = "strata-cli",
    version,
    about = "Administrative CLI for a strata database directory"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, help = "Output format")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Show table and configuration summary")]
    Inspect {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Force a checkpoint on the database")]
    Checkpoint {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Verify catalog and primary-key index consistency")]
    Verify {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Fast, help = "Verification depth")]
        level: VerifyLevelArg,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::try_init().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        }
    };

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

fn run(cli: &Cli) -> strata::Result<ExitCode> {
    match &cli.command {
        Command::Inspect { dir } => cmd_inspect(dir, cli.format),
        Command::Checkpoint { dir } => cmd_checkpoint(dir, cli.format),
        Command::Verify { dir, level } => cmd_verify(dir, cli.format, (*level).into()),
    }
}

fn cmd_inspect(dir: &PathBuf, format: OutputFormat) -> strata::Result<ExitCode> {
    let db = Database::open(dir, Config::default())?;
    let tables = db.table_summaries();

    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = tables
                .iter()
                .map(|(id, name, rows)| {
                    serde_json::json!({"id": id.0, "name": name, "row_count": rows})
                })
                .collect();
            let report = serde_json::json!({
                "path": db.path().display().to_string(),
                "buffer_pool_size": db.config().buffer_pool_size,
                "max_num_threads": db.config().max_num_threads,
                "tables": rows,
            });
            println!("{}", serde_json::to_string_pretty(&report).unwrap());
        }
        OutputFormat::Text => {
            println!("database: {}", db.path().display());
            println!("  buffer_pool_size: {}", db.config().buffer_pool_size);
            println!("  max_num_threads:  {}", db.config().max_num_threads);
            println!("  tables:");
            for (id, name, rows) in &tables {
                println!("    [{}] {name}: {rows} rows", id.0);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_checkpoint(dir: &PathBuf, format: OutputFormat) -> strata::Result<ExitCode> {
    let db = Database::open(dir, Config::default())?;
    let report = db.checkpoint()?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report).unwrap());
        }
        OutputFormat::Text => {
            println!(
                "checkpoint completed in {:.2} ms (pages_applied={}, wal_size_after={})",
                report.duration_ms, report.pages_applied, report.wal_size_after
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_verify(dir: &PathBuf, format: OutputFormat, level: VerifyLevel) -> strata::Result<ExitCode> {
    let db = Database::open(dir, Config::default())?;
    let report = db.verify(level)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report).unwrap());
        }
        OutputFormat::Text => {
            println!(
                "verify ({:?}) => success={} tables_checked={} live_rows={} tombstoned_rows={}",
                report.level, report.success, report.tables_checked, report.live_rows, report.tombstoned_rows
            );
            for error in &report.errors {
                println!("  - {error}");
            }
        }
    }

    if report.success {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

fn exit_code_for(err: &StorageError) -> ExitCode {
    match err {
        StorageError::IoError(_) => ExitCode::from(3),
        StorageError::ConfigError(_) => ExitCode::from(1),
        _ => ExitCode::from(2),
    }
}
