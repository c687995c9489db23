//! quorumlog-cli - Offline maintenance for quorumlog journal directories
//!
//! Every command works directly on the journal directories named by the node
//! configuration. Do not run it against directories a live writer is using.

use clap::{Parser, Subcommand};
use colored::Colorize;
use quorumlog_journal::file::read_storage_info;
use quorumlog_journal::recovery::{repair_dir, verify_dir, RecoveryResult};
use quorumlog_journal::segment::list_segments;
use quorumlog_journal::{SegmentStatus, TxKind};
use quorumlog_node::{Config, Node};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quorumlog-cli")]
#[command(about = "Offline maintenance tool for quorumlog journal directories")]
#[command(version)]
struct Cli {
    /// Node configuration file
    #[arg(short, long, env = "QUORUMLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Journal directory (repeatable; overrides the configured directories)
    #[arg(short = 'd', long = "dir")]
    dirs: Vec<PathBuf>,

    /// Minimum number of journals that must acknowledge a write
    #[arg(short, long)]
    quorum: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check every journal directory for torn or corrupted records
    Verify,

    /// Truncate torn tails of in-progress segments
    Repair,

    /// List the segment files of every journal directory
    Segments,

    /// Initialize any unformatted journal directory
    Format,

    /// Finalize segments left open by a crashed writer
    Recover,

    /// Print transactions read through the journal quorum
    Dump {
        /// First txid to print
        #[arg(short, long, default_value_t = 1)]
        from: u64,

        /// Maximum number of transactions to print (0 = all)
        #[arg(short, long, default_value_t = 0)]
        limit: usize,

        /// Include segments that are still in progress
        #[arg(long)]
        in_progress: bool,

        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Recover, then delete finalized segments entirely below a txid
    Purge {
        /// Oldest txid that must be kept
        min_txid: u64,
    },

    /// Print the effective configuration as YAML
    Config,
}

#[derive(Serialize)]
struct DumpLine<'a> {
    txid: u64,
    kind: TxKind,
    len: usize,
    payload: &'a str,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => fail(e),
    };

    if let Err(e) = run(cli.command, config) {
        fail(e);
    }
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };
    if !cli.dirs.is_empty() {
        config.journal.dirs = cli.dirs.clone();
        config.journal.minimum_redundant_targets =
            config.journal.minimum_redundant_targets.min(cli.dirs.len());
    }
    if let Some(quorum) = cli.quorum {
        config.journal.minimum_redundant_targets = quorum;
    }
    config.validate()?;
    Ok(config)
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", "Error".red(), e);
    std::process::exit(1);
}

fn run(command: Commands, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Verify => {
            let mut clean = true;
            for dir in config.journal.journal_dirs() {
                let result = verify_dir(&dir)?;
                clean &= result.invalid_records == 0
                    && result.bytes_truncated == 0
                    && result.segments_with_errors.is_empty();
                print_recovery(&dir, &result);
            }
            if !clean {
                std::process::exit(2);
            }
        }

        Commands::Repair => {
            for dir in config.journal.journal_dirs() {
                let result = repair_dir(&dir)?;
                print_recovery(&dir, &result);
            }
        }

        Commands::Segments => {
            for dir in config.journal.journal_dirs() {
                print_segments(&dir)?;
            }
        }

        Commands::Format => {
            // Opening a node formats any directory without a VERSION file.
            let node = Node::open(config)?;
            for dir in node.config().journal.journal_dirs() {
                if let Some(info) = read_storage_info(&dir)? {
                    println!(
                        "{} {} (storage {}, formatted {})",
                        "Formatted".green(),
                        dir.display(),
                        info.storage_id,
                        info.formatted_at.to_rfc3339()
                    );
                }
            }
        }

        Commands::Recover => {
            let node = Node::open(config)?;
            node.log().init_for_write()?;
            let last = node.log().recover_unclosed_segments()?;
            node.shutdown()?;
            println!("{} through txid {}", "Recovered".green(), last);
        }

        Commands::Dump {
            from,
            limit,
            in_progress,
            json,
        } => {
            let node = Node::open(config)?;
            node.log().init_for_read()?;
            let outcome = node.log().read_from(from, 0, in_progress)?;
            let count = if limit == 0 {
                outcome.transactions.len()
            } else {
                limit.min(outcome.transactions.len())
            };

            for txn in &outcome.transactions[..count] {
                let payload = String::from_utf8_lossy(&txn.payload);
                if json {
                    let line = DumpLine {
                        txid: txn.txid,
                        kind: txn.kind,
                        len: txn.payload.len(),
                        payload: &payload,
                    };
                    println!("{}", serde_json::to_string(&line)?);
                } else {
                    let kind = match txn.kind {
                        TxKind::Op => "OP".normal(),
                        TxKind::StartSegment => "START".cyan(),
                        TxKind::EndSegment => "END".cyan(),
                    };
                    println!("{:>10}  {:<5}  {}", txn.txid, kind, payload);
                }
            }
            if !json {
                eprintln!(
                    "{} transactions from {} segments",
                    count,
                    outcome.segments.len()
                );
            }
        }

        Commands::Purge { min_txid } => {
            let node = Node::open(config)?;
            node.log().init_for_write()?;
            node.log().recover_unclosed_segments()?;
            node.log().purge_logs_older_than(min_txid)?;
            node.shutdown()?;
            println!("{} segments below txid {}", "Purged".green(), min_txid);
        }

        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}

fn print_recovery(dir: &Path, result: &RecoveryResult) {
    let status = if result.invalid_records == 0
        && result.bytes_truncated == 0
        && result.segments_with_errors.is_empty()
    {
        "OK".green()
    } else {
        "DAMAGED".red()
    };
    println!("{} {}", status, dir.display());
    println!("  valid records:   {}", result.valid_records);
    println!("  invalid records: {}", result.invalid_records);
    println!("  torn bytes:      {}", result.bytes_truncated);
    println!("  max txid:        {}", result.max_txid);
    for segment in &result.segments_recovered {
        println!("  {} {}", "torn tail".yellow(), segment);
    }
    for (segment, error) in &result.segments_with_errors {
        println!("  {} {}: {}", "error".red(), segment, error);
    }
}

fn print_segments(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match read_storage_info(dir)? {
        Some(info) => println!("{} (storage {})", dir.display(), info.storage_id),
        None => {
            println!("{} {}", dir.display(), "(unformatted)".yellow());
            return Ok(());
        }
    }

    for (segment, path) in list_segments(dir)? {
        let status = match segment.status {
            SegmentStatus::InProgress => "in progress".yellow(),
            SegmentStatus::Finalized => "finalized".green(),
            SegmentStatus::Aborted => "aborted".red(),
        };
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        println!(
            "  {:>10} .. {:<10} {:<12} {:>10} bytes",
            segment.start_txid, segment.end_txid, status, size
        );
    }
    Ok(())
}
