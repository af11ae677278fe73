use anyhow::Context;
use clap::{Parser, Subcommand};
use sequery_lib::Database;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "sequery")]
#[command(version = "0.1.0")]
#[command(about = "Query engine for aligned genome corpora", long_about = None)]
struct Cli {
    /// Working directory holding reference_genome.txt and pango_alias.txt
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the database from a partitioned corpus and save a snapshot
    Build {
        /// Prefix of the chunk input files, relative to the working directory
        #[arg(long, default_value = "")]
        part_prefix: String,

        /// Suffix of metadata files
        #[arg(long, default_value = ".meta")]
        meta_suffix: String,

        /// Suffix of sequence files (.xz probed as fallback)
        #[arg(long, default_value = ".fasta")]
        seq_suffix: String,

        /// Snapshot output directory
        #[arg(short, long)]
        save: PathBuf,
    },

    /// Report database statistics from a snapshot
    Info {
        /// Snapshot directory
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Include per-symbol sizes and bitmap distributions
        #[arg(short, long)]
        detailed: bool,
    },

    /// Execute a JSON query against a snapshot
    Query {
        /// Snapshot directory
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Query document, inline or @path-to-file
        #[arg(short, long)]
        query: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing: use RUST_LOG if set, otherwise default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            part_prefix,
            meta_suffix,
            seq_suffix,
            save,
        } => build_command(&cli.workdir, &part_prefix, &meta_suffix, &seq_suffix, &save),
        Commands::Info { snapshot, detailed } => info_command(&cli.workdir, &snapshot, detailed),
        Commands::Query { snapshot, query } => query_command(&cli.workdir, &snapshot, &query),
    }
}

fn build_command(
    workdir: &PathBuf,
    part_prefix: &str,
    meta_suffix: &str,
    seq_suffix: &str,
    save: &PathBuf,
) -> anyhow::Result<()> {
    info!("building database from {}", workdir.display());
    let mut db = Database::open(workdir)?;
    db.build(part_prefix, meta_suffix, seq_suffix)?;

    let mut stdout = std::io::stdout().lock();
    db.db_info(&mut stdout)?;
    stdout.flush()?;

    db.save(save)?;
    info!("snapshot written to {}", save.display());
    Ok(())
}

fn info_command(workdir: &PathBuf, snapshot: &PathBuf, detailed: bool) -> anyhow::Result<()> {
    let mut db = Database::open(workdir)?;
    db.load(snapshot)?;

    let mut stdout = std::io::stdout().lock();
    db.db_info(&mut stdout)?;
    if detailed {
        db.db_info_detailed(&mut stdout)?;
    }
    stdout.flush()?;
    Ok(())
}

fn query_command(workdir: &PathBuf, snapshot: &PathBuf, query: &str) -> anyhow::Result<()> {
    let mut db = Database::open(workdir)?;
    db.load(snapshot)?;

    let query_text = match query.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read query file {path}"))?,
        None => query.to_owned(),
    };

    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr().lock();
    let result = sequery_lib::execute_query(&db, &query_text, &mut stdout, &mut stderr)?;
    stdout.flush()?;

    info!(
        "query done (parse {}us, filter {}us, action {}us)",
        result.parse_micros, result.filter_micros, result.action_micros
    );
    Ok(())
}
